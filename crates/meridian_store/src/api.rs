//! Client-facing request/response contract.
//!
//! Over TCP the messages travel as length-delimited JSON frames; embedded
//! clusters (tests, the workload generator in local mode) use the same
//! types through a channel-based client handle.

use serde::{Deserialize, Serialize};

use crate::transaction::Transaction;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsModule {
    Server,
    Scheduler,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ApiRequest {
    Txn {
        stream_id: u64,
        txn: Transaction,
    },
    Stats {
        stream_id: u64,
        module: StatsModule,
        level: u32,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ApiResponse {
    Txn {
        stream_id: u64,
        txn: Box<Transaction>,
    },
    Stats {
        stream_id: u64,
        json: String,
    },
}

impl ApiRequest {
    pub fn stream_id(&self) -> u64 {
        match self {
            ApiRequest::Txn { stream_id, .. } | ApiRequest::Stats { stream_id, .. } => *stream_id,
        }
    }
}
