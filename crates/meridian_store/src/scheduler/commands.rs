//! Execution of the key/value command program carried by a transaction.

use std::collections::HashMap;

use crate::transaction::{Procedure, Transaction, TransactionStatus};

/// Number of arguments each command consumes after its name.
fn command_num_args(cmd: &str) -> Option<usize> {
    match cmd {
        "GET" | "DEL" | "ABORT" => Some(1),
        "SET" | "COPY" => Some(2),
        _ => None,
    }
}

/// Run the transaction's program over its assembled read set, mutating the
/// pending write set. Commands touching keys outside the declared key sets
/// are ignored; malformed programs abort with a reason.
pub fn execute_key_value(txn: &mut Transaction) {
    let Procedure::KeyValue { code } = txn.procedure.clone() else {
        txn.status = TransactionStatus::Committed;
        return;
    };

    let mut writes: HashMap<String, String> = HashMap::new();
    let mut deletes: Vec<String> = Vec::new();
    let mut tokens = code.split_whitespace();
    loop {
        let Some(cmd) = tokens.next() else {
            break;
        };
        let Some(num_args) = command_num_args(cmd) else {
            abort(txn, format!("Invalid command: {cmd}"));
            return;
        };
        let mut args = Vec::with_capacity(num_args);
        for _ in 0..num_args {
            match tokens.next() {
                Some(arg) => args.push(arg.to_string()),
                None => {
                    abort(txn, format!("Invalid number of arguments for command {cmd}"));
                    return;
                }
            }
        }
        match cmd {
            "GET" => {
                // Reads resolve through the read set; nothing to do here.
            }
            "SET" => {
                if txn.write_set.contains_key(&args[0]) {
                    writes.insert(args[0].clone(), args[1].clone());
                }
            }
            "DEL" => {
                if txn.write_set.contains_key(&args[0]) {
                    deletes.push(args[0].clone());
                }
            }
            "COPY" => {
                let (src, dst) = (&args[0], &args[1]);
                if let Some(value) = txn.read_set.get(src) {
                    if txn.write_set.contains_key(dst) {
                        writes.insert(dst.clone(), value.clone());
                    }
                }
            }
            "ABORT" => {
                abort(txn, format!("User abort (key: {})", args[0]));
                return;
            }
            _ => unreachable!("arity table covers all commands"),
        }
    }

    for (key, value) in writes {
        txn.write_set.insert(key, value);
    }
    for key in deletes {
        if !txn.delete_set.contains(&key) {
            txn.delete_set.push(key);
        }
    }
    txn.status = TransactionStatus::Committed;
}

fn abort(txn: &mut Transaction, reason: String) {
    txn.status = TransactionStatus::Aborted;
    txn.abort_reason = Some(reason);
}
