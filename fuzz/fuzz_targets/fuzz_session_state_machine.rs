#![no_main]

//! Fuzz target for the session lifecycle.
//!
//! Applies an arbitrary sequence of store operations and checks after each
//! step that terminal sessions stay terminal and no thread ever has two
//! active sessions.

use std::collections::{HashMap, HashSet};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

use mmrelay::db::Database;
use mmrelay::models::SessionStatus;

#[derive(Arbitrary, Debug)]
enum Op {
    Create { session: u8, thread: u8 },
    Touch { session: u8 },
    End { session: u8 },
    ExpireAll,
    ExpireIdle,
    Delete { session: u8 },
    MarkSeen { session: u8, create_at: i64 },
}

fn id(n: u8) -> String {
    format!("s{}", n % 8)
}

fn thread(n: u8) -> String {
    format!("t{}", n % 4)
}

fuzz_target!(|ops: Vec<Op>| {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(_) => return,
    };
    let db = match Database::open(&dir.path().join("sessions.db")) {
        Ok(d) => d,
        Err(_) => return,
    };

    let mut terminal: HashSet<String> = HashSet::new();

    for op in ops.iter().take(64) {
        match op {
            Op::Create { session, thread: t } => {
                let _ = db.create(&id(*session), "/fuzz", &thread(*t), "c1");
            }
            Op::Touch { session } => {
                let _ = db.touch(&id(*session));
            }
            Op::End { session } => {
                let _ = db.end(&id(*session));
            }
            Op::ExpireAll => {
                let _ = db.expire_inactive(chrono::Duration::zero());
            }
            Op::ExpireIdle => {
                let _ = db.expire_inactive(chrono::Duration::hours(24));
            }
            Op::Delete { session } => {
                if db.delete(&id(*session)).is_ok() {
                    terminal.remove(&id(*session));
                }
            }
            Op::MarkSeen { session, create_at } => {
                let _ = db.mark_reply_seen(&id(*session), *create_at);
            }
        }

        let sessions = db.list(None).expect("list sessions");
        let mut active_threads: HashMap<String, String> = HashMap::new();
        for session in &sessions {
            if terminal.contains(&session.id) {
                assert!(session.status.is_terminal(), "{} left a terminal state", session.id);
            }
            match session.status {
                SessionStatus::Active => {
                    let previous = active_threads.insert(session.thread_id.clone(), session.id.clone());
                    assert!(previous.is_none(), "two active sessions on {}", session.thread_id);
                }
                _ => {
                    terminal.insert(session.id.clone());
                }
            }
        }

        let active = db.list_active().expect("list active sessions");
        assert!(active.iter().all(|s| s.status == SessionStatus::Active));
    }
});
