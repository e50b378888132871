//! Pending tool-approval requests, one per thread.
//!
//! The tracker keeps the live map in memory and mirrors every change into the
//! `pending_approvals` table, so outstanding requests survive a daemon restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{RelayError, SinkError, StoreError};
use crate::models::{PendingApprovalRecord, Verdict};
use crate::sink::{ResponseSink, ResponseSinks};

const APPROVE_WORDS: [&str; 3] = ["approve", "yes", "ok"];
const DENY_WORDS: [&str; 3] = ["deny", "no", "cancel"];
const APPROVE_GLYPHS: [&str; 2] = ["\u{2705}", ":white_check_mark:"];
const DENY_GLYPHS: [&str; 2] = ["\u{274C}", ":x:"];

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub session_id: String,
    pub tool_name: String,
    pub command: String,
    pub sink: Arc<dyn ResponseSink>,
    /// `create_at` of the newest thread reply when the request was made.
    /// Replies at or before it predate the prompt and are not answers to it.
    pub reply_floor: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Registered,
    /// An earlier request on the same thread was dropped in favour of this one.
    Replaced { previous_tool: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    Approved,
    Denied,
    Ambiguous,
    NoPending,
    /// The sink already held a verdict, so the pending entry was stale.
    AlreadyResolved,
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("approval tracker lock poisoned")]
    Poisoned,
}

impl From<ApprovalError> for RelayError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::Store(err) => err.into(),
            ApprovalError::Sink(err) => err.into(),
            ApprovalError::Poisoned => RelayError::Store(StoreError::Poisoned),
        }
    }
}

pub struct ApprovalTracker {
    store: Arc<Database>,
    pending: Mutex<HashMap<String, PendingApproval>>,
}

impl ApprovalTracker {
    pub fn new(store: Arc<Database>) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuilds the tracker from persisted pending approvals. Rows whose sink
    /// can no longer be restored are dropped.
    pub fn restore(
        store: Arc<Database>,
        sinks: &dyn ResponseSinks,
    ) -> Result<Self, ApprovalError> {
        let tracker = Self::new(Arc::clone(&store));
        let records = store.load_pending()?;
        {
            let mut pending = tracker.lock()?;
            for record in records {
                match sinks.restore(&record.sink_handle) {
                    Ok(sink) => {
                        pending.insert(
                            record.thread_id,
                            PendingApproval {
                                session_id: record.session_id,
                                tool_name: record.tool_name,
                                command: record.command,
                                sink,
                                reply_floor: record.reply_floor,
                            },
                        );
                    }
                    Err(err) => {
                        warn!(thread_id = %record.thread_id, error = %err, "dropping unrestorable pending approval");
                        store.delete_pending(&record.thread_id)?;
                    }
                }
            }
            if !pending.is_empty() {
                info!(count = pending.len(), "restored pending approvals");
            }
        }
        Ok(tracker)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, PendingApproval>>, ApprovalError> {
        self.pending.lock().map_err(|_| ApprovalError::Poisoned)
    }

    /// Registers a pending approval for the thread; last request wins.
    pub fn request(
        &self,
        thread_id: &str,
        session_id: &str,
        tool_name: &str,
        command: &str,
        sink: Arc<dyn ResponseSink>,
        reply_floor: Option<i64>,
    ) -> Result<RequestOutcome, ApprovalError> {
        let mut pending = self.lock()?;
        self.store.save_pending(&PendingApprovalRecord {
            thread_id: thread_id.to_string(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            command: command.to_string(),
            sink_handle: sink.handle().to_string(),
            requested_at: Utc::now(),
            reply_floor,
        })?;

        let previous = pending.insert(
            thread_id.to_string(),
            PendingApproval {
                session_id: session_id.to_string(),
                tool_name: tool_name.to_string(),
                command: command.to_string(),
                sink,
                reply_floor,
            },
        );

        Ok(match previous {
            Some(previous) => {
                info!(thread_id, previous_tool = %previous.tool_name, tool_name, "replaced pending approval");
                RequestOutcome::Replaced {
                    previous_tool: previous.tool_name,
                }
            }
            None => RequestOutcome::Registered,
        })
    }

    /// Classifies a free-text reply posted at `create_at` against the
    /// thread's pending approval.
    ///
    /// On a clear verdict the verdict is written to the sink first, then the
    /// pending entry is removed, all under the tracker lock.
    pub fn classify_reply(
        &self,
        thread_id: &str,
        text: &str,
        create_at: i64,
    ) -> Result<ReplyClass, ApprovalError> {
        let mut pending = self.lock()?;
        let Some(entry) = pending.get(thread_id) else {
            return Ok(ReplyClass::NoPending);
        };
        if entry.reply_floor.is_some_and(|floor| create_at <= floor) {
            return Ok(ReplyClass::NoPending);
        }

        let verdict = match classify_text(text) {
            Some(verdict) => verdict,
            None => {
                debug!(thread_id, "ambiguous approval reply");
                return Ok(ReplyClass::Ambiguous);
            }
        };

        match entry.sink.write(verdict) {
            Ok(()) => {}
            Err(SinkError::AlreadyWritten(handle)) => {
                // Left over from a crash between the sink write and the delete.
                warn!(thread_id, %handle, "verdict already recorded; clearing pending approval");
                self.store.delete_pending(thread_id)?;
                pending.remove(thread_id);
                return Ok(ReplyClass::AlreadyResolved);
            }
            Err(err) => return Err(err.into()),
        }
        self.store.delete_pending(thread_id)?;
        if let Some(resolved) = pending.remove(thread_id) {
            info!(thread_id, session_id = %resolved.session_id, tool_name = %resolved.tool_name, %verdict, "approval resolved");
        }

        Ok(match verdict {
            Verdict::Approved => ReplyClass::Approved,
            Verdict::Denied => ReplyClass::Denied,
        })
    }

    pub fn is_pending(&self, thread_id: &str) -> bool {
        self.lock()
            .map(|pending| pending.contains_key(thread_id))
            .unwrap_or(false)
    }

    pub fn get(&self, thread_id: &str) -> Option<PendingApproval> {
        self.lock().ok()?.get(thread_id).cloned()
    }

    /// Drops the thread's pending approval without resolving it.
    pub fn discard(&self, thread_id: &str) -> Result<bool, ApprovalError> {
        let mut pending = self.lock()?;
        self.store.delete_pending(thread_id)?;
        Ok(pending.remove(thread_id).is_some())
    }

    /// Drops pending approvals whose session is no longer active.
    pub fn prune_inactive(&self) -> Result<usize, ApprovalError> {
        let mut pending = self.lock()?;
        self.store.prune_pending()?;
        let before = pending.len();
        pending.retain(|thread_id, approval| {
            match self.store.get_by_active_thread(thread_id) {
                Ok(session) => session.id == approval.session_id,
                Err(_) => false,
            }
        });
        Ok(before - pending.len())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `Some(verdict)` when exactly one keyword class matches, `None` otherwise.
pub fn classify_text(text: &str) -> Option<Verdict> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();

    let approve = APPROVE_GLYPHS.iter().any(|glyph| lowered.contains(glyph))
        || APPROVE_WORDS.iter().any(|keyword| words.contains(keyword));
    let deny = DENY_GLYPHS.iter().any(|glyph| lowered.contains(glyph))
        || DENY_WORDS.iter().any(|keyword| words.contains(keyword));

    match (approve, deny) {
        (true, false) => Some(Verdict::Approved),
        (false, true) => Some(Verdict::Denied),
        _ => None,
    }
}
