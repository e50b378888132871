//! The reconciliation loop: polls every active session's thread for a new
//! human reply, routes it to the approval tracker or the inbox, and
//! periodically times out idle sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::approval::ReplyClass;
use crate::error::RelayError;
use crate::handlers::{APPROVED_ACK, DENIED_ACK, REPROMPT};
use crate::models::Session;
use crate::relay::Relay;

const STOP_CHECK: Duration = Duration::from_millis(100);

/// What one pass over the active sessions did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub scanned: usize,
    pub delivered: usize,
    pub resolved: usize,
    pub reprompted: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconciled {
    Idle,
    Delivered,
    Resolved,
    Reprompted,
}

impl Relay {
    /// One pass over all active sessions. A failure on one session is logged
    /// and counted; the rest of the pass still runs.
    pub fn tick(&self) -> Result<TickReport, RelayError> {
        let sessions = self.store.list_active()?;
        let mut report = TickReport {
            scanned: sessions.len(),
            ..TickReport::default()
        };

        for session in &sessions {
            match self.reconcile_session(session) {
                Ok(Reconciled::Idle) => {}
                Ok(Reconciled::Delivered) => report.delivered += 1,
                Ok(Reconciled::Resolved) => report.resolved += 1,
                Ok(Reconciled::Reprompted) => report.reprompted += 1,
                Err(err) => {
                    warn!(session_id = %session.id, thread_id = %session.thread_id, error = %err, "reconcile failed");
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }

    fn reconcile_session(&self, session: &Session) -> Result<Reconciled, RelayError> {
        let Some(reply) = self
            .gateway
            .latest_reply_excluding(&session.thread_id, &self.identity.id)?
        else {
            return Ok(Reconciled::Idle);
        };
        if session
            .last_reply_at
            .is_some_and(|seen| reply.create_at <= seen)
        {
            return Ok(Reconciled::Idle);
        }

        let text = reply.message.trim();
        if text.is_empty() {
            self.store.mark_reply_seen(&session.id, reply.create_at)?;
            return Ok(Reconciled::Idle);
        }

        match self
            .tracker
            .classify_reply(&session.thread_id, text, reply.create_at)?
        {
            class @ (ReplyClass::Approved | ReplyClass::Denied) => {
                self.store.mark_reply_seen(&session.id, reply.create_at)?;
                self.store.touch(&session.id)?;
                let ack = if class == ReplyClass::Approved {
                    APPROVED_ACK
                } else {
                    DENIED_ACK
                };
                if let Err(err) = self.post(&session.thread_id, ack) {
                    warn!(session_id = %session.id, error = %err, "failed to acknowledge verdict");
                }
                Ok(Reconciled::Resolved)
            }
            ReplyClass::AlreadyResolved => {
                self.store.mark_reply_seen(&session.id, reply.create_at)?;
                self.store.touch(&session.id)?;
                Ok(Reconciled::Resolved)
            }
            ReplyClass::Ambiguous => {
                self.store.mark_reply_seen(&session.id, reply.create_at)?;
                self.post(&session.thread_id, REPROMPT)?;
                Ok(Reconciled::Reprompted)
            }
            ReplyClass::NoPending => {
                // Cursor only advances after a successful delivery so the
                // reply is retried on the next pass.
                self.inbox.deliver(session, text)?;
                self.store.mark_reply_seen(&session.id, reply.create_at)?;
                self.store.touch(&session.id)?;
                debug!(session_id = %session.id, "delivered reply to inbox");
                Ok(Reconciled::Delivered)
            }
        }
    }

    /// Times out idle sessions and drops their pending approvals.
    pub fn sweep(&self) -> Result<usize, RelayError> {
        let timeout = chrono::Duration::from_std(self.settings.session_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let expired = self.store.expire_inactive(timeout)?;
        if expired > 0 {
            info!(count = expired, "expired inactive sessions");
        }
        let pruned = self.tracker.prune_inactive()?;
        debug!(expired, pruned, "expiry sweep finished");
        Ok(expired)
    }

    /// Runs passes until `stop` is set. A pass that cannot even list sessions
    /// backs off for `error_backoff` before the next one.
    pub fn run(&self, stop: &AtomicBool) {
        info!(
            poll_interval = ?self.settings.poll_interval,
            session_timeout = ?self.settings.session_timeout,
            "reconciliation loop started"
        );
        let mut last_sweep = Instant::now();

        while !stop.load(Ordering::Relaxed) {
            if last_sweep.elapsed() >= self.settings.cleanup_interval {
                if let Err(err) = self.sweep() {
                    error!(error = %err, "expiry sweep failed");
                }
                last_sweep = Instant::now();
            }

            let pause = match self.tick() {
                Ok(report) => {
                    if report.delivered + report.resolved + report.reprompted + report.failures > 0 {
                        debug!(?report, "tick");
                    }
                    self.settings.poll_interval
                }
                Err(err) => {
                    error!(error = %err, "tick failed");
                    self.settings.error_backoff
                }
            };
            sleep_unless_stopped(pause, stop);
        }

        info!("reconciliation loop stopped");
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(STOP_CHECK.min(deadline - now));
    }
}
