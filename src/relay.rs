//! Shared daemon state, built once at startup and handed to both the
//! reconciliation loop and the control plane.

use std::sync::Arc;
use std::time::Duration;

use crate::approval::ApprovalTracker;
use crate::db::Database;
use crate::gateway::ChatGateway;
use crate::models::Identity;
use crate::sink::{MessageSink, ResponseSinks};

/// Loop cadence and expiry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub cleanup_interval: Duration,
    pub session_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            error_backoff: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60 * 60),
            session_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub struct Relay {
    pub(crate) store: Arc<Database>,
    pub(crate) tracker: ApprovalTracker,
    pub(crate) gateway: Arc<dyn ChatGateway>,
    pub(crate) sinks: Arc<dyn ResponseSinks>,
    pub(crate) inbox: Arc<dyn MessageSink>,
    pub(crate) identity: Identity,
    pub(crate) channel_id: String,
    pub(crate) settings: LoopSettings,
}

impl Relay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Database>,
        tracker: ApprovalTracker,
        gateway: Arc<dyn ChatGateway>,
        sinks: Arc<dyn ResponseSinks>,
        inbox: Arc<dyn MessageSink>,
        identity: Identity,
        channel_id: impl Into<String>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            store,
            tracker,
            gateway,
            sinks,
            inbox,
            identity,
            channel_id: channel_id.into(),
            settings,
        }
    }

    pub fn store(&self) -> &Database {
        &self.store
    }

    pub fn tracker(&self) -> &ApprovalTracker {
        &self.tracker
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn settings(&self) -> LoopSettings {
        self.settings
    }
}
