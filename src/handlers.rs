//! Entry points driven by the assistant side. Each one mutates the store or
//! tracker and posts to the session's thread before returning.

use tracing::{info, warn};

use crate::approval::RequestOutcome;
use crate::error::{GatewayError, RelayError, StoreError};
use crate::gateway::split_for_posts;
use crate::models::{Session, SessionStatus};
use crate::relay::Relay;

pub(crate) const REPROMPT: &str =
    "Please reply with:\n\u{2705} **approve** to proceed\n\u{274C} **deny** to cancel";
pub(crate) const APPROVED_ACK: &str = "\u{2705} Approved - executing...";
pub(crate) const DENIED_ACK: &str = "\u{274C} Denied - skipping";
pub(crate) const SESSION_ENDED: &str = "\u{2713} **Session ended**";

pub(crate) fn thread_header(session_id: &str, project_path: &str, status: SessionStatus) -> String {
    let mut header = format!(
        "\u{1F916} **Assistant session** in `{}`\nSession: `{}`",
        project_path, session_id
    );
    if status.is_terminal() {
        header.push_str(&format!("\n_Session {}_", status));
    }
    header
}

pub(crate) fn approval_prompt(tool_name: &str, command: &str, description: &str) -> String {
    let command = if command.contains('\n') || command.contains('`') {
        format!("\n```\n{}\n```", command)
    } else {
        format!(" `{}`", command)
    };
    format!(
        "\u{1F527} **Tool Request: {}**\n\n**Command:**{}\n\n**Description:** {}\n\nReply with:\n\u{2705} **approve** to execute\n\u{274C} **deny** to skip",
        tool_name, command, description
    )
}

impl Relay {
    /// Opens a thread for a new session. An existing id is returned untouched.
    pub fn start_session(&self, session_id: &str, project_path: &str) -> Result<Session, RelayError> {
        match self.store.get(session_id) {
            Ok(existing) => {
                warn!(session_id, status = %existing.status, "session already exists; not recreating");
                return Ok(existing);
            }
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let header = thread_header(session_id, project_path, SessionStatus::Active);
        let thread_id = self.gateway.create_thread(&header)?;

        match self
            .store
            .create(session_id, project_path, &thread_id, &self.channel_id)
        {
            Ok(session) => {
                info!(session_id, thread_id = %thread_id, project_path, "session started");
                Ok(session)
            }
            Err(StoreError::AlreadyExists(_)) => {
                warn!(session_id, "session created concurrently; keeping the existing row");
                Ok(self.store.get(session_id)?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Posts an approval prompt and returns the handle the assistant polls for
    /// the verdict.
    pub fn request_tool_approval(
        &self,
        session_id: &str,
        tool_name: &str,
        command: &str,
        description: &str,
    ) -> Result<String, RelayError> {
        let session = self.store.get(session_id)?;
        if session.status != SessionStatus::Active {
            return Err(RelayError::SessionInactive {
                id: session.id,
                status: session.status,
            });
        }

        let reply_floor = self.reply_floor(&session);
        let sink = self.sinks.open(session_id)?;
        let handle = sink.handle().to_string();

        // Registered before posting so a fast reply cannot race past the prompt.
        let outcome = self.tracker.request(
            &session.thread_id,
            session_id,
            tool_name,
            command,
            sink,
            reply_floor,
        )?;
        if let RequestOutcome::Replaced { previous_tool } = outcome {
            info!(session_id, previous_tool = %previous_tool, "earlier approval request superseded");
        }

        if let Err(err) = self.post(
            &session.thread_id,
            &approval_prompt(tool_name, command, description),
        ) {
            if let Err(discard_err) = self.tracker.discard(&session.thread_id) {
                warn!(session_id, error = %discard_err, "failed to discard unposted approval");
            }
            return Err(err.into());
        }

        self.store.touch(session_id)?;
        info!(session_id, tool_name, "approval requested");
        Ok(handle)
    }

    pub fn send_notification(&self, session_id: &str, message: &str) -> Result<(), RelayError> {
        let session = self.store.get(session_id)?;
        self.post(&session.thread_id, message)?;
        self.store.touch(session_id)?;
        Ok(())
    }

    /// Relays the assistant's reply text into the thread.
    pub fn send_response(&self, session_id: &str, response: &str) -> Result<(), RelayError> {
        if response.trim().is_empty() {
            return Ok(());
        }
        self.send_notification(session_id, response)
    }

    /// Ends the session, then posts the end marker and updates the thread
    /// header. Chat failures are logged; the store change stands regardless.
    /// A session that was already terminal is left as it is.
    pub fn end_session(&self, session_id: &str) -> Result<(), RelayError> {
        let session = self.store.get(session_id)?;
        let status = self.store.end(session_id)?;
        if let Err(err) = self.tracker.discard(&session.thread_id) {
            warn!(session_id, error = %err, "failed to discard pending approval");
        }

        if session.status.is_terminal() {
            info!(session_id, %status, "session already closed");
            return Ok(());
        }

        if status == SessionStatus::Ended {
            if let Err(err) = self.post(&session.thread_id, SESSION_ENDED) {
                warn!(session_id, error = %err, "failed to post session end marker");
            }
        }
        let header = thread_header(session_id, &session.project_path, status);
        if let Err(err) = self.gateway.edit_post(&session.thread_id, &header) {
            warn!(session_id, error = %err, "failed to update thread header");
        }

        info!(session_id, %status, "session ended");
        Ok(())
    }

    /// Newest human reply already in the thread. Falls back to the stored
    /// cursor when the thread cannot be read.
    fn reply_floor(&self, session: &Session) -> Option<i64> {
        match self
            .gateway
            .latest_reply_excluding(&session.thread_id, &self.identity.id)
        {
            Ok(latest) => latest
                .map(|post| post.create_at)
                .max(session.last_reply_at),
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "could not read thread before approval prompt");
                session.last_reply_at
            }
        }
    }

    pub(crate) fn post(&self, thread_id: &str, text: &str) -> Result<(), GatewayError> {
        for part in split_for_posts(text) {
            self.gateway.post_to_thread(thread_id, &part)?;
        }
        Ok(())
    }
}
