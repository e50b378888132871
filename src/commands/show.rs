use anyhow::{bail, Result};

use mmrelay::db::Database;
use mmrelay::error::StoreError;
use mmrelay::models::Session;

pub fn run(db: &Database, id: &str) -> Result<()> {
    let session = match db.get(id) {
        Ok(session) => session,
        Err(StoreError::NotFound(_)) => bail!("Session {} not found", id),
        Err(err) => return Err(err.into()),
    };

    for line in describe(&session) {
        println!("{}", line);
    }

    Ok(())
}

fn describe(session: &Session) -> Vec<String> {
    let mut lines = vec![
        format!("Session {}", session.id),
        format!("Status: {}", session.status),
        format!("Project: {}", session.project_path),
        format!("Thread: {}", session.thread_id),
        format!("Channel: {}", session.channel_id),
        format!("Created: {}", session.created_at.format("%Y-%m-%d %H:%M:%S")),
        format!("Last active: {}", session.last_active.format("%Y-%m-%d %H:%M:%S")),
    ];
    if let Some(cursor) = session.last_reply_at {
        lines.push(format!("Last reply seen: {}", cursor));
    }
    lines
}
