use anyhow::Result;

use mmrelay::db::Database;
use mmrelay::models::{Session, SessionStatus};

pub fn run(db: &Database, status: Option<SessionStatus>) -> Result<()> {
    let sessions = db.list(status)?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    for session in &sessions {
        println!("{}", format_row(session));
    }

    Ok(())
}

fn format_row(session: &Session) -> String {
    let status_display = format!("[{}]", session.status);
    format!(
        "{:<24} {:9} {:<40} {}",
        truncate(&session.id, 24),
        status_display,
        truncate(&session.project_path, 40),
        session.last_active.format("%Y-%m-%d %H:%M")
    )
}

fn truncate(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars - 3).collect();
        format!("{}...", truncated)
    }
}
