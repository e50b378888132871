use anyhow::{bail, Result};
use std::io::{self, Write};

use mmrelay::db::Database;
use mmrelay::error::StoreError;

pub fn run(db: &Database, id: &str, force: bool) -> Result<()> {
    // Check the session exists first
    let session = match db.get(id) {
        Ok(session) => session,
        Err(StoreError::NotFound(_)) => bail!("Session {} not found", id),
        Err(err) => return Err(err.into()),
    };

    if !force {
        print!(
            "Delete session {} [{}] for {}? [y/N] ",
            id, session.status, session.project_path
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    db.delete(id)?;
    println!("Deleted session {}", id);

    Ok(())
}

/// Internal function for testing without stdin interaction
#[cfg(test)]
pub fn run_force(db: &Database, id: &str) -> Result<()> {
    run(db, id, true)
}
