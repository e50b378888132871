use anyhow::{bail, Result};

use mmrelay::db::Database;
use mmrelay::error::StoreError;
use mmrelay::models::SessionStatus;

/// Marks a session ended in the store without touching its thread.
pub fn run(db: &Database, id: &str) -> Result<()> {
    let status = match db.end(id) {
        Ok(status) => status,
        Err(StoreError::NotFound(_)) => bail!("Session {} not found", id),
        Err(err) => return Err(err.into()),
    };

    if status == SessionStatus::Ended {
        println!("Ended session {}", id);
    } else {
        println!("Session {} already {}", id, status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup_test_db() -> (Database, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = Database::open(&db_path).unwrap();
        (db, dir)
    }

    // ==================== Unit Tests ====================

    #[test]
    fn test_end_active_session() {
        let (db, _dir) = setup_test_db();
        db.create("s1", "/a", "t1", "c1").unwrap();

        run(&db, "s1").unwrap();
        assert_eq!(db.get("s1").unwrap().status, SessionStatus::Ended);
    }

    #[test]
    fn test_end_timed_out_session_keeps_status() {
        let (db, _dir) = setup_test_db();
        db.create("s1", "/a", "t1", "c1").unwrap();
        db.expire_inactive(chrono::Duration::zero()).unwrap();

        run(&db, "s1").unwrap();
        assert_eq!(db.get("s1").unwrap().status, SessionStatus::Timeout);
    }

    #[test]
    fn test_end_nonexistent_session() {
        let (db, _dir) = setup_test_db();
        let result = run(&db, "ghost");
        assert!(result.unwrap_err().to_string().contains("not found"));
    }
}
