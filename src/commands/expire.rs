use anyhow::Result;
use chrono::Duration;

use mmrelay::db::Database;

// Keeps the cutoff timestamp representable.
const MAX_HOURS: u64 = 24 * 365 * 100;

/// One expiry sweep: active sessions idle for at least `hours` time out, and
/// their pending approvals are dropped.
pub fn run(db: &Database, hours: u64) -> Result<()> {
    let hours = hours.min(MAX_HOURS) as i64;
    let expired = db.expire_inactive(Duration::hours(hours))?;
    let pruned = db.prune_pending()?;

    if expired == 0 {
        println!("No sessions idle for {}h or more.", hours);
    } else {
        println!("Timed out {} session(s).", expired);
    }
    if pruned > 0 {
        println!("Dropped {} pending approval(s).", pruned);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmrelay::models::SessionStatus;
    use tempfile::tempdir;

    fn setup_test_db() -> (Database, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = Database::open(&db_path).unwrap();
        (db, dir)
    }

    // ==================== Unit Tests ====================

    #[test]
    fn test_expire_with_zero_hours() {
        let (db, _dir) = setup_test_db();
        db.create("s1", "/a", "t1", "c1").unwrap();

        run(&db, 0).unwrap();
        assert_eq!(db.get("s1").unwrap().status, SessionStatus::Timeout);
    }

    #[test]
    fn test_expire_keeps_recent_sessions() {
        let (db, _dir) = setup_test_db();
        db.create("s1", "/a", "t1", "c1").unwrap();

        run(&db, 24).unwrap();
        assert_eq!(db.get("s1").unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn test_expire_huge_hours_does_not_panic() {
        let (db, _dir) = setup_test_db();
        db.create("s1", "/a", "t1", "c1").unwrap();
        run(&db, u64::MAX).unwrap();
        assert_eq!(db.get("s1").unwrap().status, SessionStatus::Active);
    }
}
