use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Current schema version. Increment and append to `MIGRATIONS` when the
/// schema changes.
const CURRENT_VERSION: u32 = 1;

type MigrationFn = fn(&Connection) -> Result<()>;

/// Ordered list of migrations. Index 0 = version 1.
const MIGRATIONS: &[MigrationFn] = &[migrate_v1];

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );",
    )?;

    let current = current_version(conn)?;
    if current >= CURRENT_VERSION {
        return Ok(());
    }

    // Each migration plus its version bump commits atomically; BEGIN
    // IMMEDIATE takes the write lock up front.
    for version in (current + 1)..=CURRENT_VERSION {
        let idx = (version - 1) as usize;
        info!("applying schema migration v{}", version);

        conn.execute_batch("BEGIN IMMEDIATE")?;
        match MIGRATIONS[idx](conn) {
            Ok(()) => {
                conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
                conn.execute_batch("COMMIT")?;
            }
            Err(e) => {
                conn.execute_batch("ROLLBACK").ok();
                return Err(anyhow::anyhow!("migration v{} failed: {}", version, e));
            }
        }
    }

    Ok(())
}

fn current_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Version 1: full schema. Timestamps are integer seconds since the epoch;
/// `delivered_at IS NULL` rows form the offline spool.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            user_id        TEXT PRIMARY KEY,
            nickname       TEXT NOT NULL,
            password_hash  TEXT NOT NULL,
            created_at     INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS groups (
            group_id    TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            owner_id    TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_id   TEXT NOT NULL,
            user_id    TEXT NOT NULL,
            role       TEXT NOT NULL,
            joined_at  INTEGER NOT NULL,
            PRIMARY KEY (group_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            message_id         INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_type  TEXT NOT NULL,
            conversation_id    TEXT NOT NULL,
            sender_id          TEXT NOT NULL,
            sender_nickname    TEXT NOT NULL,
            content            TEXT NOT NULL,
            created_at         INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS message_targets (
            message_id    INTEGER NOT NULL,
            user_id       TEXT NOT NULL,
            delivered_at  INTEGER,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS files (
            file_id            TEXT PRIMARY KEY,
            uploader_id        TEXT NOT NULL,
            uploader_nickname  TEXT NOT NULL,
            conversation_type  TEXT NOT NULL,
            conversation_id    TEXT NOT NULL,
            file_name          TEXT NOT NULL,
            file_size          INTEGER NOT NULL,
            sha256             TEXT NOT NULL,
            storage_path       TEXT NOT NULL,
            created_at         INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS file_uploads (
            file_id        TEXT PRIMARY KEY,
            uploader_id    TEXT NOT NULL,
            temp_path      TEXT NOT NULL,
            uploaded_size  INTEGER NOT NULL,
            status         TEXT NOT NULL,
            updated_at     INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS file_targets (
            file_id       TEXT NOT NULL,
            user_id       TEXT NOT NULL,
            delivered_at  INTEGER,
            PRIMARY KEY (file_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_group_members_user
            ON group_members(user_id);
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_type, conversation_id);
        CREATE INDEX IF NOT EXISTS idx_targets_user
            ON message_targets(user_id, delivered_at);
        CREATE INDEX IF NOT EXISTS idx_files_conversation
            ON files(conversation_type, conversation_id);
        CREATE INDEX IF NOT EXISTS idx_file_targets_user
            ON file_targets(user_id, delivered_at);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), CURRENT_VERSION);

        // Every table exists.
        for table in [
            "users",
            "groups",
            "group_members",
            "messages",
            "message_targets",
            "files",
            "file_uploads",
            "file_targets",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }
}
