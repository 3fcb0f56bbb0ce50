use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE: &str = "organizer.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // WAL lets display queries read a consistent snapshot while a writer holds the lock.
    conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get::<_, String>(0))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS organizations(
            id INTEGER PRIMARY KEY,
            code TEXT UNIQUE,
            name TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id INTEGER PRIMARY KEY,
            code TEXT UNIQUE,
            name TEXT NOT NULL DEFAULT '',
            start_date TEXT,
            end_date TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS persons(
            id INTEGER PRIMARY KEY,
            code TEXT UNIQUE,
            surname TEXT NOT NULL DEFAULT '',
            forename TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS rooms(
            id INTEGER PRIMARY KEY,
            code TEXT UNIQUE,
            name TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_groups(
            id INTEGER PRIMARY KEY,
            code TEXT UNIQUE,
            name TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events(
            id INTEGER PRIMARY KEY,
            code TEXT UNIQUE,
            organization_id INTEGER,
            name TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(organization_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS blocks(
            id INTEGER PRIMARY KEY,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            UNIQUE(date, start_time, end_time)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS units(
            id INTEGER PRIMARY KEY,
            code TEXT,
            organization_id INTEGER NOT NULL,
            term_id INTEGER NOT NULL,
            delta TEXT NOT NULL DEFAULT 'new',
            modified TEXT NOT NULL,
            FOREIGN KEY(organization_id) REFERENCES organizations(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            UNIQUE(organization_id, term_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_units_scope ON units(organization_id, term_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS instances(
            id INTEGER PRIMARY KEY,
            code TEXT UNIQUE,
            block_id INTEGER,
            event_id INTEGER,
            unit_id INTEGER NOT NULL,
            method_id INTEGER,
            delta TEXT NOT NULL DEFAULT 'new',
            modified TEXT NOT NULL,
            FOREIGN KEY(block_id) REFERENCES blocks(id),
            FOREIGN KEY(event_id) REFERENCES events(id),
            FOREIGN KEY(unit_id) REFERENCES units(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instances_unit ON instances(unit_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pools(
            id INTEGER PRIMARY KEY,
            group_id INTEGER,
            name TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(group_id) REFERENCES student_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS organization_resources(
            id INTEGER PRIMARY KEY,
            organization_id INTEGER NOT NULL,
            group_id INTEGER,
            person_id INTEGER,
            room_id INTEGER,
            FOREIGN KEY(organization_id) REFERENCES organizations(id),
            FOREIGN KEY(group_id) REFERENCES student_groups(id),
            FOREIGN KEY(person_id) REFERENCES persons(id),
            FOREIGN KEY(room_id) REFERENCES rooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_publishing(
            group_id INTEGER NOT NULL,
            term_id INTEGER NOT NULL,
            published INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY(group_id, term_id),
            FOREIGN KEY(group_id) REFERENCES student_groups(id),
            FOREIGN KEY(term_id) REFERENCES terms(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS instance_persons(
            id INTEGER PRIMARY KEY,
            instance_id INTEGER NOT NULL,
            person_id INTEGER NOT NULL,
            role_id INTEGER NOT NULL DEFAULT 1,
            delta TEXT NOT NULL DEFAULT 'new',
            modified TEXT NOT NULL,
            FOREIGN KEY(instance_id) REFERENCES instances(id),
            FOREIGN KEY(person_id) REFERENCES persons(id),
            UNIQUE(instance_id, person_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instance_persons_person ON instance_persons(person_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS instance_groups(
            id INTEGER PRIMARY KEY,
            assoc_id INTEGER NOT NULL,
            group_id INTEGER NOT NULL,
            delta TEXT NOT NULL DEFAULT 'new',
            modified TEXT NOT NULL,
            FOREIGN KEY(assoc_id) REFERENCES instance_persons(id),
            FOREIGN KEY(group_id) REFERENCES student_groups(id),
            UNIQUE(assoc_id, group_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instance_groups_group ON instance_groups(group_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS instance_rooms(
            id INTEGER PRIMARY KEY,
            assoc_id INTEGER NOT NULL,
            room_id INTEGER NOT NULL,
            delta TEXT NOT NULL DEFAULT 'new',
            modified TEXT NOT NULL,
            FOREIGN KEY(assoc_id) REFERENCES instance_persons(id),
            FOREIGN KEY(room_id) REFERENCES rooms(id),
            UNIQUE(assoc_id, room_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instance_rooms_room ON instance_rooms(room_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedules(
            id INTEGER PRIMARY KEY,
            organization_id INTEGER NOT NULL,
            term_id INTEGER NOT NULL,
            user_id INTEGER,
            creation_date TEXT NOT NULL,
            creation_time TEXT NOT NULL,
            schedule TEXT NOT NULL,
            checksum TEXT,
            active INTEGER NOT NULL DEFAULT 0,
            activated_at TEXT,
            FOREIGN KEY(organization_id) REFERENCES organizations(id),
            FOREIGN KEY(term_id) REFERENCES terms(id)
        )",
        [],
    )?;
    ensure_schedules_checksum(&conn)?;
    ensure_schedules_activated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_scope ON schedules(organization_id, term_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS access_admins(
            user_id INTEGER PRIMARY KEY
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS access_schedulers(
            user_id INTEGER NOT NULL,
            organization_id INTEGER NOT NULL,
            PRIMARY KEY(user_id, organization_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS operation_log(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            organization_id INTEGER,
            term_id INTEGER,
            user_id INTEGER,
            summary_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_schedules_checksum(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "schedules", "checksum")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE schedules ADD COLUMN checksum TEXT", [])?;
    Ok(())
}

fn ensure_schedules_activated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "schedules", "activated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE schedules ADD COLUMN activated_at TEXT", [])?;
    // Best-effort: currently active snapshots count as activated at creation.
    conn.execute(
        "UPDATE schedules SET activated_at = creation_date || ' ' || creation_time WHERE active = 1",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Starts a write transaction that takes SQLite's writer lock up front, so
/// competing activations/merges are serialized instead of interleaved.
pub fn begin_write(conn: &Connection) -> rusqlite::Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
}

/// Starts a deferred transaction so a multi-statement read sees one snapshot.
pub fn begin_read(conn: &Connection) -> rusqlite::Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Deferred)
}

pub fn set_busy_timeout(conn: &Connection, ms: u64) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_millis(ms))
}

/// UTC timestamp in the sortable `YYYY-MM-DD HH:MM:SS` form used by every
/// `modified` column.
pub fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("setting {} is invalid JSON", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
