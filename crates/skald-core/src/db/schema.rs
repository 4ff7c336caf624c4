//! Schema creation, seeding and version migration.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{Result, SkaldError};
use crate::meta::{Lang, MetaGroup};

/// Schema version written into the `info` table.
pub const SCHEMA_VERSION: u32 = 2;
/// Key of the version row.
pub const VERSION_KEY: &str = "db_version";

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS info (
    info_name        TEXT    PRIMARY KEY,
    info_value       TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS file (
    file_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path        TEXT    NOT NULL UNIQUE,
    file_mtime       INTEGER NOT NULL,
    checked          INTEGER NOT NULL,
    interrupted      INTEGER NOT NULL,
    outofpath        INTEGER NOT NULL,
    type_id          INTEGER NULL
);

CREATE TABLE IF NOT EXISTS type (
    type_id          INTEGER PRIMARY KEY,
    type_name        TEXT    NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS meta (
    meta_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    meta_name        TEXT    NOT NULL UNIQUE COLLATE NOCASE
);

CREATE TABLE IF NOT EXISTS data (
    data_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    data_value       TEXT    NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS grp (
    grp_id           INTEGER PRIMARY KEY,
    grp_name         TEXT    NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS lang (
    lang_id          INTEGER PRIMARY KEY,
    lang_short       TEXT    NOT NULL UNIQUE,
    lang_long        TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS grabber (
    grabber_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    grabber_name     TEXT    NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS dlcontext (
    dlcontext_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    dlcontext_url    TEXT    NOT NULL,
    dlcontext_dst    INTEGER NOT NULL,
    dlcontext_name   TEXT    NOT NULL,
    file_id          INTEGER NULL
);

CREATE TABLE IF NOT EXISTS assoc_file_metadata (
    file_id          INTEGER NOT NULL,
    meta_id          INTEGER NOT NULL,
    data_id          INTEGER NOT NULL,
    grp_id           INTEGER NOT NULL,
    lang_id          INTEGER NOT NULL DEFAULT 1,
    external         INTEGER NOT NULL,
    priority         INTEGER NOT NULL,
    PRIMARY KEY (file_id, meta_id, data_id)
);

CREATE TABLE IF NOT EXISTS assoc_file_grabber (
    file_id          INTEGER NOT NULL,
    grabber_id       INTEGER NOT NULL,
    PRIMARY KEY (file_id, grabber_id)
);

CREATE INDEX IF NOT EXISTS checked_idx     ON file (checked);
CREATE INDEX IF NOT EXISTS interrupted_idx ON file (interrupted);
CREATE INDEX IF NOT EXISTS outofpath_idx   ON file (outofpath);
CREATE INDEX IF NOT EXISTS assoc_idx       ON assoc_file_metadata (meta_id, data_id);
"#;

/// One migration: a named batch of steps run inside a transaction; the
/// version row is rewritten only when every step succeeded.
struct Migration {
    from: u32,
    to: u32,
    name: &'static str,
    steps: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[Migration {
    from: 1,
    to: 2,
    name: "add language dimension",
    steps: &[
        "CREATE TABLE IF NOT EXISTS lang (
             lang_id    INTEGER PRIMARY KEY,
             lang_short TEXT    NOT NULL UNIQUE,
             lang_long  TEXT    NOT NULL
         );",
        "ALTER TABLE assoc_file_metadata ADD COLUMN lang_id INTEGER NOT NULL DEFAULT 1;",
    ],
}];

pub(super) fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA busy_timeout=30000;
         PRAGMA synchronous=NORMAL;
         PRAGMA temp_store=MEMORY;",
    )?;
    Ok(())
}

pub(super) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES)?;
    seed_rows(conn)?;
    check_version(conn)?;
    Ok(())
}

/// Fixed enumerations get stable row ids so the conversion back from a row
/// stays arithmetic.
fn seed_rows(conn: &Connection) -> Result<()> {
    for grp in MetaGroup::ALL {
        conn.execute(
            "INSERT OR IGNORE INTO grp (grp_id, grp_name) VALUES (?1, ?2)",
            params![grp.db_id(), grp.as_str()],
        )?;
    }
    for lang in Lang::ALL {
        conn.execute(
            "INSERT OR IGNORE INTO lang (lang_id, lang_short, lang_long) VALUES (?1, ?2, ?3)",
            params![lang.db_id(), lang.short(), lang.long()],
        )?;
    }
    for (id, name) in [(1, "audio"), (2, "video"), (3, "image"), (4, "playlist")] {
        conn.execute(
            "INSERT OR IGNORE INTO type (type_id, type_name) VALUES (?1, ?2)",
            params![id, name],
        )?;
    }
    Ok(())
}

fn read_version(conn: &Connection) -> Result<Option<u32>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT info_value FROM info WHERE info_name = ?1",
            params![VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()))
}

fn write_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO info (info_name, info_value) VALUES (?1, ?2)
         ON CONFLICT(info_name) DO UPDATE SET info_value = ?2",
        params![VERSION_KEY, version.to_string()],
    )?;
    Ok(())
}

fn check_version(conn: &Connection) -> Result<()> {
    let mut version = match read_version(conn)? {
        Some(v) => v,
        None => {
            // Fresh database.
            write_version(conn, SCHEMA_VERSION)?;
            return Ok(());
        }
    };

    if version > SCHEMA_VERSION {
        return Err(SkaldError::SchemaTooNew {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    while version < SCHEMA_VERSION {
        let migration = MIGRATIONS
            .iter()
            .find(|m| m.from == version)
            .ok_or_else(|| SkaldError::Database {
                message: format!("no migration path from schema version {version}"),
                source: None,
            })?;

        info!(
            from = migration.from,
            to = migration.to,
            "migrating database schema: {}",
            migration.name
        );

        conn.execute_batch("BEGIN;")?;
        let applied = migration
            .steps
            .iter()
            .try_for_each(|step| conn.execute_batch(step).map(|_| ()))
            .and_then(|()| {
                conn.execute(
                    "UPDATE info SET info_value = ?1 WHERE info_name = ?2",
                    params![migration.to.to_string(), VERSION_KEY],
                )
                .map(|_| ())
            });

        match applied {
            Ok(()) => conn.execute_batch("COMMIT;")?,
            Err(e) => {
                // Leave the database untouched.
                let _ = conn.execute_batch("ROLLBACK;");
                return Err(e.into());
            }
        }

        debug!(version = migration.to, "schema migration applied");
        version = migration.to;
    }

    Ok(())
}
