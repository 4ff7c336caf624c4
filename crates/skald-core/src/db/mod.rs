//! Persistence layer over the bundled SQLite store.
//!
//! The connection lives behind a mutex and is shared: the DB-Manager thread
//! performs every write, while the public query surface and the on-demand
//! completeness check only read. Uniqueness violations on the name/value
//! tables are the normal "insert or lookup" path, not errors.

mod query;
mod schema;

pub use query::{FileMetaRow, FileRef, FileRes, MetaRes, Restriction, RestrictOp, SearchSpec};
pub use schema::SCHEMA_VERSION;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, warn};

use crate::config::{priority, DlKind, MetaPriority};
use crate::error::{Result, SkaldError};
use crate::filedata::{DownloadItem, FileData, FileType};
use crate::meta::{keys, Lang, MetaGroup, MetaList};

/// Snapshot of one `file` row, mostly for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub id: i64,
    pub mtime: i64,
    pub checked: i64,
    pub interrupted: i64,
    pub outofpath: i64,
    pub file_type: FileType,
}

/// Handle on the SQLite store. Cloning shares the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    in_txn: Arc<AtomicBool>,
}

impl Database {
    /// Open (or create) the store at `path`, validating the schema version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| SkaldError::Io {
                    message: format!("failed to create database directory: {e}"),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(path)?;
        schema::configure_connection(&conn)?;
        schema::ensure_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            in_txn: Arc::new(AtomicBool::new(false)),
        })
    }

    /// In-memory store, used by the test suites.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            in_txn: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| SkaldError::Database {
            message: format!("failed to lock database: {e}"),
            source: None,
        })
    }

    /* Transactions */

    pub fn begin_transaction(&self) -> Result<()> {
        if !self.in_txn.swap(true, Ordering::SeqCst) {
            self.lock()?.execute_batch("BEGIN;")?;
        }
        Ok(())
    }

    pub fn end_transaction(&self) -> Result<()> {
        if self.in_txn.swap(false, Ordering::SeqCst) {
            self.lock()?.execute_batch("COMMIT;")?;
        }
        Ok(())
    }

    /// Commit and reopen the transaction every `interval` row operations.
    /// This is the only durability batching mechanism.
    pub fn step_transaction(&self, interval: u32, count: u32) -> Result<()> {
        if interval == 0 || count == 0 || count % interval != 0 {
            return Ok(());
        }
        if self.in_txn.load(Ordering::SeqCst) {
            let conn = self.lock()?;
            conn.execute_batch("COMMIT;")?;
            conn.execute_batch("BEGIN;")?;
            debug!(count, "transaction stepped");
        }
        Ok(())
    }

    /* Insert-or-lookup helpers: a unique violation is the lookup path. */

    fn insert_or_get(
        conn: &Connection,
        insert_sql: &str,
        select_sql: &str,
        value: &str,
    ) -> Result<i64> {
        match conn.execute(insert_sql, params![value]) {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                conn.query_row(select_sql, params![value], |row| row.get(0))
                    .map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn meta_id(conn: &Connection, name: &str) -> Result<i64> {
        Self::insert_or_get(
            conn,
            "INSERT INTO meta (meta_name) VALUES (?1)",
            "SELECT meta_id FROM meta WHERE meta_name = ?1",
            name,
        )
    }

    fn data_id(conn: &Connection, value: &str) -> Result<i64> {
        Self::insert_or_get(
            conn,
            "INSERT INTO data (data_value) VALUES (?1)",
            "SELECT data_id FROM data WHERE data_value = ?1",
            value,
        )
    }

    fn grabber_id(conn: &Connection, name: &str) -> Result<i64> {
        Self::insert_or_get(
            conn,
            "INSERT INTO grabber (grabber_name) VALUES (?1)",
            "SELECT grabber_id FROM grabber WHERE grabber_name = ?1",
            name,
        )
    }

    fn file_id(conn: &Connection, path: &Path) -> Result<Option<i64>> {
        conn.query_row(
            "SELECT file_id FROM file WHERE file_path = ?1",
            params![path_str(path)],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /* File rows */

    pub fn file_mtime(&self, path: &Path) -> Result<Option<i64>> {
        self.lock()?
            .query_row(
                "SELECT file_mtime FROM file WHERE file_path = ?1",
                params![path_str(path)],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn file_interrupted(&self, path: &Path) -> Result<Option<i64>> {
        self.lock()?
            .query_row(
                "SELECT interrupted FROM file WHERE file_path = ?1",
                params![path_str(path)],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Whether the store already holds a completed record for `path` at
    /// `mtime`.
    pub fn file_complete(&self, path: &Path, mtime: i64) -> Result<bool> {
        let row: Option<(i64, i64)> = self
            .lock()?
            .query_row(
                "SELECT file_mtime, interrupted FROM file WHERE file_path = ?1",
                params![path_str(path)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(matches!(row, Some((m, i)) if m == mtime && i == 0))
    }

    /// Insert a freshly discovered file: `checked = 1`, `interrupted = -1`.
    pub fn file_insert(&self, data: &FileData) -> Result<()> {
        let conn = self.lock()?;
        match conn.execute(
            "INSERT INTO file (file_path, file_mtime, checked, interrupted, outofpath)
             VALUES (?1, ?2, 1, -1, ?3)",
            params![path_str(data.path()), data.mtime(), data.outofpath() as i64],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the parser results: refresh the file row (back to in-flight)
    /// and associate the parser metadata plus the synthetic `filesize`.
    pub fn file_parser_write(&self, data: &FileData) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE file
             SET file_mtime = ?1, checked = 1, interrupted = -1,
                 outofpath = ?2, type_id = ?3
             WHERE file_path = ?4",
            params![
                data.mtime(),
                data.outofpath() as i64,
                data.file_type().db_id(),
                path_str(data.path())
            ],
        )?;

        let Some(file_id) = Self::file_id(&conn, data.path())? else {
            warn!(path = %data.path().display(), "parser write for unknown file");
            return Ok(());
        };

        for entry in data.meta_parser().iter() {
            Self::associate(
                &conn,
                file_id,
                &entry.name,
                &entry.value,
                entry.group,
                entry.lang,
                false,
                entry.priority,
            )?;
        }

        Self::associate(
            &conn,
            file_id,
            keys::FILESIZE,
            &data.size().to_string(),
            MetaGroup::Technical,
            Lang::Undef,
            false,
            priority::HIGHEST,
        )?;
        Ok(())
    }

    /// Write one grabber's metadata batch and its grabber association.
    pub fn file_grab_write(
        &self,
        path: &Path,
        meta: &MetaList,
        grabber: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let Some(file_id) = Self::file_id(&conn, path)? else {
            warn!(path = %path.display(), "grabber write for unknown file");
            return Ok(());
        };

        for entry in meta.iter() {
            Self::associate(
                &conn,
                file_id,
                &entry.name,
                &entry.value,
                entry.group,
                entry.lang,
                false,
                entry.priority,
            )?;
        }

        if let Some(name) = grabber {
            let grabber_id = Self::grabber_id(&conn, name)?;
            match conn.execute(
                "INSERT INTO assoc_file_grabber (file_id, grabber_id) VALUES (?1, ?2)",
                params![file_id, grabber_id],
            ) {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Insert one association; when the triple already exists and is
    /// internal, refresh its group, external flag and priority. External
    /// rows are never touched here.
    #[allow(clippy::too_many_arguments)]
    fn associate(
        conn: &Connection,
        file_id: i64,
        name: &str,
        value: &str,
        group: MetaGroup,
        lang: Lang,
        external: bool,
        prio: MetaPriority,
    ) -> Result<()> {
        let meta_id = Self::meta_id(conn, name)?;
        let data_id = Self::data_id(conn, value)?;

        match conn.execute(
            "INSERT INTO assoc_file_metadata
             (file_id, meta_id, data_id, grp_id, lang_id, external, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                file_id,
                meta_id,
                data_id,
                group.db_id(),
                lang.db_id(),
                external as i64,
                prio as i64
            ],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                let existing_ext: Option<i64> = conn
                    .query_row(
                        "SELECT external FROM assoc_file_metadata
                         WHERE file_id = ?1 AND meta_id = ?2 AND data_id = ?3",
                        params![file_id, meta_id, data_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if existing_ext == Some(0) {
                    conn.execute(
                        "UPDATE assoc_file_metadata
                         SET grp_id = ?1, lang_id = ?2, external = ?3, priority = ?4
                         WHERE file_id = ?5 AND meta_id = ?6 AND data_id = ?7",
                        params![
                            group.db_id(),
                            lang.db_id(),
                            external as i64,
                            prio as i64,
                            file_id,
                            meta_id,
                            data_id
                        ],
                    )?;
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /* External metadata API (always external = 1) */

    pub fn metadata_ext_insert(
        &self,
        path: &Path,
        name: &str,
        value: &str,
        lang: Lang,
        group: MetaGroup,
    ) -> Result<()> {
        let conn = self.lock()?;
        let Some(file_id) = Self::file_id(&conn, path)? else {
            return Err(SkaldError::FileNotFound(path.to_path_buf()));
        };
        let meta_id = Self::meta_id(&conn, &name.to_ascii_lowercase())?;
        let data_id = Self::data_id(&conn, value)?;
        conn.execute(
            "INSERT INTO assoc_file_metadata
             (file_id, meta_id, data_id, grp_id, lang_id, external, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
             ON CONFLICT(file_id, meta_id, data_id) DO UPDATE
             SET grp_id = ?4, lang_id = ?5, external = 1, priority = ?6",
            params![
                file_id,
                meta_id,
                data_id,
                group.db_id(),
                lang.db_id(),
                priority::HIGHEST as i64
            ],
        )?;
        Ok(())
    }

    pub fn metadata_ext_update(
        &self,
        path: &Path,
        name: &str,
        old_value: &str,
        new_value: &str,
        lang: Lang,
    ) -> Result<()> {
        let conn = self.lock()?;
        let Some(file_id) = Self::file_id(&conn, path)? else {
            return Err(SkaldError::FileNotFound(path.to_path_buf()));
        };
        let meta_id = Self::meta_id(&conn, &name.to_ascii_lowercase())?;
        let old_data_id = Self::data_id(&conn, old_value)?;

        let old_row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT grp_id, priority FROM assoc_file_metadata
                 WHERE file_id = ?1 AND meta_id = ?2 AND data_id = ?3",
                params![file_id, meta_id, old_data_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((grp_id, prio)) = old_row else {
            return Ok(());
        };

        conn.execute(
            "DELETE FROM assoc_file_metadata
             WHERE file_id = ?1 AND meta_id = ?2 AND data_id = ?3",
            params![file_id, meta_id, old_data_id],
        )?;

        let new_data_id = Self::data_id(&conn, new_value)?;
        conn.execute(
            "INSERT INTO assoc_file_metadata
             (file_id, meta_id, data_id, grp_id, lang_id, external, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
             ON CONFLICT(file_id, meta_id, data_id) DO UPDATE
             SET external = 1, lang_id = ?5",
            params![file_id, meta_id, new_data_id, grp_id, lang.db_id(), prio],
        )?;
        Ok(())
    }

    pub fn metadata_delete(&self, path: &Path, name: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        let Some(file_id) = Self::file_id(&conn, path)? else {
            return Ok(());
        };
        conn.execute(
            "DELETE FROM assoc_file_metadata
             WHERE file_id = ?1
               AND meta_id = (SELECT meta_id FROM meta WHERE meta_name = ?2)
               AND data_id = (SELECT data_id FROM data WHERE data_value = ?3)",
            params![file_id, name.to_ascii_lowercase(), value],
        )?;
        Ok(())
    }

    /// Update association priorities; three distinct scopes depending on
    /// which of `name` / `value` are given.
    pub fn metadata_priority(
        &self,
        path: &Path,
        name: Option<&str>,
        value: Option<&str>,
        prio: MetaPriority,
    ) -> Result<()> {
        let conn = self.lock()?;
        let Some(file_id) = Self::file_id(&conn, path)? else {
            return Ok(());
        };
        match (name, value) {
            (None, _) => {
                conn.execute(
                    "UPDATE assoc_file_metadata SET priority = ?1 WHERE file_id = ?2",
                    params![prio as i64, file_id],
                )?;
            }
            (Some(name), None) => {
                conn.execute(
                    "UPDATE assoc_file_metadata SET priority = ?1
                     WHERE file_id = ?2
                       AND meta_id = (SELECT meta_id FROM meta WHERE meta_name = ?3)",
                    params![prio as i64, file_id, name.to_ascii_lowercase()],
                )?;
            }
            (Some(name), Some(value)) => {
                conn.execute(
                    "UPDATE assoc_file_metadata SET priority = ?1
                     WHERE file_id = ?2
                       AND meta_id = (SELECT meta_id FROM meta WHERE meta_name = ?3)
                       AND data_id = (SELECT data_id FROM data WHERE data_value = ?4)",
                    params![prio as i64, file_id, name.to_ascii_lowercase(), value],
                )?;
            }
        }
        Ok(())
    }

    /* Deletion & sweep */

    pub fn file_delete(&self, path: &Path) -> Result<()> {
        self.lock()?.execute(
            "DELETE FROM file WHERE file_path = ?1",
            params![path_str(path)],
        )?;
        Ok(())
    }

    /// Delete the internal metadata of one file; external rows stay until
    /// the file row itself goes away.
    pub fn file_data_delete(&self, path: &Path) -> Result<()> {
        let conn = self.lock()?;
        let Some(file_id) = Self::file_id(&conn, path)? else {
            return Ok(());
        };
        conn.execute(
            "DELETE FROM assoc_file_metadata WHERE file_id = ?1 AND external = 0",
            params![file_id],
        )?;
        Ok(())
    }

    /// Mark one file as observed in the current loop.
    pub fn file_checked_set(&self, path: &Path) -> Result<()> {
        self.lock()?.execute(
            "UPDATE file SET checked = 1 WHERE file_path = ?1",
            params![path_str(path)],
        )?;
        Ok(())
    }

    /// Forget which grabbers ran for one file (content changed, their
    /// results are stale).
    pub fn file_grab_delete(&self, path: &Path) -> Result<()> {
        let conn = self.lock()?;
        let Some(file_id) = Self::file_id(&conn, path)? else {
            return Ok(());
        };
        conn.execute(
            "DELETE FROM assoc_file_grabber WHERE file_id = ?1",
            params![file_id],
        )?;
        Ok(())
    }

    pub fn checked_clear_all(&self) -> Result<()> {
        self.lock()?.execute("UPDATE file SET checked = 0", [])?;
        Ok(())
    }

    /// Paths that were not observed in the last loop and are inside the
    /// configured roots.
    pub fn files_unchecked(&self) -> Result<Vec<std::path::PathBuf>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT file_path FROM file WHERE checked = 0 AND outofpath = 0")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .map(std::path::PathBuf::from)
            .collect();
        Ok(rows)
    }

    pub fn files_outofpath(&self) -> Result<Vec<std::path::PathBuf>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT file_path FROM file WHERE outofpath = 1")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .map(std::path::PathBuf::from)
            .collect();
        Ok(rows)
    }

    /// Rewrite in-flight markers so the next loop re-enters those files.
    pub fn interrupted_fix(&self) -> Result<()> {
        self.lock()?
            .execute("UPDATE file SET interrupted = 1 WHERE interrupted = -1", [])?;
        Ok(())
    }

    pub fn interrupted_clear(&self, path: &Path) -> Result<()> {
        self.lock()?.execute(
            "UPDATE file SET interrupted = 0 WHERE file_path = ?1",
            params![path_str(path)],
        )?;
        Ok(())
    }

    /// Remove orphaned associations, keys, values and grabbers. Returns the
    /// number of rows deleted.
    pub fn cleanup(&self) -> Result<usize> {
        let conn = self.lock()?;
        let mut changed = 0;
        for sql in [
            "DELETE FROM assoc_file_metadata
             WHERE file_id NOT IN (SELECT file_id FROM file)",
            "DELETE FROM assoc_file_grabber
             WHERE file_id NOT IN (SELECT file_id FROM file)",
            "DELETE FROM dlcontext
             WHERE file_id IS NOT NULL AND file_id NOT IN (SELECT file_id FROM file)",
            "DELETE FROM meta
             WHERE meta_id NOT IN (SELECT meta_id FROM assoc_file_metadata)",
            "DELETE FROM data
             WHERE data_id NOT IN (SELECT data_id FROM assoc_file_metadata)",
            "DELETE FROM grabber
             WHERE grabber_id NOT IN (SELECT grabber_id FROM assoc_file_grabber)",
        ] {
            changed += conn.execute(sql, [])?;
        }
        Ok(changed)
    }

    /* Grabber bookkeeping */

    pub fn grabbers_for_file(&self, path: &Path) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT grabber.grabber_name
             FROM grabber
             INNER JOIN assoc_file_grabber AS assoc
                 ON grabber.grabber_id = assoc.grabber_id
             INNER JOIN file ON assoc.file_id = file.file_id
             WHERE file.file_path = ?1",
        )?;
        let rows = stmt
            .query_map(params![path_str(path)], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /* Download contexts */

    pub fn dlcontext_save(&self, path: &Path, items: &[DownloadItem]) -> Result<()> {
        let conn = self.lock()?;
        let Some(file_id) = Self::file_id(&conn, path)? else {
            return Ok(());
        };
        for item in items {
            conn.execute(
                "INSERT INTO dlcontext (dlcontext_url, dlcontext_dst, dlcontext_name, file_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![item.url, item.dst as i64, item.name, file_id],
            )?;
        }
        Ok(())
    }

    pub fn dlcontext_for_file(&self, path: &Path) -> Result<Vec<DownloadItem>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT dlcontext_url, dlcontext_dst, dlcontext_name
             FROM dlcontext
             INNER JOIN file ON dlcontext.file_id = file.file_id
             WHERE file.file_path = ?1",
        )?;
        let rows = stmt
            .query_map(params![path_str(path)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(url, dst, name)| {
                DlKind::from_index(dst).map(|dst| DownloadItem { url, dst, name })
            })
            .collect();
        Ok(rows)
    }

    pub fn dlcontext_delete_all(&self) -> Result<()> {
        self.lock()?.execute("DELETE FROM dlcontext", [])?;
        Ok(())
    }

    /* Diagnostics */

    pub fn file_row(&self, path: &Path) -> Result<Option<FileRow>> {
        self.lock()?
            .query_row(
                "SELECT file_id, file_mtime, checked, interrupted, outofpath, type_id
                 FROM file WHERE file_path = ?1",
                params![path_str(path)],
                |row| {
                    Ok(FileRow {
                        id: row.get(0)?,
                        mtime: row.get(1)?,
                        checked: row.get(2)?,
                        interrupted: row.get(3)?,
                        outofpath: row.get(4)?,
                        file_type: FileType::from_db_id(row.get(5)?),
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::Band;
    use crate::filedata::{OdKind, Step};

    fn record(path: &str, mtime: i64) -> std::sync::Arc<FileData> {
        FileData::new(path, mtime, 64, false, OdKind::Scan, Band::Normal, Step::Parsing)
    }

    fn db_with_file(path: &str, mtime: i64) -> Database {
        let db = Database::open_in_memory().unwrap();
        let data = record(path, mtime);
        db.file_insert(&data).unwrap();
        db
    }

    #[test]
    fn test_file_insert_sets_flags() {
        let db = db_with_file("/m/a.mp3", 1000);
        let row = db.file_row(Path::new("/m/a.mp3")).unwrap().unwrap();
        assert_eq!(row.mtime, 1000);
        assert_eq!(row.checked, 1);
        assert_eq!(row.interrupted, -1);
        assert_eq!(row.outofpath, 0);
    }

    #[test]
    fn test_parser_write_associates_metadata_and_filesize() {
        let db = db_with_file("/m/a.mp3", 1000);
        let data = record("/m/a.mp3", 1000);
        data.set_file_type(FileType::Audio);
        data.meta_parser().add_default(keys::TITLE, "A");
        data.meta_parser().add_default(keys::ARTIST, "X");
        db.file_parser_write(&data).unwrap();

        let rows = db
            .file_get(Path::new("/m/a.mp3").into(), &[])
            .unwrap();
        let title = rows.iter().find(|r| r.name == "title").unwrap();
        assert_eq!(title.value, "A");
        assert_eq!(title.group, MetaGroup::Titles);
        assert!(!title.external);
        let size = rows.iter().find(|r| r.name == "filesize").unwrap();
        assert_eq!(size.value, "64");
        assert_eq!(size.group, MetaGroup::Technical);

        let row = db.file_row(Path::new("/m/a.mp3")).unwrap().unwrap();
        assert_eq!(row.file_type, FileType::Audio);
    }

    #[test]
    fn test_association_is_unique_per_triple() {
        let db = db_with_file("/m/a.mp3", 1000);
        let data = record("/m/a.mp3", 1000);
        data.meta_parser().add_default(keys::TITLE, "A");
        db.file_parser_write(&data).unwrap();
        db.file_parser_write(&data).unwrap();

        let conn = db.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM assoc_file_metadata
                 WHERE meta_id = (SELECT meta_id FROM meta WHERE meta_name = 'title')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_external_rows_resist_pipeline_writes() {
        let db = db_with_file("/m/a.mp3", 1000);
        db.metadata_ext_insert(
            Path::new("/m/a.mp3"),
            "rating",
            "5",
            Lang::Undef,
            MetaGroup::Personal,
        )
        .unwrap();

        // A pipeline write of the same triple must not demote it.
        let data = record("/m/a.mp3", 1000);
        data.meta_parser().add_default("rating", "5");
        db.file_parser_write(&data).unwrap();

        let rows = db.file_get(Path::new("/m/a.mp3").into(), &[]).unwrap();
        let rating = rows.iter().find(|r| r.name == "rating").unwrap();
        assert!(rating.external);

        // file_data_delete keeps external rows.
        db.file_data_delete(Path::new("/m/a.mp3")).unwrap();
        let rows = db.file_get(Path::new("/m/a.mp3").into(), &[]).unwrap();
        assert!(rows.iter().any(|r| r.name == "rating"));
        assert!(!rows.iter().any(|r| r.name == "filesize"));
    }

    #[test]
    fn test_cleanup_collects_orphans() {
        let db = db_with_file("/m/a.mp3", 1000);
        let data = record("/m/a.mp3", 1000);
        data.meta_parser().add_default(keys::ARTIST, "X");
        db.file_parser_write(&data).unwrap();
        db.file_grab_write(Path::new("/m/a.mp3"), &MetaList::new(), Some("local"))
            .unwrap();

        db.file_data_delete(Path::new("/m/a.mp3")).unwrap();
        db.file_delete(Path::new("/m/a.mp3")).unwrap();
        let removed = db.cleanup().unwrap();
        assert!(removed > 0);

        let conn = db.lock().unwrap();
        let metas: i64 = conn
            .query_row("SELECT COUNT(*) FROM meta", [], |r| r.get(0))
            .unwrap();
        let grabbers: i64 = conn
            .query_row("SELECT COUNT(*) FROM grabber", [], |r| r.get(0))
            .unwrap();
        assert_eq!(metas, 0);
        assert_eq!(grabbers, 0);
    }

    #[test]
    fn test_interrupted_lifecycle() {
        let db = db_with_file("/m/a.mp3", 1000);
        assert_eq!(db.file_interrupted(Path::new("/m/a.mp3")).unwrap(), Some(-1));

        db.interrupted_clear(Path::new("/m/a.mp3")).unwrap();
        assert_eq!(db.file_interrupted(Path::new("/m/a.mp3")).unwrap(), Some(0));
        assert!(db.file_complete(Path::new("/m/a.mp3"), 1000).unwrap());
        assert!(!db.file_complete(Path::new("/m/a.mp3"), 2000).unwrap());

        let db = db_with_file("/m/b.mp3", 1000);
        db.interrupted_fix().unwrap();
        assert_eq!(db.file_interrupted(Path::new("/m/b.mp3")).unwrap(), Some(1));
    }

    #[test]
    fn test_priority_update_scopes() {
        let db = db_with_file("/m/a.mp3", 1000);
        let data = record("/m/a.mp3", 1000);
        data.meta_parser().add_default(keys::TITLE, "A");
        data.meta_parser().add_default(keys::ARTIST, "X");
        db.file_parser_write(&data).unwrap();

        let path = Path::new("/m/a.mp3");
        db.metadata_priority(path, Some("title"), Some("A"), -10).unwrap();
        db.metadata_priority(path, Some("artist"), None, 20).unwrap();

        // file_get orders by ascending priority value; the synthetic
        // filesize row keeps the highest priority, then title, then artist.
        let rows = db.file_get(path.into(), &[]).unwrap();
        let order: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, vec!["filesize", "title", "artist"]);

        db.metadata_priority(path, None, None, 5).unwrap();
        let conn = db.lock().unwrap();
        let distinct: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT priority) FROM assoc_file_metadata",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(distinct, 1);
    }

    #[test]
    fn test_dlcontext_round_trip() {
        let db = db_with_file("/m/a.mp3", 1000);
        let items = vec![DownloadItem {
            url: "http://example.com/cover.jpg".into(),
            dst: DlKind::Cover,
            name: "a-cover.jpg".into(),
        }];
        db.dlcontext_save(Path::new("/m/a.mp3"), &items).unwrap();
        let loaded = db.dlcontext_for_file(Path::new("/m/a.mp3")).unwrap();
        assert_eq!(loaded, items);
        db.dlcontext_delete_all().unwrap();
        assert!(db.dlcontext_for_file(Path::new("/m/a.mp3")).unwrap().is_empty());
    }

    #[test]
    fn test_grabber_round_trip() {
        let db = db_with_file("/m/a.mp3", 1000);
        db.file_grab_write(Path::new("/m/a.mp3"), &MetaList::new(), Some("tmdb"))
            .unwrap();
        db.file_grab_write(Path::new("/m/a.mp3"), &MetaList::new(), Some("tmdb"))
            .unwrap();
        assert_eq!(
            db.grabbers_for_file(Path::new("/m/a.mp3")).unwrap(),
            vec!["tmdb".to_string()]
        );
    }

    #[test]
    fn test_checked_sweep_inputs() {
        let db = db_with_file("/m/a.mp3", 1000);
        db.checked_clear_all().unwrap();
        assert_eq!(db.files_unchecked().unwrap().len(), 1);

        let out = FileData::new(
            "/elsewhere/b.mp3",
            5,
            1,
            true,
            OdKind::New,
            Band::High,
            Step::Parsing,
        );
        db.file_insert(&out).unwrap();
        db.checked_clear_all().unwrap();
        // out-of-path files are exempt from the disappeared-file sweep
        assert_eq!(db.files_unchecked().unwrap().len(), 1);
        assert_eq!(db.files_outofpath().unwrap().len(), 1);
    }

    #[test]
    fn test_ext_update_preserves_row_shape() {
        let db = db_with_file("/m/a.mp3", 1000);
        db.metadata_ext_insert(
            Path::new("/m/a.mp3"),
            "rating",
            "3",
            Lang::Undef,
            MetaGroup::Personal,
        )
        .unwrap();
        db.metadata_ext_update(Path::new("/m/a.mp3"), "rating", "3", "5", Lang::Undef)
            .unwrap();

        let rows = db.file_get(Path::new("/m/a.mp3").into(), &[]).unwrap();
        let rating = rows.iter().find(|r| r.name == "rating").unwrap();
        assert_eq!(rating.value, "5");
        assert!(rating.external);
        assert_eq!(rating.group, MetaGroup::Personal);
    }
}
