//! Public query surface: list metadata, list files, fetch one file.
//!
//! Queries are assembled from a base select plus the caller's search spec and
//! restrictions; every user value is bound, never interpolated.

use std::path::{Path, PathBuf};

use rusqlite::types::Value;

use crate::config::MetaPriority;
use crate::error::Result;
use crate::filedata::FileType;
use crate::meta::{Lang, MetaGroup};

use super::Database;

/// What a search or restriction matches on. Unset fields are ignored.
#[derive(Debug, Clone, Default)]
pub struct SearchSpec {
    pub meta: Option<String>,
    pub value: Option<String>,
    pub group: Option<MetaGroup>,
    pub lang: Option<Lang>,
    /// Keep only associations at this priority or better (lower value).
    pub priority_max: Option<MetaPriority>,
}

impl SearchSpec {
    pub fn meta(name: impl Into<String>) -> Self {
        Self {
            meta: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn value(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn pair(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            meta: Some(name.into()),
            value: Some(value.into()),
            ..Default::default()
        }
    }
}

/// How a restriction combines with the main query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictOp {
    /// Keep files that carry a matching association.
    In,
    /// Drop files that carry a matching association.
    NotIn,
    /// Apply the condition to the listed rows themselves.
    Equal,
}

#[derive(Debug, Clone)]
pub struct Restriction {
    pub op: RestrictOp,
    pub spec: SearchSpec,
}

impl Restriction {
    pub fn new(op: RestrictOp, spec: SearchSpec) -> Self {
        Self { op, spec }
    }
}

/// One row of `metalist`.
#[derive(Debug, Clone)]
pub struct MetaRes {
    pub meta_id: i64,
    pub data_id: i64,
    pub name: String,
    pub value: String,
    pub lang: Lang,
    pub group: MetaGroup,
    pub external: bool,
}

/// One row of `filelist`.
#[derive(Debug, Clone)]
pub struct FileRes {
    pub id: i64,
    pub path: PathBuf,
    pub file_type: FileType,
}

/// One row of `file_get`.
#[derive(Debug, Clone)]
pub struct FileMetaRow {
    pub file_id: i64,
    pub meta_id: i64,
    pub data_id: i64,
    pub name: String,
    pub value: String,
    pub lang: Lang,
    pub group: MetaGroup,
    pub external: bool,
}

/// Target of `file_get`.
#[derive(Debug, Clone)]
pub enum FileRef {
    Id(i64),
    Path(PathBuf),
}

impl From<&Path> for FileRef {
    fn from(path: &Path) -> Self {
        FileRef::Path(path.to_path_buf())
    }
}

impl From<i64> for FileRef {
    fn from(id: i64) -> Self {
        FileRef::Id(id)
    }
}

/// Append the conditions of `spec` to `sql`, binding into `params`.
fn push_spec(spec: &SearchSpec, sql: &mut String, params: &mut Vec<Value>) {
    if let Some(meta) = &spec.meta {
        params.push(Value::Text(meta.to_ascii_lowercase()));
        sql.push_str(&format!(" AND meta.meta_name = ?{}", params.len()));
    }
    if let Some(value) = &spec.value {
        params.push(Value::Text(value.clone()));
        sql.push_str(&format!(" AND data.data_value = ?{}", params.len()));
    }
    if let Some(group) = spec.group {
        params.push(Value::Integer(group.db_id()));
        sql.push_str(&format!(" AND assoc.grp_id = ?{}", params.len()));
    }
    if let Some(lang) = spec.lang {
        params.push(Value::Integer(lang.db_id()));
        sql.push_str(&format!(" AND assoc.lang_id = ?{}", params.len()));
    }
    if let Some(prio) = spec.priority_max {
        params.push(Value::Integer(prio as i64));
        sql.push_str(&format!(" AND assoc.priority <= ?{}", params.len()));
    }
}

/// Append a `file_id IN (…)` / `NOT IN (…)` sub-select for one restriction.
fn push_restriction(
    restriction: &Restriction,
    alias: &str,
    sql: &mut String,
    params: &mut Vec<Value>,
) {
    match restriction.op {
        RestrictOp::Equal => push_spec(&restriction.spec, sql, params),
        RestrictOp::In | RestrictOp::NotIn => {
            let negate = if restriction.op == RestrictOp::NotIn {
                "NOT "
            } else {
                ""
            };
            sql.push_str(&format!(
                " AND {alias}.file_id {negate}IN (
                     SELECT assoc.file_id
                     FROM data
                     INNER JOIN assoc_file_metadata AS assoc
                         ON data.data_id = assoc.data_id
                     INNER JOIN meta ON assoc.meta_id = meta.meta_id
                     WHERE 1 = 1"
            ));
            push_spec(&restriction.spec, sql, params);
            sql.push_str(" )");
        }
    }
}

impl Database {
    /// List metadata pairs matching `search`, optionally limited to files of
    /// one type, filtered by `restrictions`.
    pub fn metalist(
        &self,
        search: &SearchSpec,
        filetype: Option<FileType>,
        restrictions: &[Restriction],
    ) -> Result<Vec<MetaRes>> {
        let mut sql = String::from(
            "SELECT meta.meta_id, data.data_id, meta.meta_name, data.data_value,
                    assoc.lang_id, assoc.grp_id, assoc.external
             FROM data
             INNER JOIN assoc_file_metadata AS assoc ON data.data_id = assoc.data_id
             INNER JOIN meta ON assoc.meta_id = meta.meta_id
             WHERE 1 = 1",
        );
        let mut params: Vec<Value> = Vec::new();

        push_spec(search, &mut sql, &mut params);

        if let Some(ty) = filetype {
            if let Some(type_id) = ty.db_id() {
                params.push(Value::Integer(type_id));
                sql.push_str(&format!(
                    " AND assoc.file_id IN (SELECT file_id FROM file WHERE type_id = ?{})",
                    params.len()
                ));
            } else {
                sql.push_str(
                    " AND assoc.file_id IN (SELECT file_id FROM file WHERE type_id IS NULL)",
                );
            }
        }

        for restriction in restrictions {
            push_restriction(restriction, "assoc", &mut sql, &mut params);
        }

        sql.push_str(
            " GROUP BY assoc.meta_id, assoc.data_id
              ORDER BY data.data_value",
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                Ok(MetaRes {
                    meta_id: row.get(0)?,
                    data_id: row.get(1)?,
                    name: row.get(2)?,
                    value: row.get(3)?,
                    lang: Lang::from_db_id(row.get(4)?),
                    group: MetaGroup::from_db_id(row.get(5)?)
                        .unwrap_or(MetaGroup::Miscellaneous),
                    external: row.get::<_, i64>(6)? != 0,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// List files, optionally limited to one type, filtered by
    /// `restrictions`.
    pub fn filelist(
        &self,
        filetype: Option<FileType>,
        restrictions: &[Restriction],
    ) -> Result<Vec<FileRes>> {
        // The alias keeps the restriction sub-selects shared with metalist.
        let mut sql = String::from(
            "SELECT file_id, file_path, type_id FROM file AS assoc WHERE 1 = 1",
        );
        let mut params: Vec<Value> = Vec::new();

        if let Some(ty) = filetype {
            if let Some(type_id) = ty.db_id() {
                params.push(Value::Integer(type_id));
                sql.push_str(&format!(" AND type_id = ?{}", params.len()));
            } else {
                sql.push_str(" AND type_id IS NULL");
            }
        }

        for restriction in restrictions {
            // A bare Equal makes no sense on the file table; treat it as In.
            let restriction = match restriction.op {
                RestrictOp::Equal => Restriction::new(RestrictOp::In, restriction.spec.clone()),
                _ => restriction.clone(),
            };
            push_restriction(&restriction, "assoc", &mut sql, &mut params);
        }

        sql.push_str(" ORDER BY file_id");

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                Ok(FileRes {
                    id: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                    file_type: FileType::from_db_id(row.get(2)?),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// All metadata of one file, ordered by ascending priority value.
    pub fn file_get(
        &self,
        target: FileRef,
        restrictions: &[Restriction],
    ) -> Result<Vec<FileMetaRow>> {
        let mut sql = String::from(
            "SELECT file.file_id, meta.meta_id, data.data_id,
                    meta.meta_name, data.data_value,
                    assoc.lang_id, assoc.grp_id, assoc.external
             FROM file
             INNER JOIN assoc_file_metadata AS assoc ON file.file_id = assoc.file_id
             INNER JOIN data ON data.data_id = assoc.data_id
             INNER JOIN meta ON assoc.meta_id = meta.meta_id
             WHERE 1 = 1",
        );
        let mut params: Vec<Value> = Vec::new();

        match target {
            FileRef::Id(id) => {
                params.push(Value::Integer(id));
                sql.push_str(&format!(" AND file.file_id = ?{}", params.len()));
            }
            FileRef::Path(path) => {
                params.push(Value::Text(path.to_string_lossy().into_owned()));
                sql.push_str(&format!(" AND file.file_path = ?{}", params.len()));
            }
        }

        for restriction in restrictions {
            push_restriction(restriction, "assoc", &mut sql, &mut params);
        }

        sql.push_str(" ORDER BY assoc.priority");

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                Ok(FileMetaRow {
                    file_id: row.get(0)?,
                    meta_id: row.get(1)?,
                    data_id: row.get(2)?,
                    name: row.get(3)?,
                    value: row.get(4)?,
                    lang: Lang::from_db_id(row.get(5)?),
                    group: MetaGroup::from_db_id(row.get(6)?)
                        .unwrap_or(MetaGroup::Miscellaneous),
                    external: row.get::<_, i64>(7)? != 0,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::Band;
    use crate::filedata::{FileData, OdKind, Step};
    use crate::meta::keys;

    fn seeded_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        for (path, title, artist, ty) in [
            ("/m/a.mp3", "Alpha", "X", FileType::Audio),
            ("/m/b.mp3", "Beta", "X", FileType::Audio),
            ("/v/c.mkv", "Gamma", "Y", FileType::Video),
        ] {
            let data = FileData::new(path, 1000, 10, false, OdKind::Scan, Band::Normal, Step::Parsing);
            data.set_file_type(ty);
            data.meta_parser().add_default(keys::TITLE, title);
            data.meta_parser().add_default(keys::ARTIST, artist);
            db.file_insert(&data).unwrap();
            db.file_parser_write(&data).unwrap();
        }
        db
    }

    #[test]
    fn test_metalist_by_meta_name() {
        let db = seeded_db();
        let rows = db
            .metalist(&SearchSpec::meta("title"), None, &[])
            .unwrap();
        let values: Vec<&str> = rows.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["Alpha", "Beta", "Gamma"]);
        assert!(rows.iter().all(|r| r.group == MetaGroup::Titles));
    }

    #[test]
    fn test_metalist_filetype_filter() {
        let db = seeded_db();
        let rows = db
            .metalist(&SearchSpec::meta("title"), Some(FileType::Video), &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, "Gamma");
    }

    #[test]
    fn test_metalist_with_restriction() {
        let db = seeded_db();
        // Titles of files whose artist is X.
        let rows = db
            .metalist(
                &SearchSpec::meta("title"),
                None,
                &[Restriction::new(RestrictOp::In, SearchSpec::pair("artist", "X"))],
            )
            .unwrap();
        assert_eq!(rows.len(), 2);

        let rows = db
            .metalist(
                &SearchSpec::meta("title"),
                None,
                &[Restriction::new(
                    RestrictOp::NotIn,
                    SearchSpec::pair("artist", "X"),
                )],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, "Gamma");
    }

    #[test]
    fn test_filelist_by_type() {
        let db = seeded_db();
        assert_eq!(db.filelist(None, &[]).unwrap().len(), 3);
        let audio = db.filelist(Some(FileType::Audio), &[]).unwrap();
        assert_eq!(audio.len(), 2);
        assert!(audio.iter().all(|f| f.file_type == FileType::Audio));
    }

    #[test]
    fn test_file_get_by_path_and_id() {
        let db = seeded_db();
        let by_path = db.file_get(Path::new("/m/a.mp3").into(), &[]).unwrap();
        assert!(!by_path.is_empty());
        let id = by_path[0].file_id;
        let by_id = db.file_get(id.into(), &[]).unwrap();
        assert_eq!(by_path.len(), by_id.len());
        assert!(by_id.iter().any(|r| r.name == "filesize"));
    }

    #[test]
    fn test_empty_results_are_empty_not_error() {
        let db = seeded_db();
        let rows = db
            .metalist(&SearchSpec::meta("no_such_key"), None, &[])
            .unwrap();
        assert!(rows.is_empty());
        let rows = db
            .file_get(Path::new("/nowhere.mp3").into(), &[])
            .unwrap();
        assert!(rows.is_empty());
    }
}
