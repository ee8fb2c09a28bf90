use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use regex::Regex;
use rusqlite::Connection;

use crate::error::{AppError, AppResult};

/// Identifiers accepted anywhere a column, table, or relation name is read
/// from a request: ASCII letters/digits/underscore, at most 64 bytes, and not
/// starting with a digit.
pub fn is_valid_identifier(name: &str) -> bool {
    static PATTERN: once_lock::OnceLock<Regex> = once_lock::OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap());
    re.is_match(name)
}

// `std::sync::OnceLock` landed in a later edition than the one this crate
// targets in spirit; alias it locally so the intent at the call site reads
// the same either way.
mod once_lock {
    pub use std::sync::OnceLock;
}

pub fn validate_identifier(name: &str) -> AppResult<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(AppError::validation(format!("invalid identifier: {name}")))
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
    pub pk_position: u32,
}

#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub local_column: String,
    pub foreign_table: String,
    pub foreign_column: String,
    pub on_update: String,
    pub on_delete: String,
}

/// The "many" side of a has-many relation: some other table owns a foreign
/// key pointing back at this one.
#[derive(Debug, Clone)]
pub struct ReverseForeignKey {
    pub related_table: String,
    pub related_column: String,
    pub local_column: String,
}

#[derive(Debug, Clone)]
pub struct TableIndex {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
    pub reverse_foreign_keys: Vec<ReverseForeignKey>,
    pub indexes: Vec<TableIndex>,
    pub captured_at: Instant,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Find a foreign-key edge whose local column points at `relation`
    /// (belongs-to / many-to-one embedding).
    pub fn find_relation(&self, relation: &str) -> Option<&ForeignKey> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.foreign_table == relation)
    }

    /// Find another table whose foreign key points back at this one
    /// (has-many / array embedding).
    pub fn find_reverse_relation(&self, relation: &str) -> Option<&ReverseForeignKey> {
        self.reverse_foreign_keys
            .iter()
            .find(|fk| fk.related_table == relation)
    }
}

pub struct CacheStats {
    pub count: usize,
    pub oldest: Option<Instant>,
    pub newest: Option<Instant>,
}

/// Per-database TTL-bounded memoization of introspected table structure.
///
/// Entries are returned to callers only while `now - captured_at < ttl`;
/// stale entries trigger re-introspection under the write guard. Introspection
/// never partially commits: if any pragma fails the prior entry is kept.
pub struct SchemaCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, TableSchema>>,
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, conn: &Connection, table: &str) -> AppResult<TableSchema> {
        validate_identifier(table)?;

        if let Some(schema) = self.fresh_entry(table) {
            return Ok(schema);
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| AppError::Database("schema cache poisoned".to_string()))?;

        if let Some(schema) = entries.get(table) {
            if schema.captured_at.elapsed() < self.ttl {
                return Ok(schema.clone());
            }
        }

        let introspected = introspect(conn, table)?;
        entries.insert(table.to_string(), introspected.clone());
        Ok(introspected)
    }

    fn fresh_entry(&self, table: &str) -> Option<TableSchema> {
        let entries = self.entries.read().ok()?;
        let schema = entries.get(table)?;
        if schema.captured_at.elapsed() < self.ttl {
            Some(schema.clone())
        } else {
            None
        }
    }

    /// Linearizable with respect to readers: once this returns, no subsequent
    /// `get` can observe the evicted entry.
    pub fn invalidate(&self, table: Option<&str>) -> AppResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| AppError::Database("schema cache poisoned".to_string()))?;
        match table {
            Some(t) => {
                entries.remove(t);
            }
            None => entries.clear(),
        }
        Ok(())
    }

    pub fn stats(&self) -> AppResult<CacheStats> {
        let entries = self
            .entries
            .read()
            .map_err(|_| AppError::Database("schema cache poisoned".to_string()))?;
        let oldest = entries.values().map(|s| s.captured_at).min();
        let newest = entries.values().map(|s| s.captured_at).max();
        Ok(CacheStats {
            count: entries.len(),
            oldest,
            newest,
        })
    }
}

/// Every user table in the database, for introspection endpoints that need
/// to enumerate a whole schema rather than one named table.
pub fn list_tables(conn: &Connection) -> AppResult<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    Ok(names)
}

fn table_exists(conn: &Connection, table: &str) -> AppResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type='table' AND name = ?1 AND name NOT LIKE 'sqlite_%'",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn introspect(conn: &Connection, table: &str) -> AppResult<TableSchema> {
    if !table_exists(conn, table)? {
        return Err(AppError::not_found(format!("table not found: {table}")));
    }

    let columns = introspect_columns(conn, table)?;
    let foreign_keys = introspect_foreign_keys(conn, table)?;
    let reverse_foreign_keys = introspect_reverse_foreign_keys(conn, table)?;
    let indexes = introspect_indexes(conn, table)?;

    Ok(TableSchema {
        name: table.to_string(),
        columns,
        foreign_keys,
        reverse_foreign_keys,
        indexes,
        captured_at: Instant::now(),
    })
}

/// Scan every other table's foreign keys for one pointing back at `table`.
/// There is no PRAGMA for this direction; it costs one `foreign_key_list`
/// call per table in the database.
fn introspect_reverse_foreign_keys(conn: &Connection, table: &str) -> AppResult<Vec<ReverseForeignKey>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != ?1",
    )?;
    let other_tables: Vec<String> = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut reverse = Vec::new();
    for other in other_tables {
        for fk in introspect_foreign_keys(conn, &other)? {
            if fk.foreign_table == table {
                reverse.push(ReverseForeignKey {
                    related_table: other.clone(),
                    related_column: fk.local_column,
                    local_column: fk.foreign_column,
                });
            }
        }
    }
    Ok(reverse)
}

fn introspect_columns(conn: &Connection, table: &str) -> AppResult<Vec<Column>> {
    let sql = format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\""));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        let pk_position: i64 = row.get(5)?;
        Ok(Column {
            name: row.get(1)?,
            declared_type: row.get(2)?,
            not_null: row.get::<_, i64>(3)? != 0,
            default_value: row.get(4)?,
            primary_key: pk_position > 0,
            pk_position: pk_position.max(0) as u32,
        })
    })?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    if columns.is_empty() {
        return Err(AppError::not_found(format!("table not found: {table}")));
    }
    Ok(columns)
}

fn introspect_foreign_keys(conn: &Connection, table: &str) -> AppResult<Vec<ForeignKey>> {
    let sql = format!("PRAGMA foreign_key_list(\"{}\")", table.replace('"', "\"\""));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKey {
            local_column: row.get(3)?,
            foreign_table: row.get(2)?,
            foreign_column: row.get(4)?,
            on_update: row.get(5)?,
            on_delete: row.get(6)?,
        })
    })?;

    let mut fks = Vec::new();
    for row in rows {
        fks.push(row?);
    }
    Ok(fks)
}

fn introspect_indexes(conn: &Connection, table: &str) -> AppResult<Vec<TableIndex>> {
    let sql = format!("PRAGMA index_list(\"{}\")", table.replace('"', "\"\""));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get(1)?;
        let unique: i64 = row.get(2)?;
        Ok((name, unique != 0))
    })?;

    let mut indexes = Vec::new();
    for row in rows {
        let (name, unique) = row?;
        // The implicit index backing an `INTEGER PRIMARY KEY` / autoindex has
        // no useful column list for planning and is skipped.
        if name.starts_with("sqlite_autoindex_") {
            continue;
        }
        let columns = introspect_index_columns(conn, &name)?;
        indexes.push(TableIndex {
            name,
            columns,
            unique,
        });
    }
    Ok(indexes)
}

fn introspect_index_columns(conn: &Connection, index: &str) -> AppResult<Vec<String>> {
    let sql = format!("PRAGMA index_info(\"{}\")", index.replace('"', "\"\""));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(2))?;
    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER);
             CREATE TABLE posts (id INTEGER PRIMARY KEY, author_id INTEGER NOT NULL, title TEXT,
                FOREIGN KEY(author_id) REFERENCES users(id));
             CREATE INDEX idx_posts_author ON posts(author_id);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn introspects_columns_and_foreign_keys() {
        let conn = memory_conn();
        let schema = introspect(&conn, "posts").unwrap();
        assert_eq!(schema.columns.len(), 3);
        assert_eq!(schema.foreign_keys.len(), 1);
        assert_eq!(schema.foreign_keys[0].foreign_table, "users");
        assert!(schema.find_relation("users").is_some());
    }

    #[test]
    fn reverse_relation_resolves_has_many_side() {
        let conn = memory_conn();
        let schema = introspect(&conn, "users").unwrap();
        let reverse = schema.find_reverse_relation("posts").unwrap();
        assert_eq!(reverse.related_column, "author_id");
        assert_eq!(reverse.local_column, "id");
    }

    #[test]
    fn unknown_table_is_not_found() {
        let conn = memory_conn();
        let err = introspect(&conn, "missing").unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn cache_serves_fresh_entries_without_reintrospecting() {
        let conn = memory_conn();
        let cache = SchemaCache::new(Duration::from_secs(300));
        let first = cache.get(&conn, "users").unwrap();
        let second = cache.get(&conn, "users").unwrap();
        assert_eq!(first.captured_at, second.captured_at);
    }

    #[test]
    fn invalidate_forces_reintrospection() {
        let conn = memory_conn();
        let cache = SchemaCache::new(Duration::from_secs(300));
        let first = cache.get(&conn, "users").unwrap();
        cache.invalidate(Some("users")).unwrap();
        let second = cache.get(&conn, "users").unwrap();
        assert!(second.captured_at >= first.captured_at);
    }

    #[test]
    fn rejects_invalid_identifiers() {
        assert!(validate_identifier("valid_name").is_ok());
        assert!(validate_identifier("9invalid").is_err());
        assert!(validate_identifier("bad;name").is_err());
    }
}
