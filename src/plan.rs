use crate::db::schema::{validate_identifier, TableSchema};
use crate::db::DbHandle;
use crate::error::{AppError, AppResult};
use crate::filter::{FilterNode, OrderKey, ParsedQuery};

pub const MAX_EMBED_DEPTH: u32 = 4;

#[derive(Debug, Clone)]
pub enum ProjectionItem {
    Column(String),
    Embed(EmbedSpec),
}

#[derive(Debug, Clone)]
pub struct EmbedSpec {
    pub relation: String,
    pub local_column: String,
    pub foreign_column: String,
    pub projection: Vec<ProjectionItem>,
    /// `true` for a has-many relation (the related table owns the foreign
    /// key); such an embed shapes as a JSON array instead of an object.
    pub is_array: bool,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub table: String,
    pub projection: Vec<ProjectionItem>,
    pub filters: Vec<FilterNode>,
    pub order: Vec<OrderKey>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Turn a parsed request plus introspected schema into a validated plan: every
/// column and relation name named by the caller is checked against the
/// schema cache before a single byte of SQL is emitted.
pub fn build_plan(handle: &DbHandle, table: &str, query: ParsedQuery) -> AppResult<Plan> {
    validate_identifier(table)?;
    let conn = handle.read()?;
    let schema = handle.schema.get(&conn, table)?;

    let projection = match &query.select {
        Some(raw) => parse_projection(handle, &schema, raw, 0)?,
        None => schema
            .columns
            .iter()
            .map(|c| ProjectionItem::Column(c.name.clone()))
            .collect(),
    };

    for filter in &query.filters {
        validate_filter_columns(&schema, filter)?;
    }
    for order in &query.order {
        if !schema.has_column(&order.column) {
            return Err(AppError::validation(format!(
                "unknown order column: {}",
                order.column
            )));
        }
    }

    Ok(Plan {
        table: table.to_string(),
        projection,
        filters: query.filters,
        order: query.order,
        limit: query.limit,
        offset: query.offset,
    })
}

fn validate_filter_columns(schema: &TableSchema, node: &FilterNode) -> AppResult<()> {
    match node {
        FilterNode::Atom { column, .. } => {
            if !schema.has_column(column) {
                return Err(AppError::validation(format!("unknown column: {column}")));
            }
            Ok(())
        }
        FilterNode::And(nodes) | FilterNode::Or(nodes) => {
            for n in nodes {
                validate_filter_columns(schema, n)?;
            }
            Ok(())
        }
        FilterNode::Raw(..) => Ok(()),
    }
}

/// Parse a `select=` value: a comma-separated (at the current nesting level)
/// list of column names and `relation(nested,select)` embeds, recursing up
/// to [`MAX_EMBED_DEPTH`].
fn parse_projection(
    handle: &DbHandle,
    schema: &TableSchema,
    raw: &str,
    depth: u32,
) -> AppResult<Vec<ProjectionItem>> {
    if depth >= MAX_EMBED_DEPTH {
        return Err(AppError::validation("embedding depth exceeds maximum of 4"));
    }

    let mut items = Vec::new();
    for token in split_top_level_commas(raw) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        if let Some(open) = token.find('(') {
            let relation = &token[..open];
            let nested = token[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| AppError::validation(format!("unbalanced parens in select: {token}")))?;

            validate_identifier(relation)?;
            let (local_column, foreign_column, is_array) = if let Some(fk) = schema.find_relation(relation) {
                (fk.local_column.clone(), fk.foreign_column.clone(), false)
            } else if let Some(rfk) = schema.find_reverse_relation(relation) {
                (rfk.local_column.clone(), rfk.related_column.clone(), true)
            } else {
                return Err(AppError::validation(format!("unknown relation: {relation}")));
            };

            let conn = handle.read()?;
            let related_schema = handle.schema.get(&conn, relation)?;
            drop(conn);

            let nested_projection = if nested.is_empty() {
                related_schema
                    .columns
                    .iter()
                    .map(|c| ProjectionItem::Column(c.name.clone()))
                    .collect()
            } else {
                parse_projection(handle, &related_schema, nested, depth + 1)?
            };

            items.push(ProjectionItem::Embed(EmbedSpec {
                relation: relation.to_string(),
                local_column,
                foreign_column,
                projection: nested_projection,
                is_array,
            }));
        } else {
            validate_identifier(token)?;
            if !schema.has_column(token) {
                return Err(AppError::validation(format!("unknown column: {token}")));
            }
            items.push(ProjectionItem::Column(token.to_string()));
        }
    }

    if items.is_empty() {
        return Err(AppError::validation("empty select list"));
    }

    Ok(items)
}

fn split_top_level_commas(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in raw.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, DbMode, PoolConfig};
    use crate::filter::parse_request;
    use std::path::PathBuf;

    #[test]
    fn default_projection_is_all_columns() {
        let config = DatabaseConfig {
            name: "plantest2".to_string(),
            path: PathBuf::from(":memory:"),
            mode: DbMode::InMemory,
        };
        let pool = crate::db::PoolManager::new(&[config], PoolConfig::default()).unwrap();
        let handle = pool.get(None).unwrap();
        {
            let conn = handle.write().unwrap();
            conn.execute_batch("CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT);")
                .unwrap();
        }
        let plan = build_plan(&handle, "widgets", ParsedQuery::default()).unwrap();
        assert_eq!(plan.projection.len(), 2);
    }

    #[test]
    fn select_with_embed_resolves_foreign_key() {
        let config = DatabaseConfig {
            name: "plantest3".to_string(),
            path: PathBuf::from(":memory:"),
            mode: DbMode::InMemory,
        };
        let pool = crate::db::PoolManager::new(&[config], PoolConfig::default()).unwrap();
        let handle = pool.get(None).unwrap();
        {
            let conn = handle.write().unwrap();
            conn.execute_batch(
                "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT, author_id INTEGER,
                    FOREIGN KEY(author_id) REFERENCES authors(id));",
            )
            .unwrap();
        }
        let query = parse_request("select=title,authors(name)").unwrap();
        let plan = build_plan(&handle, "books", query).unwrap();
        assert_eq!(plan.projection.len(), 2);
        assert!(matches!(plan.projection[1], ProjectionItem::Embed(_)));
    }

    #[test]
    fn select_with_embed_resolves_reverse_foreign_key() {
        let config = DatabaseConfig {
            name: "plantest5".to_string(),
            path: PathBuf::from(":memory:"),
            mode: DbMode::InMemory,
        };
        let pool = crate::db::PoolManager::new(&[config], PoolConfig::default()).unwrap();
        let handle = pool.get(None).unwrap();
        {
            let conn = handle.write().unwrap();
            conn.execute_batch(
                "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT, author_id INTEGER,
                    FOREIGN KEY(author_id) REFERENCES authors(id));",
            )
            .unwrap();
        }
        let query = parse_request("select=name,books(title)").unwrap();
        let plan = build_plan(&handle, "authors", query).unwrap();
        assert_eq!(plan.projection.len(), 2);
        match &plan.projection[1] {
            ProjectionItem::Embed(spec) => {
                assert!(spec.is_array);
                assert_eq!(spec.local_column, "id");
                assert_eq!(spec.foreign_column, "author_id");
            }
            _ => panic!("expected embed"),
        }
    }

    #[test]
    fn unknown_column_in_filter_is_rejected() {
        let config = DatabaseConfig {
            name: "plantest4".to_string(),
            path: PathBuf::from(":memory:"),
            mode: DbMode::InMemory,
        };
        let pool = crate::db::PoolManager::new(&[config], PoolConfig::default()).unwrap();
        let handle = pool.get(None).unwrap();
        {
            let conn = handle.write().unwrap();
            conn.execute_batch("CREATE TABLE widgets (id INTEGER PRIMARY KEY);")
                .unwrap();
        }
        let query = parse_request("bogus=eq.1").unwrap();
        assert!(build_plan(&handle, "widgets", query).is_err());
    }
}
