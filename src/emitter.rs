use rusqlite::types::Value;

use crate::error::{AppError, AppResult};
use crate::filter::{FilterNode, Op, OrderDirection, ValueToken};
use crate::plan::{EmbedSpec, Plan, ProjectionItem};

/// A column in the flat result set, tagged with the embed path it belongs to
/// so `shape.rs` can regroup rows into nested JSON without re-deriving the
/// projection tree.
#[derive(Debug, Clone)]
pub struct OutputColumn {
    pub alias: String,
    pub name: String,
    /// Empty for the root table; one entry per embed level otherwise.
    pub path: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EmittedQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub columns: Vec<OutputColumn>,
    /// Full embed paths (chains of relation names from the root) that shape
    /// as a JSON array rather than a nested object.
    pub array_paths: Vec<Vec<String>>,
}

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

struct AliasCounter(u32);

impl AliasCounter {
    fn next(&mut self) -> String {
        let alias = format!("t{}", self.0);
        self.0 += 1;
        alias
    }
}

pub fn emit_select(plan: &Plan) -> AppResult<EmittedQuery> {
    let mut counter = AliasCounter(0);
    let root_alias = counter.next();
    let mut columns = Vec::new();
    let mut select_parts = Vec::new();
    let mut join_parts = Vec::new();
    let mut array_paths = Vec::new();

    collect_projection(
        &plan.projection,
        &root_alias,
        &[],
        &mut counter,
        &mut columns,
        &mut select_parts,
        &mut join_parts,
        &mut array_paths,
    );

    let mut params = Vec::new();
    let where_sql = if plan.filters.is_empty() {
        String::new()
    } else {
        let mut clauses = Vec::new();
        for filter in &plan.filters {
            clauses.push(render_node(filter, &root_alias, &mut params)?);
        }
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let order_sql = if plan.order.is_empty() {
        String::new()
    } else {
        let parts: Vec<String> = plan
            .order
            .iter()
            .map(|o| {
                let dir = match o.direction {
                    OrderDirection::Asc => "ASC",
                    OrderDirection::Desc => "DESC",
                };
                let nulls = if o.nulls_first {
                    "NULLS FIRST"
                } else {
                    "NULLS LAST"
                };
                format!(
                    "{}.{} {} {}",
                    root_alias,
                    quote_ident(&o.column),
                    dir,
                    nulls
                )
            })
            .collect();
        format!(" ORDER BY {}", parts.join(", "))
    };

    let mut limit_sql = String::new();
    if let Some(limit) = plan.limit {
        limit_sql.push_str(" LIMIT ?");
        params.push(Value::Integer(limit));
        if let Some(offset) = plan.offset {
            limit_sql.push_str(" OFFSET ?");
            params.push(Value::Integer(offset));
        }
    } else if let Some(offset) = plan.offset {
        // SQLite requires a LIMIT before OFFSET; -1 means unbounded.
        limit_sql.push_str(" LIMIT -1 OFFSET ?");
        params.push(Value::Integer(offset));
    }

    let sql = format!(
        "SELECT {} FROM {} AS {}{}{}{}{}",
        select_parts.join(", "),
        quote_ident(&plan.table),
        root_alias,
        join_parts.join(""),
        where_sql,
        order_sql,
        limit_sql,
    );

    Ok(EmittedQuery {
        sql,
        params,
        columns,
        array_paths,
    })
}

#[allow(clippy::too_many_arguments)]
fn collect_projection(
    items: &[ProjectionItem],
    alias: &str,
    path: &[String],
    counter: &mut AliasCounter,
    columns: &mut Vec<OutputColumn>,
    select_parts: &mut Vec<String>,
    join_parts: &mut Vec<String>,
    array_paths: &mut Vec<Vec<String>>,
) {
    for item in items {
        match item {
            ProjectionItem::Column(name) => {
                let output_alias = format!("c{}", columns.len());
                select_parts.push(format!(
                    "{}.{} AS {}",
                    alias,
                    quote_ident(name),
                    quote_ident(&output_alias)
                ));
                columns.push(OutputColumn {
                    alias: output_alias,
                    name: name.clone(),
                    path: path.to_vec(),
                });
            }
            ProjectionItem::Embed(embed) => {
                emit_embed_join(
                    embed,
                    alias,
                    path,
                    counter,
                    columns,
                    select_parts,
                    join_parts,
                    array_paths,
                );
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_embed_join(
    embed: &EmbedSpec,
    parent_alias: &str,
    path: &[String],
    counter: &mut AliasCounter,
    columns: &mut Vec<OutputColumn>,
    select_parts: &mut Vec<String>,
    join_parts: &mut Vec<String>,
    array_paths: &mut Vec<Vec<String>>,
) {
    let child_alias = counter.next();
    join_parts.push(format!(
        " LEFT JOIN {} AS {} ON {}.{} = {}.{}",
        quote_ident(&embed.relation),
        child_alias,
        parent_alias,
        quote_ident(&embed.local_column),
        child_alias,
        quote_ident(&embed.foreign_column),
    ));

    let mut child_path = path.to_vec();
    child_path.push(embed.relation.clone());

    if embed.is_array {
        array_paths.push(child_path.clone());
    }

    collect_projection(
        &embed.projection,
        &child_alias,
        &child_path,
        counter,
        columns,
        select_parts,
        join_parts,
        array_paths,
    );
}

fn render_node(node: &FilterNode, alias: &str, params: &mut Vec<Value>) -> AppResult<String> {
    match node {
        FilterNode::Atom {
            column,
            negate,
            op,
            value,
        } => render_atom(alias, column, *negate, *op, value, params),
        FilterNode::And(nodes) => render_group(nodes, alias, params, "AND"),
        FilterNode::Or(nodes) => render_group(nodes, alias, params, "OR"),
        FilterNode::Raw(sql, values) => {
            params.extend(values.iter().cloned());
            Ok(sql.clone())
        }
    }
}

fn render_group(
    nodes: &[FilterNode],
    alias: &str,
    params: &mut Vec<Value>,
    joiner: &str,
) -> AppResult<String> {
    let mut parts = Vec::with_capacity(nodes.len());
    for node in nodes {
        parts.push(render_node(node, alias, params)?);
    }
    Ok(format!("({})", parts.join(&format!(" {joiner} "))))
}

fn render_atom(
    alias: &str,
    column: &str,
    negate: bool,
    op: Op,
    value: &ValueToken,
    params: &mut Vec<Value>,
) -> AppResult<String> {
    let col = format!("{}.{}", alias, quote_ident(column));

    let predicate = match (op, value) {
        (Op::Is, ValueToken::Null) => format!("{col} IS NULL"),
        (Op::Is, ValueToken::Scalar(s)) if s.eq_ignore_ascii_case("true") => {
            format!("{col} IS TRUE")
        }
        (Op::Is, ValueToken::Scalar(s)) if s.eq_ignore_ascii_case("false") => {
            format!("{col} IS FALSE")
        }
        (Op::Is, ValueToken::Scalar(s)) if s.eq_ignore_ascii_case("notnull") => {
            format!("{col} IS NOT NULL")
        }
        (Op::Is, _) => {
            return Err(AppError::validation(
                "is. only accepts null/notnull/true/false",
            ))
        }
        (Op::In, ValueToken::List(items)) => {
            let placeholders = items
                .iter()
                .map(|item| {
                    params.push(Value::Text(item.clone()));
                    "?".to_string()
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("{col} IN ({placeholders})")
        }
        (Op::In, _) => return Err(AppError::validation("in. requires a (a,b,c) list")),
        (_, ValueToken::Null) => {
            return Err(AppError::validation(format!(
                "operator {:?} does not accept null; use is.null",
                op
            )))
        }
        (_, ValueToken::List(_)) => {
            return Err(AppError::validation(format!(
                "operator {:?} does not accept a list",
                op
            )))
        }
        (Op::Like, ValueToken::Scalar(raw)) | (Op::Ilike, ValueToken::Scalar(raw)) => {
            params.push(Value::Text(raw.replace('*', "%")));
            format!("{col} {} ?", op.sql_symbol())
        }
        (_, ValueToken::Scalar(raw)) => {
            params.push(coerce_scalar(raw));
            format!("{col} {} ?", op.sql_symbol())
        }
    };

    Ok(if negate {
        format!("NOT ({predicate})")
    } else {
        predicate
    })
}

/// Best-effort numeric coercion so `age=gt.18` compares numerically instead
/// of lexicographically; anything that doesn't parse as a number stays text.
fn coerce_scalar(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Real(f)
    } else {
        Value::Text(raw.to_string())
    }
}

/// Render a `SELECT COUNT(*)` over the plan's root table and filters, used to
/// populate the `total` slot of a `Content-Range` header. Filters only ever
/// reference root-table columns, so no joins are needed here.
pub fn emit_count(plan: &Plan) -> AppResult<MutationQuery> {
    let alias = "t0";
    let mut params = Vec::new();
    let where_sql = if plan.filters.is_empty() {
        String::new()
    } else {
        let mut clauses = Vec::new();
        for filter in &plan.filters {
            clauses.push(render_node(filter, alias, &mut params)?);
        }
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "SELECT COUNT(*) FROM {} AS {}{}",
        quote_ident(&plan.table),
        alias,
        where_sql
    );
    Ok(MutationQuery { sql, params })
}

#[derive(Debug)]
pub struct MutationQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// INSERT with a column list drawn directly from the provided JSON keys; no
/// caller-provided identifier reaches SQL text unescaped.
pub fn emit_insert(table: &str, columns: &[String], values: &[Value]) -> AppResult<MutationQuery> {
    if columns.is_empty() {
        return Err(AppError::validation("insert body has no columns"));
    }
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        cols,
        placeholders
    );
    Ok(MutationQuery {
        sql,
        params: values.to_vec(),
    })
}

/// UPDATE and DELETE require a non-empty filter set: an unconditional bulk
/// mutation must say so explicitly by filtering on a tautology, it cannot
/// reach this emitter with zero filters.
pub fn emit_update(
    table: &str,
    columns: &[String],
    values: &[Value],
    filters: &[FilterNode],
) -> AppResult<MutationQuery> {
    if filters.is_empty() {
        return Err(AppError::validation(
            "update requires at least one filter",
        ));
    }
    if columns.is_empty() {
        return Err(AppError::validation("update body has no columns"));
    }

    let assignments = columns
        .iter()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut params = values.to_vec();
    let mut clauses = Vec::new();
    for filter in filters {
        clauses.push(render_node(filter, "main", &mut params)?);
    }

    let sql = format!(
        "UPDATE {} AS main SET {} WHERE {}",
        quote_ident(table),
        assignments,
        clauses.join(" AND ")
    );

    Ok(MutationQuery { sql, params })
}

pub fn emit_delete(table: &str, filters: &[FilterNode]) -> AppResult<MutationQuery> {
    if filters.is_empty() {
        return Err(AppError::validation(
            "delete requires at least one filter",
        ));
    }

    let mut params = Vec::new();
    let mut clauses = Vec::new();
    for filter in filters {
        clauses.push(render_node(filter, "main", &mut params)?);
    }

    let sql = format!(
        "DELETE FROM {} AS main WHERE {}",
        quote_ident(table),
        clauses.join(" AND ")
    );

    Ok(MutationQuery { sql, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;

    fn base_plan() -> Plan {
        Plan {
            table: "widgets".to_string(),
            projection: vec![ProjectionItem::Column("id".to_string())],
            filters: vec![],
            order: vec![],
            limit: None,
            offset: None,
        }
    }

    #[test]
    fn select_with_filter_binds_params() {
        let mut plan = base_plan();
        plan.filters.push(FilterNode::Atom {
            column: "id".to_string(),
            negate: false,
            op: Op::Gt,
            value: ValueToken::Scalar("10".to_string()),
        });
        let emitted = emit_select(&plan).unwrap();
        assert!(emitted.sql.contains("WHERE"));
        assert_eq!(emitted.params, vec![Value::Integer(10)]);
    }

    #[test]
    fn update_without_filters_is_rejected() {
        let err = emit_update(
            "widgets",
            &["name".to_string()],
            &[Value::Text("x".to_string())],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn delete_without_filters_is_rejected() {
        assert!(emit_delete("widgets", &[]).is_err());
    }

    #[test]
    fn in_operator_binds_each_item() {
        let mut plan = base_plan();
        plan.filters.push(FilterNode::Atom {
            column: "id".to_string(),
            negate: false,
            op: Op::In,
            value: ValueToken::List(vec!["1".to_string(), "2".to_string()]),
        });
        let emitted = emit_select(&plan).unwrap();
        assert_eq!(emitted.params.len(), 2);
        assert!(emitted.sql.contains("IN (?, ?)"));
    }

    #[test]
    fn identifier_quoting_escapes_backticks() {
        assert_eq!(quote_ident("weird`name"), "`weird``name`");
    }

    #[test]
    fn count_query_carries_root_filters_without_joins() {
        let mut plan = base_plan();
        plan.filters.push(FilterNode::Atom {
            column: "id".to_string(),
            negate: false,
            op: Op::Gt,
            value: ValueToken::Scalar("10".to_string()),
        });
        let counted = emit_count(&plan).unwrap();
        assert!(counted.sql.starts_with("SELECT COUNT(*) FROM"));
        assert!(counted.sql.contains("WHERE"));
        assert!(!counted.sql.contains("JOIN"));
        assert_eq!(counted.params, vec![Value::Integer(10)]);
    }

    #[test]
    fn array_embed_is_recorded_in_array_paths() {
        let mut plan = base_plan();
        plan.projection.push(ProjectionItem::Embed(EmbedSpec {
            relation: "books".to_string(),
            local_column: "id".to_string(),
            foreign_column: "author_id".to_string(),
            projection: vec![ProjectionItem::Column("title".to_string())],
            is_array: true,
        }));
        let emitted = emit_select(&plan).unwrap();
        assert_eq!(emitted.array_paths, vec![vec!["books".to_string()]]);
    }
}
