use crate::error::{AppError, AppResult};

/// Comparison operators accepted after the `col=op.value` dot, matching the
/// PostgREST operator vocabulary this gateway imitates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    In,
    Is,
}

impl Op {
    fn parse(token: &str) -> AppResult<Self> {
        match token {
            "eq" => Ok(Op::Eq),
            "neq" => Ok(Op::Neq),
            "gt" => Ok(Op::Gt),
            "gte" => Ok(Op::Gte),
            "lt" => Ok(Op::Lt),
            "lte" => Ok(Op::Lte),
            "like" => Ok(Op::Like),
            "ilike" => Ok(Op::Ilike),
            "in" => Ok(Op::In),
            "is" => Ok(Op::Is),
            other => Err(AppError::validation(format!("unknown operator: {other}"))),
        }
    }

    pub fn sql_symbol(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Neq => "!=",
            Op::Gt => ">",
            Op::Gte => ">=",
            Op::Lt => "<",
            Op::Lte => "<=",
            Op::Like => "LIKE",
            Op::Ilike => "LIKE",
            Op::In => "IN",
            Op::Is => "IS",
        }
    }
}

/// The right-hand side of an atom before type coercion, which happens once
/// the target column's declared type is known (see `plan.rs`).
#[derive(Debug, Clone)]
pub enum ValueToken {
    Scalar(String),
    Null,
    List(Vec<String>),
}

#[derive(Debug, Clone)]
pub enum FilterNode {
    Atom {
        column: String,
        negate: bool,
        op: Op,
        value: ValueToken,
    },
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    /// A fragment already rendered to parameterized SQL, used by the policy
    /// engine to splice compiled predicates into a request's filter tree
    /// without re-parsing or string-concatenating untrusted input.
    Raw(String, Vec<rusqlite::types::Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderKey {
    pub column: String,
    pub direction: OrderDirection,
    pub nulls_first: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedQuery {
    pub filters: Vec<FilterNode>,
    pub select: Option<String>,
    pub order: Vec<OrderKey>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

const RESERVED_KEYS: &[&str] = &["select", "order", "limit", "offset", "and", "or", "not"];

/// Parse a request's query string into filters plus the reserved
/// select/order/limit/offset parameters. Keys are read in their original
/// order but grouped per column, so `age=gte.18&age=lte.30` becomes one
/// implicit AND between two atoms on `age`, matching repeated-key semantics
/// rather than letting the second occurrence silently shadow the first.
pub fn parse_request(query: &str) -> AppResult<ParsedQuery> {
    let mut parsed = ParsedQuery::default();

    for (raw_key, raw_value) in url::form_urlencoded::parse(query.as_bytes()) {
        let key = raw_key.as_ref();
        let value = raw_value.as_ref();

        // A trailing dot escapes a column name that would otherwise collide
        // with a reserved key, e.g. a table with a real `order` column uses
        // `order.=eq.5` instead of `order=eq.5`.
        let (escaped, key) = match key.strip_suffix('.') {
            Some(stripped) => (true, stripped),
            None => (false, key),
        };

        if !escaped && RESERVED_KEYS.contains(&key) {
            match key {
                "select" => parsed.select = Some(value.to_string()),
                "order" => parsed.order = parse_order(value)?,
                "limit" => parsed.limit = Some(parse_i64(value)?),
                "offset" => parsed.offset = Some(parse_i64(value)?),
                "and" => parsed.filters.push(parse_group(value, false)?),
                "or" => parsed.filters.push(parse_group(value, true)?),
                "not" => {
                    return Err(AppError::validation(
                        "top-level `not` must prefix a column filter, e.g. not.col=eq.value",
                    ))
                }
                _ => unreachable!(),
            }
            continue;
        }

        parsed.filters.push(parse_column_filter(key, value)?);
    }

    Ok(parsed)
}

/// Parse one `col=op.value` or `not.col=op.value` pair.
fn parse_column_filter(key: &str, value: &str) -> AppResult<FilterNode> {
    let (negate, column) = match key.strip_prefix("not.") {
        Some(rest) => (true, rest),
        None => (false, key),
    };

    if column.is_empty() {
        return Err(AppError::validation("empty column name in filter"));
    }

    let (op_token, value_token) = value
        .split_once('.')
        .ok_or_else(|| AppError::validation(format!("malformed filter value: {value}")))?;

    let op = Op::parse(op_token)?;
    let value = parse_value(op, value_token);

    Ok(FilterNode::Atom {
        column: column.to_string(),
        negate,
        op,
        value,
    })
}

fn parse_value(op: Op, raw: &str) -> ValueToken {
    if op == Op::In {
        let inner = raw
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(raw);
        let items = split_paren_list(inner)
            .into_iter()
            .map(|s| s.trim().to_string())
            .collect();
        return ValueToken::List(items);
    }
    if raw.eq_ignore_ascii_case("null") {
        return ValueToken::Null;
    }
    ValueToken::Scalar(raw.to_string())
}

/// Parse `and=(cond,cond,...)` / `or=(cond,cond,...)` bodies, splitting on
/// top-level commas so a nested `and(...)`/`or(...)` group isn't split apart.
fn parse_group(raw: &str, is_or: bool) -> AppResult<FilterNode> {
    let inner = raw
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| AppError::validation(format!("malformed filter group: {raw}")))?;

    let mut nodes = Vec::new();
    for clause in split_paren_list(inner) {
        let clause = clause.trim();
        if let Some(rest) = clause.strip_prefix("and(") {
            let body = format!("({}", rest);
            nodes.push(parse_group(&body, false)?);
        } else if let Some(rest) = clause.strip_prefix("or(") {
            let body = format!("({}", rest);
            nodes.push(parse_group(&body, true)?);
        } else {
            let (key, value) = clause
                .split_once('=')
                .ok_or_else(|| AppError::validation(format!("malformed filter clause: {clause}")))?;
            nodes.push(parse_column_filter(key, value)?);
        }
    }

    Ok(if is_or {
        FilterNode::Or(nodes)
    } else {
        FilterNode::And(nodes)
    })
}

/// Split on commas that are not nested inside parentheses, so
/// `and(a.eq.1,or(b.eq.2,c.eq.3))` yields two top-level clauses.
fn split_paren_list(raw: &str) -> Vec<String> {
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
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn parse_order(raw: &str) -> AppResult<Vec<OrderKey>> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let mut parts = entry.split('.');
            let column = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| AppError::validation("empty order column"))?
                .to_string();

            let mut direction = OrderDirection::Asc;
            let mut nulls_first = false;
            for modifier in parts {
                match modifier {
                    "asc" => direction = OrderDirection::Asc,
                    "desc" => direction = OrderDirection::Desc,
                    "nullsfirst" => nulls_first = true,
                    "nullslast" => nulls_first = false,
                    other => {
                        return Err(AppError::validation(format!(
                            "unknown order modifier: {other}"
                        )))
                    }
                }
            }

            Ok(OrderKey {
                column,
                direction,
                nulls_first,
            })
        })
        .collect()
}

fn parse_i64(raw: &str) -> AppResult<i64> {
    raw.parse()
        .map_err(|_| AppError::validation(format!("expected integer, got: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_equality() {
        let parsed = parse_request("name=eq.alice").unwrap();
        assert_eq!(parsed.filters.len(), 1);
        match &parsed.filters[0] {
            FilterNode::Atom { column, op, .. } => {
                assert_eq!(column, "name");
                assert_eq!(*op, Op::Eq);
            }
            _ => panic!("expected atom"),
        }
    }

    #[test]
    fn repeated_keys_become_implicit_and() {
        let parsed = parse_request("age=gte.18&age=lte.30").unwrap();
        assert_eq!(parsed.filters.len(), 2);
    }

    #[test]
    fn parses_reserved_params() {
        let parsed = parse_request("select=id,name&order=name.desc&limit=10&offset=5").unwrap();
        assert_eq!(parsed.select.as_deref(), Some("id,name"));
        assert_eq!(parsed.order.len(), 1);
        assert_eq!(parsed.order[0].direction, OrderDirection::Desc);
        assert_eq!(parsed.limit, Some(10));
        assert_eq!(parsed.offset, Some(5));
    }

    #[test]
    fn parses_not_prefixed_filter() {
        let parsed = parse_request("not.status=eq.archived").unwrap();
        match &parsed.filters[0] {
            FilterNode::Atom { negate, .. } => assert!(negate),
            _ => panic!("expected atom"),
        }
    }

    #[test]
    fn parses_or_group_with_nested_and() {
        let parsed = parse_request("or=(status.eq.active,and(status.eq.pending,age.gte.18))").unwrap();
        match &parsed.filters[0] {
            FilterNode::Or(nodes) => {
                assert_eq!(nodes.len(), 2);
                assert!(matches!(nodes[1], FilterNode::And(_)));
            }
            _ => panic!("expected or group"),
        }
    }

    #[test]
    fn parses_in_list() {
        let parsed = parse_request("status=in.(active,pending)").unwrap();
        match &parsed.filters[0] {
            FilterNode::Atom { value, .. } => match value {
                ValueToken::List(items) => assert_eq!(items, &vec!["active".to_string(), "pending".to_string()]),
                _ => panic!("expected list"),
            },
            _ => panic!("expected atom"),
        }
    }

    #[test]
    fn trailing_dot_escapes_reserved_column_name() {
        let parsed = parse_request("order.=eq.5").unwrap();
        assert_eq!(parsed.filters.len(), 1);
        assert!(parsed.order.is_empty());
    }

    #[test]
    fn rejects_unknown_operator() {
        assert!(parse_request("name=frobnicate.alice").is_err());
    }
}
