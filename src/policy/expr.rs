use rusqlite::types::Value;

use crate::auth::Principal;
use crate::error::{AppError, AppResult};

/// A restricted boolean expression grammar for policy predicates: column
/// references, literals, comparisons, `AND`/`OR`/`NOT`, and a small set of
/// principal-aware functions (`current_user_id()`, `current_role()`,
/// `current_tenant_id()`, `has_role('x')`). This is deliberately far short of
/// SQL: it exists so policy authors can write `owner_id = current_user_id()`
/// without the engine ever concatenating untrusted text into a query.
#[derive(Debug, Clone)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp(Term, CmpOp, Term),
    HasRole(String),
    BoolLiteral(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone)]
pub enum Term {
    Column(String),
    Literal(Value),
    CurrentUserId,
    CurrentRole,
    CurrentTenantId,
}

pub fn parse(source: &str) -> AppResult<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(AppError::validation(format!(
            "unexpected trailing input in policy expression: {source}"
        )));
    }
    Ok(expr)
}

/// Resolve every principal-dependent term to a literal and render the
/// remainder as a parameterized SQL fragment referencing `alias`. `has_role`
/// is folded to a boolean constant here, never interpolated as text.
pub fn bind(expr: &Expr, alias: &str, principal: &Principal) -> (String, Vec<Value>) {
    match expr {
        Expr::And(l, r) => combine(l, r, alias, principal, "AND"),
        Expr::Or(l, r) => combine(l, r, alias, principal, "OR"),
        Expr::Not(inner) => {
            let (sql, params) = bind(inner, alias, principal);
            (format!("NOT ({sql})"), params)
        }
        Expr::HasRole(role) => {
            let matches = principal.role == *role;
            (if matches { "1".to_string() } else { "0".to_string() }, vec![])
        }
        Expr::BoolLiteral(b) => ((if *b { "1" } else { "0" }).to_string(), vec![]),
        Expr::Cmp(lhs, op, rhs) => bind_cmp(lhs, *op, rhs, alias, principal),
    }
}

fn combine(l: &Expr, r: &Expr, alias: &str, principal: &Principal, joiner: &str) -> (String, Vec<Value>) {
    let (lsql, mut lparams) = bind(l, alias, principal);
    let (rsql, rparams) = bind(r, alias, principal);
    lparams.extend(rparams);
    (format!("({lsql} {joiner} {rsql})"), lparams)
}

fn bind_cmp(lhs: &Term, op: CmpOp, rhs: &Term, alias: &str, principal: &Principal) -> (String, Vec<Value>) {
    let mut params = Vec::new();
    let lsql = render_term(lhs, alias, principal, &mut params);
    let rsql = render_term(rhs, alias, principal, &mut params);
    let symbol = match op {
        CmpOp::Eq => "=",
        CmpOp::Neq => "!=",
        CmpOp::Lt => "<",
        CmpOp::Lte => "<=",
        CmpOp::Gt => ">",
        CmpOp::Gte => ">=",
    };
    (format!("{lsql} {symbol} {rsql}"), params)
}

fn render_term(term: &Term, alias: &str, principal: &Principal, params: &mut Vec<Value>) -> String {
    match term {
        Term::Column(name) => format!("{}.{}", alias, crate::emitter::quote_ident(name)),
        Term::Literal(v) => {
            params.push(v.clone());
            "?".to_string()
        }
        Term::CurrentUserId => {
            params.push(
                principal
                    .user_id
                    .clone()
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
            );
            "?".to_string()
        }
        Term::CurrentRole => {
            params.push(Value::Text(principal.role.clone()));
            "?".to_string()
        }
        Term::CurrentTenantId => {
            params.push(
                principal
                    .tenant_id
                    .clone()
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
            );
            "?".to_string()
        }
    }
}

/// Evaluate a predicate directly against a submitted row (as JSON) rather
/// than compiling it to SQL. Used for the INSERT check extension point,
/// where there is no table row in the database yet to filter against.
pub fn evaluate(
    expr: &Expr,
    principal: &Principal,
    row: &serde_json::Map<String, serde_json::Value>,
) -> AppResult<bool> {
    match expr {
        Expr::And(l, r) => Ok(evaluate(l, principal, row)? && evaluate(r, principal, row)?),
        Expr::Or(l, r) => Ok(evaluate(l, principal, row)? || evaluate(r, principal, row)?),
        Expr::Not(inner) => Ok(!evaluate(inner, principal, row)?),
        Expr::HasRole(role) => Ok(principal.role == *role),
        Expr::BoolLiteral(b) => Ok(*b),
        Expr::Cmp(lhs, op, rhs) => {
            let l = term_as_json(lhs, principal, row);
            let r = term_as_json(rhs, principal, row);
            Ok(compare_json(&l, *op, &r))
        }
    }
}

fn term_as_json(
    term: &Term,
    principal: &Principal,
    row: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    match term {
        Term::Column(name) => row.get(name).cloned().unwrap_or(serde_json::Value::Null),
        Term::Literal(v) => crate::shape::sql_value_to_json(v),
        Term::CurrentUserId => principal
            .user_id
            .clone()
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
        Term::CurrentRole => serde_json::Value::String(principal.role.clone()),
        Term::CurrentTenantId => principal
            .tenant_id
            .clone()
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
    }
}

fn compare_json(l: &serde_json::Value, op: CmpOp, r: &serde_json::Value) -> bool {
    use serde_json::Value as J;
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return match op {
            CmpOp::Eq => a == b,
            CmpOp::Neq => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Lte => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Gte => a >= b,
        };
    }
    let a = match l {
        J::String(s) => s.clone(),
        other => other.to_string(),
    };
    let b = match r {
        J::String(s) => s.clone(),
        other => other.to_string(),
    };
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Neq => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Lte => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Gte => a >= b,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
    Op(CmpOp),
}

fn tokenize(source: &str) -> AppResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '\'' {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(AppError::validation("unterminated string literal"));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '=' => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Neq));
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Lte));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(CmpOp::Lt));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Gte));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(CmpOp::Gt));
                i += 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| AppError::validation(format!("bad numeric literal: {text}")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    "NOT" => tokens.push(Token::Not),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(AppError::validation(format!(
                    "unexpected character in policy expression: {other}"
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> AppResult<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> AppResult<Expr> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> AppResult<Expr> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> AppResult<Expr> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.advance();
            let expr = self.parse_or()?;
            match self.advance() {
                Some(Token::RParen) => return Ok(expr),
                _ => return Err(AppError::validation("unbalanced parentheses")),
            }
        }

        if let Some(Token::Ident(name)) = self.peek().cloned() {
            if name.eq_ignore_ascii_case("true") {
                self.advance();
                return Ok(Expr::BoolLiteral(true));
            }
            if name.eq_ignore_ascii_case("false") {
                self.advance();
                return Ok(Expr::BoolLiteral(false));
            }
            if name.eq_ignore_ascii_case("has_role") {
                self.advance();
                self.expect(Token::LParen)?;
                let role = self.parse_string()?;
                self.expect(Token::RParen)?;
                return Ok(Expr::HasRole(role));
            }
        }

        let lhs = self.parse_term()?;
        let op = match self.advance() {
            Some(Token::Op(op)) => op,
            other => {
                return Err(AppError::validation(format!(
                    "expected comparison operator, found {other:?}"
                )))
            }
        };
        let rhs = self.parse_term()?;
        Ok(Expr::Cmp(lhs, op, rhs))
    }

    fn parse_term(&mut self) -> AppResult<Term> {
        match self.advance() {
            Some(Token::Ident(name)) => {
                if name.eq_ignore_ascii_case("current_user_id") {
                    self.expect(Token::LParen)?;
                    self.expect(Token::RParen)?;
                    Ok(Term::CurrentUserId)
                } else if name.eq_ignore_ascii_case("current_role") {
                    self.expect(Token::LParen)?;
                    self.expect(Token::RParen)?;
                    Ok(Term::CurrentRole)
                } else if name.eq_ignore_ascii_case("current_tenant_id") {
                    self.expect(Token::LParen)?;
                    self.expect(Token::RParen)?;
                    Ok(Term::CurrentTenantId)
                } else {
                    crate::db::schema::validate_identifier(&name)?;
                    Ok(Term::Column(name))
                }
            }
            Some(Token::Str(s)) => Ok(Term::Literal(Value::Text(s))),
            Some(Token::Num(n)) => {
                if n.fract() == 0.0 {
                    Ok(Term::Literal(Value::Integer(n as i64)))
                } else {
                    Ok(Term::Literal(Value::Real(n)))
                }
            }
            other => Err(AppError::validation(format!(
                "expected a term, found {other:?}"
            ))),
        }
    }

    fn parse_string(&mut self) -> AppResult<String> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(s),
            other => Err(AppError::validation(format!(
                "expected string literal, found {other:?}"
            ))),
        }
    }

    fn expect(&mut self, expected: Token) -> AppResult<()> {
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            other => Err(AppError::validation(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;

    fn principal(role: &str, user_id: &str) -> Principal {
        Principal {
            authenticated: true,
            user_id: Some(user_id.to_string()),
            role: role.to_string(),
            tenant_id: None,
            claims: Default::default(),
        }
    }

    #[test]
    fn parses_and_binds_simple_comparison() {
        let expr = parse("owner_id = current_user_id()").unwrap();
        let (sql, params) = bind(&expr, "t0", &principal("user", "42"));
        assert!(sql.contains("="));
        assert_eq!(params, vec![Value::Text("42".to_string())]);
    }

    #[test]
    fn has_role_folds_to_constant() {
        let expr = parse("has_role('admin')").unwrap();
        let (sql, params) = bind(&expr, "t0", &principal("admin", "1"));
        assert_eq!(sql, "1");
        assert!(params.is_empty());

        let (sql, _) = bind(&expr, "t0", &principal("user", "1"));
        assert_eq!(sql, "0");
    }

    #[test]
    fn and_or_not_combine() {
        let expr = parse("has_role('admin') OR (status = 'public' AND NOT archived = 1)").unwrap();
        let (sql, _) = bind(&expr, "t0", &principal("user", "1"));
        assert!(sql.contains("OR"));
        assert!(sql.contains("AND"));
        assert!(sql.contains("NOT"));
    }

    #[test]
    fn rejects_malformed_expression() {
        assert!(parse("owner_id =").is_err());
    }
}
