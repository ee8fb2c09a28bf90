pub mod expr;

use std::path::Path;
use std::sync::RwLock;

use config::{Config, File};
use serde::Deserialize;

use crate::auth::Principal;
use crate::config::DefaultAction;
use crate::error::{AppError, AppResult};
use crate::filter::FilterNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyAction {
    fn matches(self, action: PolicyAction) -> bool {
        self == PolicyAction::All || self == action
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Policy {
    pub table: String,
    pub action: PolicyAction,
    /// `"public"` matches any authenticated or anonymous principal.
    pub role: String,
    /// Applied to SELECT and as the read-side of UPDATE/DELETE.
    pub using_expr: Option<String>,
    /// Applied to the new row on INSERT/UPDATE; falls back to `using_expr`
    /// when absent, matching the read/write symmetry most policies want.
    pub with_check_expr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PoliciesFile {
    #[serde(default, rename = "policy")]
    policies: Vec<Policy>,
}

/// Declarative (table, action, role) policies, swapped in as a unit on
/// reload (read-copy-update) so an in-flight request never observes a
/// half-updated policy set.
pub struct PolicyEngine {
    policies: RwLock<std::sync::Arc<Vec<Policy>>>,
    default_action: DefaultAction,
}

impl PolicyEngine {
    pub fn new(default_action: DefaultAction) -> Self {
        Self {
            policies: RwLock::new(std::sync::Arc::new(Vec::new())),
            default_action,
        }
    }

    pub fn load_from_file(&self, path: &Path) -> AppResult<usize> {
        let builder = Config::builder()
            .add_source(File::from(path))
            .build()?;
        let file: PoliciesFile = builder.try_deserialize()?;
        let count = file.policies.len();
        let mut guard = self
            .policies
            .write()
            .map_err(|_| AppError::Database("policy set poisoned".to_string()))?;
        *guard = std::sync::Arc::new(file.policies);
        Ok(count)
    }

    pub fn count(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> std::sync::Arc<Vec<Policy>> {
        self.policies
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|_| std::sync::Arc::new(Vec::new()))
    }

    fn applicable(&self, table: &str, action: PolicyAction, principal: &Principal) -> Vec<Policy> {
        self.snapshot()
            .iter()
            .filter(|p| {
                p.table == table
                    && p.action.matches(action)
                    && (p.role == "public" || p.role == principal.role)
            })
            .cloned()
            .collect()
    }

    /// Compile every applicable policy's `using_expr` into one OR'd predicate
    /// and append it to `filters`. A table with no matching policy falls
    /// back to `default_action`: `Allow` injects no predicate, `Deny` injects
    /// an always-false one so the query returns nothing rather than erroring.
    /// `admin` short-circuits to no restriction at all, before any policy is
    /// even looked up.
    pub fn apply_read(
        &self,
        table: &str,
        action: PolicyAction,
        principal: &Principal,
        filters: &mut Vec<FilterNode>,
    ) -> AppResult<()> {
        if principal.role == "admin" {
            return Ok(());
        }

        let policies = self.applicable(table, action, principal);
        if policies.is_empty() {
            if self.default_action == DefaultAction::Deny {
                filters.push(FilterNode::Raw("0".to_string(), vec![]));
            }
            return Ok(());
        }

        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for policy in &policies {
            let predicate = policy.using_expr.as_deref().unwrap_or("true = true");
            let parsed = expr::parse(predicate)?;
            let (sql, p) = expr::bind(&parsed, "t0", principal);
            clauses.push(sql);
            params.extend(p);
        }

        filters.push(FilterNode::Raw(format!("({})", clauses.join(" OR ")), params));
        Ok(())
    }

    /// Check a row against the applicable `with_check_expr` (or `using_expr`
    /// as a fallback) before an INSERT/UPDATE is allowed to commit it.
    pub fn check_write(
        &self,
        table: &str,
        action: PolicyAction,
        principal: &Principal,
    ) -> AppResult<Option<(String, Vec<rusqlite::types::Value>)>> {
        if principal.role == "admin" {
            return Ok(None);
        }

        let policies = self.applicable(table, action, principal);
        if policies.is_empty() {
            return if self.default_action == DefaultAction::Deny {
                Err(AppError::permission(format!(
                    "no policy permits {action:?} on {table}"
                )))
            } else {
                Ok(None)
            };
        }

        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for policy in &policies {
            let predicate = policy
                .with_check_expr
                .as_deref()
                .or(policy.using_expr.as_deref())
                .unwrap_or("true = true");
            let parsed = expr::parse(predicate)?;
            let (sql, p) = expr::bind(&parsed, "t0", principal);
            clauses.push(sql);
            params.extend(p);
        }

        Ok(Some((format!("({})", clauses.join(" OR ")), params)))
    }

    /// Insert-check extension point: there is no database row yet to filter
    /// against, so the submitted JSON body is evaluated directly in Rust
    /// rather than compiled to SQL.
    pub fn check_insert_row(
        &self,
        table: &str,
        principal: &Principal,
        row: &serde_json::Map<String, serde_json::Value>,
    ) -> AppResult<()> {
        if principal.role == "admin" {
            return Ok(());
        }

        let policies = self.applicable(table, PolicyAction::Insert, principal);
        if policies.is_empty() {
            return if self.default_action == DefaultAction::Deny {
                Err(AppError::permission(format!(
                    "no policy permits insert on {table}"
                )))
            } else {
                Ok(())
            };
        }

        for policy in &policies {
            let predicate = policy
                .with_check_expr
                .as_deref()
                .or(policy.using_expr.as_deref())
                .unwrap_or("true = true");
            let parsed = expr::parse(predicate)?;
            if expr::evaluate(&parsed, principal, row)? {
                return Ok(());
            }
        }

        Err(AppError::permission(format!(
            "row does not satisfy any insert policy on {table}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(role: &str) -> Principal {
        Principal {
            authenticated: true,
            user_id: Some("1".to_string()),
            role: role.to_string(),
            tenant_id: None,
            claims: Default::default(),
        }
    }

    #[test]
    fn no_policies_with_deny_default_injects_false() {
        let engine = PolicyEngine::new(DefaultAction::Deny);
        let mut filters = Vec::new();
        engine
            .apply_read("widgets", PolicyAction::Select, &principal("user"), &mut filters)
            .unwrap();
        assert_eq!(filters.len(), 1);
        match &filters[0] {
            FilterNode::Raw(sql, _) => assert_eq!(sql, "0"),
            _ => panic!("expected raw predicate"),
        }
    }

    #[test]
    fn no_policies_with_allow_default_injects_nothing() {
        let engine = PolicyEngine::new(DefaultAction::Allow);
        let mut filters = Vec::new();
        engine
            .apply_read("widgets", PolicyAction::Select, &principal("user"), &mut filters)
            .unwrap();
        assert!(filters.is_empty());
    }

    #[test]
    fn write_denied_without_matching_policy() {
        let engine = PolicyEngine::new(DefaultAction::Deny);
        let result = engine.check_write("widgets", PolicyAction::Insert, &principal("user"));
        assert!(result.is_err());
    }

    #[test]
    fn admin_bypasses_deny_default() {
        let engine = PolicyEngine::new(DefaultAction::Deny);
        let mut filters = Vec::new();
        engine
            .apply_read("widgets", PolicyAction::Select, &principal("admin"), &mut filters)
            .unwrap();
        assert!(filters.is_empty());
        assert!(engine
            .check_write("widgets", PolicyAction::Insert, &principal("admin"))
            .unwrap()
            .is_none());
    }
}
