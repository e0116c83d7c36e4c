// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL Translator
//!
//! Translates a [`TaskQuery`] into a parameterized WHERE clause over the
//! `tasks` table (aliased `t`). Metadata predicates become correlated
//! `EXISTS` subqueries against `field_metadata`.
//!
//! # SQL Syntax Generated
//!
//! ```sql
//! t.project_id = ?                                              -- Project
//! t.labels LIKE ? ESCAPE '!'                                    -- Label ('%"name"%')
//! EXISTS (SELECT 1 FROM field_metadata fm
//!         WHERE fm.task_id = t.id AND fm.field = ? AND fm.value = ?)  -- Meta equals
//! ```

use super::query::{MetaOperator, MetaPredicate, QueryNode, TaskQuery};

/// SQL query translator for task queries
pub struct SqlTranslator;

const LIKE_ESCAPE: char = '!';

/// Escape LIKE wildcards so `text` matches literally.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | LIKE_ESCAPE) {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(c);
    }
    escaped
}

/// WHERE clause with positional `?` placeholders
#[derive(Debug, Clone)]
pub struct SqlQuery {
    /// The WHERE clause (without "WHERE" keyword)
    pub clause: String,
    /// The parameter values in order
    pub params: Vec<SqlParam>,
}

/// SQL parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Float(f64),
}

impl SqlTranslator {
    pub fn translate(query: &TaskQuery, is_sqlite: bool) -> SqlQuery {
        let mut params = Vec::new();
        let clause = Self::translate_node(&query.root, is_sqlite, &mut params);
        SqlQuery { clause, params }
    }

    fn translate_node(node: &QueryNode, is_sqlite: bool, params: &mut Vec<SqlParam>) -> String {
        match node {
            QueryNode::All => "1 = 1".to_string(),
            QueryNode::Project(id) => {
                params.push(SqlParam::Text(id.clone()));
                "t.project_id = ?".to_string()
            }
            QueryNode::Completed(c) => {
                params.push(SqlParam::Int(*c as i64));
                "t.is_completed = ?".to_string()
            }
            QueryNode::Priority(p) => {
                params.push(SqlParam::Int(*p as i64));
                "t.priority = ?".to_string()
            }
            QueryNode::PriorityAtLeast(p) => {
                params.push(SqlParam::Int(*p as i64));
                "t.priority >= ?".to_string()
            }
            QueryNode::Label(name) => {
                // Labels are stored as a JSON array; match the quoted element
                let quoted = serde_json::to_string(name).unwrap_or_default();
                params.push(SqlParam::Text(format!("%{}%", escape_like(&quoted))));
                format!("t.labels LIKE ? ESCAPE '{}'", LIKE_ESCAPE)
            }
            QueryNode::Meta(pred) => Self::translate_meta(pred, is_sqlite, params),
            QueryNode::And(nodes) => Self::join(nodes, " AND ", is_sqlite, params),
            QueryNode::Or(nodes) => Self::join(nodes, " OR ", is_sqlite, params),
            QueryNode::Not(inner) => {
                format!("NOT ({})", Self::translate_node(inner, is_sqlite, params))
            }
        }
    }

    fn join(nodes: &[QueryNode], sep: &str, is_sqlite: bool, params: &mut Vec<SqlParam>) -> String {
        if nodes.is_empty() {
            return "1 = 1".to_string();
        }
        let parts: Vec<String> = nodes
            .iter()
            .map(|n| Self::translate_node(n, is_sqlite, params))
            .collect();
        if parts.len() == 1 {
            parts[0].clone()
        } else {
            format!("({})", parts.join(sep))
        }
    }

    fn translate_meta(pred: &MetaPredicate, is_sqlite: bool, params: &mut Vec<SqlParam>) -> String {
        params.push(SqlParam::Text(pred.field.as_str().to_string()));
        let condition = match &pred.operator {
            MetaOperator::Equals(value) => {
                params.push(SqlParam::Text(value.to_string()));
                "fm.value = ?".to_string()
            }
            MetaOperator::Range { min, max } => {
                // Only JSON numbers take part in a range; CAST would read "m" as 0
                let (is_number, cast) = if is_sqlite {
                    ("json_type(fm.value) IN ('integer', 'real')", "CAST(fm.value AS REAL)")
                } else {
                    (
                        "JSON_TYPE(fm.value) IN ('INTEGER', 'UNSIGNED INTEGER', 'DOUBLE', 'DECIMAL')",
                        "CAST(fm.value AS DECIMAL(20,6))",
                    )
                };
                let mut parts = vec![is_number.to_string()];
                if let Some(min) = min {
                    params.push(SqlParam::Float(*min));
                    parts.push(format!("{} >= ?", cast));
                }
                if let Some(max) = max {
                    params.push(SqlParam::Float(*max));
                    parts.push(format!("{} <= ?", cast));
                }
                parts.join(" AND ")
            }
            MetaOperator::Present => "1 = 1".to_string(),
        };
        format!(
            "EXISTS (SELECT 1 FROM field_metadata fm WHERE fm.task_id = t.id AND fm.field = ? AND {})",
            condition
        )
    }
}
