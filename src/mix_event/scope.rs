//! Biz set scope filters.
//!
//! A biz set's `bk_scope` either matches every biz or carries a filter tree of
//! `AND`/`OR` combined atom rules over biz attributes. Only `equal` and `in`
//! operators are meaningful for biz set scopes.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::event::doc;

pub const SCOPE_FIELD: &str = "bk_scope";
pub const MATCH_ALL_FIELD: &str = "match_all";

pub const FIELD_TYPE_INT: &str = "int";
pub const FIELD_TYPE_ENUM: &str = "enum";
pub const FIELD_TYPE_ORGANIZATION: &str = "organization";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BizSetScope {
    #[serde(default)]
    pub match_all: bool,
    #[serde(default)]
    pub filter: Option<ScopeFilter>,
}

impl BizSetScope {
    /// Scope of a biz set document, `None` when absent or malformed.
    pub fn from_doc(biz_set: &Value) -> Option<Self> {
        let raw = doc::get_path(biz_set, SCOPE_FIELD)?;
        match serde_json::from_value(raw.clone()) {
            Ok(scope) => Some(scope),
            Err(e) => {
                warn!("biz set scope {} can not be parsed: {:?}", raw, e);
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Condition {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeFilter {
    Combined {
        condition: Condition,
        rules: Vec<ScopeFilter>,
    },
    Atom(AtomRule),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomRule {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

impl ScopeFilter {
    /// Evaluates the tree, deciding each atom with `atom`.
    pub fn matches<F>(
        &self,
        atom: &mut F,
    ) -> bool
    where
        F: FnMut(&AtomRule) -> bool,
    {
        match self {
            ScopeFilter::Atom(rule) => atom(rule),
            ScopeFilter::Combined { condition, rules } => match condition {
                Condition::And => !rules.is_empty() && rules.iter().all(|r| r.matches(atom)),
                Condition::Or => rules.iter().any(|r| r.matches(atom)),
            },
        }
    }

    /// Whether any atom of the tree satisfies `pred`, whatever the conditions.
    ///
    /// Every atom is visited, so `pred` sees all rules even after a hit.
    pub fn match_any<F>(
        &self,
        pred: &mut F,
    ) -> bool
    where
        F: FnMut(&AtomRule) -> bool,
    {
        match self {
            ScopeFilter::Atom(rule) => pred(rule),
            ScopeFilter::Combined { rules, .. } => {
                let mut hit = false;
                for r in rules {
                    hit |= r.match_any(pred);
                }
                hit
            }
        }
    }
}

/// Decides one atom rule against a biz document.
///
/// Rules on fields outside `care_fields`, or on fields the biz lacks, never
/// match.
pub fn match_biz(
    rule: &AtomRule,
    biz: &Value,
    care_fields: &HashMap<String, String>,
) -> bool {
    let Some(property_type) = care_fields.get(&rule.field) else {
        warn!(field = %rule.field, "biz set scope rule on a field that is not cared");
        return false;
    };
    let Some(biz_val) = biz.get(&rule.field) else {
        return false;
    };

    match rule.operator.as_str() {
        "equal" => match_equal(&rule.value, biz_val, property_type),
        "in" => match_in(&rule.value, biz_val, property_type),
        other => {
            warn!(operator = other, "biz set scope rule has an unsupported operator");
            false
        }
    }
}

/// Enum values compare as strings, int and organization values as integers.
pub fn match_equal(
    rule_val: &Value,
    biz_val: &Value,
    property_type: &str,
) -> bool {
    match property_type {
        FIELD_TYPE_ENUM => match (rule_val.as_str(), biz_val.as_str()) {
            (Some(r), Some(b)) => r == b,
            _ => false,
        },
        FIELD_TYPE_INT | FIELD_TYPE_ORGANIZATION => {
            match (doc::value_as_i64(rule_val), doc::value_as_i64(biz_val)) {
                (Some(r), Some(b)) => r == b,
                _ => false,
            }
        }
        other => {
            warn!(property_type = other, "biz set scope rule on an unsupported field type");
            false
        }
    }
}

pub fn match_in(
    rule_val: &Value,
    biz_val: &Value,
    property_type: &str,
) -> bool {
    match rule_val.as_array() {
        Some(values) => values.iter().any(|v| match_equal(v, biz_val, property_type)),
        None => false,
    }
}
