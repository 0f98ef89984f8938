//! Mapping from observed workflow output to the minimum step reached.

use crate::types::state::{keys, risk_fields, risk_rows};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Shape of the accumulated values that proves a pipeline stage ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressCondition {
    /// Top-level key present and not null
    KeyPresent { key: String },
    /// Any of the keys holds a non-empty value
    AnyNonEmpty { keys: Vec<String> },
    /// `risk_data` holds at least one row
    RiskRows,
    /// Some risk row carries any of the fields
    RiskRowField { fields: Vec<String> },
}

impl ProgressCondition {
    pub fn matches(&self, values: &Value) -> bool {
        match self {
            ProgressCondition::KeyPresent { key } => {
                values.get(key).is_some_and(|v| !v.is_null())
            }
            ProgressCondition::AnyNonEmpty { keys } => keys
                .iter()
                .any(|k| values.get(k).is_some_and(is_non_empty)),
            ProgressCondition::RiskRows => !risk_rows(values).is_empty(),
            ProgressCondition::RiskRowField { fields } => risk_rows(values).iter().any(|row| {
                fields
                    .iter()
                    .any(|f| row.get(f).is_some_and(is_non_empty))
            }),
        }
    }
}

fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRule {
    #[serde(flatten)]
    pub condition: ProgressCondition,
    pub min_step: usize,
}

impl ProgressRule {
    pub fn new(condition: ProgressCondition, min_step: usize) -> Self {
        Self {
            condition,
            min_step,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Rules for the risk analysis pipeline.
pub fn default_rules() -> Vec<ProgressRule> {
    vec![
        ProgressRule::new(
            ProgressCondition::KeyPresent {
                key: keys::INPUT_FILE.to_string(),
            },
            1,
        ),
        ProgressRule::new(
            ProgressCondition::AnyNonEmpty {
                keys: strings(&["extracted_info", "extraction", "document_info"]),
            },
            2,
        ),
        ProgressRule::new(ProgressCondition::RiskRows, 3),
        ProgressRule::new(
            ProgressCondition::RiskRowField {
                fields: strings(&[risk_fields::CAUSES, risk_fields::CONSEQUENCES]),
            },
            4,
        ),
        ProgressRule::new(
            ProgressCondition::RiskRowField {
                fields: strings(&[risk_fields::RISK_LEVEL]),
            },
            5,
        ),
        ProgressRule::new(
            ProgressCondition::RiskRowField {
                fields: strings(&[risk_fields::APPETITE_ANALYSIS]),
            },
            6,
        ),
        ProgressRule::new(
            ProgressCondition::RiskRowField {
                fields: strings(&[
                    risk_fields::PREVENTIVE_ACTIONS,
                    risk_fields::CONTINGENCY_ACTIONS,
                ]),
            },
            7,
        ),
    ]
}

/// Highest step proven by `values`, never below `previous`.
pub fn derive_high_water_mark(rules: &[ProgressRule], values: &Value, previous: usize) -> usize {
    rules
        .iter()
        .filter(|rule| rule.condition.matches(values))
        .map(|rule| rule.min_step)
        .fold(previous, usize::max)
}
