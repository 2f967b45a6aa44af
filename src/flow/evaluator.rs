//! Pure routing decisions: trigger matching, condition evaluation and edge
//! selection. Nothing here sends or persists.

use super::{ConditionConfig, ConditionMode, FlowEdge, Operator, TriggerConfig};
use crate::types::value_to_text;
use regex::RegexBuilder;
use serde_json::{Map, Value};

const TRUE_LABELS: &[&str] = &["true", "yes", "sim", "si", "sí", "verdadeiro", "1"];
const FALSE_LABELS: &[&str] = &["false", "no", "não", "nao", "falso", "0"];

pub const NO_MATCH_HANDLE: &str = "default";

pub fn normalize_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// A trigger without keywords matches any message.
pub fn trigger_matches(config: &TriggerConfig, text: &str) -> bool {
    if config.keywords.is_empty() {
        return true;
    }
    let text = normalize_text(text);
    config
        .keywords
        .iter()
        .map(|keyword| normalize_text(keyword))
        .filter(|keyword| !keyword.is_empty())
        .any(|keyword| text == keyword || text.contains(&keyword))
}

pub fn compare(operator: Operator, input: &str, expected: &str) -> bool {
    if operator == Operator::Regex {
        return RegexBuilder::new(expected.trim())
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(input.trim()))
            .unwrap_or(false);
    }
    let input = normalize_text(input);
    let expected = normalize_text(expected);
    match operator {
        Operator::Equals => input == expected,
        Operator::NotEquals => input != expected,
        Operator::Contains => input.contains(&expected),
        Operator::StartsWith => input.starts_with(&expected),
        Operator::EndsWith => input.ends_with(&expected),
        Operator::Regex => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionOutcome {
    Branch(bool),
    Case(usize),
    NoMatch,
}

impl ConditionOutcome {
    /// Variables recorded on the session for a condition node.
    pub fn variables(&self, node_id: &str) -> Map<String, Value> {
        let mut vars = Map::new();
        let value = match self {
            ConditionOutcome::Branch(result) => Value::Bool(*result),
            ConditionOutcome::Case(index) => Value::String(format!("case-{index}")),
            ConditionOutcome::NoMatch => Value::String("no_match".to_string()),
        };
        vars.insert(format!("condition_{node_id}"), value);
        vars
    }
}

fn subject(config: &ConditionConfig, text: &str, variables: &Map<String, Value>) -> String {
    match config.field.as_deref().map(str::trim) {
        None | Some("") | Some("message") | Some("last_message") | Some("lastMessage") | Some("text") => {
            text.to_string()
        }
        Some(field) => variables.get(field).map(value_to_text).unwrap_or_default(),
    }
}

pub fn evaluate_condition(config: &ConditionConfig, text: &str, variables: &Map<String, Value>) -> ConditionOutcome {
    let input = subject(config, text, variables);
    match config.mode {
        ConditionMode::IfElse => ConditionOutcome::Branch(compare(config.operator, &input, &config.value)),
        ConditionMode::Switch => config
            .cases
            .iter()
            .position(|case| compare(case.operator, &input, &case.value))
            .map(ConditionOutcome::Case)
            .unwrap_or(ConditionOutcome::NoMatch),
    }
}

fn edge_key(edge: &FlowEdge) -> Option<String> {
    edge.handle
        .as_deref()
        .or(edge.label.as_deref())
        .map(normalize_text)
        .filter(|key| !key.is_empty())
}

fn bool_label(edge: &FlowEdge) -> Option<bool> {
    let keys = [edge.handle.as_deref(), edge.label.as_deref()];
    keys.into_iter().flatten().map(normalize_text).find_map(|key| {
        if TRUE_LABELS.contains(&key.as_str()) {
            Some(true)
        } else if FALSE_LABELS.contains(&key.as_str()) {
            Some(false)
        } else {
            None
        }
    })
}

/// Picks the outgoing edge for a condition result.
///
/// Boolean branches match edges labelled with any true/false synonym. When no
/// edge carries a boolean label the first edge is followed; when labels exist
/// but none fits, the first unlabelled edge is used, or the walk ends.
pub fn select_edge<'a>(edges: &[&'a FlowEdge], outcome: &ConditionOutcome) -> Option<&'a FlowEdge> {
    match outcome {
        ConditionOutcome::Branch(result) => {
            if let Some(edge) = edges.iter().find(|edge| bool_label(edge) == Some(*result)) {
                return Some(*edge);
            }
            if edges.iter().all(|edge| bool_label(edge).is_none()) {
                return edges.first().copied();
            }
            // never follow the opposite branch; without an unlabelled edge the walk ends
            edges.iter().find(|edge| bool_label(edge).is_none()).copied()
        }
        ConditionOutcome::Case(index) => {
            let handle = format!("case-{index}");
            edges
                .iter()
                .find(|edge| edge_key(edge).as_deref() == Some(handle.as_str()))
                .or_else(|| default_edge(edges))
                .copied()
        }
        ConditionOutcome::NoMatch => default_edge(edges).copied(),
    }
}

fn default_edge<'a, 'b>(edges: &'b [&'a FlowEdge]) -> Option<&'b &'a FlowEdge> {
    edges
        .iter()
        .find(|edge| edge_key(edge).as_deref() == Some(NO_MATCH_HANDLE))
        .or_else(|| edges.first())
}
