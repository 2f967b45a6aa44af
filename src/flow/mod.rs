//! Conversation graphs for interactive campaigns.
//!
//! Graphs arrive from the flow editor as `{nodes, edges}` JSON where every
//! node carries a `type` tag and a free-form `data` object. On load each node
//! is parsed into the config struct for its kind, so the evaluator can match
//! exhaustively over [`NodeKind`].

pub mod evaluator;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowGraph {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("flow has no trigger node")]
    MissingTrigger,
    #[error("edge {source_id} -> {target} references an unknown node")]
    DanglingEdge { source_id: String, target: String },
    #[error("node id '{0}' is used twice")]
    DuplicateNode(String),
    #[error("delay node '{node_id}' waits {seconds}s, longer than {max}s", max = MAX_DELAY_SECONDS)]
    DelayTooLong { node_id: String, seconds: u64 },
}

/// Longest wait a delay node may ask for (30 days).
pub const MAX_DELAY_SECONDS: u64 = 30 * 24 * 60 * 60;

impl FlowGraph {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn trigger(&self) -> Option<&FlowNode> {
        self.nodes
            .iter()
            .find(|node| matches!(node.kind, NodeKind::Trigger(_)))
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn outgoing(&self, id: &str) -> Vec<&FlowEdge> {
        self.edges.iter().filter(|edge| edge.source == id).collect()
    }

    pub fn first_target(&self, id: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|edge| edge.source == id)
            .map(|edge| edge.target.as_str())
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        for (index, node) in self.nodes.iter().enumerate() {
            if self.nodes[..index].iter().any(|other| other.id == node.id) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }
        if self.trigger().is_none() {
            return Err(GraphError::MissingTrigger);
        }
        for node in &self.nodes {
            if let NodeKind::Delay(cfg) = &node.kind {
                if cfg.seconds > MAX_DELAY_SECONDS {
                    return Err(GraphError::DelayTooLong {
                        node_id: node.id.clone(),
                        seconds: cfg.seconds,
                    });
                }
            }
        }
        for edge in &self.edges {
            if self.node(&edge.source).is_none() || self.node(&edge.target).is_none() {
                return Err(GraphError::DanglingEdge {
                    source_id: edge.source.clone(),
                    target: edge.target.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(
        default,
        rename = "sourceHandle",
        alias = "source_handle",
        alias = "handle",
        skip_serializing_if = "Option::is_none"
    )]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct FlowNode {
    pub id: String,
    pub kind: NodeKind,
    pub position: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntegrationKind {
    #[serde(rename = "crm_a")]
    CrmA,
    #[serde(rename = "crm_b")]
    CrmB,
}

impl IntegrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationKind::CrmA => "crm_a",
            IntegrationKind::CrmB => "crm_b",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Trigger(TriggerConfig),
    Text(TextConfig),
    Image(MediaConfig),
    Video(MediaConfig),
    Audio(MediaConfig),
    Document(MediaConfig),
    Condition(ConditionConfig),
    Delay(DelayConfig),
    Stop(StopConfig),
    Integration(IntegrationKind, IntegrationConfig),
    /// Older editor versions emitted a generic action node.
    Action(ActionConfig),
}

impl NodeKind {
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Trigger(_) => "trigger",
            NodeKind::Text(_) => "text",
            NodeKind::Image(_) => "image",
            NodeKind::Video(_) => "video",
            NodeKind::Audio(_) => "audio",
            NodeKind::Document(_) => "document",
            NodeKind::Condition(_) => "condition",
            NodeKind::Delay(_) => "delay",
            NodeKind::Stop(_) => "stop",
            NodeKind::Integration(IntegrationKind::CrmA, _) => "integration_crm_a",
            NodeKind::Integration(IntegrationKind::CrmB, _) => "integration_crm_b",
            NodeKind::Action(_) => "action",
        }
    }

    /// Nodes without user-facing content that a walk passes through without
    /// waiting for a reply.
    pub fn is_auto_advance(&self) -> bool {
        matches!(
            self,
            NodeKind::Delay(_) | NodeKind::Integration(..) | NodeKind::Action(_) | NodeKind::Stop(_)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    #[serde(default, alias = "sender_accounts", alias = "accounts")]
    pub sender_accounts: Vec<String>,
    #[serde(default, alias = "targetCategories", alias = "target_categories")]
    pub categories: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextConfig {
    #[serde(alias = "message")]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(alias = "mediaUrl")]
    pub url: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default, alias = "fileName")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionMode {
    #[default]
    #[serde(alias = "if", alias = "ifElse")]
    IfElse,
    Switch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    #[default]
    Equals,
    Contains,
    #[serde(alias = "starts_with")]
    StartsWith,
    #[serde(alias = "ends_with")]
    EndsWith,
    #[serde(alias = "not_equals")]
    NotEquals,
    Regex,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub mode: ConditionMode,
    /// `None` or `message` compares the inbound text; anything else names a session variable.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub cases: Vec<SwitchCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    #[serde(default)]
    pub operator: Operator,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default, alias = "delay", alias = "duration")]
    pub seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopConfig {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub integration: Option<IntegrationKind>,
    #[serde(default)]
    pub payload: Value,
}

/// Wire shape of a node as stored by the editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<Value>,
}

fn parse_config<T: serde::de::DeserializeOwned>(id: &str, kind: &str, data: Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|err| format!("node '{}' ({}): {}", id, kind, err))
}

impl TryFrom<RawNode> for FlowNode {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let data = if raw.data.is_null() {
            Value::Object(Default::default())
        } else {
            raw.data
        };
        let id = raw.id.as_str();
        let tag = raw.kind.as_str();
        let kind = match tag {
            "trigger" => NodeKind::Trigger(parse_config(id, tag, data)?),
            "text" => NodeKind::Text(parse_config(id, tag, data)?),
            "image" => NodeKind::Image(parse_config(id, tag, data)?),
            "video" => NodeKind::Video(parse_config(id, tag, data)?),
            "audio" => NodeKind::Audio(parse_config(id, tag, data)?),
            "document" => NodeKind::Document(parse_config(id, tag, data)?),
            "condition" => NodeKind::Condition(parse_config(id, tag, data)?),
            "delay" => NodeKind::Delay(parse_config(id, tag, data)?),
            "stop" => NodeKind::Stop(parse_config(id, tag, data)?),
            "integration_crm_a" => {
                NodeKind::Integration(IntegrationKind::CrmA, parse_config(id, tag, data)?)
            }
            "integration_crm_b" => {
                NodeKind::Integration(IntegrationKind::CrmB, parse_config(id, tag, data)?)
            }
            "action" => NodeKind::Action(parse_config(id, tag, data)?),
            other => return Err(format!("node '{}' has unknown type '{}'", id, other)),
        };
        Ok(FlowNode {
            id: raw.id,
            kind,
            position: raw.position,
        })
    }
}

impl From<FlowNode> for RawNode {
    fn from(node: FlowNode) -> Self {
        let kind = node.kind.tag().to_string();
        let data = match &node.kind {
            NodeKind::Trigger(cfg) => serde_json::to_value(cfg),
            NodeKind::Text(cfg) => serde_json::to_value(cfg),
            NodeKind::Image(cfg)
            | NodeKind::Video(cfg)
            | NodeKind::Audio(cfg)
            | NodeKind::Document(cfg) => serde_json::to_value(cfg),
            NodeKind::Condition(cfg) => serde_json::to_value(cfg),
            NodeKind::Delay(cfg) => serde_json::to_value(cfg),
            NodeKind::Stop(cfg) => serde_json::to_value(cfg),
            NodeKind::Integration(_, cfg) => serde_json::to_value(cfg),
            NodeKind::Action(cfg) => serde_json::to_value(cfg),
        }
        .unwrap_or_default();
        RawNode {
            id: node.id,
            kind,
            data,
            position: node.position,
        }
    }
}
