use crate::campaigns::MAX_SEND_DELAY_SECONDS;
use crate::types::{value_to_text, Contact, MessageType, SendPayload};
use anyhow::{anyhow, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use std::time::Duration;

const USE_VARIATIONS: &str = "useVariations";
const VARIATIONS: &str = "variations";
const USE_MEDIA_VARIATIONS: &str = "useMediaVariations";
const MEDIA_VARIATIONS: &str = "mediaVariations";

/// Picks one variation per object that asks for it, at every nesting level.
pub fn resolve_variations(content: &Value) -> Value {
    resolve_variations_with(content, &mut rand::thread_rng())
}

pub fn resolve_variations_with<R: Rng + ?Sized>(content: &Value, rng: &mut R) -> Value {
    match content {
        Value::Object(map) => Value::Object(resolve_object(map, rng)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_variations_with(item, rng))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_object<R: Rng + ?Sized>(map: &Map<String, Value>, rng: &mut R) -> Map<String, Value> {
    let mut out = map.clone();

    if take_flag(&mut out, USE_VARIATIONS) {
        if let Some(choice) = take_choice(&mut out, VARIATIONS, rng) {
            match choice {
                Value::Object(fields) => merge_into(&mut out, fields),
                other => {
                    out.insert("text".to_string(), Value::String(value_to_text(&other)));
                }
            }
        }
    }

    if take_flag(&mut out, USE_MEDIA_VARIATIONS) {
        if let Some(choice) = take_choice(&mut out, MEDIA_VARIATIONS, rng) {
            match choice {
                Value::Object(fields) => merge_into(&mut out, fields),
                other => {
                    out.insert("url".to_string(), Value::String(value_to_text(&other)));
                }
            }
        }
    }

    for value in out.values_mut() {
        if value.is_object() || value.is_array() {
            *value = resolve_variations_with(value, rng);
        }
    }
    out
}

fn take_flag(map: &mut Map<String, Value>, key: &str) -> bool {
    let enabled = matches!(map.get(key), Some(Value::Bool(true)));
    if enabled {
        map.remove(key);
    }
    enabled
}

/// Removes the candidate list and returns one entry, or restores nothing when empty.
fn take_choice<R: Rng + ?Sized>(map: &mut Map<String, Value>, key: &str, rng: &mut R) -> Option<Value> {
    match map.remove(key) {
        Some(Value::Array(candidates)) => candidates.choose(rng).cloned(),
        _ => None,
    }
}

fn merge_into(target: &mut Map<String, Value>, fields: Map<String, Value>) {
    for (key, value) in fields {
        target.insert(key, value);
    }
}

fn placeholder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_.]*)\s*\}\}").ok())
        .as_ref()
}

/// Replaces `{{field}}` with contact values; unknown fields become empty.
pub fn render_text(text: &str, contact: &Contact) -> String {
    let Some(re) = placeholder_pattern() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &regex::Captures| {
        contact.field(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

pub fn substitute_placeholders(content: &Value, contact: &Contact) -> Value {
    match content {
        Value::String(text) => Value::String(render_text(text, contact)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_placeholders(item, contact))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), substitute_placeholders(value, contact)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Variation draw followed by placeholder substitution.
pub fn resolve_content(content: &Value, contact: &Contact) -> Value {
    substitute_placeholders(&resolve_variations(content), contact)
}

fn str_field<'a>(content: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| content.get(*key).and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn opt_string(content: &Value, keys: &[&str]) -> Option<String> {
    str_field(content, keys).map(str::to_string)
}

/// Turns resolved content for a single-send type into a provider payload.
pub fn build_payload(message_type: MessageType, content: &Value) -> Result<SendPayload> {
    let url = || {
        opt_string(content, &["url", "mediaUrl", "media_url"])
            .ok_or_else(|| anyhow!("{} message has no media url", message_type.as_str()))
    };
    match message_type {
        MessageType::Text | MessageType::Generated => {
            let text = opt_string(content, &["text", "message"])
                .ok_or_else(|| anyhow!("text message is empty"))?;
            Ok(SendPayload::Text { text })
        }
        MessageType::Image => Ok(SendPayload::Image {
            url: url()?,
            caption: opt_string(content, &["caption", "text"]),
        }),
        MessageType::Video => Ok(SendPayload::Video {
            url: url()?,
            caption: opt_string(content, &["caption", "text"]),
        }),
        MessageType::Audio => Ok(SendPayload::Audio { url: url()? }),
        MessageType::Document => Ok(SendPayload::Document {
            url: url()?,
            filename: opt_string(content, &["filename", "fileName"]),
            caption: opt_string(content, &["caption", "text"]),
        }),
        MessageType::Sequence | MessageType::Wait => Err(anyhow!(
            "{} content cannot be sent as a single payload",
            message_type.as_str()
        )),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SequenceItem {
    Send(SendPayload),
    Wait(Duration),
}

/// Reads the wait length from `{"seconds": n}` (or `delay`).
pub fn wait_duration(content: &Value) -> Duration {
    let secs = ["seconds", "delay", "duration"]
        .iter()
        .find_map(|key| content.get(*key).and_then(|v| v.as_f64()))
        .unwrap_or(0.0)
        .clamp(0.0, MAX_SEND_DELAY_SECONDS as f64);
    Duration::from_millis((secs * 1000.0) as u64)
}

/// Expands a resolved `sequence` body into ordered steps.
pub fn sequence_items(content: &Value) -> Result<Vec<SequenceItem>> {
    let items = content
        .get("sequence")
        .or_else(|| content.get("items"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("sequence message has no items"))?;

    let mut steps = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let kind = item
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("sequence item {} has no type", index))?;
        let kind: MessageType = kind.parse()?;
        let body = item.get("content").filter(|v| v.is_object()).unwrap_or(item);
        match kind {
            MessageType::Wait => steps.push(SequenceItem::Wait(wait_duration(body))),
            MessageType::Sequence | MessageType::Generated => {
                return Err(anyhow!(
                    "sequence item {} cannot be of type {}",
                    index,
                    kind.as_str()
                ))
            }
            other => steps.push(SequenceItem::Send(build_payload(other, body)?)),
        }
    }
    Ok(steps)
}
