use serde_json::{Map, Value};
use tracing::warn;

use crate::ledger::LedgerChange;
use crate::models::TargetUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Document,
    Assessment,
    TargetJob,
}

/// Typed trigger decoded from a ledger change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Document {
        business_id: String,
        document_id: String,
    },
    Assessment {
        business_id: String,
        assessment_id: String,
    },
    TargetJob {
        target_id: String,
        input: Option<String>,
        updates: Vec<(String, TargetUpdate)>,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChangeEvent::Document { .. } => EventKind::Document,
            ChangeEvent::Assessment { .. } => EventKind::Assessment,
            ChangeEvent::TargetJob { .. } => EventKind::TargetJob,
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            ChangeEvent::Document { document_id, .. } => document_id,
            ChangeEvent::Assessment { assessment_id, .. } => assessment_id,
            ChangeEvent::TargetJob { target_id, .. } => target_id,
        }
    }
}

/// Maps a raw change to an event. Writes the orchestrator makes itself
/// (metadata, links) decode to `None`.
pub fn decode(change: &LedgerChange) -> Option<ChangeEvent> {
    let segments: Vec<&str> = change
        .path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    match segments.as_slice() {
        ["businesses", business_id, "documents", document_id, "mirror", ..] => {
            Some(ChangeEvent::Document {
                business_id: business_id.to_string(),
                document_id: document_id.to_string(),
            })
        }
        ["businesses", business_id, "assessments", assessment_id, "mirror", ..] => {
            Some(ChangeEvent::Assessment {
                business_id: business_id.to_string(),
                assessment_id: assessment_id.to_string(),
            })
        }
        ["target", "jobs", target_id, rest @ ..] => {
            let body = rooted_target_body(rest, &change.body)?;
            Some(ChangeEvent::TargetJob {
                target_id: target_id.to_string(),
                input: body
                    .get("input")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                updates: decode_updates(target_id, body.get("updates")),
            })
        }
        _ => None,
    }
}

fn rooted_target_body(rest: &[&str], body: &Value) -> Option<Map<String, Value>> {
    match rest {
        [] => body.as_object().cloned(),
        ["updates"] => {
            let mut root = Map::new();
            root.insert("updates".to_string(), body.clone());
            Some(root)
        }
        ["updates", update_id] => {
            let mut updates = Map::new();
            updates.insert(update_id.to_string(), body.clone());
            let mut root = Map::new();
            root.insert("updates".to_string(), Value::Object(updates));
            Some(root)
        }
        _ => None,
    }
}

fn decode_updates(target_id: &str, updates: Option<&Value>) -> Vec<(String, TargetUpdate)> {
    let Some(Value::Object(updates)) = updates else {
        return Vec::new();
    };

    let mut decoded: Vec<(String, TargetUpdate)> = updates
        .iter()
        .filter_map(|(key, value)| {
            match serde_json::from_value::<TargetUpdate>(value.clone()) {
                Ok(update) => Some((key.clone(), update)),
                Err(err) => {
                    warn!(target_id, update = %key, error = %err, "ignoring malformed target update");
                    None
                }
            }
        })
        .collect();
    decoded.sort_by(|(left_key, left), (right_key, right)| {
        left.time.cmp(&right.time).then_with(|| left_key.cmp(right_key))
    });
    decoded
}
