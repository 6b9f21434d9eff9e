//! Typed view of one remote activity-log entry.
//!
//! Every struct keeps the keys it does not model in a flattened `extra` map,
//! so re-serializing a decoded body yields the same JSON object.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// One item of the remote log page: `{id, raw_body}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawLogEntry {
    #[serde(default, deserialize_with = "opt_i64_lenient")]
    pub id: Option<i64>,
    #[serde(default)]
    pub raw_body: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawLogEntry {
    /// Decode the embedded body. The remote sends it as a JSON string, but an
    /// already-decoded object is accepted too.
    pub fn body(&self) -> Result<LogEntryBody, serde_json::Error> {
        match &self.raw_body {
            Value::String(s) => serde_json::from_str(s),
            Value::Null => serde_json::from_str("{}"),
            other => serde_json::from_value(other.clone()),
        }
    }
}

/// The decoded `raw_body` of a log entry.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntryBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<Actor>,
    #[serde(
        default,
        deserialize_with = "opt_i64_lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub triggered_time_in_millis: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<TaskPayload>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(default, deserialize_with = "opt_string_lenient", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Scope {
    #[serde(default, deserialize_with = "opt_string_lenient", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The task object carried in `payload`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    #[serde(default, deserialize_with = "opt_string_lenient", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_lenient", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<BoardRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<SectionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<PriorityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignees: Vec<Assignee>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom_fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checklists: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskPayload {
    /// Value of the custom field whose `name` equals `field_name`.
    pub fn custom_field(&self, field_name: &str) -> Option<&Value> {
        self.custom_fields.values().find_map(|cf| {
            let name = cf.get("name").and_then(Value::as_str)?;
            if name == field_name {
                cf.get("value").filter(|v| !v.is_null())
            } else {
                None
            }
        })
    }

    /// The "Category" custom field: an option object's `name`, or the scalar.
    pub fn category(&self) -> String {
        match self.custom_field("Category") {
            Some(Value::Object(obj)) => obj
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// The free-text "User story" custom field.
    pub fn user_story(&self) -> String {
        match self.custom_field("User story") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BoardRef {
    #[serde(default, deserialize_with = "opt_string_lenient", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SectionRef {
    #[serde(default, deserialize_with = "opt_string_lenient", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRef {
    #[serde(default, deserialize_with = "opt_string_lenient", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PriorityRef {
    #[serde(default, deserialize_with = "opt_string_lenient", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignee {
    #[serde(default, deserialize_with = "opt_string_lenient", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Remote ids arrive as strings or numbers; both become strings. Empty
/// strings are treated as absent.
fn opt_string_lenient<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn opt_i64_lenient<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_body() -> Value {
        json!({
            "triggerType": "Task_Status_Changed",
            "triggeredBy": {"id": 6003, "name": "Ravi", "emailId": "ravi@example.com"},
            "triggeredTimeInMillis": "1718000000000",
            "scope": {"id": "9001", "name": "Acme"},
            "webhookVersion": 2,
            "payload": {
                "id": "124744000004280299",
                "taskId": "T-17",
                "title": "Fix login",
                "partition": {"id": "B1", "name": "Platform", "url": "https://b/1", "color": "red"},
                "status": {"id": "CFO_1", "name": "Done", "colorType": "green", "mappingType": "closed"},
                "assignees": [{"id": 60037264906_i64, "name": "Ana", "emailId": "ana@example.com"}],
                "customFields": {
                    "cf1": {"name": "Category", "value": {"id": "o1", "name": "Bug"}},
                    "cf2": {"name": "User story", "value": "As a user I can log in"}
                }
            }
        })
    }

    #[test]
    fn test_decodes_string_and_numeric_ids() {
        let body: LogEntryBody = serde_json::from_value(sample_body()).unwrap();
        assert_eq!(body.triggered_time_in_millis, Some(1_718_000_000_000));
        assert_eq!(body.triggered_by.unwrap().id.as_deref(), Some("6003"));
        let payload = body.payload.unwrap();
        assert_eq!(payload.assignees[0].id.as_deref(), Some("60037264906"));
        assert_eq!(payload.status.unwrap().mapping_type.as_deref(), Some("closed"));
    }

    #[test]
    fn test_custom_field_extraction() {
        let body: LogEntryBody = serde_json::from_value(sample_body()).unwrap();
        let payload = body.payload.unwrap();
        assert_eq!(payload.category(), "Bug");
        assert_eq!(payload.user_story(), "As a user I can log in");

        let empty = TaskPayload::default();
        assert_eq!(empty.category(), "");
        assert_eq!(empty.user_story(), "");
    }

    #[test]
    fn test_unknown_keys_survive_reserialization() {
        let body: LogEntryBody = serde_json::from_value(sample_body()).unwrap();
        let back = serde_json::to_value(&body).unwrap();
        assert_eq!(back["webhookVersion"], json!(2));
        assert_eq!(back["payload"]["partition"]["color"], json!("red"));
    }

    #[test]
    fn test_raw_entry_accepts_string_or_object_body() {
        let as_string = RawLogEntry {
            id: Some(1),
            raw_body: Value::String(sample_body().to_string()),
            extra: Map::new(),
        };
        let as_object = RawLogEntry {
            id: Some(2),
            raw_body: sample_body(),
            extra: Map::new(),
        };
        assert!(as_string.body().unwrap().payload.is_some());
        assert!(as_object.body().unwrap().payload.is_some());

        let broken = RawLogEntry {
            id: Some(3),
            raw_body: Value::String("{not json".into()),
            extra: Map::new(),
        };
        assert!(broken.body().is_err());
    }
}
