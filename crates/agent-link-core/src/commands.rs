//! Command discovery.
//!
//! The agent answers a `GetCommands` request with a plain text result whose
//! body is itself JSON. Agents disagree on the exact shape, so parsing here
//! never fails: anything unrecognised becomes an empty catalogue, and a
//! malformed entry only drops itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Schema of one command parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// One command advertised by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Command catalogue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandList {
    #[serde(default)]
    pub commands: Vec<CommandDefinition>,
    /// Agent-side timestamp in milliseconds, when supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl CommandList {
    /// Look a command up by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&CommandDefinition> {
        self.commands.iter().find(|cmd| cmd.name == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Parse the text body of a command-list answer.
///
/// Accepts `{"commands": [...]}` or a bare `[...]`; everything else,
/// including empty text and error messages, yields an empty list. Entries
/// that do not describe a command are skipped.
#[must_use]
pub fn parse_command_list(text: &str) -> CommandList {
    let text = text.trim();
    if text.is_empty() {
        return CommandList::default();
    }

    let (entries, timestamp) = match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(entries)) => (entries, None),
        Ok(Value::Object(mut body)) => match body.remove("commands") {
            Some(Value::Array(entries)) => (entries, body.get("timestamp").and_then(Value::as_i64)),
            _ => {
                tracing::warn!("Command list without a commands array, treating as empty");
                return CommandList::default();
            }
        },
        Ok(_) => {
            tracing::warn!("Command list is neither an object nor an array, treating as empty");
            return CommandList::default();
        }
        Err(e) => {
            tracing::warn!("Unrecognised command list, treating as empty: {e}");
            return CommandList::default();
        }
    };

    let commands = entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<CommandDefinition>(entry) {
            Ok(command) => Some(command),
            Err(e) => {
                tracing::warn!("Skipping malformed command entry: {e}");
                None
            }
        })
        .collect();
    CommandList {
        commands,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_object() {
        let list = parse_command_list(r#"{"commands":[{"name":"echo"}]}"#);
        assert_eq!(list.len(), 1);
        assert_eq!(list.commands[0].name, "echo");
        assert!(list.commands[0].parameters.is_empty());
    }

    #[test]
    fn test_bare_array_with_schema() {
        let list = parse_command_list(
            r#"[{"name":"test_stream","description":"stream test","parameters":{
                "message":{"type":"string","description":"text","required":true},
                "delay":{"type":"number","required":false,"default":100}
            }}]"#,
        );
        let cmd = list.find("test_stream").unwrap();
        assert!(cmd.parameters["message"].required);
        assert_eq!(cmd.parameters["delay"].kind, "number");
        assert_eq!(cmd.parameters["delay"].default, Some(Value::from(100)));
    }

    #[test]
    fn test_empty_text() {
        assert!(parse_command_list("").is_empty());
    }

    #[test]
    fn test_error_text() {
        assert!(parse_command_list("error: unsupported").is_empty());
    }

    #[test]
    fn test_unrelated_json() {
        assert!(parse_command_list(r#"{"status":"ok"}"#).is_empty());
        assert!(parse_command_list("42").is_empty());
    }

    #[test]
    fn test_timestamp_is_kept() {
        let list = parse_command_list(r#"{"commands":[],"timestamp":1700000000000}"#);
        assert_eq!(list.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let list = parse_command_list(
            r#"{"commands":[
                {"name":"echo","description":null},
                {"name":"search","parameters":{"query":"string"}},
                {"description":"no name"},
                "status",
                {"name":"clear","parameters":{"all":{"type":"boolean","description":null}}}
            ],"timestamp":"yesterday"}"#,
        );
        let names: Vec<&str> = list.commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["echo", "clear"]);
        assert_eq!(list.commands[0].description, "");
        assert_eq!(list.commands[1].parameters["all"].kind, "boolean");
        assert_eq!(list.timestamp, None);
    }
}
