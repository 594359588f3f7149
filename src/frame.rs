//! Scripts, stack frames, and materialized values.

use std::sync::Arc;

use log::debug;
use serde_json as json;

/// An engine-known source unit.
///
/// Created on discovery and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Engine id, or `-1` for the sentinel.
    pub id: i64,
    /// File path or virtual name.
    pub name: String,
}

impl Script {
    /// The sentinel for frames whose script cannot be resolved.
    pub(crate) fn unknown() -> Arc<Script> {
        Arc::new(Script {
            id: -1,
            name: "<unknown>".to_string(),
        })
    }
}

/// The debuggee's sole thread. Owns the frame vector of the current stop.
#[derive(Debug)]
pub(crate) struct Thread {
    pub id: u32,
    pub frames: Vec<Arc<StackFrame>>,
}

impl Thread {
    pub fn new() -> Thread {
        Thread {
            id: 1,
            frames: Vec::new(),
        }
    }
}

/// A per-stop stack frame snapshot. Re-created on every backtrace; frames
/// from earlier stops are stale the moment a new one is installed.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub script: Arc<Script>,
    pub function_name: String,
    /// 1-based.
    pub line_no: u32,
    pub frame_index: u32,
    pub parameters: Vec<EvaluationResult>,
    pub locals: Vec<EvaluationResult>,
}

/// The type tag of a materialized value.
///
/// There is no `Undefined`: undefined values are dropped at materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Object,
    String,
    Number,
    Boolean,
    Null,
    Date,
    Function,
}

/// A materialized value: a frame variable, an evaluation outcome, or an
/// enumerated child.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    /// Engine handle, when the value is resolvable via `lookup`.
    pub handle: Option<i64>,
    pub display: String,
    /// `0x%08X` form, present when the display parses as a 32-bit integer.
    pub hex_display: Option<String>,
    pub kind: ValueKind,
    pub name: String,
    /// Expression trail used to re-evaluate this value or name its children.
    pub expression: String,
    pub expandable: bool,
    /// Set when this result carries an engine error message instead of a
    /// value.
    pub is_error: bool,
}

impl EvaluationResult {
    pub(crate) fn error(name: String, expression: String, message: String) -> EvaluationResult {
        EvaluationResult {
            handle: None,
            display: message,
            hex_display: None,
            kind: ValueKind::String,
            name,
            expression,
            expandable: false,
            is_error: true,
        }
    }
}

/// Hex form for values that fit a 32-bit integer, two's complement for
/// negatives.
pub(crate) fn hex_display(decimal: &str) -> Option<String> {
    let parsed: i32 = decimal.trim().parse().ok()?;
    Some(format!("0x{:08X}", parsed as u32))
}

fn record_handle(record: &json::Value) -> Option<i64> {
    record
        .get("handle")
        .and_then(json::Value::as_i64)
        .or_else(|| record.get("ref").and_then(json::Value::as_i64))
}

fn string_field<'v>(record: &'v json::Value, name: &str) -> Option<&'v str> {
    record.get(name).and_then(json::Value::as_str)
}

/// Display name for a function record: `name` if non-blank, else
/// `inferredName`.
fn function_name(record: &json::Value) -> Option<&str> {
    for field in ["name", "inferredName"] {
        if let Some(name) = string_field(record, field) {
            if !name.trim().is_empty() {
                return Some(name);
            }
        }
    }
    None
}

/// Materialize one value record into an `EvaluationResult`.
///
/// Returns `None` for undefined values (not represented) and for record
/// types this client does not know.
pub(crate) fn evaluation_result(
    name: &str,
    expression: String,
    record: &json::Value,
) -> Option<EvaluationResult> {
    let handle = record_handle(record);
    let kind = string_field(record, "type").unwrap_or("");

    let result = match kind {
        "object" => {
            let class_name = string_field(record, "className").unwrap_or("Object");
            if class_name == "Date" {
                // dates display their value string and are not expandable
                let display = string_field(record, "value")
                    .or_else(|| string_field(record, "text"))
                    .unwrap_or(class_name)
                    .to_string();
                EvaluationResult {
                    handle,
                    display,
                    hex_display: None,
                    kind: ValueKind::Date,
                    name: name.to_string(),
                    expression,
                    expandable: false,
                    is_error: false,
                }
            } else {
                EvaluationResult {
                    handle,
                    display: class_name.to_string(),
                    hex_display: None,
                    kind: ValueKind::Object,
                    name: name.to_string(),
                    expression,
                    expandable: true,
                    is_error: false,
                }
            }
        }
        "string" => EvaluationResult {
            handle,
            display: format!("\"{}\"", string_field(record, "value").unwrap_or("")),
            hex_display: None,
            kind: ValueKind::String,
            name: name.to_string(),
            expression,
            expandable: false,
            is_error: false,
        },
        "number" => {
            let value = record.get("value").filter(|value| !value.is_null());
            let display = match value {
                // the engine sometimes returns numbers by reference only;
                // the placeholder is overwritten by the backtrace fix-up
                None => "null".to_string(),
                Some(json::Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
            };
            let hex_display = hex_display(&display);
            EvaluationResult {
                handle,
                display,
                hex_display,
                kind: ValueKind::Number,
                name: name.to_string(),
                expression,
                expandable: false,
                is_error: false,
            }
        }
        "boolean" => EvaluationResult {
            handle,
            display: record
                .get("value")
                .and_then(json::Value::as_bool)
                .unwrap_or(false)
                .to_string(),
            hex_display: None,
            kind: ValueKind::Boolean,
            name: name.to_string(),
            expression,
            expandable: false,
            is_error: false,
        },
        "null" => EvaluationResult {
            handle,
            display: "null".to_string(),
            hex_display: None,
            kind: ValueKind::Null,
            name: name.to_string(),
            expression,
            expandable: false,
            is_error: false,
        },
        "undefined" => return None,
        "function" => {
            let display = match function_name(record) {
                Some(function) => format!("[Function: {}]", function),
                None => "[Function]".to_string(),
            };
            EvaluationResult {
                handle,
                display,
                hex_display: None,
                kind: ValueKind::Function,
                name: name.to_string(),
                expression,
                expandable: true,
                is_error: false,
            }
        }
        other => {
            debug!("dropping value {:?} of unknown type {:?}", name, other);
            return None;
        }
    };

    Some(result)
}

/// Build a frame from one `backtrace` response entry.
pub(crate) fn stack_frame(
    frame: &json::Value,
    script: Arc<Script>,
) -> StackFrame {
    let func = frame.get("func").cloned().unwrap_or(json::Value::Null);
    let function_name = function_name(&func).unwrap_or("<anonymous>").to_string();

    StackFrame {
        script,
        function_name,
        // the wire is zero-based
        line_no: frame.get("line").and_then(json::Value::as_u64).unwrap_or(0) as u32 + 1,
        frame_index: frame.get("index").and_then(json::Value::as_u64).unwrap_or(0) as u32,
        parameters: frame_variables(frame.get("arguments")),
        locals: frame_variables(frame.get("locals")),
    }
}

fn frame_variables(list: Option<&json::Value>) -> Vec<EvaluationResult> {
    let Some(entries) = list.and_then(json::Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            // arguments may be unnamed
            let name = string_field(entry, "name")?;
            if name.is_empty() {
                return None;
            }
            let value = entry.get("value")?;
            evaluation_result(name, name.to_string(), value)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn number_with_value_gets_hex() {
        let result =
            evaluation_result("n", "n".to_string(), &json!({"type": "number", "value": 255}))
                .unwrap();
        assert_eq!(result.kind, ValueKind::Number);
        assert_eq!(result.display, "255");
        assert_eq!(result.hex_display.as_deref(), Some("0x000000FF"));
        assert!(!result.expandable);
    }

    #[test]
    fn negative_number_hex_is_twos_complement() {
        assert_eq!(hex_display("-1").as_deref(), Some("0xFFFFFFFF"));
    }

    #[test]
    fn non_integer_number_has_no_hex() {
        let result =
            evaluation_result("n", "n".to_string(), &json!({"type": "number", "value": 1.5}))
                .unwrap();
        assert_eq!(result.display, "1.5");
        assert_eq!(result.hex_display, None);
    }

    #[test]
    fn number_by_reference_keeps_placeholder_and_handle() {
        let result =
            evaluation_result("n", "n".to_string(), &json!({"type": "number", "ref": 12}))
                .unwrap();
        assert_eq!(result.display, "null");
        assert_eq!(result.handle, Some(12));
        assert_eq!(result.hex_display, None);
    }

    #[test]
    fn string_is_quoted() {
        let result = evaluation_result(
            "s",
            "s".to_string(),
            &json!({"type": "string", "value": "hi"}),
        )
        .unwrap();
        assert_eq!(result.display, "\"hi\"");
        assert_eq!(result.kind, ValueKind::String);
    }

    #[test]
    fn object_displays_class_and_expands() {
        let result = evaluation_result(
            "o",
            "o".to_string(),
            &json!({"type": "object", "className": "Array", "ref": 3}),
        )
        .unwrap();
        assert_eq!(result.display, "Array");
        assert!(result.expandable);
        assert_eq!(result.handle, Some(3));
    }

    #[test]
    fn date_is_reclassified_and_not_expandable() {
        let result = evaluation_result(
            "d",
            "d".to_string(),
            &json!({"type": "object", "className": "Date", "value": "Mon Apr 01 2013", "ref": 9}),
        )
        .unwrap();
        assert_eq!(result.kind, ValueKind::Date);
        assert_eq!(result.display, "Mon Apr 01 2013");
        assert!(!result.expandable);
    }

    #[test]
    fn function_display_prefers_name_then_inferred() {
        let named = evaluation_result(
            "f",
            "f".to_string(),
            &json!({"type": "function", "name": "go", "handle": 1}),
        )
        .unwrap();
        assert_eq!(named.display, "[Function: go]");
        assert!(named.expandable);

        let inferred = evaluation_result(
            "f",
            "f".to_string(),
            &json!({"type": "function", "name": " ", "inferredName": "cb", "handle": 1}),
        )
        .unwrap();
        assert_eq!(inferred.display, "[Function: cb]");

        let anonymous = evaluation_result(
            "f",
            "f".to_string(),
            &json!({"type": "function", "handle": 1}),
        )
        .unwrap();
        assert_eq!(anonymous.display, "[Function]");
    }

    #[test]
    fn undefined_is_dropped() {
        assert!(evaluation_result("u", "u".to_string(), &json!({"type": "undefined"})).is_none());
    }

    #[test]
    fn unknown_type_is_dropped() {
        assert!(evaluation_result("x", "x".to_string(), &json!({"type": "frame"})).is_none());
    }

    #[test]
    fn stack_frame_from_wire() {
        let frame = stack_frame(
            &json!({
                "index": 2,
                "line": 9,
                "func": {"name": "handler", "scriptId": 42},
                "arguments": [
                    {"name": "req", "value": {"type": "object", "className": "Object", "ref": 5}},
                    {"value": {"type": "number", "value": 1}}
                ],
                "locals": [
                    {"name": "gone", "value": {"type": "undefined"}},
                    {"name": "n", "value": {"type": "number", "value": 3}}
                ]
            }),
            Script::unknown(),
        );

        assert_eq!(frame.function_name, "handler");
        assert_eq!(frame.line_no, 10);
        assert_eq!(frame.frame_index, 2);
        // unnamed arguments and undefined locals are dropped
        assert_eq!(frame.parameters.len(), 1);
        assert_eq!(frame.parameters[0].name, "req");
        assert_eq!(frame.locals.len(), 1);
        assert_eq!(frame.locals[0].display, "3");
    }
}
