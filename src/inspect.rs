//! Backtrace materialization, value fix-up, child enumeration, and
//! expression evaluation.

use std::sync::{Arc, Mutex};

use serde_json as json;

use crate::frame::{self, EvaluationResult, Script, StackFrame, ValueKind};
use crate::router::{Continuation, ResponseHandler, Wait};
use crate::session::{ChildrenCallback, EvaluateCallback, SessionCore};
use crate::wire;

impl SessionCore {
    /// Refresh the thread's frame vector.
    ///
    /// The continuation's flag is the engine's `running` state: when true
    /// the engine resumed under our feet and no frames were touched. The
    /// new vector is installed in one go; older frames are stale from that
    /// moment.
    pub(crate) fn perform_backtrace(self: &Arc<Self>, done: Continuation) {
        self.send(
            "backtrace",
            Some(json::json!({ "inlineRefs": true })),
            ResponseHandler::on_result(move |core, result| {
                let Ok(response) = result else {
                    done(core, true);
                    return;
                };
                if response.running == Some(true) {
                    done(core, true);
                    return;
                }

                let mut frames = core.build_frames(response.body.as_ref());

                // numbers the engine returned by reference only get one
                // collective lookup before the frames go live
                let handles = fixup_handles(&frames);
                if handles.is_empty() {
                    core.install_frames(frames);
                    done(core, false);
                    return;
                }
                core.lookup(
                    handles,
                    Box::new(move |core, body| {
                        if let Some(body) = body {
                            apply_fixups(&mut frames, &body);
                        }
                        core.install_frames(frames);
                        done(core, false);
                    }),
                );
            }),
            None,
        );
    }

    fn build_frames(&self, body: Option<&json::Value>) -> Vec<StackFrame> {
        let Some(entries) = body
            .and_then(|body| body.get("frames"))
            .and_then(json::Value::as_array)
        else {
            return Vec::new();
        };

        let state = self.state();
        entries
            .iter()
            .map(|entry| {
                let script = entry
                    .get("func")
                    .and_then(|func| func.get("scriptId"))
                    .and_then(json::Value::as_i64)
                    .and_then(|id| state.scripts_by_id.get(&id).cloned())
                    .unwrap_or_else(Script::unknown);
                frame::stack_frame(entry, script)
            })
            .collect()
    }

    pub(crate) fn install_frames(&self, frames: Vec<StackFrame>) {
        self.state().thread.frames = frames.into_iter().map(Arc::new).collect();
    }

    /// `lookup` a set of handles. The continuation gets the response body,
    /// a map keyed by handle.
    pub(crate) fn lookup(
        self: &Arc<Self>,
        handles: Vec<i64>,
        done: Box<dyn FnOnce(&Arc<SessionCore>, Option<json::Value>) + Send>,
    ) {
        self.send(
            "lookup",
            Some(json::json!({ "handles": handles, "includeSource": false })),
            ResponseHandler::on_result(move |core, result| match result {
                Ok(response) => done(core, response.body.clone()),
                Err(_) => done(core, None),
            }),
            None,
        );
    }

    /// Enumerate an expandable value's children.
    pub(crate) fn enum_children(self: &Arc<Self>, parent: &EvaluationResult, callback: ChildrenCallback) {
        let Some(handle) = parent.handle else {
            callback(Vec::new());
            return;
        };
        let expression = parent.expression.clone();
        // objects carry their class name as display
        let array_like = parent.kind == ValueKind::Object && parent.display == "Array";

        self.send(
            "lookup",
            Some(json::json!({ "handles": [handle], "includeSource": false })),
            ResponseHandler::on_result(move |_core, result| {
                let Ok(response) = result else {
                    callback(Vec::new());
                    return;
                };
                let refs = wire::index_refs(&response.refs);
                let record = response
                    .body
                    .as_ref()
                    .and_then(|body| body.get(handle.to_string()));
                let properties = record
                    .and_then(|record| record.get("properties"))
                    .and_then(json::Value::as_array);

                let mut children = Vec::new();
                if let Some(properties) = properties {
                    if array_like {
                        // the first property is the backing length; the
                        // next `length` are the elements
                        let length = properties
                            .first()
                            .and_then(|property| property.get("ref"))
                            .and_then(json::Value::as_i64)
                            .and_then(|handle| refs.get(&handle))
                            .and_then(|record| record.get("value"))
                            .and_then(json::Value::as_u64)
                            .unwrap_or(0) as usize;
                        for (index, property) in properties.iter().skip(1).take(length).enumerate()
                        {
                            let name = format!("[{}]", index);
                            let child_expression = format!("{}{}", expression, name);
                            if let Some(child) = child_result(&name, child_expression, property, &refs)
                            {
                                children.push(child);
                            }
                        }
                    } else {
                        for property in properties {
                            let Some(name) = property.get("name").and_then(json::Value::as_str)
                            else {
                                continue;
                            };
                            let child_expression = format!("{}.{}", expression, name);
                            if let Some(child) = child_result(name, child_expression, property, &refs)
                            {
                                children.push(child);
                            }
                        }
                    }
                }
                callback(children);
            }),
            None,
        );
    }

    /// Evaluate an expression in a stopped frame, without letting the
    /// evaluation trip breakpoints.
    pub(crate) fn execute_text(self: &Arc<Self>, expression: &str, frame_index: u32, callback: EvaluateCallback) {
        let arguments = json::json!({
            "expression": expression,
            "frame": frame_index,
            "global": false,
            "disable_break": true,
        });
        let name = expression.to_string();

        self.send(
            "evaluate",
            Some(arguments),
            ResponseHandler::on_result(move |_core, result| match result {
                Ok(response) => {
                    let result = response
                        .body
                        .as_ref()
                        .and_then(|body| frame::evaluation_result(&name, name.clone(), body));
                    callback(result);
                }
                Err(response) => {
                    let message = response
                        .and_then(|response| response.message.clone())
                        .unwrap_or_else(|| "evaluation failed".to_string());
                    callback(Some(EvaluationResult::error(name.clone(), name, message)));
                }
            }),
            None,
        );
    }

    /// Evaluate `Boolean(<expression>)` on the top frame and report the
    /// verdict. Anything that is not a true boolean — including an
    /// evaluation failure — is false.
    pub(crate) fn test_predicate(self: &Arc<Self>, expression: &str, done: Continuation) {
        let arguments = json::json!({
            "expression": format!("Boolean({})", expression),
            "frame": 0,
            "global": false,
            "disable_break": true,
        });
        self.send(
            "evaluate",
            Some(arguments),
            ResponseHandler::on_result(move |core, result| {
                let verdict = result
                    .ok()
                    .and_then(|response| response.body.as_ref())
                    .map(|body| {
                        body.get("type").and_then(json::Value::as_str) == Some("boolean")
                            && body.get("value").and_then(json::Value::as_bool) == Some(true)
                    })
                    .unwrap_or(false);
                done(core, verdict);
            }),
            None,
        );
    }

    /// Fetch one script's source, synchronously.
    pub(crate) fn script_text(self: &Arc<Self>, script_id: i64) -> Option<String> {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let ok = self.send(
            "scripts",
            Some(json::json!({ "ids": [script_id], "includeSource": true })),
            ResponseHandler::on_success(move |_core, response| {
                let source = response
                    .body
                    .as_ref()
                    .and_then(json::Value::as_array)
                    .and_then(|scripts| scripts.first())
                    .and_then(|script| script.get("source"))
                    .and_then(json::Value::as_str)
                    .map(str::to_string);
                *out.lock().unwrap() = source;
            }),
            Some(Wait::exit_guard(self)),
        );
        if !ok {
            return None;
        }
        let source = slot.lock().unwrap().take();
        source
    }
}

/// Which results need their display fixed from a `lookup`: numbers the
/// engine left as a bare reference.
fn needs_fixup(result: &EvaluationResult) -> bool {
    result.kind == ValueKind::Number
        && result.display == "null"
        && result.handle.map(|handle| handle > 0).unwrap_or(false)
}

fn fixup_handles(frames: &[StackFrame]) -> Vec<i64> {
    let mut handles = Vec::new();
    for frame in frames {
        for result in frame.parameters.iter().chain(frame.locals.iter()) {
            if needs_fixup(result) {
                handles.extend(result.handle);
            }
        }
    }
    handles.sort_unstable();
    handles.dedup();
    handles
}

fn apply_fixups(frames: &mut [StackFrame], body: &json::Value) {
    for frame in frames {
        for result in frame.parameters.iter_mut().chain(frame.locals.iter_mut()) {
            if !needs_fixup(result) {
                continue;
            }
            let text = result
                .handle
                .and_then(|handle| body.get(handle.to_string()))
                .and_then(|record| record.get("text"))
                .and_then(json::Value::as_str);
            if let Some(text) = text {
                result.display = text.to_string();
                result.hex_display = frame::hex_display(text);
            }
        }
    }
}

/// Materialize a property child through the response's ref records.
fn child_result(
    name: &str,
    expression: String,
    property: &json::Value,
    refs: &std::collections::HashMap<i64, &json::Value>,
) -> Option<EvaluationResult> {
    let handle = property.get("ref").and_then(json::Value::as_i64)?;
    let record = refs.get(&handle)?;
    frame::evaluation_result(name, expression, record)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::evaluation_result;
    use serde_json::json;

    fn frame_with(locals: Vec<EvaluationResult>) -> StackFrame {
        StackFrame {
            script: Script::unknown(),
            function_name: "f".to_string(),
            line_no: 1,
            frame_index: 0,
            parameters: Vec::new(),
            locals,
        }
    }

    #[test]
    fn fixup_selects_referenced_numbers_only() {
        let by_ref =
            evaluation_result("a", "a".to_string(), &json!({"type": "number", "ref": 11})).unwrap();
        let inline =
            evaluation_result("b", "b".to_string(), &json!({"type": "number", "value": 2}))
                .unwrap();
        let object = evaluation_result(
            "c",
            "c".to_string(),
            &json!({"type": "object", "className": "Object", "ref": 12}),
        )
        .unwrap();

        let frames = vec![frame_with(vec![by_ref, inline, object])];
        assert_eq!(fixup_handles(&frames), vec![11]);
    }

    #[test]
    fn fixup_overwrites_display_and_hex() {
        let by_ref =
            evaluation_result("a", "a".to_string(), &json!({"type": "number", "ref": 11})).unwrap();
        let mut frames = vec![frame_with(vec![by_ref])];

        apply_fixups(&mut frames, &json!({"11": {"text": "64"}}));

        let fixed = &frames[0].locals[0];
        assert_eq!(fixed.display, "64");
        assert_eq!(fixed.hex_display.as_deref(), Some("0x00000040"));
    }

    #[test]
    fn fixup_leaves_unresolved_handles_alone() {
        let by_ref =
            evaluation_result("a", "a".to_string(), &json!({"type": "number", "ref": 11})).unwrap();
        let mut frames = vec![frame_with(vec![by_ref])];

        apply_fixups(&mut frames, &json!({"99": {"text": "64"}}));
        assert_eq!(frames[0].locals[0].display, "null");
    }
}
