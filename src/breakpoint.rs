//! Breakpoints and their engine-side bindings.

use std::fmt;
use std::sync::Arc;

use serde_json as json;

use crate::event::DebugEvent;
use crate::router::{Continuation, ResponseHandler, Wait};
use crate::session::SessionCore;
use crate::wire::Response;
use crate::Error;

/// Identifies a user breakpoint within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub(crate) u32);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakOnKind {
    Always,
    Equal,
    GreaterThanOrEqual,
    Mod,
}

/// When a breakpoint hit counts as a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakOn {
    kind: BreakOnKind,
    count: u32,
}

impl BreakOn {
    pub fn always() -> BreakOn {
        BreakOn {
            kind: BreakOnKind::Always,
            count: 0,
        }
    }

    /// Any kind but `Always` needs a count of at least 1.
    pub fn new(kind: BreakOnKind, count: u32) -> Result<BreakOn, Error> {
        if kind != BreakOnKind::Always && count < 1 {
            return Err(Error::InvalidBreakOn);
        }
        Ok(BreakOn { kind, count })
    }

    pub fn kind(&self) -> BreakOnKind {
        self.kind
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Does a hit with this engine-side count stop the debuggee?
    pub(crate) fn should_break(&self, hit_count: u32) -> bool {
        match self.kind {
            BreakOnKind::Always => true,
            BreakOnKind::Equal => hit_count == self.count,
            BreakOnKind::GreaterThanOrEqual => hit_count >= self.count,
            BreakOnKind::Mod => self.count != 0 && hit_count % self.count == 0,
        }
    }

    /// Whether the engine-side breakpoint should be enabled at all, given
    /// the user flag and the hits so far. An `Equal` policy that has fired
    /// is done for good.
    pub(crate) fn engine_enabled(&self, enabled: bool, hit_count: u32) -> bool {
        if enabled && self.kind == BreakOnKind::Equal && hit_count >= self.count {
            return false;
        }
        enabled
    }

    /// The `ignoreCount` projection of this policy: how many upcoming hits
    /// the engine may swallow without telling us.
    pub(crate) fn engine_ignore_count(&self, hit_count: u32) -> u32 {
        match self.kind {
            BreakOnKind::Always | BreakOnKind::Mod => 0,
            BreakOnKind::Equal | BreakOnKind::GreaterThanOrEqual => {
                (self.count.max(1) - 1).saturating_sub(hit_count)
            }
        }
    }
}

impl Default for BreakOn {
    fn default() -> BreakOn {
        BreakOn::always()
    }
}

/// A user breakpoint request.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub file_name: String,
    /// 1-based.
    pub line_no: u32,
    pub enabled: bool,
    pub break_on: BreakOn,
    pub condition: Option<String>,
}

impl Breakpoint {
    pub fn new(file_name: &str, line_no: u32) -> Breakpoint {
        Breakpoint {
            file_name: file_name.to_string(),
            line_no,
            enabled: true,
            break_on: BreakOn::always(),
            condition: None,
        }
    }
}

/// Session-side record of a breakpoint: the request plus back-references to
/// its engine bindings. The bindings themselves live in the session's
/// binding map.
pub(crate) struct BreakpointRecord {
    pub spec: Breakpoint,
    pub bindings: Vec<i64>,
}

/// One engine-side realization of a breakpoint.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub engine_id: i64,
    pub script_id: Option<i64>,
    /// The line the engine actually placed the breakpoint on, 1-based. May
    /// differ from the requested line.
    pub line_no: u32,
    /// Decided once, at bind time. A successful re-bind produces a new
    /// binding instead of flipping this.
    pub fully_bound: bool,
    pub unbound: bool,
    pub breakpoint: BreakpointId,
    /// Engine-side hit count as of the last time we asked.
    pub hit_count: u32,
    /// Engine state we last pushed, to detect drift after a hit.
    pub engine_enabled: bool,
    pub engine_ignore_count: u32,
}

/// The outcome of a `setbreakpoint` request: engine id, engine script id if
/// the location resolved, and the actual 1-based line.
pub(crate) type SetBreakpointOutcome = Option<(i64, Option<i64>, u32)>;

/// Build the engine-dialect source regex matching a path case-insensitively.
/// The dialect has no case-insensitive flag, so every cased character
/// becomes a two-character class. Leaf-only matching anchors on a path
/// separator instead of the start, for attaching to an engine whose script
/// paths we did not produce.
pub(crate) fn case_insensitive_regex(file_path: &str, leaf_name_only: bool) -> String {
    let mut name = file_path;
    let mut trailing = false;
    if leaf_name_only {
        if let Some(index) = file_path.rfind(|ch| ch == '\\' || ch == '/') {
            name = &file_path[index + 1..];
            trailing = true;
        }
    }

    let mut out = String::with_capacity(name.len() * 2 + 8);
    if trailing {
        out.push_str("[\\\\/]");
    } else {
        out.push('^');
    }
    for ch in name.chars() {
        if ch.is_alphabetic() {
            out.push('[');
            out.extend(ch.to_uppercase());
            out.extend(ch.to_lowercase());
            out.push(']');
        } else if "\\^$.|?*+()[]{}".contains(ch) {
            out.push('\\');
            out.push(ch);
        } else {
            out.push(ch);
        }
    }
    out.push('$');
    out
}

impl SessionCore {
    /// Register a breakpoint and start binding it.
    pub(crate) fn add_breakpoint(self: &Arc<Self>, breakpoint: Breakpoint) -> BreakpointId {
        let id = {
            let mut state = self.state();
            state.next_breakpoint += 1;
            let id = BreakpointId(state.next_breakpoint);
            state.breakpoints.insert(
                id,
                BreakpointRecord {
                    spec: breakpoint,
                    bindings: Vec::new(),
                },
            );
            id
        };
        self.bind_breakpoint(id);
        id
    }

    /// Bind (or re-bind after a module loads) one breakpoint.
    pub(crate) fn bind_breakpoint(self: &Arc<Self>, id: BreakpointId) {
        let Some(spec) = self.breakpoint_spec(id) else {
            return;
        };
        let requested_line = spec.line_no;
        let has_condition = spec.condition.is_some();

        self.set_breakpoint_request(
            &spec,
            false,
            Box::new(move |core, outcome| match outcome {
                None => core.emit(DebugEvent::BreakpointBindFailure { breakpoint: id }),
                Some((engine_id, script_id, line_no)) => {
                    if script_id.is_some() && line_no == requested_line {
                        core.install_binding(id, engine_id, script_id, line_no, true);
                        core.emit(DebugEvent::BreakpointBound {
                            breakpoint: id,
                            engine_id,
                            line_no,
                        });
                        return;
                    }

                    if has_condition {
                        // The engine would not honor the predicate at the
                        // requested location. Re-bind without it and keep the
                        // binding, but still report failure: the front end
                        // relies on that signal to flag the breakpoint.
                        core.send(
                            "clearbreakpoint",
                            Some(json::json!({ "breakpoint": engine_id })),
                            ResponseHandler::none(),
                            None,
                        );
                        let Some(spec) = core.breakpoint_spec(id) else {
                            return;
                        };
                        core.set_breakpoint_request(
                            &spec,
                            true,
                            Box::new(move |core, outcome| {
                                if let Some((engine_id, script_id, line_no)) = outcome {
                                    core.install_binding(id, engine_id, script_id, line_no, false);
                                }
                                core.emit(DebugEvent::BreakpointBindFailure { breakpoint: id });
                            }),
                        );
                        return;
                    }

                    // plain line fix-up: keep the binding for a later
                    // re-bind, tell the caller it did not stick
                    core.install_binding(id, engine_id, script_id, line_no, false);
                    core.emit(DebugEvent::BreakpointBindFailure { breakpoint: id });
                }
            }),
        );
    }

    pub(crate) fn breakpoint_spec(&self, id: BreakpointId) -> Option<Breakpoint> {
        self.state()
            .breakpoints
            .get(&id)
            .map(|record| record.spec.clone())
    }

    /// Send `setbreakpoint` for one breakpoint.
    ///
    /// User coordinates are 1-based, the engine's are 0-based. Column 1 on
    /// the first line skips the wrapper the engine puts around
    /// `require`-loaded scripts.
    pub(crate) fn set_breakpoint_request(
        self: &Arc<Self>,
        spec: &Breakpoint,
        without_predicate: bool,
        done: Box<dyn FnOnce(&Arc<SessionCore>, SetBreakpointOutcome) + Send>,
    ) {
        let line = spec.line_no.saturating_sub(1);
        let column = if line == 0 { 1 } else { 0 };

        let (target_type, target) = {
            let state = self.state();
            match state.scripts_by_name.get(&spec.file_name.to_lowercase()) {
                Some(script) => ("scriptId", script.id.to_string()),
                None => (
                    "scriptRegExp",
                    case_insensitive_regex(&spec.file_name, self.attached),
                ),
            }
        };

        let mut arguments = json::json!({
            "line": line,
            "column": column,
            "type": target_type,
            "target": target,
        });
        if !spec.break_on.engine_enabled(spec.enabled, 0) {
            arguments["enabled"] = json::Value::Bool(false);
        }
        if !without_predicate {
            let ignore_count = spec.break_on.engine_ignore_count(0);
            if ignore_count > 0 {
                arguments["ignoreCount"] = ignore_count.into();
            }
            if let Some(condition) = &spec.condition {
                arguments["condition"] = condition.as_str().into();
            }
        }

        let requested_line = spec.line_no;
        self.send(
            "setbreakpoint",
            Some(arguments),
            ResponseHandler::on_result(move |core, result| {
                let Ok(response) = result else {
                    done(core, None);
                    return;
                };
                let body = response.body.as_ref();
                let engine_id =
                    body.and_then(|body| body.get("breakpoint")).and_then(json::Value::as_i64);
                let Some(engine_id) = engine_id else {
                    done(core, None);
                    return;
                };

                let location = body
                    .and_then(|body| body.get("actual_locations"))
                    .and_then(json::Value::as_array)
                    .and_then(|locations| locations.first());
                let script_id = location
                    .and_then(|location| location.get("script_id"))
                    .and_then(json::Value::as_i64);
                let line_no = location
                    .and_then(|location| location.get("line"))
                    .and_then(json::Value::as_u64)
                    .map(|line| line as u32 + 1)
                    .unwrap_or(requested_line);

                done(core, Some((engine_id, script_id, line_no)));
            }),
            None,
        );
    }

    /// Create a binding, index it, and back-reference it from its
    /// breakpoint.
    pub(crate) fn install_binding(
        &self,
        breakpoint: BreakpointId,
        engine_id: i64,
        script_id: Option<i64>,
        line_no: u32,
        fully_bound: bool,
    ) {
        let mut state = self.state();
        let (engine_enabled, engine_ignore_count) = match state.breakpoints.get(&breakpoint) {
            Some(record) => (
                record.spec.break_on.engine_enabled(record.spec.enabled, 0),
                record.spec.break_on.engine_ignore_count(0),
            ),
            None => (true, 0),
        };
        state.bindings.insert(
            engine_id,
            Binding {
                engine_id,
                script_id,
                line_no,
                fully_bound,
                unbound: false,
                breakpoint,
                hit_count: 0,
                engine_enabled,
                engine_ignore_count,
            },
        );
        if let Some(record) = state.breakpoints.get_mut(&breakpoint) {
            record.bindings.push(engine_id);
        }
    }

    /// Remove one binding from the engine and the session. Idempotent: a
    /// binding that is already gone succeeds silently.
    pub(crate) fn remove_binding(self: &Arc<Self>, engine_id: i64, done: Continuation) {
        let present = self.state().bindings.contains_key(&engine_id);
        if !present {
            done(self, true);
            return;
        }

        self.send(
            "clearbreakpoint",
            Some(json::json!({ "breakpoint": engine_id })),
            ResponseHandler::on_result(move |core, result| {
                if result.is_err() {
                    done(core, false);
                    return;
                }
                let unbound = {
                    let mut state = core.state();
                    // removal strictly precedes the unbound mark
                    let binding = state.bindings.remove(&engine_id);
                    if let Some(binding) = &binding {
                        if let Some(record) = state.breakpoints.get_mut(&binding.breakpoint) {
                            record.bindings.retain(|id| *id != engine_id);
                        }
                    }
                    binding.map(|mut binding| {
                        binding.unbound = true;
                        binding
                    })
                };
                if let Some(binding) = unbound {
                    core.emit(DebugEvent::BreakpointUnbound {
                        breakpoint: binding.breakpoint,
                        engine_id,
                    });
                }
                done(core, true);
            }),
            None,
        );
    }

    /// Remove a breakpoint and every binding it still has.
    pub(crate) fn remove_breakpoint(self: &Arc<Self>, id: BreakpointId) {
        let bindings = {
            let mut state = self.state();
            match state.breakpoints.remove(&id) {
                Some(record) => record.bindings,
                None => return,
            }
        };
        for engine_id in bindings {
            self.remove_binding(engine_id, Box::new(|_core, _ok| {}));
        }
    }

    /// Send `changebreakpoint`. With `validate` the call waits up to two
    /// seconds for the engine to acknowledge, abandoning the wait if the
    /// debuggee exits.
    pub(crate) fn change_breakpoint_request(
        self: &Arc<Self>,
        engine_id: i64,
        enabled: Option<bool>,
        condition: Option<Option<&str>>,
        ignore_count: Option<u32>,
        validate: bool,
    ) -> bool {
        let mut arguments = json::json!({ "breakpoint": engine_id });
        if let Some(enabled) = enabled {
            arguments["enabled"] = enabled.into();
        }
        if let Some(condition) = condition {
            arguments["condition"] = condition.unwrap_or("").into();
        }
        if let Some(ignore_count) = ignore_count {
            arguments["ignoreCount"] = ignore_count.into();
        }

        let wait = validate.then(|| Wait::exit_guard(self));
        self.send("changebreakpoint", Some(arguments), ResponseHandler::none(), wait)
    }

    /// Ask the engine for one binding's hit count, asynchronously. The
    /// continuation sees `false` when the request failed; the count itself
    /// is cached on the binding.
    pub(crate) fn fetch_hit_count(self: &Arc<Self>, engine_id: i64, done: Continuation) {
        self.send(
            "listbreakpoints",
            None,
            ResponseHandler::on_result(move |core, result| {
                let hit_count = result.ok().and_then(|response| hit_count_from_body(response, engine_id));
                if let Some(hit_count) = hit_count {
                    if let Some(binding) = core.state().bindings.get_mut(&engine_id) {
                        binding.hit_count = hit_count;
                    }
                }
                done(core, hit_count.is_some());
            }),
            None,
        );
    }

    /// Synchronous hit-count query, for the embedder.
    pub(crate) fn hit_count_sync(self: &Arc<Self>, engine_id: i64) -> Option<u32> {
        let slot = Arc::new(std::sync::Mutex::new(None));
        let out = Arc::clone(&slot);
        let ok = self.send(
            "listbreakpoints",
            None,
            ResponseHandler::on_success(move |_core, response| {
                *out.lock().unwrap() = hit_count_from_body(response, engine_id);
            }),
            Some(Wait::exit_guard(self)),
        );
        if !ok {
            return None;
        }
        let count = slot.lock().unwrap().take();
        count
    }

    pub(crate) fn breakpoint_hit_count(self: &Arc<Self>, id: BreakpointId) -> Option<u32> {
        let engine_id = {
            let state = self.state();
            state.breakpoints.get(&id)?.bindings.first().copied()?
        };
        self.hit_count_sync(engine_id)
    }

    pub(crate) fn set_breakpoint_enabled(self: &Arc<Self>, id: BreakpointId, enabled: bool) -> bool {
        self.update_breakpoint(id, |spec| spec.enabled = enabled)
    }

    pub(crate) fn set_breakpoint_condition(
        self: &Arc<Self>,
        id: BreakpointId,
        condition: Option<String>,
    ) -> bool {
        self.update_breakpoint(id, move |spec| spec.condition = condition)
    }

    pub(crate) fn set_breakpoint_break_on(self: &Arc<Self>, id: BreakpointId, break_on: BreakOn) -> bool {
        self.update_breakpoint(id, move |spec| spec.break_on = break_on)
    }

    /// Apply a mutation to the breakpoint request, then push the resulting
    /// engine state to every binding, validated.
    fn update_breakpoint(
        self: &Arc<Self>,
        id: BreakpointId,
        mutate: impl FnOnce(&mut Breakpoint),
    ) -> bool {
        let updates = {
            let mut state = self.state();
            let Some(record) = state.breakpoints.get_mut(&id) else {
                return false;
            };
            mutate(&mut record.spec);
            let spec = record.spec.clone();
            let bindings = record.bindings.clone();

            bindings
                .into_iter()
                .filter_map(|engine_id| {
                    let binding = state.bindings.get_mut(&engine_id)?;
                    let enabled = spec.break_on.engine_enabled(spec.enabled, binding.hit_count);
                    let ignore_count = spec.break_on.engine_ignore_count(binding.hit_count);
                    binding.engine_enabled = enabled;
                    binding.engine_ignore_count = ignore_count;
                    Some((engine_id, enabled, ignore_count, spec.condition.clone()))
                })
                .collect::<Vec<_>>()
        };

        let mut ok = true;
        for (engine_id, enabled, ignore_count, condition) in updates {
            ok &= self.change_breakpoint_request(
                engine_id,
                Some(enabled),
                Some(condition.as_deref()),
                Some(ignore_count),
                true,
            );
        }
        ok
    }
}

fn hit_count_from_body(response: &Response, engine_id: i64) -> Option<u32> {
    response
        .body
        .as_ref()?
        .get("breakpoints")?
        .as_array()?
        .iter()
        .find(|entry| entry.get("number").and_then(json::Value::as_i64) == Some(engine_id))?
        .get("hit_count")
        .and_then(json::Value::as_u64)
        .map(|count| count as u32)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn break_on_rejects_zero_count() {
        assert!(BreakOn::new(BreakOnKind::Equal, 0).is_err());
        assert!(BreakOn::new(BreakOnKind::Always, 0).is_ok());
        assert!(BreakOn::new(BreakOnKind::Mod, 1).is_ok());
    }

    #[test]
    fn break_on_policies() {
        let always = BreakOn::always();
        assert!(always.should_break(0));
        assert!(always.should_break(17));

        let equal = BreakOn::new(BreakOnKind::Equal, 3).unwrap();
        assert!(!equal.should_break(2));
        assert!(equal.should_break(3));
        assert!(!equal.should_break(4));

        let at_least = BreakOn::new(BreakOnKind::GreaterThanOrEqual, 2).unwrap();
        assert!(!at_least.should_break(1));
        assert!(at_least.should_break(2));
        assert!(at_least.should_break(9));

        let every = BreakOn::new(BreakOnKind::Mod, 4).unwrap();
        assert!(!every.should_break(3));
        assert!(every.should_break(4));
        assert!(every.should_break(8));
    }

    #[test]
    fn engine_projection_of_policies() {
        let equal = BreakOn::new(BreakOnKind::Equal, 2).unwrap();
        assert_eq!(equal.engine_ignore_count(0), 1);
        assert_eq!(equal.engine_ignore_count(1), 0);
        assert!(equal.engine_enabled(true, 1));
        // a satisfied Equal policy is done for good
        assert!(!equal.engine_enabled(true, 2));
        assert!(!equal.engine_enabled(false, 0));

        let at_least = BreakOn::new(BreakOnKind::GreaterThanOrEqual, 3).unwrap();
        assert_eq!(at_least.engine_ignore_count(0), 2);
        assert_eq!(at_least.engine_ignore_count(5), 0);
        assert!(at_least.engine_enabled(true, 5));

        assert_eq!(BreakOn::always().engine_ignore_count(7), 0);
    }

    #[test]
    fn regex_is_anchored_and_caseless() {
        assert_eq!(
            case_insensitive_regex("C:\\app\\a.js", false),
            "^[Cc]:\\\\[Aa][Pp][Pp]\\\\[Aa]\\.[Jj][Ss]$"
        );
    }

    #[test]
    fn regex_leaf_only_anchors_on_separator() {
        assert_eq!(
            case_insensitive_regex("/srv/app/a.js", true),
            "[\\\\/][Aa]\\.[Jj][Ss]$"
        );
        // no separator to strip: the whole path anchors normally
        assert_eq!(case_insensitive_regex("a.js", true), "^[Aa]\\.[Jj][Ss]$");
    }

    #[test]
    fn regex_escapes_metacharacters() {
        assert_eq!(case_insensitive_regex("a+(1).js", false), "^[Aa]\\+\\(1\\)\\.[Jj][Ss]$");
    }
}
