//! Session lifecycle: connect handshake, script inventory, run/pause, and
//! teardown.

use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender};
use log::debug;
use serde_json as json;

use crate::breakpoint::{Binding, BreakOn, Breakpoint, BreakpointId, BreakpointRecord};
use crate::breaks::SteppingState;
use crate::connection;
use crate::event::DebugEvent;
use crate::exception::{self, ExceptionTreatment};
use crate::frame::{EvaluationResult, Script, StackFrame, Thread};
use crate::process::DebuggeeProcess;
use crate::router::{PendingRequest, ResponseHandler};
use crate::wire::{Packet, WireEvent};
use crate::Error;

/// A stepping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
}

impl StepKind {
    pub(crate) fn engine_arg(self) -> &'static str {
        match self {
            StepKind::Into => "in",
            StepKind::Over => "next",
            StepKind::Out => "out",
        }
    }
}

/// Callback invoked by the embedder-facing evaluation API. `None` means the
/// expression evaluated to `undefined`.
pub type EvaluateCallback = Box<dyn FnOnce(Option<EvaluationResult>) + Send>;

/// Callback invoked with the enumerated children of a value.
pub type ChildrenCallback = Box<dyn FnOnce(Vec<EvaluationResult>) + Send>;

/// One debugging session against one debuggee.
///
/// Cheap to clone; all clones share the same session. Dropping the last
/// handle does not tear the session down — call [`Session::terminate`] (or
/// let the socket close do it).
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// Attach to an engine already listening on `host:port`.
    pub fn connect(host: &str, port: u16) -> Result<(Session, Receiver<DebugEvent>), Error> {
        let stream = TcpStream::connect((host, port))?;
        Session::from_stream(stream, None)
    }

    /// Build a session over an existing byte stream, with the debuggee's
    /// process handle when this side launched it.
    pub fn from_stream(
        stream: TcpStream,
        process: Option<Box<dyn DebuggeeProcess>>,
    ) -> Result<(Session, Receiver<DebugEvent>), Error> {
        let _ = stream.set_nodelay(true);
        let reader = stream.try_clone()?;
        let (events, events_rx) = crossbeam_channel::unbounded();

        let core = Arc::new(SessionCore {
            attached: process.is_none(),
            state: Mutex::new(State::new()),
            writer: Mutex::new(Some(stream)),
            process: Mutex::new(process),
            events,
        });
        connection::start_listener(Arc::clone(&core), reader)?;

        Ok((Session { core }, events_rx))
    }

    /// Ask the engine to suspend. Emits `AsyncBreakComplete` once frames are
    /// populated.
    pub fn break_all(&self) {
        self.core.send(
            "suspend",
            None,
            ResponseHandler::on_success(|core, _response| {
                core.perform_backtrace(Box::new(|core, running| {
                    debug_assert!(!running);
                    core.emit(DebugEvent::AsyncBreakComplete);
                }));
            }),
            None,
        );
    }

    /// Resume the debuggee, honoring the entry-point discipline.
    pub fn resume(&self) {
        self.core.send_resume_thread();
    }

    /// Start a step from the current stop.
    pub fn step(&self, kind: StepKind) {
        self.core.continue_with(Some(kind), true);
    }

    /// Tell the engine we are leaving without killing the debuggee.
    pub fn detach(&self) {
        self.core.detach();
    }

    /// Tear the session down. Idempotent.
    pub fn terminate(&self) {
        self.core.terminate();
    }

    /// Register a breakpoint and start binding it. The outcome arrives as a
    /// `BreakpointBound` or `BreakpointBindFailure` event.
    pub fn add_breakpoint(&self, breakpoint: Breakpoint) -> BreakpointId {
        self.core.add_breakpoint(breakpoint)
    }

    /// Remove a breakpoint and all of its bindings.
    pub fn remove_breakpoint(&self, breakpoint: BreakpointId) {
        self.core.remove_breakpoint(breakpoint)
    }

    /// Enable or disable a breakpoint. Waits for the engine to acknowledge.
    pub fn set_breakpoint_enabled(&self, breakpoint: BreakpointId, enabled: bool) -> bool {
        self.core.set_breakpoint_enabled(breakpoint, enabled)
    }

    /// Replace a breakpoint's condition expression.
    pub fn set_breakpoint_condition(
        &self,
        breakpoint: BreakpointId,
        condition: Option<String>,
    ) -> bool {
        self.core.set_breakpoint_condition(breakpoint, condition)
    }

    /// Replace a breakpoint's hit-count policy.
    pub fn set_breakpoint_break_on(&self, breakpoint: BreakpointId, break_on: BreakOn) -> bool {
        self.core.set_breakpoint_break_on(breakpoint, break_on)
    }

    /// The engine-side hit count of a breakpoint's first binding.
    pub fn breakpoint_hit_count(&self, breakpoint: BreakpointId) -> Option<u32> {
        self.core.breakpoint_hit_count(breakpoint)
    }

    /// Set the treatment for one exception name, e.g. `TypeError` or
    /// `Error(ENOENT)`.
    pub fn set_exception_treatment(
        &self,
        name: &str,
        treatment: ExceptionTreatment,
    ) -> Result<(), Error> {
        self.core.set_exception_treatment(name, treatment)
    }

    /// Set the treatment applied to exception names without an entry.
    pub fn set_default_exception_treatment(
        &self,
        treatment: ExceptionTreatment,
    ) -> Result<(), Error> {
        self.core.set_default_exception_treatment(treatment)
    }

    /// Drop one exception name back to the default treatment.
    pub fn clear_exception_treatment(&self, name: &str) {
        self.core.clear_exception_treatment(name)
    }

    /// Drop every exception name back to the default treatment.
    pub fn clear_exception_treatments(&self) {
        self.core.clear_exception_treatments()
    }

    /// The frame vector of the current stop, top frame first.
    pub fn frames(&self) -> Vec<Arc<StackFrame>> {
        self.core.state().thread.frames.clone()
    }

    /// Every script the engine has reported.
    pub fn scripts(&self) -> Vec<Arc<Script>> {
        let state = self.core.state();
        let mut scripts: Vec<_> = state.scripts_by_id.values().cloned().collect();
        scripts.sort_by_key(|script| script.id);
        scripts
    }

    /// Evaluate an expression in a stopped frame.
    pub fn evaluate(&self, expression: &str, frame_index: u32, callback: EvaluateCallback) {
        self.core.execute_text(expression, frame_index, callback)
    }

    /// Enumerate the children of an expandable value.
    pub fn children(&self, parent: &EvaluationResult, callback: ChildrenCallback) {
        self.core.enum_children(parent, callback)
    }

    /// Fetch a script's source text from the engine.
    pub fn script_text(&self, script_id: i64) -> Option<String> {
        self.core.script_text(script_id)
    }

    /// True once the debuggee or the connection is gone.
    pub fn has_exited(&self) -> bool {
        self.core.has_exited()
    }
}

/// All shared session state, guarded by the one session mutex.
///
/// One reader (the listener thread) and a few caller threads touch these
/// maps; a single lock keeps the orderings trivial.
pub(crate) struct State {
    pub seq: u64,
    pub pending: HashMap<u64, PendingRequest>,
    /// Keyed by lowercased name; paths compare case-insensitively.
    pub scripts_by_name: HashMap<String, Arc<Script>>,
    pub scripts_by_id: HashMap<i64, Arc<Script>>,
    pub breakpoints: HashMap<BreakpointId, BreakpointRecord>,
    /// Keyed by engine breakpoint id. Never holds an unbound binding.
    pub bindings: HashMap<i64, Binding>,
    pub treatments: HashMap<String, ExceptionTreatment>,
    pub default_treatment: ExceptionTreatment,
    /// Cache of resolved `code` property handles.
    pub error_codes: HashMap<i64, String>,
    pub stepping: SteppingState,
    pub thread: Thread,
    pub next_breakpoint: u32,
    pub load_complete_handled: bool,
    pub handle_entry_point_hit: bool,
    /// Last `setexceptionbreak` state acknowledged by the engine.
    pub break_on_all_sent: bool,
    pub break_on_uncaught_sent: bool,
    pub detached: bool,
    pub terminated: bool,
}

impl State {
    fn new() -> State {
        State {
            seq: 0,
            pending: HashMap::new(),
            scripts_by_name: HashMap::new(),
            scripts_by_id: HashMap::new(),
            breakpoints: HashMap::new(),
            bindings: HashMap::new(),
            treatments: exception::default_treatments(),
            default_treatment: ExceptionTreatment::BreakAlways,
            error_codes: HashMap::new(),
            stepping: SteppingState::default(),
            thread: Thread::new(),
            next_breakpoint: 0,
            load_complete_handled: false,
            handle_entry_point_hit: false,
            break_on_all_sent: false,
            break_on_uncaught_sent: false,
            detached: false,
            terminated: false,
        }
    }
}

pub(crate) struct SessionCore {
    /// True when this side did not launch the debuggee.
    pub attached: bool,
    pub state: Mutex<State>,
    /// Write half of the socket; `None` once dropped.
    pub writer: Mutex<Option<TcpStream>>,
    pub process: Mutex<Option<Box<dyn DebuggeeProcess>>>,
    events: Sender<DebugEvent>,
}

impl SessionCore {
    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn emit(&self, event: DebugEvent) {
        // fire and forget; a gone embedder is not our problem
        let _ = self.events.send(event);
    }

    /// The short-circuit predicate for synchronous waits.
    pub(crate) fn has_exited(&self) -> bool {
        if self.state().terminated {
            return true;
        }
        match self.process.lock().unwrap().as_mut() {
            Some(process) => process.has_exited(),
            None => false,
        }
    }

    /// Route one inbound packet. Runs on the listener thread.
    pub(crate) fn dispatch(self: &Arc<Self>, packet: Packet) {
        match packet {
            Packet::Connect => self.process_connect(),
            Packet::Response(response) => self.deliver(response),
            Packet::Event(event) => self.handle_wire_event(event),
        }
    }

    fn handle_wire_event(self: &Arc<Self>, event: WireEvent) {
        match event.event.as_str() {
            "afterCompile" => self.handle_after_compile(event),
            "break" => self.handle_break_event(event),
            "exception" => self.handle_exception_event(event),
            other => debug!("ignoring unknown event {:?}", other),
        }
    }

    /// Drive the post-handshake sequence: script inventory, exception-break
    /// configuration, then the initial backtrace.
    fn process_connect(self: &Arc<Self>) {
        self.send(
            "scripts",
            None,
            ResponseHandler::on_success(|core, response| {
                if let Some(scripts) = response.body.as_ref().and_then(json::Value::as_array) {
                    for script in scripts {
                        core.add_script(script);
                    }
                }
                core.configure_exception_break(false);
                core.perform_backtrace(Box::new(|core, running| {
                    let thread_id = core.state().thread.id;
                    core.emit(DebugEvent::ThreadCreated { thread_id });
                    core.emit(DebugEvent::ProcessLoaded { running });
                }));
            }),
            None,
        );
    }

    fn handle_after_compile(self: &Arc<Self>, event: WireEvent) {
        let Some(body) = event.body else { return };
        if let Some(script) = body.get("script") {
            self.add_script(script);
        }
    }

    /// Index a script record, emitting `ModuleLoaded` when it is new.
    pub(crate) fn add_script(&self, record: &json::Value) {
        let Some(id) = record.get("id").and_then(json::Value::as_i64) else {
            return;
        };
        let Some(name) = record.get("name").and_then(json::Value::as_str) else {
            // anonymous evals carry no name and cannot back a breakpoint
            debug!("ignoring nameless script {}", id);
            return;
        };

        let script = {
            let mut state = self.state();
            let key = name.to_lowercase();
            if state.scripts_by_name.contains_key(&key) {
                return;
            }
            let script = Arc::new(Script {
                id,
                name: name.to_string(),
            });
            state.scripts_by_name.insert(key, Arc::clone(&script));
            state.scripts_by_id.insert(id, Arc::clone(&script));
            script
        };
        self.emit(DebugEvent::ModuleLoaded { script });
    }

    /// Send `continue`, optionally stepping. With `reset_stepping` the
    /// stepping state is re-armed from the current frame depth; without it
    /// the engine argument changes but the state machine keeps tracking the
    /// original step.
    pub(crate) fn continue_with(self: &Arc<Self>, kind: Option<StepKind>, reset_stepping: bool) {
        {
            let mut state = self.state();
            if reset_stepping {
                state.stepping = SteppingState {
                    mode: kind,
                    frame_depth_at_step: state.thread.frames.len() as u32,
                    resuming: false,
                };
            }
            state.load_complete_handled = true;
            state.handle_entry_point_hit = false;
        }

        let arguments = kind.map(|kind| json::json!({ "stepaction": kind.engine_arg() }));
        self.send("continue", arguments, ResponseHandler::none(), None);
    }

    /// Tear the session down. Serialized under the session mutex; emits
    /// `ProcessExited` exactly once across any number of calls.
    pub(crate) fn terminate(self: &Arc<Self>) {
        let mut state = self.state();
        if state.terminated {
            return;
        }
        state.terminated = true;

        {
            let mut writer = self.writer.lock().unwrap();
            if let Some(stream) = writer.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }

        let mut exit_code = None;
        {
            let mut process = self.process.lock().unwrap();
            match process.as_mut() {
                Some(process) => {
                    if !process.has_exited() {
                        process.kill();
                    }
                    exit_code = process.exit_code();
                }
                None => {
                    if state.detached {
                        // attach session we already left; nothing to report
                        return;
                    }
                }
            }
        }
        drop(state);

        self.emit(DebugEvent::ProcessExited {
            exit_code: exit_code.unwrap_or(-1),
        });
    }

    /// Send `disconnect` and half-close. The engine keeps running; the
    /// listener sees EOF and finishes the teardown quietly.
    fn detach(self: &Arc<Self>) {
        // mark first, so the EOF-triggered teardown stays silent
        self.state().detached = true;
        self.send("disconnect", None, ResponseHandler::none(), None);

        let mut writer = self.writer.lock().unwrap();
        if let Some(stream) = writer.take() {
            let _ = stream.shutdown(Shutdown::Write);
        }
    }
}

#[cfg(test)]
impl Session {
    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }
}
