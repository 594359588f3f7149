//! Notifications delivered to the embedder.

use std::sync::Arc;

use crate::breakpoint::BreakpointId;
use crate::frame::Script;

/// A notification from the session.
///
/// Events are fire-and-forget: the session never waits on the embedder, and
/// a dropped receiver is not an error.
#[derive(Debug, Clone)]
pub enum DebugEvent {
    /// The connect handshake finished: scripts are indexed, exception breaks
    /// are configured, and the first backtrace returned.
    ProcessLoaded { running: bool },
    /// The session is over. Fired exactly once, however often the session is
    /// torn down.
    ProcessExited { exit_code: i32 },
    /// The sole debuggee thread exists.
    ThreadCreated { thread_id: u32 },
    /// The engine knows a new source unit, either from the initial inventory
    /// or from an `afterCompile` event.
    ModuleLoaded { script: Arc<Script> },
    /// The debuggee is stopped on the first executable user-code line after
    /// module load.
    EntryPointHit,
    /// A step finished, or the debuggee stopped without a breakpoint (for
    /// example on a `debugger` statement).
    StepComplete,
    /// A `break_all` request took effect and frames are populated.
    AsyncBreakComplete,
    /// The engine placed a breakpoint at the requested line.
    BreakpointBound {
        breakpoint: BreakpointId,
        engine_id: i64,
        line_no: u32,
    },
    /// A binding was removed from the engine.
    BreakpointUnbound {
        breakpoint: BreakpointId,
        engine_id: i64,
    },
    /// The engine refused the breakpoint, snapped it to a different line, or
    /// could not honor its condition at the requested location. A binding
    /// may still exist; the front end uses this to flag the breakpoint.
    BreakpointBindFailure { breakpoint: BreakpointId },
    /// A breakpoint stopped the debuggee and its condition and hit-count
    /// policy agreed. Frames are populated.
    BreakpointHit {
        breakpoint: BreakpointId,
        engine_id: i64,
    },
    /// An exception was thrown and the treatment table said to stop. Frames
    /// are populated.
    ExceptionRaised {
        name: String,
        description: String,
        uncaught: bool,
    },
}
