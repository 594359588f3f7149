//! Client for the legacy V8/Node.js debugger wire protocol.
//!
//! The engine speaks line-based `Content-Length` framing carrying JSON
//! packets over a TCP socket (default port 5858). This crate drives a
//! debuggee through a full debugging session: attach or launch, script
//! discovery, breakpoint binding with location fix-up, stepping, exception
//! filtering, backtrace and variable inspection, expression evaluation, and
//! orderly teardown.
//!
//! The entry point is [`Session`]: construct one with [`Session::connect`]
//! (or [`Session::from_stream`] for a pre-opened socket plus an optional
//! [`DebuggeeProcess`] handle), then drive it from any thread while the
//! session's listener thread turns inbound packets into [`DebugEvent`]
//! notifications on the returned channel.

use std::io;

use thiserror::Error;

mod breakpoint;
mod breaks;
mod connection;
mod event;
mod exception;
mod frame;
mod header;
mod inspect;
mod process;
mod router;
mod session;
mod wire;

#[cfg(test)]
mod mock_engine;

pub use breakpoint::{BreakOn, BreakOnKind, Breakpoint, BreakpointId};
pub use event::DebugEvent;
pub use exception::ExceptionTreatment;
pub use frame::{EvaluationResult, Script, StackFrame, ValueKind};
pub use process::{debug_launch_args, parse_env_block, DebuggeeProcess};
pub use session::{ChildrenCallback, EvaluateCallback, Session, StepKind};

/// The port the engine listens on when started with `--debug-brk` and no
/// explicit port.
pub const DEFAULT_DEBUG_PORT: u16 = 5858;

#[derive(Error, Debug)]
pub enum Error {
    /// A packet that could not be framed or was missing a required field.
    #[error("malformed packet")]
    BadPacket,
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// A hit-count policy was constructed with a count of zero.
    #[error("hit count must be at least 1")]
    InvalidBreakOn,
    /// The engine reports no reliable "uncaught" signal, so a treatment of
    /// break-on-unhandled cannot be stored.
    #[error("break on unhandled is not supported by the engine")]
    UnsupportedTreatment,
}
