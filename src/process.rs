//! The debuggee process handle and launch conveyance helpers.
//!
//! Launch policy (executable, working directory, terminal) belongs to the
//! embedder; the session only needs something it can poll for exit and kill
//! on teardown.

use std::process::Child;

/// A launched debuggee. Attach sessions have none.
pub trait DebuggeeProcess: Send {
    fn has_exited(&mut self) -> bool;
    /// The exit code, once the process is gone. `None` while running or when
    /// the process died without a code (killed by signal).
    fn exit_code(&mut self) -> Option<i32>;
    fn kill(&mut self);
}

impl DebuggeeProcess for Child {
    fn has_exited(&mut self) -> bool {
        matches!(self.try_wait(), Ok(Some(_)))
    }

    fn exit_code(&mut self) -> Option<i32> {
        self.try_wait().ok().flatten().and_then(|status| status.code())
    }

    fn kill(&mut self) {
        let _ = Child::kill(self);
        // reap, so exit_code sees the final status
        let _ = self.wait();
    }
}

/// Interpreter arguments that start a debuggee halted on its first line.
pub fn debug_launch_args(script: &str, interpreter_options: &[String]) -> Vec<String> {
    let mut args = Vec::with_capacity(2 + interpreter_options.len());
    args.push("--debug-brk".to_string());
    args.push(script.to_string());
    args.extend(interpreter_options.iter().cloned());
    args
}

/// Parse the NUL-separated `KEY=VALUE` environment block the launcher
/// receives. Entries with an empty name or no `=` are skipped; only the
/// first `=` splits.
pub fn parse_env_block(block: &str) -> Vec<(String, String)> {
    block
        .split('\0')
        .filter_map(|entry| {
            let (name, value) = entry.split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
