//! An in-process fake engine for session-level tests: a `TcpListener` on an
//! ephemeral port plus helpers to speak the wire format from the engine's
//! side.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use serde_json as json;
use serde_json::json;

use crate::event::DebugEvent;
use crate::header::Header;
use crate::process::DebuggeeProcess;
use crate::session::{Session, SessionCore};

/// A debuggee process the tests can pose as.
pub(crate) struct FakeProcess {
    exited: bool,
    code: Option<i32>,
}

impl FakeProcess {
    /// A process that already ran to completion.
    pub fn finished(code: i32) -> Box<FakeProcess> {
        Box::new(FakeProcess {
            exited: true,
            code: Some(code),
        })
    }
}

impl DebuggeeProcess for FakeProcess {
    fn has_exited(&mut self) -> bool {
        self.exited
    }

    fn exit_code(&mut self) -> Option<i32> {
        self.code
    }

    fn kill(&mut self) {
        self.exited = true;
    }
}

/// The engine's half of one connection.
pub(crate) struct EngineIo {
    reader: std::io::BufReader<TcpStream>,
    writer: TcpStream,
    seq: u64,
}

impl EngineIo {
    fn new(stream: TcpStream) -> EngineIo {
        let writer = stream.try_clone().unwrap();
        EngineIo {
            reader: std::io::BufReader::new(stream),
            writer,
            seq: 0,
        }
    }

    pub fn send_handshake(&mut self) {
        self.writer
            .write_all(
                b"Type: connect\r\n\
                  V8-Version: 3.14.5.9\r\n\
                  Protocol-Version: 1\r\n\
                  Embedding-Host: node v0.10.40\r\n\
                  Content-Length: 0\r\n\r\n",
            )
            .unwrap();
    }

    /// The next request from the client, or `None` once it hung up.
    pub fn read_request(&mut self) -> Option<json::Value> {
        let header = Header::read_from(&mut self.reader).ok()?;
        let mut buffer = vec![0; header.len];
        self.reader.read_exact(buffer.as_mut_slice()).ok()?;
        json::from_slice(buffer.as_slice()).ok()
    }

    fn write_value(&mut self, value: json::Value) {
        let body = value.to_string();
        write!(self.writer, "Content-Length: {}\r\n\r\n{}", body.len(), body).unwrap();
    }

    pub fn respond(&mut self, request: &json::Value, body: json::Value, running: bool) {
        self.seq += 1;
        self.write_value(json!({
            "seq": self.seq,
            "type": "response",
            "request_seq": request["seq"],
            "command": request["command"],
            "success": true,
            "running": running,
            "body": body,
        }));
    }

    pub fn event(&mut self, name: &str, body: json::Value) {
        self.seq += 1;
        self.write_value(json!({
            "seq": self.seq,
            "type": "event",
            "event": name,
            "body": body,
        }));
    }

    pub fn event_with_refs(&mut self, name: &str, body: json::Value, refs: json::Value) {
        self.seq += 1;
        self.write_value(json!({
            "seq": self.seq,
            "type": "event",
            "event": name,
            "body": body,
            "refs": refs,
        }));
    }

    /// Answer the connect-time requests up to and including the initial
    /// backtrace.
    pub fn drive_connect(&mut self, scripts: json::Value, frames: json::Value) {
        loop {
            let request = self.read_request().expect("client hung up during connect");
            match request["command"].as_str().unwrap() {
                "scripts" => {
                    let scripts = scripts.clone();
                    self.respond(&request, scripts, false);
                }
                "backtrace" => {
                    let total = frames.as_array().map(Vec::len).unwrap_or(0);
                    let body = json!({ "frames": frames, "totalFrames": total });
                    self.respond(&request, body, false);
                    return;
                }
                _ => self.respond(&request, json!({}), false),
            }
        }
    }

    /// Expect one request for `command`, answer it, and hand the request
    /// back for argument assertions.
    pub fn expect(&mut self, command: &str, body: json::Value, running: bool) -> json::Value {
        let request = self.read_request().expect("client hung up");
        assert_eq!(request["command"], command, "unexpected request {}", request);
        self.respond(&request, body, running);
        request
    }
}

/// A frame record the way `backtrace` reports one.
pub(crate) fn frame(index: u64, script_id: i64, line0: u64) -> json::Value {
    json!({
        "index": index,
        "line": line0,
        "func": { "name": "f", "scriptId": script_id },
        "arguments": [],
        "locals": [],
    })
}

/// A callstack of the given depth with the top frame on `top_line0`.
pub(crate) fn frames(depth: u64, script_id: i64, top_line0: u64) -> json::Value {
    let frames: Vec<json::Value> = (0..depth)
        .map(|index| frame(index, script_id, if index == 0 { top_line0 } else { 0 }))
        .collect();
    json::Value::Array(frames)
}

/// Spawn an engine; the script owns the accepted connection.
pub(crate) fn spawn_engine<F>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(EngineIo) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        script(EngineIo::new(stream));
    });
    (port, handle)
}

/// An engine that never speaks: no handshake, drains requests until EOF.
pub(crate) fn idle_engine() -> impl FnOnce(EngineIo) + Send + 'static {
    |mut io: EngineIo| while io.read_request().is_some() {}
}

/// Connect a session (attach flavor) to a scripted engine.
pub(crate) fn attach_pair<F>(script: F) -> (Arc<SessionCore>, Receiver<DebugEvent>, JoinHandle<()>)
where
    F: FnOnce(EngineIo) + Send + 'static,
{
    let (port, handle) = spawn_engine(script);
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let (session, events) = Session::from_stream(stream, None).unwrap();
    (Arc::clone(session.core()), events, handle)
}

/// Connect a full session to a scripted engine.
pub(crate) fn session_pair<F>(
    script: F,
    process: Option<Box<dyn DebuggeeProcess>>,
) -> (Session, Receiver<DebugEvent>, JoinHandle<()>)
where
    F: FnOnce(EngineIo) + Send + 'static,
{
    let (port, handle) = spawn_engine(script);
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let (session, events) = Session::from_stream(stream, process).unwrap();
    (session, events, handle)
}
