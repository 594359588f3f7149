use std::collections::HashMap;
use std::io::{BufRead, Write};

use log::warn;
use serde::Deserialize;
use serde_json as json;

use crate::header::Header;
use crate::Error;

/// An inbound packet.
///
/// The engine distinguishes ordinary packets by the JSON `type` field. The
/// initial handshake is the exception: a headers-only packet carrying a
/// `Type` header and no meaningful body.
pub(crate) enum Packet {
    Connect,
    Response(Response),
    Event(WireEvent),
}

/// A response to one of our requests.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Response {
    /// Sequence number of the corresponding request.
    pub request_seq: u64,
    /// Outcome of the request. If true, the request was successful and the
    /// `body` attribute may contain the result. If false, `message` contains
    /// the error in short form.
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    /// Whether the debuggee is running after this response.
    #[serde(default)]
    pub running: Option<bool>,
    #[serde(default)]
    pub body: Option<json::Value>,
    /// Records for values the body refers to by handle.
    #[serde(default)]
    pub refs: Option<Vec<json::Value>>,
}

/// An event raised by the engine.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireEvent {
    pub event: String,
    #[serde(default)]
    pub body: Option<json::Value>,
    #[serde(default)]
    pub refs: Option<Vec<json::Value>>,
}

/// Index a packet's `refs` array by handle.
pub(crate) fn index_refs(refs: &Option<Vec<json::Value>>) -> HashMap<i64, &json::Value> {
    let mut map = HashMap::new();
    if let Some(refs) = refs {
        for record in refs {
            if let Some(handle) = record.get("handle").and_then(json::Value::as_i64) {
                map.insert(handle, record);
            }
        }
    }
    map
}

/// Read one packet from the wire.
///
/// `Ok(None)` means the packet was well framed but malformed; it has been
/// consumed and logged, and the stream is still in sync. An `Err` is
/// terminal: framing is lost or the socket is gone.
pub(crate) fn read_packet<R: BufRead>(input: &mut R) -> Result<Option<Packet>, Error> {
    let header = Header::read_from(input)?;

    let mut buffer = vec![0; header.len];
    input.read_exact(buffer.as_mut_slice())?;

    // the handshake carries a `Type` header and is all headers
    if header.field("Type").is_some() {
        return Ok(Some(Packet::Connect));
    }

    let value: json::Value = match json::from_slice(buffer.as_slice()) {
        Ok(value) => value,
        Err(err) => {
            warn!("dropping packet with invalid json: {}", err);
            return Ok(None);
        }
    };

    let packet = match value.get("type").and_then(json::Value::as_str) {
        Some("response") => json::from_value(value).map(Packet::Response),
        Some("event") => json::from_value(value).map(Packet::Event),
        other => {
            warn!("dropping packet with unexpected type {:?}", other);
            return Ok(None);
        }
    };

    match packet {
        Ok(packet) => Ok(Some(packet)),
        Err(err) => {
            warn!("dropping packet with missing fields: {}", err);
            Ok(None)
        }
    }
}

/// Frame and write one JSON value, `Content-Length` first.
pub(crate) fn write_packet<W: Write>(output: &mut W, value: &json::Value) -> Result<(), Error> {
    let body = value.to_string();
    write!(output, "Content-Length: {}\r\n\r\n", body.len())?;
    output.write_all(body.as_bytes())?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use bstr::B;
    use serde_json::json;

    fn frame(body: &str) -> String {
        format!("Content-Length:{}\r\n\r\n{}", body.as_bytes().len(), body)
    }

    #[test]
    fn read_response_packet() {
        let body = r#"{"seq":3,"type":"response","request_seq":1,"command":"continue","success":true,"running":true}"#;
        let raw = frame(body);

        let packet = read_packet(&mut B(&raw)).unwrap().unwrap();
        match packet {
            Packet::Response(response) => {
                assert_eq!(response.request_seq, 1);
                assert!(response.success);
                assert_eq!(response.running, Some(true));
                assert_eq!(response.body, None);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn read_event_packet() {
        let body = r#"{"seq":4,"type":"event","event":"afterCompile","body":{"script":{"id":42,"name":"a.js"}}}"#;
        let raw = frame(body);

        let packet = read_packet(&mut B(&raw)).unwrap().unwrap();
        match packet {
            Packet::Event(event) => {
                assert_eq!(event.event, "afterCompile");
                assert_eq!(event.body.unwrap()["script"]["id"], 42);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn read_handshake_packet() {
        let raw = "Type:connect\r\nV8-Version:3.14.5.9\r\nContent-Length:0\r\n\r\n";

        let packet = read_packet(&mut B(raw)).unwrap().unwrap();
        assert!(matches!(packet, Packet::Connect));
    }

    #[test]
    fn malformed_body_is_dropped_not_fatal() {
        let raw = format!("{}{}", frame("{not json"), frame(r#"{"type":"event","event":"x"}"#));
        let mut input = B(&raw);

        assert!(read_packet(&mut input).unwrap().is_none());
        // the next packet is still readable
        assert!(matches!(
            read_packet(&mut input).unwrap(),
            Some(Packet::Event(_))
        ));
    }

    #[test]
    fn response_without_request_seq_is_dropped() {
        let raw = frame(r#"{"type":"response","success":true}"#);
        assert!(read_packet(&mut B(&raw)).unwrap().is_none());
    }

    #[test]
    fn write_packet_frames_utf8_length() {
        let mut out = Vec::new();
        write_packet(&mut out, &json!({"seq": 1, "type": "request", "command": "suspend"}))
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        assert!(text.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));
    }

    #[test]
    fn index_refs_by_handle() {
        let refs = Some(vec![
            json!({"handle": 7, "name": "Error", "type": "function"}),
            json!({"no_handle": true}),
        ]);
        let map = index_refs(&refs);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&7]["name"], "Error");
    }
}
