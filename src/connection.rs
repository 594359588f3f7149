use std::io::BufReader;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

use log::debug;

use crate::session::SessionCore;
use crate::wire;
use crate::Error;

/// Start the dedicated reader for the inbound byte stream.
///
/// The listener owns dispatch: responses, events, and the handshake are all
/// handled on this thread, in wire order. Whatever ends the stream — EOF,
/// a read error, lost framing — funnels into a single `terminate` call.
pub(crate) fn start_listener(core: Arc<SessionCore>, stream: TcpStream) -> Result<(), Error> {
    thread::Builder::new()
        .name("v8-debug-listener".to_string())
        .spawn(move || {
            let mut input = BufReader::new(stream);
            loop {
                match wire::read_packet(&mut input) {
                    Ok(Some(packet)) => core.dispatch(packet),
                    // malformed but well-framed packet, already logged
                    Ok(None) => {}
                    Err(err) => {
                        debug!("listener stopping: {}", err);
                        break;
                    }
                }
            }
            core.terminate();
        })?;
    Ok(())
}
