//! Attach to a node process started with `node --debug-brk <script>` (or
//! `--debug`) and print whatever the session reports.

use log::{error, info};
use v8_debug::{DebugEvent, Session, DEFAULT_DEBUG_PORT};

fn init_logger() {
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{l} - {m}\n")))
        .build("output.log")
        .unwrap();

    let config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .build(
            Root::builder()
                .appender("logfile")
                .build(log::LevelFilter::Debug),
        )
        .unwrap();

    log4rs::init_config(config).unwrap();
}

fn main() {
    init_logger();

    let (session, events) = match Session::connect("127.0.0.1", DEFAULT_DEBUG_PORT) {
        Ok(pair) => pair,
        Err(error) => {
            error!("connect failed: {}", error);
            return;
        }
    };

    for event in events.iter() {
        info!("event: {:?}", event);
        match event {
            DebugEvent::ProcessLoaded { .. } | DebugEvent::EntryPointHit => {
                for frame in session.frames() {
                    info!(
                        "  {} {}:{}",
                        frame.function_name, frame.script.name, frame.line_no
                    );
                }
                session.resume();
            }
            DebugEvent::BreakpointHit { .. } | DebugEvent::StepComplete => session.resume(),
            DebugEvent::ProcessExited { exit_code } => {
                info!("debuggee exited with {}", exit_code);
                break;
            }
            _ => {}
        }
    }
}
