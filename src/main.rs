//! Terminal front end for a voxstream session.
//!
//! Lines typed on stdin are sent as chat messages. Slash commands drive the
//! rest of the session:
//!
//! ```text
//! /rec     start recording      /stop    stop and send
//! /cancel  discard recording    /abort   stop the streaming reply
//! /new     start a new session  /save    write settings to disk
//! /quit    exit
//! ```
//!
//! Pass `--stub` to run without a backend or microphone.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use voxstream::settings::save_settings;
use voxstream::store::Role;
use voxstream::{
    load_settings, spawn_session, EffectRunner, LiveEffectRunner, Notice, RecordingState,
    SessionCommand, SessionController, SessionObserver, SessionStore, StubEffectRunner,
};

/// How much of an assistant message is already on screen
struct Printed {
    id: String,
    len: usize,
    done: bool,
}

/// Prints assistant output as it streams in.
#[derive(Default)]
struct TerminalObserver {
    printed: Option<Printed>,
    recording: &'static str,
}

impl SessionObserver for TerminalObserver {
    fn state_changed(&mut self, store: &SessionStore, recording: &RecordingState) {
        if recording.label() != self.recording {
            self.recording = recording.label();
            eprintln!("[mic: {}]", self.recording);
        }

        let Some(last) = store.messages.last().filter(|m| m.role == Role::Assistant) else {
            return;
        };
        let (already, done) = match &self.printed {
            Some(printed) if printed.id == last.id => (printed.len, printed.done),
            _ => {
                print!("assistant> ");
                (0, false)
            }
        };
        if done {
            return;
        }
        // Rollback or a `done` rewrite can shorten the text
        match last.content.get(already..) {
            Some(delta) => print!("{}", delta),
            None => print!("\n{}", last.content),
        }
        if !last.streaming {
            println!();
        }
        let _ = std::io::stdout().flush();
        self.printed = Some(Printed {
            id: last.id.clone(),
            len: last.content.len(),
            done: !last.streaming,
        });
    }

    fn notify(&mut self, notice: &Notice) {
        match notice {
            Notice::Busy => eprintln!("\n[busy: wait for the current reply]"),
            Notice::Warning(msg) => eprintln!("\n[warning] {}", msg),
            Notice::Error(msg) => eprintln!("\n[error] {}", msg),
        }
    }
}

/// One line of terminal input
#[derive(Debug, PartialEq)]
enum Input {
    Session(SessionCommand),
    SaveSettings,
    Quit,
}

fn parse_line(line: &str) -> Option<Input> {
    let command = match line.trim() {
        "" => return None,
        "/quit" => return Some(Input::Quit),
        "/save" => return Some(Input::SaveSettings),
        "/rec" => SessionCommand::StartRecording,
        "/stop" => SessionCommand::StopRecording,
        "/cancel" => SessionCommand::CancelRecording,
        "/abort" => SessionCommand::StopStreaming,
        "/new" => SessionCommand::NewSession,
        text => SessionCommand::SendText(text.to_string()),
    };
    Some(Input::Session(command))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = load_settings();
    let stub = std::env::args().any(|arg| arg == "--stub");

    let runner: Arc<dyn EffectRunner> = if stub {
        log::info!("Using stub effect runner");
        StubEffectRunner::new()
    } else {
        match LiveEffectRunner::new(&settings) {
            Ok(runner) => runner,
            Err(e) => {
                eprintln!("Failed to set up backend client: {}", e);
                std::process::exit(1);
            }
        }
    };

    let controller = SessionController::from_settings(&settings, TerminalObserver::default());
    let (handle, task) = spawn_session(controller, runner);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read stdin: {}", e);
                break;
            }
        };
        match parse_line(&line) {
            None => {}
            Some(Input::Quit) => break,
            Some(Input::SaveSettings) => match save_settings(&settings) {
                Ok(()) => eprintln!("[settings saved]"),
                Err(e) => eprintln!("[error] {}", e),
            },
            Some(Input::Session(command)) => {
                if handle.command(command).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = handle.exit().await;
    match task.await {
        Ok(controller) => {
            let summary = controller.metrics().get_summary();
            log::info!(
                "Exchanges: {} ok, {} failed",
                summary.successful_exchanges,
                summary.failed_exchanges
            );
        }
        Err(e) => log::error!("Session loop failed: {}", e),
    }
}
