//! voxstream: streaming chat session controller
//!
//! One session loop owns the [`SessionStore`] and applies every command,
//! stream signal and recorder result in arrival order. I/O runs in the
//! [`EffectRunner`], which reports back on the same channel.

pub mod audio;
pub mod effects;
pub mod metrics;
pub mod rollback;
pub mod router;
pub mod session;
pub mod sessions;
pub mod settings;
pub mod state_machine;
pub mod store;
pub mod streaming;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use effects::{EffectRunner, LiveEffectRunner, StubEffectRunner};
pub use session::{SessionCommand, SessionController, SessionEvent, SessionObserver, SessionOptions};
pub use settings::{load_settings, ChatSettings};
pub use state_machine::{Effect, Notice, RecordingState};
pub use store::SessionStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle for feeding the session loop
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Send an event to the session loop
    pub async fn send(
        &self,
        event: SessionEvent,
    ) -> Result<(), mpsc::error::SendError<SessionEvent>> {
        self.tx.send(event).await
    }

    pub async fn command(
        &self,
        command: SessionCommand,
    ) -> Result<(), mpsc::error::SendError<SessionEvent>> {
        self.send(SessionEvent::Command(command)).await
    }

    /// Ask the loop to stop. The loop cancels anything in flight first.
    pub async fn exit(&self) -> Result<(), mpsc::error::SendError<SessionEvent>> {
        self.send(SessionEvent::Exit).await
    }
}

/// Spawn the session loop on the current runtime.
///
/// The join handle yields the controller once the loop ends.
pub fn spawn_session<O: SessionObserver>(
    controller: SessionController<O>,
    effect_runner: Arc<dyn EffectRunner>,
) -> (SessionHandle, JoinHandle<SessionController<O>>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let handle = SessionHandle { tx: tx.clone() };
    let task = tokio::spawn(run_session_loop(controller, rx, tx, effect_runner));
    (handle, task)
}

/// Run the session loop until `Exit`.
pub async fn run_session_loop<O: SessionObserver>(
    mut controller: SessionController<O>,
    mut rx: mpsc::Receiver<SessionEvent>,
    tx: mpsc::Sender<SessionEvent>,
    effect_runner: Arc<dyn EffectRunner>,
) -> SessionController<O> {
    log::info!("Session loop started ({})", controller.store().session_id);

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Exit at the edge
        if matches!(event, SessionEvent::Exit) {
            log::info!("Exit requested, shutting down session loop");
            break;
        }

        let effects = controller.handle(event);
        dispatch(&mut controller, effects, &tx, &effect_runner);
    }

    let effects = controller.shutdown();
    dispatch(&mut controller, effects, &tx, &effect_runner);

    log::info!("Session loop ended");
    controller
}

fn dispatch<O: SessionObserver>(
    controller: &mut SessionController<O>,
    effects: Vec<Effect>,
    tx: &mpsc::Sender<SessionEvent>,
    effect_runner: &Arc<dyn EffectRunner>,
) {
    for effect in effects {
        match effect {
            Effect::OpenStream {
                exchange_id,
                request,
            } => {
                let stream = effect_runner.open_stream(exchange_id, request, tx.clone());
                controller.attach_stream(exchange_id, stream);
            }
            other => effect_runner.spawn(other, tx.clone()),
        }
    }
}
