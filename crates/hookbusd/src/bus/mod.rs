//! Event bus using the actor pattern.
//!
//! A single `BusActor` task is the dispatcher: it owns the history buffer,
//! the client table, the session table and the counters. Everything else
//! talks to it through a `BusHandle`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  BusCommand   ┌─────────────────┐  Frame (try_send)  ┌──────────────┐
//! │ ConnectionHandler│─────────────▶│    BusActor     │───────────────────▶│ client outbox│
//! │   Heartbeat     │  (mpsc)       │ history/sessions│  per subscriber    │ → writer task│
//! └─────────────────┘               └─────────────────┘                    └──────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

mod actor;
mod commands;
mod handle;
mod history;
mod sessions;

pub use actor::{BusActor, BusSettings, DEFAULT_MAX_CLIENTS};
pub use commands::{encode, BusCommand, BusError, Frame, Outbox};
pub use handle::BusHandle;
pub use history::{HistoryBuffer, HistoryEntry, DEFAULT_HISTORY_CAPACITY};
pub use sessions::{HookProcessor, SessionTable, DEFAULT_AGENT};

/// Command channel capacity
const COMMAND_BUFFER: usize = 1024;

/// Session cleanup interval in seconds
const CLEANUP_INTERVAL_SECS: u64 = 30;

/// Spawns the bus actor with the hook processor registered.
///
/// Also spawns a background task that triggers periodic session cleanup.
/// Both tasks end once every handle is dropped or `shutdown` is called.
pub fn spawn_bus(settings: BusSettings) -> BusHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = BusActor::new(cmd_rx, settings).with_hook_processor(HookProcessor::new());
    tokio::spawn(actor.run());

    spawn_cleanup_task(cmd_tx.downgrade());

    BusHandle::new(cmd_tx)
}

/// Periodically asks the actor to expire idle sessions.
///
/// Holds only a weak sender so it never keeps the actor alive.
fn spawn_cleanup_task(sender: mpsc::WeakSender<BusCommand>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(sender) = sender.upgrade() else {
                debug!("Cleanup task stopping: bus handles dropped");
                break;
            };
            if sender.send(BusCommand::CleanupSessions).await.is_err() {
                debug!("Cleanup task stopping: bus channel closed");
                break;
            }
        }
    });
}
