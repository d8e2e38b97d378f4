//! Periodic `system.heartbeat` generation.
//!
//! The generator samples process metrics on its own task and asks the bus
//! actor to compose and publish the heartbeat, so the event is built from
//! the dispatcher's own counters.
//!
//! ```text
//!   Idle ──start()──▶ Running ──stop()──▶ Stopped
//!     └──────────────stop()──────────────────┘
//! ```

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::BusHandle;
use crate::metrics::ProcessMonitor;

/// Lifecycle state of the heartbeat generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    Running,
    Stopped,
}

/// Publishes a heartbeat every `interval` while running.
pub struct Heartbeat {
    interval: Duration,
    bus: BusHandle,
    state: HeartbeatState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(bus: BusHandle, interval: Duration) -> Self {
        Self {
            interval,
            bus,
            state: HeartbeatState::Idle,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Ties the generator to an outer shutdown token.
    #[must_use]
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    /// Starts the timer. Returns false unless the generator was idle.
    pub fn start(&mut self) -> bool {
        if self.state != HeartbeatState::Idle {
            return false;
        }

        let bus = self.bus.clone();
        let cancel = self.cancel.clone();
        let period = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut monitor = ProcessMonitor::new();
            // First sample sets the CPU baseline.
            let _ = monitor.sample();

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_secs = period.as_secs_f64(), "Heartbeat started");

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    _ = ticker.tick() => {
                        let metrics = monitor.sample();
                        if bus.heartbeat(metrics).await.is_err() {
                            debug!("Heartbeat stopping: bus closed");
                            break;
                        }
                    }
                }
            }

            debug!("Heartbeat task completed");
        }));

        self.state = HeartbeatState::Running;
        true
    }

    /// Cancels the timer and waits for the task. Idempotent.
    pub async fn stop(&mut self) {
        if self.state == HeartbeatState::Stopped {
            return;
        }
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.state = HeartbeatState::Stopped;
        info!("Heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{spawn_bus, BusSettings};

    #[tokio::test]
    async fn test_lifecycle_and_idempotent_stop() {
        let bus = spawn_bus(BusSettings::default());
        let mut heartbeat = Heartbeat::new(bus, Duration::from_secs(60));
        assert_eq!(heartbeat.state(), HeartbeatState::Idle);

        assert!(heartbeat.start());
        assert!(!heartbeat.start());
        assert_eq!(heartbeat.state(), HeartbeatState::Running);

        heartbeat.stop().await;
        heartbeat.stop().await;
        assert_eq!(heartbeat.state(), HeartbeatState::Stopped);
        assert!(!heartbeat.start());
    }

    #[tokio::test]
    async fn test_publishes_on_interval() {
        let bus = spawn_bus(BusSettings::default());
        let mut heartbeat = Heartbeat::new(bus.clone(), Duration::from_millis(50));
        heartbeat.start();

        tokio::time::sleep(Duration::from_millis(600)).await;
        heartbeat.stop().await;

        let beats = bus.history(None, Some("/system".to_string())).await.unwrap();
        assert!(!beats.is_empty());
        assert!(beats.iter().all(|e| e.qualified_name() == "system.heartbeat"));

        let count = beats.len();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let after = bus.history(None, Some("/system".to_string())).await.unwrap();
        assert_eq!(after.len(), count);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let bus = spawn_bus(BusSettings::default());
        let mut heartbeat = Heartbeat::new(bus, Duration::from_secs(1));
        heartbeat.stop().await;
        assert_eq!(heartbeat.state(), HeartbeatState::Stopped);
    }
}
