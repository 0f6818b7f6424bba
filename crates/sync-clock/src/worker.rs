//! Isolated coordinator task.
//!
//! The coordinator runs on its own tokio task and owns all sync state.
//! Everything else talks to it through a [`ClockHandle`] and listens for
//! [`SyncEvent`]s on the receiver returned by [`ClockWorker::spawn`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use lockstep_common::{Generation, LockstepError, LockstepResult, SourceId, SyncConfig, WallClock};

use crate::coordinator::{DriftCoordinator, FrameSample, SyncEvent};

/// Messages accepted by the coordinator task.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncCommand {
    Init(SourceId),
    SetMaster(SourceId),
    ClearMaster,
    Frame(FrameSample),
    Play { master_secs: f64 },
    Pause,
    Seek { time_secs: f64 },
    Remove(SourceId),
    SeekCompleted {
        source_id: SourceId,
        generation: Generation,
        reported_secs: f64,
    },
    SeekFailed {
        source_id: SourceId,
        generation: Generation,
    },
    Shutdown,
}

/// Cloneable sender side of the coordinator.
#[derive(Debug, Clone)]
pub struct ClockHandle {
    commands: mpsc::UnboundedSender<SyncCommand>,
}

impl ClockHandle {
    fn send(&self, command: SyncCommand) -> LockstepResult<()> {
        self.commands
            .send(command)
            .map_err(|_| LockstepError::ClockUnavailable)
    }

    pub fn init(&self, source_id: SourceId) -> LockstepResult<()> {
        self.send(SyncCommand::Init(source_id))
    }

    pub fn set_master(&self, source_id: SourceId) -> LockstepResult<()> {
        self.send(SyncCommand::SetMaster(source_id))
    }

    pub fn clear_master(&self) -> LockstepResult<()> {
        self.send(SyncCommand::ClearMaster)
    }

    pub fn on_frame(&self, sample: FrameSample) -> LockstepResult<()> {
        self.send(SyncCommand::Frame(sample))
    }

    pub fn play(&self, master_secs: f64) -> LockstepResult<()> {
        self.send(SyncCommand::Play { master_secs })
    }

    pub fn pause(&self) -> LockstepResult<()> {
        self.send(SyncCommand::Pause)
    }

    pub fn seek(&self, time_secs: f64) -> LockstepResult<()> {
        self.send(SyncCommand::Seek { time_secs })
    }

    pub fn remove(&self, source_id: SourceId) -> LockstepResult<()> {
        self.send(SyncCommand::Remove(source_id))
    }

    pub fn seek_completed(
        &self,
        source_id: SourceId,
        generation: Generation,
        reported_secs: f64,
    ) -> LockstepResult<()> {
        self.send(SyncCommand::SeekCompleted {
            source_id,
            generation,
            reported_secs,
        })
    }

    pub fn seek_failed(&self, source_id: SourceId, generation: Generation) -> LockstepResult<()> {
        self.send(SyncCommand::SeekFailed {
            source_id,
            generation,
        })
    }

    /// Ask the task to exit. Dropping every handle has the same effect.
    pub fn shutdown(&self) -> LockstepResult<()> {
        self.send(SyncCommand::Shutdown)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Spawns the coordinator task.
pub struct ClockWorker;

impl ClockWorker {
    /// Start the coordinator on the current tokio runtime.
    pub fn spawn(
        config: SyncConfig,
        clock: Arc<dyn WallClock>,
    ) -> (ClockHandle, mpsc::UnboundedReceiver<SyncEvent>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(config, clock, command_rx, event_tx));
        (
            ClockHandle {
                commands: command_tx,
            },
            event_rx,
            task,
        )
    }
}

async fn run(
    config: SyncConfig,
    clock: Arc<dyn WallClock>,
    mut commands: mpsc::UnboundedReceiver<SyncCommand>,
    events: mpsc::UnboundedSender<SyncEvent>,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(config.tick_interval_ms.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats = tokio::time::interval(Duration::from_millis(config.stats_interval_ms.max(1)));
    stats.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Both intervals fire immediately on the first poll.
    stats.tick().await;

    let mut coordinator = DriftCoordinator::new(config);
    tracing::debug!("Clock coordinator started");

    loop {
        let out = tokio::select! {
            command = commands.recv() => match command {
                None | Some(SyncCommand::Shutdown) => break,
                Some(command) => handle(&mut coordinator, command, clock.now_secs()),
            },
            _ = tick.tick() => coordinator.tick(clock.now_secs()),
            _ = stats.tick() => {
                let stats = coordinator.stats();
                if stats.is_empty() {
                    Vec::new()
                } else {
                    vec![SyncEvent::Stats(stats)]
                }
            }
        };

        for event in out {
            if events.send(event).is_err() {
                tracing::debug!("Sync event receiver dropped, stopping coordinator");
                return;
            }
        }
    }

    tracing::debug!("Clock coordinator stopped");
}

fn handle(coordinator: &mut DriftCoordinator, command: SyncCommand, now: f64) -> Vec<SyncEvent> {
    match command {
        SyncCommand::Init(source_id) => {
            coordinator.init(source_id);
            Vec::new()
        }
        SyncCommand::SetMaster(source_id) => coordinator.set_master(source_id),
        SyncCommand::ClearMaster => {
            coordinator.clear_master();
            Vec::new()
        }
        SyncCommand::Frame(sample) => coordinator.on_frame(sample),
        SyncCommand::Play { master_secs } => {
            coordinator.play(master_secs, now);
            Vec::new()
        }
        SyncCommand::Pause => {
            coordinator.pause(now);
            Vec::new()
        }
        SyncCommand::Seek { time_secs } => {
            coordinator.seek(time_secs, now);
            Vec::new()
        }
        SyncCommand::Remove(source_id) => {
            coordinator.remove(&source_id);
            Vec::new()
        }
        SyncCommand::SeekCompleted {
            source_id,
            generation,
            reported_secs,
        } => {
            coordinator.seek_completed(&source_id, generation, reported_secs, now);
            Vec::new()
        }
        SyncCommand::SeekFailed {
            source_id,
            generation,
        } => {
            coordinator.seek_failed(&source_id, generation);
            Vec::new()
        }
        SyncCommand::Shutdown => Vec::new(),
    }
}
