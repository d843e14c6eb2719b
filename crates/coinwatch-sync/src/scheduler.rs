//! Single-task cyclical scheduler. Routines run one after another in registration order.

use std::sync::Arc;
use std::time::Duration;

use coinwatch_core::Clock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::routine::{Routine, RunReport};

enum Command {
    Add(Routine),
    Remove(String),
}

/// Cloneable control surface for a running scheduler. Commands apply at the next cycle.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    pub fn add(&self, routine: Routine) {
        if self.commands.send(Command::Add(routine)).is_err() {
            debug!("scheduler gone, add ignored");
        }
    }

    pub fn remove(&self, name: impl Into<String>) {
        if self.commands.send(Command::Remove(name.into())).is_err() {
            debug!("scheduler gone, remove ignored");
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub ran: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Scheduler {
    routines: Vec<Routine>,
    cycle: Duration,
    clock: Arc<dyn Clock>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(cycle: Duration, clock: Arc<dyn Clock>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            routines: Vec::new(),
            cycle,
            clock,
            commands_tx,
            commands_rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Registers a routine, replacing any routine already registered under the same name.
    pub fn add(&mut self, routine: Routine) {
        match self.routines.iter_mut().find(|r| r.name() == routine.name()) {
            Some(slot) => *slot = routine,
            None => self.routines.push(routine),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Routine> {
        let idx = self.routines.iter().position(|r| r.name() == name)?;
        Some(self.routines.remove(idx))
    }

    pub fn names(&self) -> Vec<&str> {
        self.routines.iter().map(Routine::name).collect()
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            commands: self.commands_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            match command {
                Command::Add(routine) => {
                    info!(routine = routine.name(), "routine added");
                    self.add(routine);
                }
                Command::Remove(name) => {
                    if self.remove(&name).is_some() {
                        info!(routine = %name, "routine removed");
                    }
                }
            }
        }
    }

    /// One pass over every registered routine. Routine errors are reported and swallowed.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        self.drain_commands();

        let cycle_id = Uuid::new_v4();
        let clock = self.clock.clone();
        let routines = &mut self.routines;
        async move {
            let mut summary = CycleSummary::default();
            for routine in routines.iter_mut() {
                match routine.tick(clock.now()).await {
                    None => summary.skipped += 1,
                    Some(Ok(RunReport::Succeeded)) => summary.ran += 1,
                    Some(Ok(RunReport::GaveUp | RunReport::Insufficient)) => {
                        summary.ran += 1;
                        summary.failed += 1;
                    }
                    Some(Err(err)) => {
                        summary.ran += 1;
                        summary.failed += 1;
                        routine.sink().error(routine.name(), &err.to_string());
                    }
                }
            }
            debug!(ran = summary.ran, skipped = summary.skipped, failed = summary.failed, "cycle done");
            summary
        }
        .instrument(info_span!("cycle", %cycle_id))
        .await
    }

    /// Runs cycles until cancelled, pacing each to the configured cycle length.
    pub async fn run(&mut self) {
        info!(cycle_secs = self.cycle.as_secs(), routines = self.routines.len(), "scheduler started");
        while !self.cancel.is_cancelled() {
            let started = Instant::now();
            self.run_cycle().await;
            let pause = self.cycle.saturating_sub(started.elapsed());

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("scheduler stopped");
    }
}
