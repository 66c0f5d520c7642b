//! Background driver for periodic DGC passes

use super::{GcKind, MarkAndSweepGarbageCollector};
use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use dso_common::DsoError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

enum GcCommand {
    Run(GcKind),
    Stop,
}

/// Runs full passes every `full_interval` and, when configured, young passes
/// every `young_interval`.
pub struct GcThread {
    control: Sender<GcCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for GcThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcThread")
            .field("running", &self.is_running())
            .finish()
    }
}

impl GcThread {
    /// Start the driver thread.
    pub fn spawn(
        collector: Arc<MarkAndSweepGarbageCollector>,
        full_interval: Duration,
        young_interval: Option<Duration>,
    ) -> std::io::Result<Self> {
        let (control, commands) = unbounded();
        let handle = std::thread::Builder::new()
            .name("dso-gc".to_string())
            .spawn(move || {
                let mut next_full = Instant::now() + full_interval;
                let mut next_young = young_interval.map(|every| Instant::now() + every);

                loop {
                    let deadline = next_young.map_or(next_full, |young| young.min(next_full));
                    let wait = deadline.saturating_duration_since(Instant::now());

                    match commands.recv_timeout(wait) {
                        Ok(GcCommand::Run(kind)) => run_pass(&collector, kind),
                        Ok(GcCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            let now = Instant::now();
                            if now >= next_full {
                                run_pass(&collector, GcKind::Full);
                                next_full = now + full_interval;
                            } else if let (Some(due), Some(every)) = (next_young, young_interval) {
                                if now >= due {
                                    run_pass(&collector, GcKind::YoungGen);
                                    next_young = Some(now + every);
                                }
                            }
                        }
                    }
                }
                tracing::debug!(target: "dso::gc", "GC thread stopped");
            })?;

        Ok(Self {
            control,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Ask for a pass without waiting for the next interval.
    pub fn request_now(&self, kind: GcKind) {
        let _ = self.control.send(GcCommand::Run(kind));
    }

    /// Whether the thread has not been joined yet.
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Stop the thread and wait for it. A pass in progress completes first.
    pub fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.control.send(GcCommand::Stop);
        // Stopped from a listener: the loop sees Stop once the pass returns
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!(target: "dso::gc", "GC thread panicked");
        }
    }
}

impl Drop for GcThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_pass(collector: &MarkAndSweepGarbageCollector, kind: GcKind) {
    match collector.collect(kind) {
        Ok(_) => {}
        Err(DsoError::GcBusy) => {
            tracing::debug!(target: "dso::gc", kind = ?kind, state = ?collector.state(), "skipping scheduled pass");
        }
        Err(e) => tracing::warn!(target: "dso::gc", kind = ?kind, error = %e, "DGC pass failed"),
    }
}
