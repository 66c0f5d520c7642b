//! Named background thread running a task at a fixed interval

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

/// Runs `tick` every interval until stopped or until `tick` returns `false`.
pub struct PeriodicTask {
    name: String,
    stop: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PeriodicTask {
    /// Start the thread.
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop, stopped) = bounded::<()>(1);
        let handle = std::thread::Builder::new().name(name.to_string()).spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !tick() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;

        Ok(Self {
            name: name.to_string(),
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Whether the thread has not been joined yet.
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Stop the thread and wait for the current tick to finish.
    pub fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.stop.try_send(());
        // The task may drop its own owner; it exits on the next wakeup
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!(target: "dso::client", thread = %self.name, "background thread panicked");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
