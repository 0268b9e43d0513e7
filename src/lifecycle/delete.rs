//! Asynchronous delete workers
//!
//! `begin_delete_async` only hides the container and marks it; the object removal
//! happens here, on dedicated threads fed through a channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::{FlashError, Result};
use crate::types::ContainerId;

use super::LifecycleManager;

enum DeleteCommand {
    Delete(ContainerId),
    Shutdown,
}

/// Deletes queued but not yet finished
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Pool of background threads finishing asynchronous deletes
pub struct AsyncDeleter {
    command_tx: Sender<DeleteCommand>,
    in_flight: Arc<InFlight>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncDeleter {
    /// Spawn `workers` threads sharing one queue
    pub fn spawn(lifecycle: Arc<LifecycleManager>, workers: usize) -> Result<Self> {
        let (tx, rx) = unbounded();
        let in_flight = Arc::new(InFlight::default());

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers.max(1) {
            let rx = rx.clone();
            let lifecycle = lifecycle.clone();
            let in_flight = in_flight.clone();
            let handle = thread::Builder::new()
                .name(format!("flashtree-delete-{}", n))
                .spawn(move || Self::worker_loop(rx, lifecycle, in_flight))?;
            handles.push(handle);
        }

        Ok(Self {
            command_tx: tx,
            in_flight,
            workers: handles,
        })
    }

    /// Hand a `DeletePending` container to the workers
    pub fn enqueue(&self, id: ContainerId) -> Result<()> {
        self.in_flight.add();
        self.command_tx.send(DeleteCommand::Delete(id)).map_err(|_| {
            self.in_flight.done();
            FlashError::ShuttingDown
        })
    }

    /// Deletes queued or running
    pub fn pending(&self) -> usize {
        *self.in_flight.count.lock()
    }

    /// Wait until every queued delete has finished; false on timeout
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            if self.in_flight.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Let the workers drain the queue, then join them
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.command_tx.send(DeleteCommand::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("delete worker panicked");
            }
        }
    }

    fn worker_loop(
        rx: Receiver<DeleteCommand>,
        lifecycle: Arc<LifecycleManager>,
        in_flight: Arc<InFlight>,
    ) {
        while let Ok(cmd) = rx.recv() {
            match cmd {
                DeleteCommand::Delete(id) => {
                    if let Err(err) = lifecycle.finish_delete(id) {
                        // Left DeletePending: deleting the id again, or the next
                        // start, resumes it
                        tracing::error!(container = %id, error = %err, "background delete failed");
                    }
                    in_flight.done();
                }
                DeleteCommand::Shutdown => break,
            }
        }
    }
}

impl Drop for AsyncDeleter {
    fn drop(&mut self) {
        self.stop();
    }
}
