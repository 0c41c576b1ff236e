use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, warn};

/// Item of a worker queue: a unit of work or the request to exit.
#[derive(Debug)]
pub enum Job<T> {
    Work(T),
    Quit,
}

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Fixed-size pool of threads consuming one queue.
pub struct WorkerPool<T: Send + 'static> {
    name: &'static str,
    tx: Sender<Job<T>>,
    rx: Receiver<Job<T>>,
    handler: Handler<T>,
    threads: Vec<JoinHandle<()>>,
    spawned: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `count` workers running `handler` on every item of the queue.
    pub fn spawn(
        name: &'static str,
        count: usize,
        tx: Sender<Job<T>>,
        rx: Receiver<Job<T>>,
        handler: impl Fn(T) + Send + Sync + 'static,
    ) -> io::Result<Self> {
        let mut pool = Self {
            name,
            tx,
            rx,
            handler: Arc::new(handler),
            threads: Vec::with_capacity(count),
            spawned: 0,
        };
        for _ in 0..count {
            let handle = pool.spawn_one()?;
            pool.threads.push(handle);
        }
        Ok(pool)
    }

    fn spawn_one(&mut self) -> io::Result<JoinHandle<()>> {
        let rx = self.rx.clone();
        let handler = Arc::clone(&self.handler);
        let name = format!("{}-{}", self.name, self.spawned);
        self.spawned += 1;
        thread::Builder::new().name(name).spawn(move || {
            while let Ok(Job::Work(item)) = rx.recv() {
                handler(item);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Replace workers that have exited unexpectedly. Returns how many were restarted.
    pub fn check_alive(&mut self) -> usize {
        let mut restarted = 0;
        for i in 0..self.threads.len() {
            if !self.threads[i].is_finished() {
                continue;
            }
            let replacement = match self.spawn_one() {
                Ok(handle) => handle,
                Err(e) => {
                    error!(pool = self.name, error = %e, "Failed to respawn worker");
                    continue;
                }
            };
            let dead = std::mem::replace(&mut self.threads[i], replacement);
            if dead.join().is_err() {
                warn!(pool = self.name, "Worker thread panicked, restarted");
            } else {
                warn!(pool = self.name, "Worker thread exited, restarted");
            }
            restarted += 1;
        }
        restarted
    }

    /// Send one quit sentinel per worker and join them all.
    pub fn shutdown(self) {
        debug!(pool = self.name, workers = self.threads.len(), "Stopping workers");
        for _ in &self.threads {
            if self.tx.send(Job::Quit).is_err() {
                break;
            }
        }
        for handle in self.threads {
            if handle.join().is_err() {
                error!(pool = self.name, "Worker thread panicked during shutdown");
            }
        }
    }
}
