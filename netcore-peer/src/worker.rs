//! Listener worker: one dedicated OS thread per channel, driving that channel's receive loop on
//! its own current-thread tokio runtime. Shutdown is cooperative (watch signal + bounded join).

use std::future::Future;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use rand::Rng;
use tokio::sync::watch;

/// How long `join` waits before detaching a worker that does not exit.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Worker {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn `body` on a new thread. The receiver flips to `true` when shutdown is requested.
    pub fn spawn<F, Fut>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()>,
    {
        let (shutdown, rx) = watch::channel(false);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("{thread_name}: failed to build runtime: {e}");
                        return;
                    }
                };
                rt.block_on(body(rx));
                debug!("{thread_name}: exited");
            })?;
        Ok(Self {
            name: name.to_string(),
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Ask the loop to exit. Does not wait.
    pub fn signal(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal, then wait up to `timeout` for the thread to finish. A worker that does not
    /// exit in time is detached, never aborted. Returns true if the thread was joined.
    pub fn join(&self, timeout: Duration) -> bool {
        self.signal();
        let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return true;
        };
        if handle.thread().id() == thread::current().id() {
            // Called from inside the loop (e.g. a handler); it exits on its own once we return.
            return false;
        }
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("{}: did not exit within {:?}, detaching", self.name, timeout);
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            error!("{}: thread panicked", self.name);
        }
        true
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Sleep for `delay` unless shutdown is requested first. Returns false on shutdown.
pub async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Spread retries from both ends of a link so they don't fire in lockstep.
pub fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
}
