use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
};

use log::{debug, error};

/// Runs every accepted connection on its own thread and keeps count of the
/// ones still running, so the acceptor can wait for them on shutdown.
#[derive(Debug, Default)]
pub struct ConnectionThreads {
    active: Arc<Active>,
}

#[derive(Debug, Default)]
struct Active {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Active {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by a connection thread for its whole life.
struct Running(Arc<Active>);

impl Drop for Running {
    fn drop(&mut self) {
        let mut count = self.0.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl ConnectionThreads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections whose thread has not finished yet.
    pub fn active(&self) -> usize {
        *self.active.lock()
    }

    /// Starts `f` on a new thread named `name`. A panic in `f` is logged and
    /// does not escape the thread.
    pub fn spawn<F>(&self, name: String, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        *self.active.lock() += 1;
        let running = Running(Arc::clone(&self.active));

        thread::Builder::new().name(name).spawn(move || {
            let _running = running;
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
                let name = thread::current().name().unwrap_or("connection").to_string();
                error!("{name} panicked: {}", panic_message(panic.as_ref()));
            }
        })?;
        Ok(())
    }

    /// Blocks until every spawned connection has finished.
    pub fn wait_idle(&self) {
        let mut count = self.active.lock();
        while *count > 0 {
            debug!("waiting on {} connections", *count);
            count = self
                .active
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else {
        format!("{payload:?}")
    }
}
