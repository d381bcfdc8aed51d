use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Error;

/// Cooperative cancellation signal shared by every stage loop
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    pub fn trigger(&self) {
        let (ref flag, ref cond) = *self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout` unless shutdown is triggered first. Returns true
    /// when shutting down.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (ref flag, ref cond) = *self.inner;
        let deadline = Instant::now() + timeout;
        let mut triggered = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            triggered = cond
                .wait_timeout(triggered, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

// Triggers shutdown if the owning thread unwinds
struct PanicGuard(Shutdown);

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.trigger();
        }
    }
}

/// Runs stage loops on named threads. The first loop to fail or panic
/// triggers the shared shutdown so its siblings wind down too.
pub struct TaskGroup {
    shutdown: Shutdown,
    handles: Vec<(String, JoinHandle<Result<(), Error>>)>,
}

impl TaskGroup {
    pub fn new(shutdown: Shutdown) -> TaskGroup {
        TaskGroup {
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn spawn<F>(&mut self, name: &str, task: F) -> Result<(), Error>
    where
        F: FnOnce(Shutdown) -> Result<(), Error> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let task_name = name.to_owned();
        let handle = thread::Builder::new().name(name.to_owned()).spawn(move || {
            let _guard = PanicGuard(shutdown.clone());
            let result = task(shutdown.clone());
            if let Err(ref e) = result {
                error!("({}) failed: {}", task_name, e);
                shutdown.trigger();
            }
            result
        })?;
        self.handles.push((name.to_owned(), handle));
        Ok(())
    }

    /// Join every task. Returns the first error in spawn order.
    pub fn wait(self) -> Result<(), Error> {
        let mut first_error = None;
        for (name, handle) in self.handles {
            let result = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(Error::TaskPanicked(name)),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_timeout_returns_early_on_trigger() {
        let shutdown = Shutdown::new();
        let remote = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.trigger();
        });
        let started = Instant::now();
        assert!(shutdown.wait_timeout(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
        assert!(!Shutdown::new().wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn first_failure_stops_siblings() {
        let shutdown = Shutdown::new();
        let mut group = TaskGroup::new(shutdown.clone());
        group
            .spawn("looper", |shutdown| {
                while !shutdown.wait_timeout(Duration::from_millis(5)) {}
                Ok(())
            })
            .unwrap();
        group
            .spawn("failer", |_| Err(Error::Config("boom".to_owned())))
            .unwrap();

        assert!(matches!(group.wait(), Err(Error::Config(_))));
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn panics_are_reported() {
        let shutdown = Shutdown::new();
        let mut group = TaskGroup::new(shutdown.clone());
        group
            .spawn("looper", |shutdown| {
                while !shutdown.wait_timeout(Duration::from_millis(5)) {}
                Ok(())
            })
            .unwrap();
        group.spawn("panicker", |_| panic!("stage bug")).unwrap();

        match group.wait() {
            Err(Error::TaskPanicked(name)) => assert_eq!(name, "panicker"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
