use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tracing::warn;

/// Detects tasks that unwound instead of finishing
///
/// A panic in any of the node's tasks leaves the node in an unknown
/// state, so the guard raises the shutdown flag the process waits on.
pub struct PanicGuard {
    name: &'static str,
    flag: Arc<AtomicBool>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, flag: Arc<AtomicBool>) -> Self {
        Self {
            name,
            flag,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!("Task {} panic detected via PanicGuard", self.name);
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Spawn `f` on `rt` with a [`PanicGuard`] around it
pub fn spawn_guarded<F>(
    rt: &Handle,
    name: &'static str,
    flag: Arc<AtomicBool>,
    f: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    rt.spawn(async move {
        let guard = PanicGuard::new(name, flag);
        f.await;
        guard.done();
    })
}

/// Run blocking `f`, letting a multi-threaded runtime move its other
/// tasks off the current worker first
///
/// Outside of a runtime, or on a current-thread one, `f` just runs inline.
pub fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(rt) if rt.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
