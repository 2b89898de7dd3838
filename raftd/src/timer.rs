use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::sleep;

/// Identifies one particular arming of a [`Timer`]
///
/// Callbacks get it back on expiry, so the owner can tell whether the
/// timer was re-armed between the expiry and the callback taking its locks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Expiry(u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerOutcome {
    Fired(Expiry),
    Cancelled,
}

static NEXT_ARMING: AtomicU64 = AtomicU64::new(1);

struct Armed {
    expiry: Expiry,
    /// Dropping it cancels the pending wait
    _cancel: oneshot::Sender<()>,
}

/// Single-shot, cancellable timer bound to a runtime
///
/// Arming it again cancels the previous pending fire; dropping it
/// cancels too. Callbacks run on the runtime's worker threads and
/// must not block.
pub struct Timer {
    rt: Handle,
    armed: Option<Armed>,
}

impl Timer {
    pub fn new(rt: Handle) -> Self {
        Self { rt, armed: None }
    }

    /// A fresh, unarmed timer on the same runtime
    pub fn rebind(&self) -> Self {
        Self::new(self.rt.clone())
    }

    pub fn schedule_after<F>(&mut self, duration: Duration, callback: F) -> Expiry
    where
        F: FnOnce(TimerOutcome) + Send + 'static,
    {
        let expiry = Expiry(NEXT_ARMING.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        self.rt.spawn(async move {
            let outcome = tokio::select! {
                _ = sleep(duration) => TimerOutcome::Fired(expiry),
                _ = cancel_rx => TimerOutcome::Cancelled,
            };
            callback(outcome);
        });

        // replaces (and so cancels) the previous arming
        self.armed = Some(Armed {
            expiry,
            _cancel: cancel_tx,
        });
        expiry
    }

    /// Returns `true` if there was a pending arming
    pub fn cancel(&mut self) -> bool {
        self.armed.take().is_some()
    }

    /// Is `expiry` the latest arming of this timer
    pub fn is_current(&self, expiry: Expiry) -> bool {
        self.armed.as_ref().map(|a| a.expiry) == Some(expiry)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

/// Wrap a callback so it only runs when the timer actually fired
pub fn on_fired<F>(f: F) -> impl FnOnce(TimerOutcome) + Send + 'static
where
    F: FnOnce(Expiry) + Send + 'static,
{
    move |outcome| {
        if let TimerOutcome::Fired(expiry) = outcome {
            f(expiry)
        }
    }
}

/// Uniformly random duration in `[min, max]` (bounds swapped if reversed)
pub fn random_between(min: Duration, max: Duration) -> Duration {
    let (min, max) = if max < min { (max, min) } else { (min, max) };
    if min == max {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}
