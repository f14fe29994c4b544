/// Callback arbiter
///
/// Guarantees the completion callback of a resolution call fires exactly
/// once: whichever of {timeout timer, resolution} happens first wins, and the
/// loser's continuation becomes a no-op with respect to delivery. All state
/// is per-call; concurrent calls for different partners cannot interfere.
use crate::identity::records::{Cohort, Resolution, ResolvedIdentity};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// Caller-supplied completion callback
pub type ResolveCallback = Box<dyn FnOnce(&Resolution) + Send + 'static>;

struct Inner {
    tx: Option<oneshot::Sender<Resolution>>,
    callback: Option<ResolveCallback>,
    timer: Option<JoinHandle<()>>,
}

/// Per-call delivery arbiter
#[derive(Clone)]
pub struct Arbiter {
    inner: Arc<Mutex<Inner>>,
}

impl Arbiter {
    /// Create an arbiter and the receiver its delivery resolves
    pub fn new(callback: Option<ResolveCallback>) -> (Self, oneshot::Receiver<Resolution>) {
        let (tx, rx) = oneshot::channel();
        let arbiter = Self {
            inner: Arc::new(Mutex::new(Inner {
                tx: Some(tx),
                callback,
                timer: None,
            })),
        };
        (arbiter, rx)
    }

    /// Arm the timeout path: when the budget lapses before a resolution
    /// lands, the in-hand identity is delivered instead
    pub fn arm_timeout(&self, budget: Duration, in_hand: ResolvedIdentity, cohort: Cohort) {
        let arbiter = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            if arbiter.deliver_from_timer(Resolution::Identity(in_hand), cohort) {
                debug!("Resolution budget of {:?} lapsed, delivered in-hand identity", budget);
            }
        });
        self.inner.lock().unwrap().timer = Some(handle);
    }

    /// Deliver a resolution; a no-op once anything has been delivered
    ///
    /// Returns true when this call performed the delivery.
    pub fn deliver(&self, resolution: Resolution, cohort: Cohort) -> bool {
        self.finish(resolution, cohort, false)
    }

    fn deliver_from_timer(&self, resolution: Resolution, cohort: Cohort) -> bool {
        self.finish(resolution, cohort, true)
    }

    /// True once a delivery has happened
    pub fn delivered(&self) -> bool {
        self.inner.lock().unwrap().tx.is_none()
    }

    fn finish(&self, mut resolution: Resolution, cohort: Cohort, from_timer: bool) -> bool {
        let (tx, callback, timer) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(tx) = inner.tx.take() else {
                return false;
            };
            (tx, inner.callback.take(), inner.timer.take())
        };

        // The control cohort never shares identity, whatever was computed
        if cohort == Cohort::WithoutIiq {
            if let Resolution::Identity(_) = resolution {
                resolution = Resolution::empty();
            }
        }

        if let Some(timer) = timer {
            if !from_timer {
                timer.abort();
            }
        }

        // Callback runs outside the lock so it may re-enter the engine
        if let Some(callback) = callback {
            callback(&resolution);
        }
        let _ = tx.send(resolution);
        true
    }
}
