//! Stop broadcast: a source that triggers, tokens that observe, and
//! callbacks that run once on the requesting thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Callback = Box<dyn FnMut() + Send>;

struct Shared {
    requested: AtomicBool,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

/// The triggering side. Owned by the reactor; `request_stop` is safe from
/// any thread.
pub struct StopSource {
    shared: Arc<Shared>,
}

/// The observing side. Cheap to clone and hand to operations that want to
/// notice cancellation or register a callback for it.
#[derive(Clone)]
pub struct StopToken {
    shared: Arc<Shared>,
}

/// A registered stop callback; deregisters on drop. Dropping synchronizes
/// with a concurrent `request_stop`: once `drop` returns, the callback is
/// not and will never be running.
pub struct StopCallback {
    shared: Arc<Shared>,
    id: u64,
}

impl StopSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                requested: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.requested.load(Ordering::Acquire)
    }

    /// Trigger the stop. Returns true for the call that made the
    /// transition; every registered callback runs here, on this thread,
    /// before it returns.
    pub fn request_stop(&self) -> bool {
        if self.shared.requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut callbacks = self.shared.callbacks.lock();
        for (_, callback) in callbacks.iter_mut() {
            callback();
        }
        callbacks.clear();
        true
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    pub fn stop_requested(&self) -> bool {
        self.shared.requested.load(Ordering::Acquire)
    }

    /// Register `callback` to run when stop is requested. If it already has
    /// been, the callback runs immediately on this thread and `None` is
    /// returned. Callbacks must not register or deregister other callbacks
    /// on the same token.
    pub fn on_stop(&self, mut callback: impl FnMut() + Send + 'static) -> Option<StopCallback> {
        let mut callbacks = self.shared.callbacks.lock();
        if self.stop_requested() {
            drop(callbacks);
            callback();
            return None;
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        callbacks.push((id, Box::new(callback)));
        Some(StopCallback {
            shared: Arc::clone(&self.shared),
            id,
        })
    }
}

impl Drop for StopCallback {
    fn drop(&mut self) {
        self.shared
            .callbacks
            .lock()
            .retain(|(id, _)| *id != self.id);
    }
}

impl fmt::Debug for StopSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSource")
            .field("requested", &self.stop_requested())
            .finish()
    }
}

impl fmt::Debug for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopToken")
            .field("requested", &self.stop_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn callbacks_run_once_on_transition() {
        let source = StopSource::new();
        let token = source.token();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_callback = Arc::clone(&fired);
        let registration = token.on_stop(move || {
            fired_in_callback.fetch_add(1, Ordering::Relaxed);
        });
        assert!(registration.is_some());
        assert!(source.request_stop());
        assert!(!source.request_stop());
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(token.stop_requested());
    }

    #[test]
    fn late_registration_fires_immediately() {
        let source = StopSource::new();
        source.request_stop();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_callback = Arc::clone(&fired);
        let registration = source.token().on_stop(move || {
            fired_in_callback.fetch_add(1, Ordering::Relaxed);
        });
        assert!(registration.is_none());
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dropped_registration_does_not_fire() {
        let source = StopSource::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_callback = Arc::clone(&fired);
        let registration = source.token().on_stop(move || {
            fired_in_callback.fetch_add(1, Ordering::Relaxed);
        });
        drop(registration);
        source.request_stop();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }
}
