//! Interrupt notification wait objects.
//!
//! A wait object binds a set of interrupt causes and doorbell bits to a
//! condition variable. The deferred interrupt handler walks the list and
//! wakes every object whose selection intersects the triggered cause; user
//! threads block in [`WaitList::wait`] until then.
//!
//! The condition variables are paired with the single list mutex: state
//! transitions and membership changes are both made under it, so a sleeper
//! can never miss a wake-up between checking the state and going to sleep.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::device::OwnerHandle;
use crate::intr::IntrCause;
use crate::status::{ApiStatus, CanFail};

/// Infinite-wait sentinel for [`WaitList::wait`].
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

/// Opaque wait-object handle returned to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitHandle(pub u64);

// Wait object states.
const STATE_WAITING: u32 = 0;
const STATE_TRIGGERED: u32 = 1;
const STATE_MARKED_FOR_DELETE: u32 = 2;

/// Rounds of the cancellation drain loop.
const DRAIN_MAX_ROUNDS: u32 = 20;
/// Sleep per drain round.
const DRAIN_ROUND_MS: u64 = 10;

struct WaitObject {
    owner: OwnerHandle,
    notify_mask: IntrCause,
    notify_doorbell: u32,

    // Mutated only under the list mutex; atomics make the shared reads from
    // a woken sleeper well-defined.
    state: AtomicU32,
    source_mask: AtomicU32,
    source_doorbell: AtomicU32,

    /// Threads currently sleeping on this object.
    sleepers: AtomicU32,
    queue: Condvar,
}

impl WaitObject {
    fn state(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: u32) {
        self.state.store(state, Ordering::SeqCst);
    }
}

/// Per-device list of registered wait objects.
pub struct WaitList {
    entries: Mutex<Vec<(WaitHandle, Arc<WaitObject>)>>,
    next_handle: AtomicU64,
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitList {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(WaitHandle, Arc<WaitObject>)>> {
        // A poisoned list only means another thread panicked while holding
        // it; the data itself is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a new wait object and returns its handle.
    pub fn register(
        &self,
        owner: OwnerHandle,
        notify_mask: IntrCause,
        notify_doorbell: u32,
    ) -> WaitHandle {
        let handle = WaitHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        let object = Arc::new(WaitObject {
            owner,
            notify_mask,
            notify_doorbell,
            state: AtomicU32::new(STATE_WAITING),
            source_mask: AtomicU32::new(0),
            source_doorbell: AtomicU32::new(0),
            sleepers: AtomicU32::new(0),
            queue: Condvar::new(),
        });

        self.lock().push((handle, object));

        debug!(target: "plxcore::intr", "registered wait object {:?}", handle);

        handle
    }

    /// Blocks until the object triggers, the timeout expires, or the object
    /// is cancelled.
    ///
    /// A triggered object is re-armed (`Triggered` back to `Waiting`) before
    /// returning, so the same registration can be waited on again.
    pub fn wait(&self, handle: WaitHandle, timeout_ms: u64) -> CanFail<ApiStatus> {
        let mut guard = self.lock();

        let Some(object) = lookup(&guard, handle) else {
            debug!(
                target: "plxcore::intr",
                "wait object {:?} not found or previously canceled", handle
            );
            return Err(ApiStatus::Failed);
        };

        let deadline = if timeout_ms == TIMEOUT_INFINITE {
            None
        } else {
            // Saturating conversion keeps an absurd timeout finite instead
            // of wrapping into a negative tick count.
            Some(Instant::now() + Duration::from_millis(timeout_ms.min(u64::MAX / 2)))
        };

        object.sleepers.fetch_add(1, Ordering::SeqCst);

        let result = loop {
            match object.state() {
                STATE_TRIGGERED => {
                    object.set_state(STATE_WAITING);
                    break Ok(());
                }
                STATE_MARKED_FOR_DELETE => break Err(ApiStatus::WaitCanceled),
                _ => {}
            }

            match deadline {
                None => {
                    guard = object
                        .queue
                        .wait(guard)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(ApiStatus::WaitTimeout);
                    }

                    guard = object
                        .queue
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        };

        object.sleepers.fetch_sub(1, Ordering::SeqCst);

        result
    }

    /// Returns and clears the sources that triggered the object.
    pub fn status(&self, handle: WaitHandle) -> Result<(IntrCause, u32), ApiStatus> {
        let guard = self.lock();

        let Some(object) = lookup(&guard, handle) else {
            return Err(ApiStatus::Failed);
        };

        let mask = IntrCause::from_bits_truncate(object.source_mask.swap(0, Ordering::SeqCst));
        let doorbell = object.source_doorbell.swap(0, Ordering::SeqCst);

        Ok((mask, doorbell))
    }

    /// Wakes every object whose selection intersects the triggered cause.
    ///
    /// Called from the deferred interrupt handler.
    pub fn signal(&self, cause: IntrCause, doorbell: u32) {
        let guard = self.lock();

        for (handle, object) in guard.iter() {
            let hit_mask = object.notify_mask & cause;
            let hit_doorbell = object.notify_doorbell & doorbell;

            if hit_mask.is_empty() && hit_doorbell == 0 {
                continue;
            }

            debug!(target: "plxcore::intr", "signaling wait object {:?}", handle);

            object
                .source_mask
                .fetch_or(hit_mask.bits(), Ordering::SeqCst);
            object
                .source_doorbell
                .fetch_or(hit_doorbell, Ordering::SeqCst);
            object.set_state(STATE_TRIGGERED);
            object.queue.notify_all();
        }
    }

    /// Removes wait objects belonging to `owner`.
    ///
    /// With a handle, only that object is removed; with `None`, every object
    /// of the owner goes (the per-owner teardown path). Objects with live
    /// sleepers are marked for deletion, woken, and drained with a bounded
    /// backoff. If the drain expires the storage is intentionally left to
    /// the remaining sleeper references instead of being reclaimed here.
    pub fn cancel(&self, owner: OwnerHandle, handle: Option<WaitHandle>) -> CanFail<ApiStatus> {
        let mut removed_any = false;

        loop {
            let mut guard = self.lock();

            let position = guard.iter().position(|(entry_handle, object)| {
                object.owner == owner
                    && handle.map_or(true, |wanted| *entry_handle == wanted)
            });

            let Some(position) = position else {
                return if removed_any {
                    Ok(())
                } else {
                    Err(ApiStatus::Failed)
                };
            };

            let (entry_handle, object) = guard.remove(position);
            removed_any = true;

            debug!(target: "plxcore::intr", "removing wait object {:?}", entry_handle);

            let mut drained = true;
            if object.sleepers.load(Ordering::SeqCst) != 0 {
                debug!(
                    target: "plxcore::intr",
                    "wait object {:?} is pending in another thread, forcing wake up",
                    entry_handle
                );

                object.set_state(STATE_MARKED_FOR_DELETE);
                object.queue.notify_all();
                drop(guard);

                let mut rounds = DRAIN_MAX_ROUNDS;
                while rounds != 0 && object.sleepers.load(Ordering::SeqCst) != 0 {
                    std::thread::sleep(Duration::from_millis(DRAIN_ROUND_MS));
                    rounds -= 1;
                }

                drained = object.sleepers.load(Ordering::SeqCst) == 0;
            } else {
                drop(guard);
            }

            if !drained {
                error!(
                    target: "plxcore::intr",
                    "timeout waiting for pending thread, wait object {:?} storage leaked",
                    entry_handle
                );
            }

            if handle.is_some() {
                return Ok(());
            }
        }
    }

    /// Number of registered objects, for teardown checks.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lookup(
    entries: &[(WaitHandle, Arc<WaitObject>)],
    handle: WaitHandle,
) -> Option<Arc<WaitObject>> {
    entries
        .iter()
        .find(|(entry_handle, _)| *entry_handle == handle)
        .map(|(_, object)| Arc::clone(object))
}
