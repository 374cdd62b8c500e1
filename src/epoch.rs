//! Read-side epoch for deferred destruction.
//!
//! Readers traversing shared connection tables, or calling into a behavior
//! module's `output`, enter the epoch through [`enter`]. Objects unlinked while
//! readers are inside are handed to [`defer`] and released once every reader
//! that entered before the unlink has left.
//!
//! ```rust
//! use tcp_usrreq::epoch;
//!
//! let guard = epoch::enter();
//! epoch::defer(|| println!("runs after the last reader exits"));
//! drop(guard);
//! ```

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

type Deferred = Box<dyn FnOnce() + Send>;

/// Process-wide epoch domain.
static DOMAIN: Epoch = Epoch::new();

/// An epoch domain: a generation counter, the readers of the two most
/// recent generations and the destructors waiting on them.
///
/// A destructor queued in generation `g` runs once the domain has reached
/// generation `g + 2`. The domain moves from `g` to `g + 1` only after every
/// reader of `g - 1` has left, so readers that overlap each other
/// indefinitely still let queued destructors run.
pub struct Epoch {
    generation: AtomicUsize,
    /// Readers inside the domain, by generation parity. Nested entries count
    /// once each.
    readers: [AtomicUsize; 2],
    /// Destructors with the generation they were queued in.
    deferred: Mutex<Vec<(usize, Deferred)>>,
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Epoch")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("readers", &self.reader_count())
            .field("deferred", &self.pending())
            .finish()
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

impl Epoch {
    /// Creates an empty epoch domain.
    pub const fn new() -> Self {
        Self {
            generation: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Enters a read-side section. The section ends when the guard drops.
    pub fn enter(&self) -> EpochGuard<'_> {
        loop {
            let generation = self.generation.load(Ordering::SeqCst);
            let slot = generation & 1;
            self.readers[slot].fetch_add(1, Ordering::SeqCst);

            // Counted in a slot the domain may have moved past; retry.
            if self.generation.load(Ordering::SeqCst) == generation {
                return EpochGuard { epoch: self, slot };
            }
            self.exit(slot);
        }
    }

    /// Returns `true` while at least one reader is inside the domain.
    pub fn is_active(&self) -> bool {
        self.reader_count() > 0
    }

    /// Current generation of the domain.
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::SeqCst)
    }

    /// Number of destructors still waiting for readers to leave.
    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    /// Runs `f` once no reader that could still observe the released object
    /// is inside the domain.
    ///
    /// The object `f` releases must already be unreachable for new readers.
    pub fn defer(&self, f: impl FnOnce() + Send + 'static) {
        if !self.is_active() {
            f();
            return;
        }

        let generation = self.generation();
        self.queue().push((generation, Box::new(f)));

        // The last reader may have left between the check and the push.
        self.reclaim();
    }

    fn reader_count(&self) -> usize {
        self.readers[0].load(Ordering::SeqCst) + self.readers[1].load(Ordering::SeqCst)
    }

    fn queue(&self) -> MutexGuard<'_, Vec<(usize, Deferred)>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exit(&self, slot: usize) {
        self.readers[slot].fetch_sub(1, Ordering::SeqCst);
        self.reclaim();
    }

    /// Moves to the next generation once the readers of the previous one
    /// have left, and returns the current generation.
    fn advance(&self) -> usize {
        let generation = self.generation();

        if self.readers[(generation + 1) & 1].load(Ordering::SeqCst) == 0 {
            let _ = self.generation.compare_exchange(
                generation,
                generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }

        self.generation()
    }

    fn reclaim(&self) {
        let idle = !self.is_active();
        let generation = self.advance();

        let ready: Vec<(usize, Deferred)> = {
            let mut queue = self.queue();
            let (ready, waiting) = mem::take(&mut *queue)
                .into_iter()
                .partition(|(queued, _)| idle || queued + 2 <= generation);
            *queue = waiting;
            ready
        };

        // Destructors run outside of the queue lock; they may defer more work.
        for (_, f) in ready {
            f();
        }
    }
}

/// RAII read-side section; leaving is mandatory on every path, including
/// early returns through `?`.
#[must_use = "dropping the guard immediately exits the epoch"]
pub struct EpochGuard<'a> {
    epoch: &'a Epoch,
    slot: usize,
}

impl fmt::Debug for EpochGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochGuard")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.epoch.exit(self.slot);
    }
}

/// Enters the process-wide epoch.
pub fn enter() -> EpochGuard<'static> {
    DOMAIN.enter()
}

/// Defers `f` until every reader of the process-wide epoch has left.
pub fn defer(f: impl FnOnce() + Send + 'static) {
    DOMAIN.defer(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn epoch_defer_without_readers_runs_immediately_valid() {
        let epoch = Epoch::new();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        epoch.defer(move || flag.store(true, Ordering::SeqCst));

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(epoch.pending(), 0);
    }

    #[test]
    fn epoch_defer_waits_for_last_reader_valid() {
        let epoch = Epoch::new();
        let ran = Arc::new(AtomicBool::new(false));

        let outer = epoch.enter();
        let inner = epoch.enter();

        let flag = Arc::clone(&ran);
        epoch.defer(move || flag.store(true, Ordering::SeqCst));

        assert_eq!(epoch.pending(), 1);

        drop(inner);
        assert!(!ran.load(Ordering::SeqCst));

        drop(outer);
        assert!(ran.load(Ordering::SeqCst));
        assert!(!epoch.is_active());
    }

    #[test]
    fn epoch_overlapping_readers_reclaim_valid() {
        let epoch = Epoch::new();
        let ran = Arc::new(AtomicBool::new(false));

        let mut reader = epoch.enter();

        let flag = Arc::clone(&ran);
        epoch.defer(move || flag.store(true, Ordering::SeqCst));
        assert_eq!(epoch.pending(), 1);

        // Some reader is always inside; each hands over to the next.
        for _ in 0..3 {
            let next = epoch.enter();
            drop(reader);
            reader = next;
        }

        assert!(epoch.is_active());
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(epoch.pending(), 0);
        assert!(epoch.generation() >= 2);

        drop(reader);
        assert!(!epoch.is_active());
    }

    #[test]
    fn epoch_defer_keeps_object_for_earlier_reader_valid() {
        let epoch = Epoch::new();
        let ran = Arc::new(AtomicBool::new(false));

        let early = epoch.enter();
        let flag = Arc::clone(&ran);
        epoch.defer(move || flag.store(true, Ordering::SeqCst));

        // Later readers come and go while the earlier one is still inside.
        for _ in 0..4 {
            drop(epoch.enter());
        }
        assert!(!ran.load(Ordering::SeqCst));

        drop(early);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn epoch_exit_on_early_return_valid() {
        fn fallible(epoch: &Epoch) -> Result<(), ()> {
            let _guard = epoch.enter();
            let step: Result<(), ()> = Err(());
            step?;
            Ok(())
        }

        let epoch = Epoch::new();
        assert!(fallible(&epoch).is_err());
        assert!(!epoch.is_active());
    }
}
