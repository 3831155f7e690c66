//! Triple-buffered producer/consumer hand-off.
//!
//! An arena of exactly three slots plus a Write/Staging/Read role table
//! rotated by a small state machine. The producer (simulation thread) fills
//! the Write slot and publishes it as Staging; the consumer (render thread)
//! claims Staging as Read only when it is newer than what it already has.
//! The idle third slot absorbs one ready-but-unconsumed frame, so neither
//! thread ever stalls on the other within a tick.
//!
//! Under a sustained speed mismatch, intermediate Staging values are
//! overwritten before being read: at-most-latest-wins, no queue growth.
//! Dropped frames are silent apart from a diagnostics counter.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

/// Which arena slot currently holds which role.
///
/// Invariant: `write`, `staging` and `read` are always a permutation of
/// `{0, 1, 2}`, so the producer and consumer never touch the same slot.
#[derive(Debug)]
struct RoleTable {
    write: usize,
    staging: usize,
    read: usize,
    /// Whether the current Staging value has been claimed by the consumer
    /// (or never published). A publish over an unconsumed value is a drop.
    staging_consumed: bool,
}

/// Lock-minimal hand-off of one payload between exactly one producer and one
/// consumer thread.
///
/// Role exclusivity makes the per-slot mutexes uncontended by construction;
/// the only shared lock is the role table, held for a few loads per call.
pub struct TripleBuffer<T> {
    slots: [Mutex<T>; 3],
    roles: Mutex<RoleTable>,
    dropped: AtomicU64,
}

/// Exclusive guard over the Write-role slot (producer side).
pub struct WriteGuard<'a, T> {
    slot: MutexGuard<'a, T>,
}

impl<T> std::ops::Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.slot
    }
}

impl<T> std::ops::DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.slot
    }
}

/// Guard over the Read-role slot (consumer side).
pub struct ReadGuard<'a, T> {
    slot: MutexGuard<'a, T>,
}

impl<T> std::ops::Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.slot
    }
}

impl<T> std::ops::DerefMut for ReadGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.slot
    }
}

impl<T> TripleBuffer<T> {
    /// Build the three slots from a factory, invoked exactly three times.
    pub fn new(mut factory: impl FnMut() -> T) -> Self {
        Self {
            slots: [
                Mutex::new(factory()),
                Mutex::new(factory()),
                Mutex::new(factory()),
            ],
            roles: Mutex::new(RoleTable {
                write: 0,
                staging: 1,
                read: 2,
                staging_consumed: true,
            }),
            dropped: AtomicU64::new(0),
        }
    }

    /// Exclusive access to the Write-role slot.
    ///
    /// Producer thread only. Drop the guard before calling
    /// [`publish`](Self::publish).
    pub fn write(&self) -> WriteGuard<'_, T> {
        let index = self.roles.lock().write;
        WriteGuard {
            slot: self.slots[index].lock(),
        }
    }

    /// Exchange the Write and Staging roles, publishing the written frame.
    ///
    /// Called once per tick, after all extraction for the tick completed.
    /// If the previous Staging value was never read it is silently dropped
    /// (counted in [`dropped_frames`](Self::dropped_frames)).
    pub fn publish(&self) {
        let mut roles = self.roles.lock();
        if !roles.staging_consumed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("triple buffer: unconsumed staging frame overwritten");
        }
        let roles = &mut *roles;
        std::mem::swap(&mut roles.write, &mut roles.staging);
        roles.staging_consumed = false;
    }

    /// Claim the Staging slot as the new Read slot if `is_newer` holds for
    /// it against the current Read value; otherwise keep the previous Read.
    ///
    /// Never blocks on the producer: if nothing newer was published the
    /// consumer simply re-reads the frame it already had.
    pub fn acquire_read(&self, is_newer: impl FnOnce(&T, &T) -> bool) -> ReadGuard<'_, T> {
        let mut roles = self.roles.lock();
        {
            // The producer only ever holds the Write slot, so locking the
            // Staging and Read slots here cannot contend for long.
            let staging = self.slots[roles.staging].lock();
            let read = self.slots[roles.read].lock();
            if is_newer(&staging, &read) {
                drop(staging);
                drop(read);
                let roles = &mut *roles;
                std::mem::swap(&mut roles.staging, &mut roles.read);
                roles.staging_consumed = true;
            }
        }
        let index = roles.read;
        drop(roles);
        ReadGuard {
            slot: self.slots[index].lock(),
        }
    }

    /// Frames published but overwritten before the consumer saw them.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn role_indices(&self) -> (usize, usize, usize) {
        let roles = self.roles.lock();
        (roles.write, roles.staging, roles.read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, Copy)]
    struct Payload {
        cycle: u64,
    }

    fn newer(staging: &Payload, read: &Payload) -> bool {
        staging.cycle > read.cycle
    }

    #[test]
    fn test_roles_always_a_permutation() {
        let buffer = TripleBuffer::new(Payload::default);

        for step in 0..32u64 {
            {
                let mut frame = buffer.write();
                frame.cycle = step + 1;
            }
            buffer.publish();
            if step % 3 != 0 {
                let _ = buffer.acquire_read(newer);
            }

            let (w, s, r) = buffer.role_indices();
            let mut seen = [false; 3];
            seen[w] = true;
            seen[s] = true;
            seen[r] = true;
            assert!(seen.iter().all(|&x| x), "roles collapsed: {w} {s} {r}");
            assert_ne!(w, r, "write and read roles share a slot");
        }
    }

    #[test]
    fn test_first_read_returns_initial_without_publish() {
        let buffer = TripleBuffer::new(|| Payload { cycle: 0 });
        // No publish yet: must hand back the initial read-role value
        // immediately, no blocking involved.
        let read = buffer.acquire_read(newer);
        assert_eq!(read.cycle, 0);
    }

    #[test]
    fn test_monotonic_visibility() {
        let buffer = TripleBuffer::new(Payload::default);
        let mut last_seen = 0u64;

        for step in 1..=64u64 {
            {
                let mut frame = buffer.write();
                frame.cycle = step;
            }
            buffer.publish();

            if step % 2 == 0 {
                let read = buffer.acquire_read(newer);
                assert!(
                    read.cycle >= last_seen,
                    "cycle went backwards: {} after {}",
                    read.cycle,
                    last_seen
                );
                last_seen = read.cycle;
            }
        }
    }

    #[test]
    fn test_latest_wins_drops_intermediates() {
        let buffer = TripleBuffer::new(Payload::default);

        for cycle in [1u64, 2, 3] {
            buffer.write().cycle = cycle;
            buffer.publish();
        }

        let read = buffer.acquire_read(newer);
        assert_eq!(read.cycle, 3, "only the latest publish is observable");
        drop(read);
        assert_eq!(buffer.dropped_frames(), 2);
    }

    #[test]
    fn test_stale_staging_not_reacquired() {
        let buffer = TripleBuffer::new(Payload::default);
        buffer.write().cycle = 1;
        buffer.publish();

        let first = buffer.acquire_read(newer);
        assert_eq!(first.cycle, 1);
        drop(first);

        // Nothing new published: read role keeps the same frame.
        let second = buffer.acquire_read(newer);
        assert_eq!(second.cycle, 1);
        drop(second);
        assert_eq!(buffer.dropped_frames(), 0);
    }

    #[test]
    fn test_two_thread_handoff() {
        use std::sync::Arc;

        let buffer = Arc::new(TripleBuffer::new(Payload::default));
        let producer_buffer = Arc::clone(&buffer);

        let producer = std::thread::spawn(move || {
            for cycle in 1..=500u64 {
                producer_buffer.write().cycle = cycle;
                producer_buffer.publish();
            }
        });

        let mut last_seen = 0u64;
        for _ in 0..500 {
            let read = buffer.acquire_read(newer);
            assert!(read.cycle >= last_seen);
            last_seen = read.cycle;
        }

        producer.join().unwrap();
        let read = buffer.acquire_read(newer);
        assert_eq!(read.cycle, 500);
    }
}
