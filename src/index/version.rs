//! Per-vertex seqlock versions guarding partition edge lists.
//!
//! An even version means the vertex is free, odd means a writer holds it.
//! Writers move even to odd on `acquire` and odd to even on `release`;
//! any other transition is a build-logic bug and reported as a protocol
//! violation. Readers snapshot the version around their read and retry if
//! a writer was active or finished in between.

use std::sync::atomic::{AtomicU64, Ordering, fence};

use crate::error::{IndexError, IndexResult};

#[derive(Debug)]
pub struct VersionGuard {
    versions: Box<[AtomicU64]>,
}

impl VersionGuard {
    pub fn new(vertices: usize) -> Self {
        Self {
            versions: (0..vertices).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Current version of `vertex`.
    pub fn version(&self, vertex: usize) -> u64 {
        self.versions[vertex].load(Ordering::Acquire)
    }

    /// Takes exclusive write access to `vertex`.
    pub fn acquire(&self, vertex: usize) -> IndexResult<()> {
        let slot = &self.versions[vertex];
        let current = slot.load(Ordering::Relaxed);
        if current & 1 == 1 {
            return Err(IndexError::protocol(format!(
                "vertex {vertex} acquired while already held (version {current})"
            )));
        }
        slot.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
            .map_err(|actual| {
                IndexError::protocol(format!(
                    "vertex {vertex} changed from version {current} to {actual} during acquire"
                ))
            })?;
        // Data stores after this point must not become visible before the odd version.
        fence(Ordering::Release);
        Ok(())
    }

    /// Gives up write access to `vertex`.
    pub fn release(&self, vertex: usize) -> IndexResult<()> {
        let slot = &self.versions[vertex];
        let current = slot.load(Ordering::Relaxed);
        if current & 1 == 0 {
            return Err(IndexError::protocol(format!(
                "vertex {vertex} released without acquire (version {current})"
            )));
        }
        slot.compare_exchange(current, current + 1, Ordering::Release, Ordering::Relaxed)
            .map_err(|actual| {
                IndexError::protocol(format!(
                    "vertex {vertex} changed from version {current} to {actual} during release"
                ))
            })?;
        Ok(())
    }

    /// Runs `read` until it observes no concurrent writer.
    pub fn read_consistent<T>(&self, vertex: usize, mut read: impl FnMut() -> T) -> T {
        let slot = &self.versions[vertex];
        loop {
            let before = slot.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let value = read();
            fence(Ordering::Acquire);
            if slot.load(Ordering::Relaxed) == before {
                return value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_acquire_release_cycle() {
        let guard = VersionGuard::new(3);
        guard.acquire(1).unwrap();
        assert_eq!(guard.version(1), 1);
        guard.release(1).unwrap();
        assert_eq!(guard.version(1), 2);
        assert_eq!(guard.version(0), 0);
    }

    #[test]
    fn test_wrong_sequences_are_protocol_violations() {
        let guard = VersionGuard::new(2);
        assert!(matches!(
            guard.release(0),
            Err(IndexError::ProtocolViolation { .. })
        ));

        guard.acquire(0).unwrap();
        assert!(matches!(
            guard.acquire(0),
            Err(IndexError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_readers_never_observe_torn_pairs() {
        let guard = VersionGuard::new(1);
        let pair = [AtomicU32::new(0), AtomicU32::new(0)];

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 1..=2000u32 {
                    guard.acquire(0).unwrap();
                    pair[0].store(i, Ordering::Relaxed);
                    pair[1].store(i, Ordering::Relaxed);
                    guard.release(0).unwrap();
                }
            });
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..2000 {
                        let (a, b) = guard.read_consistent(0, || {
                            (pair[0].load(Ordering::Relaxed), pair[1].load(Ordering::Relaxed))
                        });
                        assert_eq!(a, b);
                    }
                });
            }
        });
        assert_eq!(guard.version(0), 4000);
    }
}
