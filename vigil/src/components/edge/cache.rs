use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Instant;

/// A cached value and when it arrived.
#[derive(Clone, Debug, PartialEq)]
pub struct Stamped<T> {
    pub value: T,
    /// Wall clock arrival time, for display.
    pub received_at: DateTime<Utc>,
    /// Monotonic arrival time, for comparing caches.
    pub arrival: Instant,
}

/// Single slot store holding the most recently written value. Writes
/// always overwrite, in arrival order, whatever timestamp the value
/// carries. Readers get their own copy.
#[derive(Debug)]
pub struct LatestValueCache<T> {
    slot: Mutex<Option<Stamped<T>>>,
}

impl<T> Default for LatestValueCache<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T: Clone> LatestValueCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached value.
    pub fn put(&self, value: T) {
        let stamped = Stamped {
            value,
            received_at: Utc::now(),
            arrival: Instant::now(),
        };
        *self.slot.lock() = Some(stamped);
    }

    /// Copy of the latest value, `None` if nothing has been written yet.
    pub fn get(&self) -> Option<T> {
        self.slot.lock().as_ref().map(|stamped| stamped.value.clone())
    }

    /// Copy of the latest value with its arrival times.
    pub fn snapshot(&self) -> Option<Stamped<T>> {
        self.slot.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
    };

    #[test]
    fn test_empty_until_written() {
        let cache = LatestValueCache::<String>::new();
        assert!(cache.is_empty());
        assert_eq!(cache.get(), None);

        cache.put("first".to_string());
        cache.put("second".to_string());
        assert_eq!(cache.get().as_deref(), Some("second"));
    }

    #[test]
    fn test_reader_copy_is_independent() {
        let cache = LatestValueCache::new();
        cache.put(vec![1, 2, 3]);
        let mut copy = cache.get().unwrap();
        copy.push(4);
        assert_eq!(cache.get().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_read_after_write_sees_new_value() {
        let cache = LatestValueCache::new();
        for i in 0..100 {
            cache.put(i);
            assert_eq!(cache.get(), Some(i));
        }
        let first = cache.snapshot().unwrap();
        cache.put(100);
        assert!(cache.snapshot().unwrap().arrival >= first.arrival);
    }

    #[test]
    fn test_snapshot_isolation() {
        // Both fields are always written together, a torn read would see
        // them differ.
        let cache = Arc::new(LatestValueCache::new());
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let cache = cache.clone();
            let done = done.clone();
            thread::spawn(move || {
                for i in 0..20_000u64 {
                    cache.put((i, format!("{i}")));
                }
                done.store(true, Ordering::Release);
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let done = done.clone();
                thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        if let Some((number, text)) = cache.get() {
                            assert_eq!(number.to_string(), text);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(cache.get(), Some((19_999, "19999".to_string())));
    }
}
