//! Single-writer-per-key lock table.
//!
//! Each business key maps to its own mutex, so different keys proceed in
//! parallel while two operations on the same key are serialized. The table
//! lock is only held long enough to fetch or create a key's entry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct KeyLocks {
    table: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut table = self.table.lock();
        match table.get(key) {
            Some(lock) => Arc::clone(lock),
            None => {
                let lock = Arc::new(Mutex::new(()));
                table.insert(key.to_string(), Arc::clone(&lock));
                lock
            }
        }
    }

    /// Run `f` while holding `key`'s lock. With a timeout, returns `None` if
    /// the lock could not be acquired in time.
    pub fn with_key<R>(
        &self,
        key: &str,
        timeout: Option<Duration>,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        let lock = self.entry(key);
        let _guard = match timeout {
            Some(t) => lock.try_lock_for(t)?,
            None => lock.lock(),
        };
        Some(f())
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_same_key_times_out_while_held() {
        let locks = Arc::new(KeyLocks::new());
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let l = Arc::clone(&locks);
        let holder = thread::spawn(move || {
            l.with_key("C1", None, || {
                held_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        });

        held_rx.recv().unwrap();
        assert!(locks
            .with_key("C1", Some(Duration::from_millis(20)), || ())
            .is_none());
        // Other keys are independent.
        assert_eq!(locks.with_key("C2", Some(Duration::from_millis(20)), || 7), Some(7));

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(locks.with_key("C1", Some(Duration::from_millis(20)), || 1), Some(1));
        assert_eq!(locks.len(), 2);
    }
}
