//! Collapses concurrent identical work into one execution.
//!
//! The first caller for a key becomes the leader: its future is wrapped in
//! [`Shared`] and registered under the key. Callers arriving while it runs
//! await the same shared future and observe the same outcome, success or
//! failure. The registry only holds a weak handle, so once every caller has
//! gone away the work is dropped and cancelled.

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::CacheKey;

struct Slot<T> {
    id: u64,
    work: WeakShared<BoxFuture<'static, T>>,
}

type Slots<T> = Arc<Mutex<HashMap<CacheKey, Slot<T>>>>;

fn lock<T>(slots: &Mutex<HashMap<CacheKey, Slot<T>>>) -> MutexGuard<'_, HashMap<CacheKey, Slot<T>>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a slot once its work resolves or is dropped
struct SlotGuard<T> {
    slots: Slots<T>,
    key: CacheKey,
    id: u64,
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        if slots.get(&self.key).is_some_and(|slot| slot.id == self.id) {
            slots.remove(&self.key);
        }
    }
}

/// Whether a caller started the work or joined it
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Leader,
    Follower,
}

pub struct SingleFlight<T> {
    slots: Slots<T>,
    next_id: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `make()` unless work for `key` is already in flight, in which
    /// case wait for that work instead
    pub async fn run<F>(&self, key: &CacheKey, make: impl FnOnce() -> F) -> (T, Role)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (work, role) = self.join_or_start(key, make);
        (work.await, role)
    }

    fn join_or_start<F>(
        &self,
        key: &CacheKey,
        make: impl FnOnce() -> F,
    ) -> (Shared<BoxFuture<'static, T>>, Role)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut slots = lock(&self.slots);

        if let Some(work) = slots.get(key).and_then(|slot| slot.work.upgrade()) {
            return (work, Role::Follower);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = SlotGuard {
            slots: self.slots.clone(),
            key: key.clone(),
            id,
        };
        let inner = make();
        let work = async move {
            let _guard = guard;
            inner.await
        }
        .boxed()
        .shared();

        if let Some(weak) = work.downgrade() {
            slots.insert(key.clone(), Slot { id, work: weak });
        }
        (work, Role::Leader)
    }

    /// Number of keys with work in flight
    pub fn in_flight(&self) -> usize {
        lock(&self.slots).len()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::types::TenantContext;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn key(source: &str) -> CacheKey {
        CacheKey::compute(&TenantContext::new("t1"), &Query::new(source), 10, 0).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flight = Arc::new(SingleFlight::<Result<u32, String>>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run(&key("orders"), || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (value, role) = handle.await.unwrap();
            assert_eq!(value, Ok(7));
            if role == Role::Leader {
                leaders += 1;
            }
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_then_forgotten() {
        let flight = SingleFlight::<Result<u32, String>>::new();

        let (first, _) = flight
            .run(&key("orders"), || async { Err("down".to_string()) })
            .await;
        assert_eq!(first, Err("down".to_string()));
        assert_eq!(flight.in_flight(), 0);

        let (second, role) = flight.run(&key("orders"), || async { Ok(1) }).await;
        assert_eq!(second, Ok(1));
        assert_eq!(role, Role::Leader);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_collapse() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let (orders, events) = (key("orders"), key("events"));

        let a = {
            let runs = runs.clone();
            flight.run(&orders, move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                1
            })
        };
        let b = {
            let runs = runs.clone();
            flight.run(&events, move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                2
            })
        };

        let ((x, _), (y, _)) = tokio::join!(a, b);
        assert_eq!((x, y), (1, 2));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_work_is_dropped() {
        let flight = SingleFlight::<u32>::new();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            flight.run(&key("orders"), || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                1
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(flight.in_flight(), 0);

        let (value, role) = flight.run(&key("orders"), || async { 2 }).await;
        assert_eq!((value, role), (2, Role::Leader));
    }
}
