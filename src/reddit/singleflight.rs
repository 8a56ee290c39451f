//! Keyed single-flight coordination
//!
//! Serializes concurrent executions of the same logical operation: the
//! first arriver for a key drives the work, late arrivers await and receive
//! a clone of the same result. The entry is removed as soon as the work
//! completes, so the next call after completion runs fresh.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::broadcast;

/// A group of single-flight keys.
pub struct Group<K, V> {
    inflight: Mutex<HashMap<K, broadcast::Sender<V>>>,
}

enum Role<V> {
    Leader,
    Follower(broadcast::Receiver<V>),
}

impl<K, V> Group<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `make` for `key`, deduplicating concurrent callers.
    ///
    /// The mutex is only held to register or look up the in-flight entry,
    /// never across an await. If the leader is cancelled before publishing
    /// a result, followers restart the election rather than hang.
    pub async fn work<F, Fut>(&self, key: K, make: F) -> V
    where
        F: Fn() -> Fut,
        Fut: Future<Output = V>,
    {
        loop {
            let role = {
                let mut inflight = self.inflight.lock().expect("singleflight mutex poisoned");
                match inflight.get(&key) {
                    Some(sender) => Role::Follower(sender.subscribe()),
                    None => {
                        let (sender, _) = broadcast::channel(1);
                        inflight.insert(key.clone(), sender);
                        Role::Leader
                    }
                }
            };

            match role {
                Role::Leader => {
                    let mut guard = LeaderGuard {
                        group: self,
                        key: &key,
                        done: false,
                    };

                    let value = make().await;

                    let sender = guard.finish();
                    if let Some(sender) = sender {
                        // Followers subscribed while the entry was present;
                        // a send with no live receivers is fine.
                        let _ = sender.send(value.clone());
                    }
                    return value;
                }
                Role::Follower(mut receiver) => match receiver.recv().await {
                    Ok(value) => return value,
                    // Leader dropped without publishing; elect again.
                    Err(_) => continue,
                },
            }
        }
    }
}

impl<K, V> Default for Group<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the in-flight entry if the leader future is dropped before it
/// publishes a result, so followers re-elect instead of hanging.
struct LeaderGuard<'a, K: Eq + Hash, V> {
    group: &'a Group<K, V>,
    key: &'a K,
    done: bool,
}

impl<K: Eq + Hash, V> LeaderGuard<'_, K, V> {
    fn finish(&mut self) -> Option<broadcast::Sender<V>> {
        self.done = true;
        let mut inflight = self
            .group
            .inflight
            .lock()
            .expect("singleflight mutex poisoned");
        inflight.remove(self.key)
    }
}

impl<K: Eq + Hash, V> Drop for LeaderGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(mut inflight) = self.group.inflight.lock() {
            inflight.remove(self.key);
        }
    }
}
