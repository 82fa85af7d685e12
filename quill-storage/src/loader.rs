//! Per-request batched lookup.
//!
//! A GraphQL resolution pass issues many point lookups for the same entity
//! type (the creator of every post in a listing, the requester's vote on
//! every post). [`BatchLoader`] coalesces the lookups issued during one
//! scheduling tick into a single grouped storage query and fans the results
//! back out by key identity. Loaders are constructed fresh per inbound
//! request; their result cache must never outlive the request, or stale
//! points/vote state would leak into later requests.

use crate::Storage;
use async_trait::async_trait;
use quill_core::{StorageError, User, UserId, Vote, VoteKey};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;

/// Failure of a grouped fetch, delivered identically to every caller
/// whose key was in the failed batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("Batch fetch failed: {0}")]
    FetchFailed(#[from] StorageError),
}

/// A grouped fetch over one key shape. Implementations issue exactly one
/// storage round trip for the given distinct keys and return a map keyed
/// by the original key identity; absent keys are simply not in the map.
#[async_trait]
pub trait BatchFetch: Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    async fn fetch(
        &self,
        keys: &[Self::Key],
    ) -> Result<HashMap<Self::Key, Self::Value>, StorageError>;
}

type LoadResult<V> = Result<Option<V>, BatchError>;

struct LoaderState<K, V> {
    /// Results from already-executed batches, cached for the loader's
    /// (request's) lifetime.
    completed: HashMap<K, LoadResult<V>>,
    /// Keys awaiting the next flush, with every caller's wakeup channel.
    pending: HashMap<K, Vec<oneshot::Sender<LoadResult<V>>>>,
    /// Keys whose grouped fetch is currently executing. A load racing in
    /// from another worker attaches here instead of opening a new batch,
    /// so a key hits storage at most once per loader.
    in_flight: HashMap<K, Vec<oneshot::Sender<LoadResult<V>>>>,
    has_leader: bool,
}

impl<K, V> Default for LoaderState<K, V> {
    fn default() -> Self {
        Self {
            completed: HashMap::new(),
            pending: HashMap::new(),
            in_flight: HashMap::new(),
            has_leader: false,
        }
    }
}

struct LoaderInner<F: BatchFetch> {
    fetcher: F,
    state: Mutex<LoaderState<F::Key, F::Value>>,
}

/// Micro-batch scheduler for single-key reads.
///
/// Every `load` issued before the surrounding task suspends joins the same
/// batch. The first load in a window is elected leader: it yields once
/// (letting the current tick finish enqueuing keys), then drains the batch
/// and runs the grouped fetch inside its own future. The fetch never runs
/// on a separate worker, so no load from the same task can slip past the
/// drain and split the batch. All loads of one loader must be driven by
/// the same request future, which the per-request construction guarantees.
pub struct BatchLoader<F: BatchFetch> {
    inner: Arc<LoaderInner<F>>,
}

impl<F: BatchFetch> Clone for BatchLoader<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: BatchFetch> BatchLoader<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                fetcher,
                state: Mutex::new(LoaderState::default()),
            }),
        }
    }

    /// Load the value for `key`, joining the current batch window.
    ///
    /// Returns `Ok(None)` when storage has no row for the key. Repeated
    /// loads of one key within the loader's lifetime hit the cache; the
    /// storage is queried for a given key at most once per loader.
    pub async fn load(&self, key: F::Key) -> LoadResult<F::Value> {
        let (leader, rx) = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(result) = state.completed.get(&key) {
                return result.clone();
            }

            let (tx, rx) = oneshot::channel();
            if let Some(waiters) = state.in_flight.get_mut(&key) {
                // The key's batch is already being fetched; wait on it.
                waiters.push(tx);
                (false, rx)
            } else {
                state.pending.entry(key).or_default().push(tx);
                let leader = !state.has_leader;
                state.has_leader = true;
                (leader, rx)
            }
        };

        if leader {
            // Let every load issued in the current tick register before
            // the batch closes, then fetch in this future.
            tokio::task::yield_now().await;
            Self::flush(&self.inner).await;
        }

        match rx.await {
            Ok(result) => result,
            // The flush never drops a registered sender; treat a closed
            // channel as a failed fetch all the same.
            Err(_) => Err(BatchError::FetchFailed(StorageError::QueryFailed {
                reason: "batch flush aborted".to_string(),
            })),
        }
    }

    async fn flush(inner: &LoaderInner<F>) {
        let keys: Vec<F::Key> = {
            let mut state = inner.state.lock().unwrap();
            state.has_leader = false;
            let pending = std::mem::take(&mut state.pending);
            let mut keys = Vec::with_capacity(pending.len());
            for (key, senders) in pending {
                keys.push(key.clone());
                state.in_flight.insert(key, senders);
            }
            keys
        };
        if keys.is_empty() {
            return;
        }

        tracing::trace!(batch_size = keys.len(), "executing grouped fetch");
        let outcome = inner.fetcher.fetch(&keys).await;

        let mut state = inner.state.lock().unwrap();
        match outcome {
            Ok(rows) => {
                for key in keys {
                    let senders = state.in_flight.remove(&key).unwrap_or_default();
                    let result = Ok(rows.get(&key).cloned());
                    state.completed.insert(key, result.clone());
                    for tx in senders {
                        let _ = tx.send(result.clone());
                    }
                }
            }
            Err(err) => {
                let failure = BatchError::FetchFailed(err);
                for key in keys {
                    let senders = state.in_flight.remove(&key).unwrap_or_default();
                    state.completed.insert(key, Err(failure.clone()));
                    for tx in senders {
                        let _ = tx.send(Err(failure.clone()));
                    }
                }
            }
        }
    }
}

// ============================================================================
// PRODUCTION FETCHERS
// ============================================================================

/// Grouped user lookup by id, backing the `Post.creator` resolver.
pub struct UserByIdFetcher {
    store: Arc<dyn Storage>,
}

impl UserByIdFetcher {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchFetch for UserByIdFetcher {
    type Key = UserId;
    type Value = User;

    async fn fetch(&self, keys: &[UserId]) -> Result<HashMap<UserId, User>, StorageError> {
        let users = self.store.user_get_by_ids(keys).await?;
        Ok(users.into_iter().map(|u| (u.id, u)).collect())
    }
}

/// Grouped vote lookup by (user, post), backing `Post.voteStatus`.
pub struct VoteByKeyFetcher {
    store: Arc<dyn Storage>,
}

impl VoteByKeyFetcher {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchFetch for VoteByKeyFetcher {
    type Key = VoteKey;
    type Value = Vote;

    async fn fetch(&self, keys: &[VoteKey]) -> Result<HashMap<VoteKey, Vote>, StorageError> {
        let votes = self.store.vote_get_by_keys(keys).await?;
        Ok(votes.into_iter().map(|v| (v.key(), v)).collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
