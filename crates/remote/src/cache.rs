//! Partition-aware cache of communication clients.
//!
//! Layout is partition id -> (address, listener) -> entry. Every entry is guarded by its own
//! async mutex, and a client is only ever created while that mutex is held, so a given
//! (partition, address, listener) triple has at most one live client at a time.
//!
//! Eviction is explicit: a periodic sweep drops entries whose client is not referenced
//! outside the cache and has been idle longer than the configured timeout. Entries whose
//! lock is contended are skipped until the next sweep, and partitions left without entries
//! are only removed by the sweep after the one that emptied them.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::{ClientError, RemoteError, RemoteErrorKind},
    resolver::{PartitionId, PartitionKey, PartitionResolver, ReplicaSelector, ResolvedPartition},
    retry::{ExceptionHandler, RetrySettings, TransportExceptionHandler},
};

/// Creates the connection objects held by the cache.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    async fn create_client(&self, address: &str) -> Result<Self::Client, RemoteError>;

    /// Checked on every cache hit, an invalid client is replaced.
    fn is_client_valid(&self, _client: &Self::Client) -> bool {
        true
    }
}

/// A client handed out by the cache together with the routing it was resolved from.
pub struct ResolvedClient<C> {
    pub client: Arc<C>,
    pub partition: ResolvedPartition,
    pub address: String,
    pub listener: String,
}

impl<C> Clone for ResolvedClient<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            partition: self.partition.clone(),
            address: self.address.clone(),
            listener: self.listener.clone(),
        }
    }
}

impl<C> fmt::Debug for ResolvedClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedClient")
            .field("partition_id", &self.partition.partition_id)
            .field("version", &self.partition.version)
            .field("address", &self.address)
            .field("listener", &self.listener)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub evicted_entries: usize,
    pub skipped_busy: usize,
    pub removed_partitions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    address: String,
    listener: String,
}

struct EntryState<C> {
    rsp: Option<ResolvedPartition>,
    client: Option<Arc<C>>,
    last_used: Instant,
    // Set by the sweep when the entry is dropped from the cache, acquirers that
    // looked the entry up before that must look it up again
    evicted: bool,
}

struct CacheEntry<C> {
    state: tokio::sync::Mutex<EntryState<C>>,
}

struct PartitionClients<C> {
    entries: HashMap<EntryKey, Arc<CacheEntry<C>>>,
    empty_since_last_sweep: bool,
}

impl<C> Default for PartitionClients<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            empty_since_last_sweep: false,
        }
    }
}

struct ResolvedSlot {
    rsp: ResolvedPartition,
    stale: bool,
}

pub struct CommunicationClientFactory<F: ClientFactory> {
    factory: F,
    resolver: Arc<dyn PartitionResolver>,
    handlers: Vec<Arc<dyn ExceptionHandler>>,
    settings: RetrySettings,
    resolved: Mutex<HashMap<PartitionKey, ResolvedSlot>>,
    clients: Mutex<HashMap<PartitionId, PartitionClients<F::Client>>>,
}

impl<F: ClientFactory> fmt::Debug for CommunicationClientFactory<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommunicationClientFactory")
            .field("resolver", &self.resolver)
            .field("handlers", &self.handlers)
            .field("settings", &self.settings)
            .finish()
    }
}

impl<F: ClientFactory> CommunicationClientFactory<F> {
    pub fn new(factory: F, resolver: Arc<dyn PartitionResolver>, settings: RetrySettings) -> Self {
        Self {
            factory,
            resolver,
            handlers: vec![Arc::new(TransportExceptionHandler)],
            settings,
            resolved: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_exception_handlers(mut self, handlers: Vec<Arc<dyn ExceptionHandler>>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    pub fn exception_handlers(&self) -> &[Arc<dyn ExceptionHandler>] {
        &self.handlers
    }

    /// Returns the cached client for the replica chosen by `selector`, creating it if needed.
    pub async fn get_client(
        &self,
        key: &PartitionKey,
        selector: ReplicaSelector,
        listener: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedClient<F::Client>, ClientError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            let partition = self.resolve(key, cancel).await.map_err(ClientError::Remote)?;
            let address = partition
                .select(selector)
                .and_then(|endpoint| endpoint.address(listener))
                .ok_or_else(|| {
                    ClientError::Remote(RemoteError::new(
                        RemoteErrorKind::EndpointNotFound,
                        format!(
                            "no {selector:?} replica with listener {listener:?} in partition {}",
                            partition.partition_id
                        ),
                    ))
                })?
                .to_owned();

            let entry = self.entry(&partition.partition_id, &address, listener);
            let mut state = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                state = entry.state.lock() => state,
            };
            if state.evicted {
                continue;
            }

            let cached = state
                .client
                .clone()
                .filter(|client| self.factory.is_client_valid(client));
            let client = match cached {
                Some(client) => client,
                None => {
                    debug!(
                        partition_id = %partition.partition_id,
                        version = partition.version,
                        address = %address,
                        "Creating communication client"
                    );
                    let client = Arc::new(
                        self.factory
                            .create_client(&address)
                            .await
                            .map_err(ClientError::Remote)?,
                    );
                    state.client = Some(client.clone());
                    client
                }
            };
            if let Some(previous) = state.rsp.as_ref()
                && previous.version != partition.version
            {
                debug!(
                    partition_id = %partition.partition_id,
                    previous_version = previous.version,
                    version = partition.version,
                    "Refreshing cached routing"
                );
            }
            state.rsp = Some(partition.clone());
            state.last_used = Instant::now();

            return Ok(ResolvedClient {
                client,
                partition,
                address,
                listener: listener.to_owned(),
            });
        }
    }

    /// Drops `resolved` from the cache and marks the partition routing as stale so the next
    /// acquisition re-resolves it. Used after non-transient failures.
    pub async fn invalidate(&self, key: &PartitionKey, resolved: &ResolvedClient<F::Client>) {
        self.mark_stale(key, Some(resolved.partition.version));

        let entry = {
            let clients = lock(&self.clients);
            clients
                .get(&resolved.partition.partition_id)
                .and_then(|partition| {
                    partition.entries.get(&EntryKey {
                        address: resolved.address.clone(),
                        listener: resolved.listener.clone(),
                    })
                })
                .cloned()
        };
        let Some(entry) = entry else {
            return;
        };

        let mut state = entry.state.lock().await;
        if state
            .client
            .as_ref()
            .is_some_and(|client| Arc::ptr_eq(client, &resolved.client))
        {
            state.client = None;
        }
    }

    /// Forces the next acquisition for `key` to re-resolve, passing the current descriptor
    /// as the stale one. With `version` set, newer descriptors are left alone.
    pub fn mark_stale(&self, key: &PartitionKey, version: Option<u64>) {
        let mut resolved = lock(&self.resolved);
        if let Some(slot) = resolved.get_mut(key)
            && version.is_none_or(|version| slot.rsp.version <= version)
        {
            slot.stale = true;
        }
    }

    /// Runs one eviction pass over the cache.
    pub fn sweep(&self) -> SweepStats {
        let now = Instant::now();
        let idle_timeout = self.settings.client_idle_timeout;
        let mut stats = SweepStats::default();
        let mut clients = lock(&self.clients);

        let before = clients.len();
        clients.retain(|_, partition| {
            !(partition.entries.is_empty() && partition.empty_since_last_sweep)
        });
        stats.removed_partitions = before - clients.len();

        for partition in clients.values_mut() {
            partition.entries.retain(|_, entry| {
                let Ok(mut state) = entry.state.try_lock() else {
                    stats.skipped_busy += 1;
                    return true;
                };
                let in_use = state
                    .client
                    .as_ref()
                    .is_some_and(|client| Arc::strong_count(client) > 1);
                let idle = now.saturating_duration_since(state.last_used) >= idle_timeout;
                if in_use || !idle {
                    return true;
                }
                state.evicted = true;
                state.client = None;
                stats.evicted_entries += 1;
                false
            });
            partition.empty_since_last_sweep = partition.entries.is_empty();
        }

        stats
    }

    /// Sweeps the cache on a randomized interval until `cancel` fires.
    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let factory = self.clone();
        tokio::spawn(async move {
            loop {
                let delay = factory.settings.next_cleanup_delay();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let stats = factory.sweep();
                debug!(
                    evicted = stats.evicted_entries,
                    skipped = stats.skipped_busy,
                    removed_partitions = stats.removed_partitions,
                    "Client cache sweep finished"
                );
            }
            info!("Client cache cleanup stopped");
        })
    }

    pub fn cached_partitions(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn cached_entries(&self) -> usize {
        lock(&self.clients)
            .values()
            .map(|partition| partition.entries.len())
            .sum()
    }

    async fn resolve(
        &self,
        key: &PartitionKey,
        cancel: &CancellationToken,
    ) -> Result<ResolvedPartition, RemoteError> {
        let previous = match lock(&self.resolved).get(key) {
            Some(slot) if !slot.stale => return Ok(slot.rsp.clone()),
            Some(slot) => Some(slot.rsp.clone()),
            None => None,
        };

        let rsp = self.resolver.resolve(key, previous.as_ref(), cancel).await?;
        if let Some(previous) = &previous {
            info!(
                partition_id = %rsp.partition_id,
                previous_version = previous.version,
                version = rsp.version,
                "Re-resolved partition"
            );
        }
        lock(&self.resolved).insert(
            key.clone(),
            ResolvedSlot {
                rsp: rsp.clone(),
                stale: false,
            },
        );
        Ok(rsp)
    }

    fn entry(
        &self,
        partition_id: &PartitionId,
        address: &str,
        listener: &str,
    ) -> Arc<CacheEntry<F::Client>> {
        let mut clients = lock(&self.clients);
        let partition = clients.entry(partition_id.clone()).or_default();
        partition
            .entries
            .entry(EntryKey {
                address: address.to_owned(),
                listener: listener.to_owned(),
            })
            .or_insert_with(|| {
                Arc::new(CacheEntry {
                    state: tokio::sync::Mutex::new(EntryState {
                        rsp: None,
                        client: None,
                        last_used: Instant::now(),
                        evicted: false,
                    }),
                })
            })
            .clone()
    }
}

// Nothing in this module panics while holding these locks
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
