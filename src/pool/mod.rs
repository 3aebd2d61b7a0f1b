//! Connection Pool (spec §4.D). Bounded per-host concurrency, connection
//! reuse, first-connect coalescing and background idle reaping.
//!
//! Coalescing design (see SPEC_FULL §13.1): at most one connect attempt is
//! ever in flight for a given HostKey. Callers that can't be served from
//! idle immediately enqueue as FIFO waiters; a single background "grow"
//! task per host drains that queue one connect at a time. When demand can
//! be met by Transports already connected or freed by earlier waiters, no
//! redundant connect happens — N concurrent first-connect requests against
//! a host with room for only one Transport produce exactly one underlying
//! authentication attempt. Concurrent requests that genuinely need distinct
//! Transports at the same time (up to `per_host_max`) still connect once
//! per Transport, one at a time, never two connects in flight together.

pub mod transport;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::{oneshot, Mutex};

use crate::error::{HubError, HubResult};
use crate::model::{ConnectOptions, Credential, HostKey};
use transport::{Connector, Transport};

struct IdleTransport {
    transport: Arc<dyn Transport>,
    last_used: Instant,
}

struct Waiter {
    tx: oneshot::Sender<HubResult<Arc<dyn Transport>>>,
    credential: Credential,
}

#[derive(Default)]
struct PoolEntryState {
    idle: VecDeque<IdleTransport>,
    in_use: usize,
    connecting: bool,
    waiters: VecDeque<Waiter>,
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    entries: Mutex<HashMap<HostKey, PoolEntryState>>,
    per_host_max: usize,
    idle_ttl: Duration,
    connect_options: ConnectOptions,
    shutting_down: AtomicBool,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, per_host_max: usize, idle_ttl: Duration, connect_options: ConnectOptions) -> Arc<Self> {
        Arc::new(Self {
            connector,
            entries: Mutex::new(HashMap::new()),
            per_host_max: per_host_max.max(1),
            idle_ttl,
            connect_options,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Leases a Transport for `key`, connecting (or waiting for a connect)
    /// as needed. See spec §4.D steps 1-3.
    pub async fn lease(self: &Arc<Self>, key: HostKey, credential: Credential) -> HubResult<Lease> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(HubError::PoolShuttingDown);
        }

        let immediate = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(key.clone()).or_default();
            if entry.waiters.is_empty() {
                if let Some(idle) = entry.idle.pop_front() {
                    entry.in_use += 1;
                    Some(idle.transport)
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some(transport) = immediate {
            return Ok(self.make_lease(key, transport));
        }

        let rx = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(key.clone()).or_default();
            let (tx, rx) = oneshot::channel();
            entry.waiters.push_back(Waiter { tx, credential });
            rx
        };
        self.kick_grow(key.clone());

        match rx.await {
            Ok(Ok(transport)) => Ok(self.make_lease(key, transport)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HubError::Cancelled),
        }
    }

    fn make_lease(self: &Arc<Self>, key: HostKey, transport: Arc<dyn Transport>) -> Lease {
        Lease { pool: self.clone(), key, transport: Some(transport) }
    }

    fn kick_grow(self: &Arc<Self>, key: HostKey) {
        let pool = self.clone();
        tokio::spawn(async move { pool.grow(key).await });
    }

    /// Services the waiter queue for `key` one connect at a time. Returns
    /// immediately (a no-op) if another grow task already owns this host's
    /// connecting flag, or if there is nothing left to do.
    async fn grow(self: Arc<Self>, key: HostKey) {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                self.fail_all_waiters(&key, HubError::PoolShuttingDown).await;
                return;
            }

            let credential = {
                let mut entries = self.entries.lock().await;
                let entry = entries.entry(key.clone()).or_default();
                if entry.connecting || entry.waiters.is_empty() || entry.in_use >= self.per_host_max {
                    return;
                }
                entry.connecting = true;
                entry.waiters.front().expect("checked non-empty above").credential.clone()
            };

            let result = self.connect_with_retry(&key, &credential).await;

            let mut entries = self.entries.lock().await;
            let entry = entries.entry(key.clone()).or_default();
            entry.connecting = false;
            match result {
                Ok(transport) => {
                    entry.in_use += 1;
                    if let Some(waiter) = entry.waiters.pop_front() {
                        let _ = waiter.tx.send(Ok(transport));
                    } else {
                        // The waiter that asked for this connect was cancelled
                        // in the interim; park the new Transport as idle.
                        entry.in_use -= 1;
                        entry.idle.push_back(IdleTransport { transport, last_used: Instant::now() });
                        return;
                    }
                }
                Err(e) => {
                    let retry_remaining_waiters = if let Some(waiter) = entry.waiters.pop_front() {
                        let _ = waiter.tx.send(Err(e.shallow_clone()));
                        !entry.waiters.is_empty()
                    } else {
                        false
                    };
                    warn!("connect to {key} failed: {e}");
                    drop(entries);
                    if retry_remaining_waiters {
                        self.kick_grow(key.clone());
                    }
                    return;
                }
            }
        }
    }

    async fn connect_with_retry(&self, key: &HostKey, credential: &Credential) -> HubResult<Arc<dyn Transport>> {
        let attempts = self.connect_options.retry_count.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.connector.connect(key, credential, &self.connect_options).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    debug!("connect attempt {attempt} to {key} failed: {e}");
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.connect_options.retry_delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| HubError::Connect { host: key.clone(), message: "no connect attempts made".into() }))
    }

    async fn fail_all_waiters(&self, key: &HostKey, err: HubError) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            while let Some(waiter) = entry.waiters.pop_front() {
                let _ = waiter.tx.send(Err(err.shallow_clone()));
            }
        }
    }

    async fn release(&self, key: HostKey, transport: Arc<dyn Transport>) {
        if self.shutting_down.load(Ordering::Acquire) || transport.is_closed() {
            let _ = transport.close().await;
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(&key) {
                entry.in_use = entry.in_use.saturating_sub(1);
            }
            return;
        }

        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.clone()).or_default();
        if let Some(waiter) = entry.waiters.pop_front() {
            let _ = waiter.tx.send(Ok(transport));
        } else {
            entry.in_use = entry.in_use.saturating_sub(1);
            entry.idle.push_back(IdleTransport { transport, last_used: Instant::now() });
        }
        drop(entries);
    }

    async fn discard(self: &Arc<Self>, key: HostKey, transport: Arc<dyn Transport>) {
        let _ = transport.close().await;
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(&key) {
                entry.in_use = entry.in_use.saturating_sub(1);
            }
        }
        self.kick_grow(key);
    }

    /// Spawns the background reaper: wakes every `interval` and closes idle
    /// Transports older than `idle_ttl`. Snapshots under the lock, closes
    /// outside it (spec §5).
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if pool.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                pool.reap_once().await;
            }
        });
    }

    async fn reap_once(&self) {
        let expired: Vec<Arc<dyn Transport>> = {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            let mut out = Vec::new();
            for entry in entries.values_mut() {
                let ttl = self.idle_ttl;
                let mut keep = VecDeque::new();
                while let Some(idle) = entry.idle.pop_front() {
                    if now.duration_since(idle.last_used) > ttl {
                        out.push(idle.transport);
                    } else {
                        keep.push_back(idle);
                    }
                }
                entry.idle = keep;
            }
            out
        };
        for transport in expired {
            let _ = transport.close().await;
        }
    }

    /// Refuses new leases, cancels waiters, and closes all idle Transports.
    /// In-use Transports close naturally as their lessees release or drop
    /// them (see `release`'s shutdown check).
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let idle: Vec<Arc<dyn Transport>> = {
            let mut entries = self.entries.lock().await;
            let mut out = Vec::new();
            for entry in entries.values_mut() {
                while let Some(waiter) = entry.waiters.pop_front() {
                    let _ = waiter.tx.send(Err(HubError::PoolShuttingDown));
                }
                while let Some(idle) = entry.idle.pop_front() {
                    out.push(idle.transport);
                }
            }
            out
        };
        for transport in idle {
            let _ = transport.close().await;
        }
    }

    #[cfg(test)]
    async fn snapshot(&self, key: &HostKey) -> (usize, usize, usize) {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(e) => (e.idle.len(), e.in_use, e.waiters.len()),
            None => (0, 0, 0),
        }
    }
}

/// Exclusive borrow of a Transport. Must be released (or discarded) by the
/// holder; a forgotten Lease still returns the Transport via `Drop`.
pub struct Lease {
    pool: Arc<ConnectionPool>,
    key: HostKey,
    transport: Option<Arc<dyn Transport>>,
}

impl Lease {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.transport.as_ref().expect("transport taken")
    }

    pub fn host_key(&self) -> &HostKey {
        &self.key
    }

    pub async fn release(mut self) {
        if let Some(transport) = self.transport.take() {
            self.pool.release(self.key.clone(), transport).await;
        }
    }

    pub async fn discard(mut self) {
        if let Some(transport) = self.transport.take() {
            self.pool.discard(self.key.clone(), transport).await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            let pool = self.pool.clone();
            let key = self.key.clone();
            tokio::spawn(async move { pool.release(key, transport).await });
        }
    }
}


#[cfg(test)]
impl ConnectionPool {
    async fn reap_with_ttl_override(&self, ttl: Duration) {
        let expired: Vec<Arc<dyn Transport>> = {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            let mut out = Vec::new();
            for entry in entries.values_mut() {
                let mut keep = VecDeque::new();
                while let Some(idle) = entry.idle.pop_front() {
                    if now.duration_since(idle.last_used) >= ttl {
                        out.push(idle.transport);
                    } else {
                        keep.push_back(idle);
                    }
                }
                entry.idle = keep;
            }
            out
        };
        for transport in expired {
            let _ = transport.close().await;
        }
    }
}
