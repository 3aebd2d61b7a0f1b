//! Interactive Session Registry (spec §4.F). Long-lived shell channels
//! keyed by an opaque session id; each session pins one Transport for its
//! whole lifetime so it never returns to the idle pool while open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::{HubError, HubResult};
use crate::model::{Credential, HostKey};
use crate::pool::transport::ShellChannel;
use crate::pool::{ConnectionPool, Lease};

struct Session {
    host: HostKey,
    lease: AsyncMutex<Option<Lease>>,
    shell: Arc<dyn ShellChannel>,
    last_activity_at: std::sync::Mutex<Instant>,
    idle_ttl: Duration,
    busy: AtomicBool,
}

pub struct SendOutput {
    pub stdout: String,
    pub stderr: String,
}

pub struct SessionRegistry {
    pool: Arc<ConnectionPool>,
    sessions: AsyncMutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(pool: Arc<ConnectionPool>) -> Arc<Self> {
        Arc::new(Self { pool, sessions: AsyncMutex::new(HashMap::new()) })
    }

    pub async fn open(self: &Arc<Self>, host: HostKey, credential: Credential, idle_ttl: Duration) -> HubResult<String> {
        let lease = self.pool.lease(host.clone(), credential).await?;
        let shell = lease.transport().open_shell().await?;
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session {
            host,
            lease: AsyncMutex::new(Some(lease)),
            shell,
            last_activity_at: std::sync::Mutex::new(Instant::now()),
            idle_ttl,
            busy: AtomicBool::new(false),
        });
        self.sessions.lock().await.insert(id.clone(), session);
        Ok(id)
    }

    /// Writes `input` then drains stdout and stderr concurrently within
    /// `read_timeout`; a second concurrent `send` on the same id fails with
    /// `SessionBusy` rather than queuing (spec §5 serialization rule).
    pub async fn send(&self, session_id: &str, input: &str, read_timeout: Duration) -> HubResult<SendOutput> {
        let session = self.get(session_id).await?;

        if session.busy.swap(true, Ordering::AcqRel) {
            return Err(HubError::SessionBusy(session_id.to_string()));
        }

        let result = async {
            session.shell.write(input).await?;
            let (stdout, stderr) = tokio::join!(
                session.shell.read_stdout(read_timeout),
                session.shell.read_stderr(read_timeout),
            );
            Ok::<_, HubError>(SendOutput { stdout: stdout?, stderr: stderr? })
        }
        .await;

        session.busy.store(false, Ordering::Release);

        if result.is_ok() {
            let mut last = session.last_activity_at.lock().expect("session mutex poisoned");
            *last = Instant::now();
        }
        result
    }

    pub async fn close(&self, session_id: &str) -> HubResult<()> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id).ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?
        };
        session.shell.close().await?;
        if let Some(lease) = session.lease.lock().await.take() {
            lease.release().await;
        }
        Ok(())
    }

    pub async fn host_of(&self, session_id: &str) -> HubResult<HostKey> {
        self.get(session_id).await.map(|session| session.host.clone())
    }

    async fn get(&self, session_id: &str) -> HubResult<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.sweep_once().await;
            }
        });
    }

    async fn sweep_once(&self) {
        let expired: Vec<String> = {
            let sessions = self.sessions.lock().await;
            let now = Instant::now();
            sessions
                .iter()
                .filter(|(_, session)| {
                    let last = *session.last_activity_at.lock().expect("session mutex poisoned");
                    now.duration_since(last) > session.idle_ttl
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in expired {
            debug!("sweeping idle interactive session {id}");
            let _ = self.close(&id).await;
        }
    }

}
