//! Command Executor (spec §4.E). Orchestrates Safety Gate, Result Cache and
//! Connection Pool around a single remote execution, plus batch and script
//! variants that reuse one leased Transport across multiple channels.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::cache::ResultCache;
use crate::error::{HubError, HubResult};
use crate::keystore::Keystore;
use crate::model::{
    cache_key, CacheHint, CacheTier, CommandResult, Credential, HostKey, ShapingMode, ShapingSpec,
};
use crate::pool::ConnectionPool;
use crate::safety::{self, Classification, SafetyMode};

pub struct ExecutorConfig {
    pub default_timeout: Duration,
    pub safety_mode: SafetyMode,
}

pub struct CommandExecutor {
    pool: Arc<ConnectionPool>,
    cache: Arc<ResultCache>,
    keystore: Arc<Keystore>,
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(pool: Arc<ConnectionPool>, cache: Arc<ResultCache>, keystore: Arc<Keystore>, config: ExecutorConfig) -> Self {
        Self { pool, cache, keystore, config }
    }

    /// Resolves credentials in the order argued by spec §4.D: explicit
    /// call-site argument, then the keystore, else `AuthFailure`.
    fn resolve_credential(&self, host: &HostKey, explicit: Option<Credential>) -> HubResult<Credential> {
        if let Some(credential) = explicit {
            return Ok(credential);
        }
        self.keystore
            .get(&host.host, &host.user)
            .ok_or_else(|| HubError::AuthFailure { host: host.clone(), message: "no credential supplied and none in keystore".into() })
    }

    pub async fn execute(
        &self,
        host: HostKey,
        credential: Option<Credential>,
        command: String,
        timeout: Option<Duration>,
        shaping: ShapingSpec,
        cache_hint: Option<CacheHint>,
    ) -> HubResult<CommandResult> {
        let credential = self.resolve_credential(&host, credential)?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);

        // §4.E step order: Safety Gate first, Result Cache second.
        let classification = safety::classify(&command, self.config.safety_mode);
        if let Classification::Blocked { reason } = classification {
            return Err(HubError::SafetyBlocked { reason });
        }
        let warnings = match classification {
            Classification::Warn { reasons } => reasons,
            _ => Vec::new(),
        };

        if let Some(cached) = self.lookup_cache(&host, &command, &shaping) {
            return Ok(cached);
        }

        let lease = self.pool.lease(host.clone(), credential).await?;
        let started = Instant::now();
        let exec_result = lease.transport().exec(&command, timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match exec_result {
            Ok(outcome) => {
                lease.release().await;
                outcome
            }
            Err(HubError::TimedOut { message }) => {
                // §4.E step 5: still release the Transport on a timeout, the
                // channel itself isn't necessarily unusable.
                lease.release().await;
                return Err(HubError::TimedOut { message });
            }
            Err(other) => {
                lease.discard().await;
                return Err(other);
            }
        };

        let result = self.shape_and_maybe_cache(&host, &command, &shaping, cache_hint, outcome, duration_ms, warnings);
        Ok(result)
    }

    /// Runs `commands` sequentially against independently-opened channels on
    /// one leased Transport. Working-directory side effects are not
    /// preserved between commands, per spec.
    pub async fn execute_batch(
        &self,
        host: HostKey,
        credential: Option<Credential>,
        commands: Vec<String>,
        timeout: Option<Duration>,
        shaping: ShapingSpec,
        cache_hint: Option<CacheHint>,
    ) -> HubResult<Vec<HubResult<CommandResult>>> {
        let credential = self.resolve_credential(&host, credential)?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let lease = self.pool.lease(host.clone(), credential).await?;

        let mut results = Vec::with_capacity(commands.len());
        let mut discard = false;

        for command in commands {
            // §4.E step order: Safety Gate first, Result Cache second.
            let classification = safety::classify(&command, self.config.safety_mode);
            if let Classification::Blocked { reason } = classification {
                results.push(Err(HubError::SafetyBlocked { reason }));
                continue;
            }
            let warnings = match classification {
                Classification::Warn { reasons } => reasons,
                _ => Vec::new(),
            };

            if let Some(cached) = self.lookup_cache(&host, &command, &shaping) {
                results.push(Ok(cached));
                continue;
            }

            let started = Instant::now();
            match lease.transport().exec(&command, timeout).await {
                Ok(outcome) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    let result = self.shape_and_maybe_cache(&host, &command, &shaping, cache_hint.clone(), outcome, duration_ms, warnings);
                    results.push(Ok(result));
                }
                Err(HubError::TimedOut { message }) => {
                    results.push(Err(HubError::TimedOut { message }));
                }
                Err(other) => {
                    discard = true;
                    results.push(Err(other));
                    break;
                }
            }
        }

        if discard {
            lease.discard().await;
        } else {
            lease.release().await;
        }
        Ok(results)
    }

    /// Uploads `script` to a temp path via SFTP, executes it with `shell`,
    /// and best-effort removes the temp file afterwards regardless of the
    /// execution outcome.
    pub async fn execute_script(
        &self,
        host: HostKey,
        credential: Option<Credential>,
        script: String,
        shell: &str,
        timeout: Option<Duration>,
        shaping: ShapingSpec,
    ) -> HubResult<CommandResult> {
        let credential = self.resolve_credential(&host, credential)?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let lease = self.pool.lease(host.clone(), credential).await?;

        let remote_path = format!("/tmp/sshhub-{}.sh", Uuid::new_v4());
        let upload = async {
            let sftp = lease.transport().open_sftp().await?;
            sftp.write_chunk(&remote_path, 0, script.as_bytes()).await?;
            Ok::<_, HubError>(sftp)
        }
        .await;

        let sftp = match upload {
            Ok(sftp) => sftp,
            Err(e) => {
                lease.discard().await;
                return Err(e);
            }
        };

        let started = Instant::now();
        let exec_result = lease.transport().exec(&format!("{shell} {remote_path}"), timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let _ = sftp.remove(&remote_path).await;

        match exec_result {
            Ok(outcome) => {
                lease.release().await;
                Ok(self.shape_and_maybe_cache(&host, &script, &shaping, None, outcome, duration_ms, Vec::new()))
            }
            Err(HubError::TimedOut { message }) => {
                lease.release().await;
                Err(HubError::TimedOut { message })
            }
            Err(other) => {
                lease.discard().await;
                Err(other)
            }
        }
    }

    pub fn clear_cache(&self, host: Option<&HostKey>) {
        match host {
            Some(host) => self.cache.invalidate_host(host),
            None => self.cache.invalidate_all(),
        }
    }

    fn lookup_cache(&self, host: &HostKey, command: &str, shaping: &ShapingSpec) -> Option<CommandResult> {
        let key = cache_key(host, command, shaping);
        self.cache.get(&key).map(|mut value| {
            value.from_cache = true;
            value
        })
    }

    fn shape_and_maybe_cache(
        &self,
        host: &HostKey,
        command: &str,
        shaping: &ShapingSpec,
        cache_hint: Option<CacheHint>,
        outcome: crate::pool::transport::ExecOutcome,
        duration_ms: u64,
        warnings: Vec<String>,
    ) -> CommandResult {
        let stdout = crate::shaping::shape(&outcome.stdout, shaping);
        let stderr = crate::shaping::shape(&outcome.stderr, shaping);

        let result = CommandResult {
            stdout: stdout.text,
            stderr: stderr.text,
            exit_code: outcome.exit_code,
            duration_ms,
            truncated: stdout.truncated || stderr.truncated,
            shaping_mode_used: shaping.mode,
            from_cache: false,
            warnings: warnings.clone(),
        };

        let eligible = cache_hint.is_some() && warnings.is_empty() && result.exit_code == Some(0);
        if eligible {
            if let Some(hint) = cache_hint {
                let key = cache_key(host, command, shaping);
                let tier = hint.tier;
                let ttl = Duration::from_secs(hint.ttl_seconds.unwrap_or(60));
                self.cache.put(key, host.clone(), result.clone(), tier, ttl);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectOptions, KnownHostsPolicy};
    use crate::pool::transport::{Connector, ExecOutcome, SftpChannel, ShellChannel, Transport};
    use async_trait::async_trait;

    struct ScriptedTransport {
        key: HostKey,
        stdout: String,
        exit_code: Option<i32>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn host_key(&self) -> &HostKey {
            &self.key
        }
        fn is_closed(&self) -> bool {
            false
        }
        async fn exec(&self, _command: &str, _timeout: Duration) -> HubResult<ExecOutcome> {
            Ok(ExecOutcome { stdout: self.stdout.clone(), stderr: String::new(), exit_code: self.exit_code })
        }
        async fn open_shell(&self) -> HubResult<Arc<dyn ShellChannel>> {
            unimplemented!()
        }
        async fn open_sftp(&self) -> HubResult<Arc<dyn SftpChannel>> {
            unimplemented!()
        }
        async fn close(&self) -> HubResult<()> {
            Ok(())
        }
    }

    struct ScriptedConnector {
        stdout: String,
        exit_code: Option<i32>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, key: &HostKey, _credential: &Credential, _options: &ConnectOptions) -> HubResult<Arc<dyn Transport>> {
            Ok(Arc::new(ScriptedTransport { key: key.clone(), stdout: self.stdout.clone(), exit_code: self.exit_code }))
        }
    }

    fn make_executor(stdout: &str, exit_code: Option<i32>) -> CommandExecutor {
        let connector = Arc::new(ScriptedConnector { stdout: stdout.to_string(), exit_code });
        let options = ConnectOptions { known_hosts_policy: KnownHostsPolicy::Ignore, retry_count: 1, retry_delay: Duration::from_millis(1) };
        let pool = ConnectionPool::new(connector, 5, Duration::from_secs(300), options);
        let cache = Arc::new(ResultCache::new(32));
        let keystore = Arc::new(Keystore::new());
        CommandExecutor::new(pool, cache, keystore, ExecutorConfig { default_timeout: Duration::from_secs(5), safety_mode: SafetyMode::Standard })
    }

    #[tokio::test]
    async fn echo_executes_and_is_not_cached_without_hint() {
        let executor = make_executor("hello\n", Some(0));
        let host = HostKey::new("h1", 22, "u");
        let result = executor
            .execute(host, Some(Credential::Password("p".into())), "echo hello".into(), None, ShapingSpec::default(), None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.from_cache);
    }

    #[tokio::test]
    async fn second_call_with_cache_hint_is_served_from_cache() {
        let executor = make_executor("hello\n", Some(0));
        let host = HostKey::new("h1", 22, "u");
        let hint = CacheHint { tier: CacheTier::Static, ttl_seconds: Some(60) };

        let first = executor
            .execute(host.clone(), Some(Credential::Password("p".into())), "echo hello".into(), None, ShapingSpec::default(), Some(hint.clone()))
            .await
            .unwrap();
        assert!(!first.from_cache);

        let second = executor
            .execute(host, Some(Credential::Password("p".into())), "echo hello".into(), None, ShapingSpec::default(), Some(hint))
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.stdout, "hello\n");
    }

    #[tokio::test]
    async fn dangerous_command_is_blocked_before_any_lease() {
        let executor = make_executor("unused", Some(0));
        let host = HostKey::new("h1", 22, "u");
        let result = executor
            .execute(host, Some(Credential::Password("p".into())), "rm -rf /".into(), None, ShapingSpec::default(), None)
            .await;
        assert!(matches!(result, Err(HubError::SafetyBlocked { .. })));
    }

    #[tokio::test]
    async fn clear_cache_makes_next_call_a_miss() {
        let executor = make_executor("hello\n", Some(0));
        let host = HostKey::new("h1", 22, "u");
        let hint = CacheHint { tier: CacheTier::Dynamic, ttl_seconds: Some(60) };
        let _ = executor
            .execute(host.clone(), Some(Credential::Password("p".into())), "echo hello".into(), None, ShapingSpec::default(), Some(hint.clone()))
            .await
            .unwrap();

        executor.clear_cache(Some(&host));

        let after = executor
            .execute(host, Some(Credential::Password("p".into())), "echo hello".into(), None, ShapingSpec::default(), Some(hint))
            .await
            .unwrap();
        assert!(!after.from_cache);
    }

    #[tokio::test]
    async fn nonzero_exit_is_never_cached() {
        let executor = make_executor("boom\n", Some(1));
        let host = HostKey::new("h1", 22, "u");
        let hint = CacheHint { tier: CacheTier::Dynamic, ttl_seconds: Some(60) };
        let first = executor
            .execute(host.clone(), Some(Credential::Password("p".into())), "false".into(), None, ShapingSpec::default(), Some(hint.clone()))
            .await
            .unwrap();
        assert!(!first.from_cache);
        let second = executor
            .execute(host, Some(Credential::Password("p".into())), "false".into(), None, ShapingSpec::default(), Some(hint))
            .await
            .unwrap();
        assert!(!second.from_cache);
    }
}
