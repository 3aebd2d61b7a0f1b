//! Tool Dispatcher (spec §4.H / §6). Thin, stateless façade mapping the 14
//! external tool names onto the Command Executor, Session Registry and
//! Transfer Engine; normalizes every error into the uniform envelope.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::{ErrorEnvelope, HubError, HubResult};
use crate::executor::CommandExecutor;
use crate::interactive::SessionRegistry;
use crate::keystore::Keystore;
use crate::model::{
    CacheHint, Credential, HashAlgorithm, HostKey, ShapingSpec, TransferDirection, TransferJob,
};
use crate::pool::ConnectionPool;
use crate::pool::transport::{SftpChannel, Transport};
use crate::transfer::TransferEngine;

/// Shared connection arguments accepted by every execution/file/directory
/// tool: how to reach the host and which credential to use.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct Target {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl Target {
    fn host_key(&self) -> HostKey {
        HostKey::new(self.host.clone(), self.port, self.user.clone())
    }

    fn inline_credential(&self) -> Option<Credential> {
        if let Some(password) = &self.password {
            return Some(Credential::Password(password.clone()));
        }
        if let Some(path) = &self.private_key_path {
            return Some(Credential::PrivateKey { path: PathBuf::from(path), passphrase: self.passphrase.clone() });
        }
        None
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AuthStoreCredentialsArgs {
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteArgs {
    #[serde(flatten)]
    pub target: Target,
    pub command: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub shaping: ShapingSpec,
    #[serde(default)]
    pub cache_hint: Option<CacheHint>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteBatchArgs {
    #[serde(flatten)]
    pub target: Target,
    pub commands: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub shaping: ShapingSpec,
    #[serde(default)]
    pub cache_hint: Option<CacheHint>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteScriptArgs {
    #[serde(flatten)]
    pub target: Target,
    pub script: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub shaping: ShapingSpec,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchContentArgs {
    #[serde(flatten)]
    pub target: Target,
    pub path: String,
    pub pattern: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionInfoArgs {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ClearCacheArgs {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FileTransferArgs {
    #[serde(flatten)]
    pub target: Target,
    pub local_path: String,
    pub remote_path: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
}

fn default_chunk_size() -> usize {
    32 * 1024
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FileInfoArgs {
    #[serde(flatten)]
    pub target: Target,
    pub remote_path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DirListArgs {
    #[serde(flatten)]
    pub target: Target,
    pub path: String,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub filter_regex: Option<String>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DirInteractiveOp {
    Open,
    Send,
    Close,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DirInteractiveArgs {
    pub op: DirInteractiveOp,
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub idle_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub read_timeout_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

impl ToolResponse {
    fn ok(result: Value) -> Self {
        Self { ok: true, result: Some(result), error: None }
    }

    fn err(error: &HubError) -> Self {
        Self { ok: false, result: None, error: Some(ErrorEnvelope::from(error)) }
    }
}

pub struct Dispatcher {
    executor: Arc<CommandExecutor>,
    sessions: Arc<SessionRegistry>,
    transfer: Arc<TransferEngine>,
    pool: Arc<ConnectionPool>,
    keystore: Arc<Keystore>,
    config: Arc<Config>,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<CommandExecutor>,
        sessions: Arc<SessionRegistry>,
        transfer: Arc<TransferEngine>,
        pool: Arc<ConnectionPool>,
        keystore: Arc<Keystore>,
        config: Arc<Config>,
    ) -> Self {
        Self { executor, sessions, transfer, pool, keystore, config }
    }

    /// Runs `tool` against `args`, returning an already-normalized envelope;
    /// no error crosses this boundary unwrapped (spec §7).
    pub async fn dispatch(&self, tool: &str, args: Value) -> ToolResponse {
        match self.run(tool, args).await {
            Ok(result) => ToolResponse::ok(result),
            Err(e) => ToolResponse::err(&e),
        }
    }

    async fn run(&self, tool: &str, args: Value) -> HubResult<Value> {
        match tool {
            "auth_store_credentials" => self.auth_store_credentials(args),
            "ssh_execute" => self.ssh_execute(args).await,
            "ssh_execute_batch" => self.ssh_execute_batch(args).await,
            "ssh_execute_script" => self.ssh_execute_script(args).await,
            "ssh_system_info" => self.ssh_system_info(args).await,
            "ssh_search_content" => self.ssh_search_content(args).await,
            "ssh_health_check" => self.ssh_health_check(args).await,
            "ssh_session_info" => self.ssh_session_info(args).await,
            "ssh_clear_cache" => self.ssh_clear_cache(args),
            "file_upload" => self.file_transfer(args, TransferDirection::Upload).await,
            "file_download" => self.file_transfer(args, TransferDirection::Download).await,
            "file_info" => self.file_info(args).await,
            "dir_list" => self.dir_list(args).await,
            "dir_interactive" => self.dir_interactive(args).await,
            other => Err(HubError::config(format!("unknown tool: {other}"))),
        }
    }

    fn parse<T: for<'de> Deserialize<'de>>(&self, args: Value) -> HubResult<T> {
        serde_json::from_value(args).map_err(|e| HubError::config(format!("invalid arguments: {e}")))
    }

    fn auth_store_credentials(&self, args: Value) -> HubResult<Value> {
        let args: AuthStoreCredentialsArgs = self.parse(args)?;
        if let Some(password) = args.password {
            self.keystore.put_password(&args.host, &args.user, password);
        } else if let Some(path) = args.private_key_path {
            self.keystore.put_private_key(&args.host, &args.user, path, args.passphrase);
        } else {
            return Err(HubError::config("either password or private_key_path must be provided"));
        }
        Ok(serde_json::json!({ "stored": true }))
    }

    async fn ssh_execute(&self, args: Value) -> HubResult<Value> {
        let args: ExecuteArgs = self.parse(args)?;
        let timeout = args.timeout_seconds.map(Duration::from_secs).unwrap_or(self.config.command_timeout());
        let result = self
            .executor
            .execute(args.target.host_key(), args.target.inline_credential(), args.command, Some(timeout), args.shaping, args.cache_hint)
            .await?;
        Ok(serde_json::to_value(result).expect("CommandResult is always serializable"))
    }

    async fn ssh_execute_batch(&self, args: Value) -> HubResult<Value> {
        let args: ExecuteBatchArgs = self.parse(args)?;
        let timeout = args.timeout_seconds.map(Duration::from_secs).unwrap_or(self.config.command_timeout());
        let results = self
            .executor
            .execute_batch(args.target.host_key(), args.target.inline_credential(), args.commands, Some(timeout), args.shaping, args.cache_hint)
            .await?;
        let envelopes: Vec<Value> = results
            .into_iter()
            .map(|r| match r {
                Ok(result) => serde_json::json!({ "ok": true, "result": result }),
                Err(e) => serde_json::json!({ "ok": false, "error": ErrorEnvelope::from(&e) }),
            })
            .collect();
        Ok(Value::Array(envelopes))
    }

    async fn ssh_execute_script(&self, args: Value) -> HubResult<Value> {
        let args: ExecuteScriptArgs = self.parse(args)?;
        let timeout = args.timeout_seconds.map(Duration::from_secs).unwrap_or(self.config.command_timeout());
        let result = self
            .executor
            .execute_script(args.target.host_key(), args.target.inline_credential(), args.script, &args.shell, Some(timeout), args.shaping)
            .await?;
        Ok(serde_json::to_value(result).expect("CommandResult is always serializable"))
    }

    async fn ssh_system_info(&self, args: Value) -> HubResult<Value> {
        let args: Target = self.parse(args)?;
        let result = self
            .executor
            .execute(args.host_key(), args.inline_credential(), "uname -a".to_string(), None, ShapingSpec::default(), None)
            .await?;
        Ok(serde_json::to_value(result).expect("CommandResult is always serializable"))
    }

    async fn ssh_search_content(&self, args: Value) -> HubResult<Value> {
        let args: SearchContentArgs = self.parse(args)?;
        let timeout = args.timeout_seconds.map(Duration::from_secs).unwrap_or(self.config.command_timeout());
        let command = format!("grep -rn -- {} {}", shell_quote(&args.pattern), shell_quote(&args.path));
        let result = self
            .executor
            .execute(args.target.host_key(), args.target.inline_credential(), command, Some(timeout), ShapingSpec::default(), None)
            .await?;
        Ok(serde_json::to_value(result).expect("CommandResult is always serializable"))
    }

    async fn ssh_health_check(&self, args: Value) -> HubResult<Value> {
        let args: Target = self.parse(args)?;
        let started = std::time::Instant::now();
        let result = self
            .executor
            .execute(args.host_key(), args.inline_credential(), "echo ok".to_string(), Some(Duration::from_secs(10)), ShapingSpec::default(), None)
            .await?;
        let latency_ms = started.elapsed().as_millis() as u64;
        Ok(serde_json::json!({ "healthy": result.exit_code == Some(0), "latency_ms": latency_ms }))
    }

    async fn ssh_session_info(&self, args: Value) -> HubResult<Value> {
        let args: SessionInfoArgs = self.parse(args)?;
        match args.session_id {
            Some(id) => {
                let host = self.sessions.host_of(&id).await?;
                Ok(serde_json::json!({ "session_id": id, "host": host.to_string() }))
            }
            None => Ok(serde_json::json!({ "sessions": "per-session detail requires session_id" })),
        }
    }

    fn ssh_clear_cache(&self, args: Value) -> HubResult<Value> {
        let args: ClearCacheArgs = self.parse(args)?;
        match args.host {
            Some(host) => {
                let user = args.user.ok_or_else(|| HubError::config("user is required when host is set"))?;
                self.executor.clear_cache(Some(&HostKey::new(host, args.port, user)));
            }
            None => self.executor.clear_cache(None),
        }
        Ok(serde_json::json!({ "cleared": true }))
    }

    async fn file_transfer(&self, args: Value, direction: TransferDirection) -> HubResult<Value> {
        let args: FileTransferArgs = self.parse(args)?;
        let credential = args.target.inline_credential().ok_or_else(|| {
            HubError::AuthFailure { host: args.target.host_key(), message: "no credential supplied".into() }
        })?;
        let lease = self.pool.lease(args.target.host_key(), credential).await?;
        let job = TransferJob {
            direction,
            local_path: args.local_path,
            remote_path: args.remote_path,
            chunk_size: args.chunk_size,
            resume: args.resume,
            hash_algorithm: args.hash_algorithm,
        };
        let result = self.transfer.run(lease.transport().as_ref(), &job).await;
        match result {
            Ok(result) => {
                lease.release().await;
                Ok(serde_json::to_value(result).expect("TransferResult is always serializable"))
            }
            Err(e) => {
                lease.release().await;
                Err(e)
            }
        }
    }

    async fn file_info(&self, args: Value) -> HubResult<Value> {
        let args: FileInfoArgs = self.parse(args)?;
        let credential = args.target.inline_credential().ok_or_else(|| {
            HubError::AuthFailure { host: args.target.host_key(), message: "no credential supplied".into() }
        })?;
        let lease = self.pool.lease(args.target.host_key(), credential).await?;
        let sftp = lease.transport().open_sftp().await?;
        let size = sftp.size(&args.remote_path).await?;
        lease.release().await;
        match size {
            Some(size) => Ok(serde_json::json!({ "exists": true, "size": size })),
            None => Ok(serde_json::json!({ "exists": false })),
        }
    }

    async fn dir_list(&self, args: Value) -> HubResult<Value> {
        let args: DirListArgs = self.parse(args)?;
        let credential = args.target.inline_credential().ok_or_else(|| {
            HubError::AuthFailure { host: args.target.host_key(), message: "no credential supplied".into() }
        })?;
        let command = format!("ls -1 -- {}", shell_quote(&args.path));
        let result = self
            .executor
            .execute(args.target.host_key(), Some(credential), command, None, ShapingSpec::default(), None)
            .await?;

        let mut entries: Vec<&str> = result.stdout.lines().collect();
        entries.sort_unstable();

        if let Some(pattern) = &args.filter_regex {
            let re = regex::Regex::new(pattern).map_err(|e| HubError::config(format!("invalid filter_regex: {e}")))?;
            entries.retain(|e| re.is_match(e));
        }

        let page = args.page.max(1);
        let start = (page - 1) * args.page_size;
        let page_entries: Vec<&str> = entries.into_iter().skip(start).take(args.page_size).collect();

        Ok(serde_json::json!({ "entries": page_entries, "page": page, "page_size": args.page_size }))
    }

    async fn dir_interactive(&self, args: Value) -> HubResult<Value> {
        let args: DirInteractiveArgs = self.parse(args)?;
        match args.op {
            DirInteractiveOp::Open => {
                let target = args.target.ok_or_else(|| HubError::config("target is required for op=open"))?;
                let credential =
                    target.inline_credential().ok_or_else(|| HubError::AuthFailure { host: target.host_key(), message: "no credential supplied".into() })?;
                let idle_ttl = Duration::from_secs(args.idle_ttl_seconds.unwrap_or(self.config.idle_connection_ttl_seconds));
                let session_id = self.sessions.open(target.host_key(), credential, idle_ttl).await?;
                Ok(serde_json::json!({ "session_id": session_id }))
            }
            DirInteractiveOp::Send => {
                let session_id = args.session_id.ok_or_else(|| HubError::config("session_id is required for op=send"))?;
                let input = args.input.ok_or_else(|| HubError::config("input is required for op=send"))?;
                let read_timeout = Duration::from_secs(args.read_timeout_seconds.unwrap_or(5));
                let output = self.sessions.send(&session_id, &input, read_timeout).await?;
                Ok(serde_json::json!({ "stdout": output.stdout, "stderr": output.stderr }))
            }
            DirInteractiveOp::Close => {
                let session_id = args.session_id.ok_or_else(|| HubError::config("session_id is required for op=close"))?;
                self.sessions.close(&session_id).await?;
                Ok(serde_json::json!({ "closed": true }))
            }
        }
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
