//! Concrete `Transport`/`Connector` implementation backed by
//! `async-ssh2-tokio` for the initial authenticated connect and raw `russh`
//! channels for command execution, persistent shells and SFTP — the same
//! split used for connection setup versus channel I/O elsewhere in this
//! codebase's connection-manager code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config as SshConfig, ServerCheckMethod};
use async_trait::async_trait;
use log::debug;
use russh::{ChannelMsg, Preferred};
use tokio::sync::{mpsc, Mutex};

use crate::error::{HubError, HubResult};
use crate::model::{ConnectOptions, Credential, HostKey, KnownHostsPolicy};
use crate::pool::transport::{Connector, ExecOutcome, SftpChannel, ShellChannel, Transport};

pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn server_check(policy: KnownHostsPolicy) -> ServerCheckMethod {
    match policy {
        KnownHostsPolicy::Ignore => ServerCheckMethod::NoCheck,
        KnownHostsPolicy::Warn => ServerCheckMethod::NoCheck,
        KnownHostsPolicy::Reject => ServerCheckMethod::DefaultKnownHostsFile,
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        key: &HostKey,
        credential: &Credential,
        options: &ConnectOptions,
    ) -> HubResult<Arc<dyn Transport>> {
        let auth = match credential {
            Credential::Password(password) => AuthMethod::with_password(password),
            Credential::PrivateKey { path, passphrase } => AuthMethod::with_key_file(
                path.to_string_lossy().to_string(),
                passphrase.as_deref(),
            ),
        };

        if matches!(options.known_hosts_policy, KnownHostsPolicy::Warn) {
            debug!("known_hosts_policy=warn for {key}: accepting host key without verification");
        }

        let config = SshConfig { preferred: Preferred::default(), inactivity_timeout: Some(Duration::from_secs(60)), ..Default::default() };

        let client = Client::connect_with_config(
            (key.host.clone(), key.port),
            &key.user,
            auth,
            server_check(options.known_hosts_policy),
            config,
        )
        .await
        .map_err(|e| HubError::Connect { host: key.clone(), message: e.to_string() })?;

        debug!("{key} TCP+auth successful");
        Ok(Arc::new(RusshTransport { key: key.clone(), client: Arc::new(client), closed: AtomicBool::new(false) }))
    }
}

pub struct RusshTransport {
    key: HostKey,
    client: Arc<Client>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for RusshTransport {
    fn host_key(&self) -> &HostKey {
        &self.key
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn exec(&self, command: &str, timeout: Duration) -> HubResult<ExecOutcome> {
        let result = tokio::time::timeout(timeout, self.client.execute(command))
            .await
            .map_err(|_| HubError::TimedOut { message: format!("command timed out after {timeout:?}") })?
            .map_err(|e| HubError::Execution { message: e.to_string(), exit_code: None })?;

        Ok(ExecOutcome {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: Some(result.exit_status as i32),
        })
    }

    async fn open_shell(&self) -> HubResult<Arc<dyn ShellChannel>> {
        let mut channel = self.client.get_channel().await?;
        channel.request_pty(false, "xterm", 120, 40, 0, 0, &[]).await?;
        channel.request_shell(false).await?;

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
        let (stdout_tx, stdout_rx) = mpsc::channel::<String>(256);
        let (stderr_tx, stderr_rx) = mpsc::channel::<String>(256);

        let bridge_key = self.key.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = input_rx.recv() => {
                        if channel.data(data.as_slice()).await.is_err() {
                            break;
                        }
                    }
                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { data }) => {
                                if let Ok(s) = std::str::from_utf8(&data) {
                                    if stdout_tx.send(s.to_string()).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                                if let Ok(s) = std::str::from_utf8(&data) {
                                    if stderr_tx.send(s.to_string()).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                            _ => {}
                        }
                    }
                }
            }
            debug!("{bridge_key} shell bridge task ended");
        });

        Ok(Arc::new(RusshShellChannel {
            input_tx,
            stdout_rx: Mutex::new(stdout_rx),
            stderr_rx: Mutex::new(stderr_rx),
        }))
    }

    async fn open_sftp(&self) -> HubResult<Arc<dyn SftpChannel>> {
        let channel = self.client.get_channel().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream()).await?;
        Ok(Arc::new(RusshSftpChannel { sftp }))
    }

    async fn close(&self) -> HubResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct RusshShellChannel {
    input_tx: mpsc::Sender<Vec<u8>>,
    stdout_rx: Mutex<mpsc::Receiver<String>>,
    stderr_rx: Mutex<mpsc::Receiver<String>>,
}

#[async_trait]
impl ShellChannel for RusshShellChannel {
    async fn write(&self, input: &str) -> HubResult<()> {
        self.input_tx
            .send(input.as_bytes().to_vec())
            .await
            .map_err(|_| HubError::Execution { message: "shell channel closed".into(), exit_code: None })
    }

    async fn read_stdout(&self, timeout: Duration) -> HubResult<String> {
        drain_for(&self.stdout_rx, timeout).await
    }

    async fn read_stderr(&self, timeout: Duration) -> HubResult<String> {
        drain_for(&self.stderr_rx, timeout).await
    }

    async fn close(&self) -> HubResult<()> {
        Ok(())
    }
}

/// Collects whatever text arrives within `timeout`; an empty result is not
/// an error, it just means the remote had nothing new to say (spec §4.F:
/// stderr must never backpressure stdout consumption, so each stream is
/// drained independently against its own deadline).
async fn drain_for(rx: &Mutex<mpsc::Receiver<String>>, timeout: Duration) -> HubResult<String> {
    let mut rx = rx.lock().await;
    let mut out = String::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(chunk)) => out.push_str(&chunk),
            Ok(None) => break,
            Err(_) => break,
        }
    }
    Ok(out)
}

struct RusshSftpChannel {
    sftp: russh_sftp::client::SftpSession,
}

#[async_trait]
impl SftpChannel for RusshSftpChannel {
    async fn size(&self, path: &str) -> HubResult<Option<u64>> {
        match self.sftp.metadata(path).await {
            Ok(attrs) => Ok(attrs.size),
            Err(russh_sftp::client::error::Error::Status(status))
                if status.status_code == russh_sftp::protocol::StatusCode::NoSuchFile =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> HubResult<Vec<u8>> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        let mut file = self.sftp.open(path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> HubResult<()> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};
        let mut file = self
            .sftp
            .open_with_flags(
                path,
                russh_sftp::protocol::OpenFlags::CREATE | russh_sftp::protocol::OpenFlags::WRITE,
            )
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> HubResult<()> {
        self.sftp.rename(from, to).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> HubResult<()> {
        self.sftp.remove_file(path).await?;
        Ok(())
    }
}
