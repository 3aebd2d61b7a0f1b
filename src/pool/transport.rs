//! Abstractions the pool depends on instead of a concrete SSH library, so
//! the lease/release/coalescing machinery in `pool::mod` can be exercised
//! with an injected, counting test double (spec §8's coalescing property).

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::HubResult;
use crate::model::{ConnectOptions, Credential, HostKey};

/// One raw command execution, independent of a persistent shell.
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// A persistent interactive shell channel opened on a Transport.
#[async_trait]
pub trait ShellChannel: Send + Sync {
    async fn write(&self, input: &str) -> HubResult<()>;
    /// Reads whatever output is available within `timeout`; an empty string
    /// is a valid (non-error) result when the remote has nothing new to say.
    async fn read_stdout(&self, timeout: Duration) -> HubResult<String>;
    async fn read_stderr(&self, timeout: Duration) -> HubResult<String>;
    async fn close(&self) -> HubResult<()>;
}

/// Block-wise SFTP I/O primitive, addressed by offset (pread/pwrite style)
/// so the transfer engine doesn't need to hold a file handle across a loop.
#[async_trait]
pub trait SftpChannel: Send + Sync {
    async fn size(&self, path: &str) -> HubResult<Option<u64>>;
    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> HubResult<Vec<u8>>;
    async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> HubResult<()>;
    async fn rename(&self, from: &str, to: &str) -> HubResult<()>;
    async fn remove(&self, path: &str) -> HubResult<()>;
}

/// An authenticated SSH channel factory owned by the pool (spec GLOSSARY).
#[async_trait]
pub trait Transport: Send + Sync {
    fn host_key(&self) -> &HostKey;
    /// True once the underlying connection is known dead; the pool never
    /// returns a closed Transport to idle.
    fn is_closed(&self) -> bool;
    async fn exec(&self, command: &str, timeout: Duration) -> HubResult<ExecOutcome>;
    async fn open_shell(&self) -> HubResult<Arc<dyn ShellChannel>>;
    async fn open_sftp(&self) -> HubResult<Arc<dyn SftpChannel>>;
    async fn close(&self) -> HubResult<()>;
}

/// Establishes new Transports. The real implementation lives in `crate::ssh`;
/// tests substitute a counting or failing double.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        key: &HostKey,
        credential: &Credential,
        options: &ConnectOptions,
    ) -> HubResult<Arc<dyn Transport>>;
}
