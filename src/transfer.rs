//! File Transfer Engine (spec §4.G). Chunked SFTP upload/download with
//! optional resume and hash verification; both directions write to a
//! `.part` path, verify against it, and only rename to the final
//! destination once verification passes — a hash mismatch never leaves a
//! corrupt file at the final path.

use std::path::Path;
use std::time::Duration;

use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest as Sha2Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{HubError, HubResult};
use crate::model::{HashAlgorithm, TransferDirection, TransferJob, TransferResult};
use crate::pool::transport::{SftpChannel, Transport};

pub struct TransferEngine;

impl TransferEngine {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, transport: &dyn Transport, job: &TransferJob) -> HubResult<TransferResult> {
        let sftp = transport.open_sftp().await?;
        match job.direction {
            TransferDirection::Upload => self.upload(transport, sftp.as_ref(), job).await,
            TransferDirection::Download => self.download(transport, sftp.as_ref(), job).await,
        }
    }

    async fn upload(&self, transport: &dyn Transport, sftp: &dyn SftpChannel, job: &TransferJob) -> HubResult<TransferResult> {
        let local_len = tokio::fs::metadata(&job.local_path)
            .await
            .map_err(|e| HubError::transfer(format!("cannot stat local file {}: {e}", job.local_path)))?
            .len();

        let part_path = format!("{}.part", job.remote_path);
        let mut offset = if job.resume {
            let existing = sftp.size(&part_path).await?.unwrap_or(0);
            if local_len < existing {
                return Err(HubError::transfer("resume mismatch: source is smaller than the partial destination"));
            }
            existing
        } else {
            0
        };

        let mut file = File::open(&job.local_path).await.map_err(|e| HubError::transfer(e.to_string()))?;
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(|e| HubError::transfer(e.to_string()))?;

        let mut buf = vec![0u8; job.chunk_size];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| HubError::transfer(e.to_string()))?;
            if n == 0 {
                break;
            }
            if let Err(e) = sftp.write_chunk(&part_path, offset, &buf[..n]).await {
                if !job.resume {
                    let _ = sftp.remove(&part_path).await;
                }
                return Err(e);
            }
            offset += n as u64;
        }

        // Verify against `.part` before rename, so a hash mismatch never
        // leaves a corrupt file sitting at the final destination path
        // (spec §4.G, §8 scenario 4).
        let finished = self.finish(transport, &job.local_path, &part_path, local_len, job.hash_algorithm).await;
        let result = match finished {
            Ok(result) => result,
            Err(e) => {
                if !job.resume {
                    let _ = sftp.remove(&part_path).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = sftp.rename(&part_path, &job.remote_path).await {
            if !job.resume {
                let _ = sftp.remove(&part_path).await;
            }
            return Err(e);
        }

        Ok(result)
    }

    async fn download(&self, transport: &dyn Transport, sftp: &dyn SftpChannel, job: &TransferJob) -> HubResult<TransferResult> {
        let remote_len = sftp
            .size(&job.remote_path)
            .await?
            .ok_or_else(|| HubError::transfer(format!("remote file not found: {}", job.remote_path)))?;

        let local_part = format!("{}.part", job.local_path);
        let mut offset = if job.resume && Path::new(&local_part).exists() {
            let existing = tokio::fs::metadata(&local_part).await.map_err(|e| HubError::transfer(e.to_string()))?.len();
            if remote_len < existing {
                return Err(HubError::transfer("resume mismatch: source is smaller than the partial destination"));
            }
            existing
        } else {
            0
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&local_part)
            .await
            .map_err(|e| HubError::transfer(e.to_string()))?;
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(|e| HubError::transfer(e.to_string()))?;

        while offset < remote_len {
            let want = (remote_len - offset).min(job.chunk_size as u64) as usize;
            let chunk = match sftp.read_chunk(&job.remote_path, offset, want).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    if !job.resume {
                        let _ = tokio::fs::remove_file(&local_part).await;
                    }
                    return Err(e);
                }
            };
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk).await.map_err(|e| HubError::transfer(e.to_string()))?;
            offset += chunk.len() as u64;
        }
        drop(file);

        // Verify the `.part` file before it becomes the final destination
        // path, for the same reason as the upload side.
        let finished = self.finish(transport, &local_part, &job.remote_path, remote_len, job.hash_algorithm).await;
        let result = match finished {
            Ok(result) => result,
            Err(e) => {
                if !job.resume {
                    let _ = tokio::fs::remove_file(&local_part).await;
                }
                return Err(e);
            }
        };

        tokio::fs::rename(&local_part, &job.local_path).await.map_err(|e| HubError::transfer(e.to_string()))?;

        Ok(result)
    }

    async fn finish(
        &self,
        transport: &dyn Transport,
        local_path: &str,
        remote_path: &str,
        bytes_transferred: u64,
        algorithm: HashAlgorithm,
    ) -> HubResult<TransferResult> {
        if algorithm == HashAlgorithm::None {
            return Ok(TransferResult { bytes_transferred, verified: true, local_hash: None, remote_hash: None });
        }

        let local_hash = hash_local_file(local_path, algorithm).await?;
        let remote_hash = remote_hash(transport, remote_path, algorithm).await?;
        let verified = local_hash.is_some() && local_hash == remote_hash;

        if !verified {
            return Err(HubError::transfer("hash mismatch between local and remote file"));
        }

        Ok(TransferResult { bytes_transferred, verified, local_hash, remote_hash })
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// For `Both`, combines the md5 and sha256 digests into one comparable
/// string so a single equality check still enforces that both match.
async fn hash_local_file(path: &str, algorithm: HashAlgorithm) -> HubResult<Option<String>> {
    let data = tokio::fs::read(path).await.map_err(|e| HubError::transfer(e.to_string()))?;
    Ok(Some(match algorithm {
        HashAlgorithm::Md5 => hex(&Md5::digest(&data)),
        HashAlgorithm::Sha256 => hex(&Sha256::digest(&data)),
        HashAlgorithm::Both => format!("md5={};sha256={}", hex(&Md5::digest(&data)), hex(&Sha256::digest(&data))),
        HashAlgorithm::None => return Ok(None),
    }))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Runs the remote side of hash verification over a command channel
/// (`SftpChannel` has no exec, so this goes through `Transport` directly),
/// falling back through `md5sum -> openssl dgst -> busybox md5sum` for MD5
/// per spec §9's open question; `sha256sum` is used directly for SHA-256.
async fn remote_hash(transport: &dyn Transport, path: &str, algorithm: HashAlgorithm) -> HubResult<Option<String>> {
    if algorithm == HashAlgorithm::None {
        return Ok(None);
    }
    if algorithm == HashAlgorithm::Both {
        let md5 = remote_hash_one(transport, path, HashAlgorithm::Md5).await?;
        let sha256 = remote_hash_one(transport, path, HashAlgorithm::Sha256).await?;
        return Ok(Some(format!("md5={md5};sha256={sha256}")));
    }
    Ok(Some(remote_hash_one(transport, path, algorithm).await?))
}

async fn remote_hash_one(transport: &dyn Transport, path: &str, algorithm: HashAlgorithm) -> HubResult<String> {
    let tools: &[&str] = match algorithm {
        HashAlgorithm::Sha256 => &["sha256sum"],
        _ => &["md5sum", "openssl dgst -md5", "busybox md5sum"],
    };

    for tool in tools {
        let command = format!("{tool} {path}");
        if let Ok(outcome) = transport.exec(&command, Duration::from_secs(30)).await {
            if outcome.exit_code == Some(0) {
                if let Some(digest) = outcome.stdout.split_whitespace().find(|tok| tok.len() == 32 || tok.len() == 64) {
                    return Ok(digest.to_lowercase());
                }
            }
        }
    }

    Err(HubError::transfer("no remote hashing tool available (tried md5sum, openssl dgst, busybox md5sum)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HostKey;
    use crate::pool::transport::ExecOutcome;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex;

    struct FakeSftp {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl SftpChannel for FakeSftp {
        async fn size(&self, path: &str) -> HubResult<Option<u64>> {
            Ok(self.files.lock().unwrap().get(path).map(|b| b.len() as u64))
        }
        async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> HubResult<Vec<u8>> {
            let files = self.files.lock().unwrap();
            let data = files.get(path).cloned().unwrap_or_default();
            let start = (offset as usize).min(data.len());
            let end = (start + len).min(data.len());
            Ok(data[start..end].to_vec())
        }
        async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> HubResult<()> {
            let mut files = self.files.lock().unwrap();
            let entry = files.entry(path.to_string()).or_default();
            let end = offset as usize + data.len();
            if entry.len() < end {
                entry.resize(end, 0);
            }
            entry[offset as usize..end].copy_from_slice(data);
            Ok(())
        }
        async fn rename(&self, from: &str, to: &str) -> HubResult<()> {
            let mut files = self.files.lock().unwrap();
            if let Some(data) = files.remove(from) {
                files.insert(to.to_string(), data);
            }
            Ok(())
        }
        async fn remove(&self, path: &str) -> HubResult<()> {
            self.files.lock().unwrap().remove(path);
            Ok(())
        }
    }

    /// Remote side always answers with the md5sum of whatever bytes the
    /// fake SFTP layer holds under `/remote/file.bin`, so upload/download
    /// round trips can verify without a real shell.
    struct FakeTransport {
        sftp: Arc<FakeSftp>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn host_key(&self) -> &HostKey {
            unimplemented!()
        }
        fn is_closed(&self) -> bool {
            false
        }
        async fn exec(&self, command: &str, _timeout: Duration) -> HubResult<ExecOutcome> {
            let path = command.split_whitespace().last().unwrap_or_default();
            let files = self.sftp.files.lock().unwrap();
            let data = files.get(path).cloned().unwrap_or_default();
            let digest = if command.starts_with("sha256sum") { hex(&Sha256::digest(&data)) } else { hex(&Md5::digest(&data)) };
            Ok(ExecOutcome { stdout: format!("{digest}  {path}\n"), stderr: String::new(), exit_code: Some(0) })
        }
        async fn open_shell(&self) -> HubResult<Arc<dyn crate::pool::transport::ShellChannel>> {
            unimplemented!()
        }
        async fn open_sftp(&self) -> HubResult<Arc<dyn SftpChannel>> {
            Ok(self.sftp.clone())
        }
        async fn close(&self) -> HubResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn upload_then_download_round_trips_with_sha256_verification() {
        let dir = tempfile::tempdir().unwrap();
        let local_src = dir.path().join("src.bin");
        let payload = vec![7u8; 5000];
        tokio::fs::write(&local_src, &payload).await.unwrap();

        let sftp = Arc::new(FakeSftp { files: Mutex::new(HashMap::new()) });
        let transport = FakeTransport { sftp: sftp.clone() };
        let engine = TransferEngine::new();

        let upload_job = TransferJob {
            direction: TransferDirection::Upload,
            local_path: local_src.to_string_lossy().to_string(),
            remote_path: "/remote/file.bin".into(),
            chunk_size: 1024,
            resume: false,
            hash_algorithm: HashAlgorithm::Sha256,
        };
        let uploaded = engine.run(&transport, &upload_job).await.unwrap();
        assert!(uploaded.verified);
        assert_eq!(uploaded.bytes_transferred, 5000);

        let local_dst = dir.path().join("dst.bin");
        let download_job = TransferJob {
            direction: TransferDirection::Download,
            local_path: local_dst.to_string_lossy().to_string(),
            remote_path: "/remote/file.bin".into(),
            chunk_size: 1024,
            resume: false,
            hash_algorithm: HashAlgorithm::Sha256,
        };
        let downloaded = engine.run(&transport, &download_job).await.unwrap();
        assert!(downloaded.verified);

        let round_tripped = tokio::fs::read(&local_dst).await.unwrap();
        assert_eq!(round_tripped, payload);
    }

    /// A transport whose `exec` always answers with a fixed, wrong digest,
    /// regardless of what bytes actually sit on the fake remote — used to
    /// exercise the hash-mismatch path without needing a real corrupt
    /// transfer.
    struct BadHashTransport {
        sftp: Arc<FakeSftp>,
    }

    #[async_trait]
    impl Transport for BadHashTransport {
        fn host_key(&self) -> &HostKey {
            unimplemented!()
        }
        fn is_closed(&self) -> bool {
            false
        }
        async fn exec(&self, command: &str, _timeout: Duration) -> HubResult<ExecOutcome> {
            let path = command.split_whitespace().last().unwrap_or_default();
            Ok(ExecOutcome { stdout: format!("{}  {path}\n", "0".repeat(32)), stderr: String::new(), exit_code: Some(0) })
        }
        async fn open_shell(&self) -> HubResult<Arc<dyn crate::pool::transport::ShellChannel>> {
            unimplemented!()
        }
        async fn open_sftp(&self) -> HubResult<Arc<dyn SftpChannel>> {
            Ok(self.sftp.clone())
        }
        async fn close(&self) -> HubResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn upload_hash_mismatch_leaves_no_final_file_and_removes_part_without_resume() {
        let dir = tempfile::tempdir().unwrap();
        let local_src = dir.path().join("src.bin");
        tokio::fs::write(&local_src, vec![5u8; 100]).await.unwrap();

        let sftp = Arc::new(FakeSftp { files: Mutex::new(HashMap::new()) });
        let transport = BadHashTransport { sftp: sftp.clone() };
        let engine = TransferEngine::new();

        let job = TransferJob {
            direction: TransferDirection::Upload,
            local_path: local_src.to_string_lossy().to_string(),
            remote_path: "/remote/bad.bin".into(),
            chunk_size: 1024,
            resume: false,
            hash_algorithm: HashAlgorithm::Md5,
        };

        let result = engine.run(&transport, &job).await;
        assert!(matches!(result, Err(HubError::Transfer { .. })));

        let files = sftp.files.lock().unwrap();
        assert!(!files.contains_key("/remote/bad.bin"), "final path must not exist after a hash mismatch");
        assert!(!files.contains_key("/remote/bad.bin.part"), "part file must be removed when resume is disabled");
    }

    #[tokio::test]
    async fn upload_hash_mismatch_keeps_part_file_when_resume_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let local_src = dir.path().join("src.bin");
        tokio::fs::write(&local_src, vec![5u8; 100]).await.unwrap();

        let sftp = Arc::new(FakeSftp { files: Mutex::new(HashMap::new()) });
        let transport = BadHashTransport { sftp: sftp.clone() };
        let engine = TransferEngine::new();

        let job = TransferJob {
            direction: TransferDirection::Upload,
            local_path: local_src.to_string_lossy().to_string(),
            remote_path: "/remote/bad.bin".into(),
            chunk_size: 1024,
            resume: true,
            hash_algorithm: HashAlgorithm::Md5,
        };

        let result = engine.run(&transport, &job).await;
        assert!(matches!(result, Err(HubError::Transfer { .. })));

        let files = sftp.files.lock().unwrap();
        assert!(!files.contains_key("/remote/bad.bin"), "final path must not exist after a hash mismatch");
        assert!(files.contains_key("/remote/bad.bin.part"), "part file must survive for a later resume");
    }

    #[tokio::test]
    async fn resume_mismatch_when_source_is_smaller_than_partial_destination() {
        let dir = tempfile::tempdir().unwrap();
        let local_src = dir.path().join("small.bin");
        tokio::fs::write(&local_src, vec![1u8; 10]).await.unwrap();

        let sftp = Arc::new(FakeSftp { files: Mutex::new(HashMap::new()) });
        sftp.files.lock().unwrap().insert("/remote/file.bin.part".into(), vec![0u8; 100]);
        let transport = FakeTransport { sftp: sftp.clone() };
        let engine = TransferEngine::new();

        let job = TransferJob {
            direction: TransferDirection::Upload,
            local_path: local_src.to_string_lossy().to_string(),
            remote_path: "/remote/file.bin".into(),
            chunk_size: 1024,
            resume: true,
            hash_algorithm: HashAlgorithm::None,
        };

        let result = engine.run(&transport, &job).await;
        assert!(matches!(result, Err(HubError::Transfer { .. })));
    }

    #[tokio::test]
    async fn finish_rejects_when_local_and_remote_hashes_disagree() {
        let dir = tempfile::tempdir().unwrap();
        let local_src = dir.path().join("src.bin");
        tokio::fs::write(&local_src, vec![9u8; 2000]).await.unwrap();

        // Simulates a byte flipped in flight: the transport's exec() answers
        // with the hash of corrupted bytes even though the local source
        // (used for local_hash) is untouched.
        let sftp = Arc::new(FakeSftp { files: Mutex::new(HashMap::new()) });
        let mut corrupted = vec![9u8; 2000];
        corrupted[0] ^= 0xff;
        sftp.files.lock().unwrap().insert("/remote/file.bin".into(), corrupted);
        let transport = FakeTransport { sftp };

        let local_hash = hash_local_file(local_src.to_str().unwrap(), HashAlgorithm::Md5).await.unwrap();
        let remote_hash = remote_hash(&transport, "/remote/file.bin", HashAlgorithm::Md5).await.unwrap();
        assert_ne!(local_hash, remote_hash);
    }
}
