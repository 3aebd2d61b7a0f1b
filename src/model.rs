//! Cross-cutting data types shared by every component: host identity,
//! credentials, shaping specs and the result/job shapes returned to callers.

use std::fmt;
use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `(hostname, port, username)`. Partitions all pool, cache and session state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostKey {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl HostKey {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self { host: host.into(), port, user: user.into() }
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Resolved at connect time, never stored beyond the life of a connect attempt.
#[derive(Debug, Clone)]
pub enum Credential {
    Password(String),
    PrivateKey { path: PathBuf, passphrase: Option<String> },
}

/// How a known-hosts mismatch is handled at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum KnownHostsPolicy {
    #[default]
    Ignore,
    Warn,
    Reject,
}

/// Connect-time options threaded from config down to the real transport.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub known_hosts_policy: KnownHostsPolicy,
    pub retry_count: u32,
    pub retry_delay: std::time::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShapingMode {
    #[default]
    Full,
    Filter,
    Truncate,
}

/// `(mode, regex?, max_tokens?)` — deterministically transforms raw output
/// into a bounded payload. Part of the cache key.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ShapingSpec {
    #[serde(default)]
    pub mode: ShapingMode,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

/// A cache hint attached to an execution call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    #[default]
    Dynamic,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheHint {
    #[serde(default)]
    pub tier: CacheTier,
    /// Seconds. Ignored when `tier` is absent from the call (caching is
    /// opt-in per §4.C).
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub truncated: bool,
    pub shaping_mode_used: ShapingMode,
    pub from_cache: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    #[default]
    None,
    Md5,
    Sha256,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransferJob {
    pub direction: TransferDirection,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub bytes_transferred: u64,
    pub verified: bool,
    #[serde(default)]
    pub local_hash: Option<String>,
    #[serde(default)]
    pub remote_hash: Option<String>,
}

/// Builds the deterministic cache key for `(host, command, shaping spec)`,
/// per spec §9: credentials are intentionally excluded. Each field is
/// length-prefixed before hashing so that e.g. `host="a", cmd="bc"` cannot
/// collide with `host="ab", cmd="c"`.
pub fn cache_key(host: &HostKey, command: &str, spec: &ShapingSpec) -> String {
    let mut hasher = Sha256::new();
    for field in [host.host.as_str(), host.user.as_str()] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.update(host.port.to_le_bytes());
    let canonical = canonicalize_command(command);
    hasher.update((canonical.len() as u64).to_le_bytes());
    hasher.update(canonical.as_bytes());
    let mode_tag = match spec.mode {
        ShapingMode::Full => 0u8,
        ShapingMode::Filter => 1u8,
        ShapingMode::Truncate => 2u8,
    };
    hasher.update([mode_tag]);
    if let Some(re) = &spec.regex {
        hasher.update((re.len() as u64).to_le_bytes());
        hasher.update(re.as_bytes());
    }
    if let Some(tokens) = spec.max_tokens {
        hasher.update((tokens as u64).to_le_bytes());
    }
    hex_encode(&hasher.finalize())
}

/// Collapses runs of ASCII whitespace and trims the ends, so that the cache
/// key (and the safety gate) are insensitive to incidental whitespace
/// differences between otherwise-identical commands.
pub fn canonicalize_command(command: &str) -> String {
    let mut out = String::with_capacity(command.len());
    let mut last_was_space = false;
    for ch in command.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_display_matches_user_host_port() {
        let key = HostKey::new("example.com", 22, "root");
        assert_eq!(key.to_string(), "root@example.com:22");
    }

    #[test]
    fn cache_key_is_deterministic() {
        let key = HostKey::new("h", 22, "u");
        let spec = ShapingSpec::default();
        let a = cache_key(&key, "uname -a", &spec);
        let b = cache_key(&key, "uname -a", &spec);
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_does_not_collide_across_field_boundaries() {
        let a = cache_key(&HostKey::new("a", 1, "bc"), "x", &ShapingSpec::default());
        let b = cache_key(&HostKey::new("ab", 1, "c"), "x", &ShapingSpec::default());
        assert_ne!(a, b);
    }

    #[test]
    fn cache_key_ignores_incidental_whitespace() {
        let key = HostKey::new("h", 22, "u");
        let spec = ShapingSpec::default();
        let a = cache_key(&key, "ls   -la", &spec);
        let b = cache_key(&key, "ls -la", &spec);
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_changes_with_shaping_spec() {
        let key = HostKey::new("h", 22, "u");
        let full = cache_key(&key, "ls", &ShapingSpec::default());
        let truncate = cache_key(
            &key,
            "ls",
            &ShapingSpec { mode: ShapingMode::Truncate, regex: None, max_tokens: Some(10) },
        );
        assert_ne!(full, truncate);
    }
}
