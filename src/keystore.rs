//! Credential keystore boundary (spec §6). The core never persists secrets
//! beyond this in-process map; it's deliberately the thinnest possible
//! oracle, not a vault.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::model::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Password,
    PrivateKey,
}

struct Entry {
    kind: CredentialKind,
    value: String,
    passphrase: Option<String>,
}

/// Keyed on `(host, user)`; last `put` for a key wins.
#[derive(Default)]
pub struct Keystore {
    entries: RwLock<HashMap<(String, String), Entry>>,
}

impl Keystore {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    pub fn put_password(&self, host: &str, user: &str, password: String) {
        let mut entries = self.entries.write().expect("keystore poisoned");
        entries.insert(
            (host.to_string(), user.to_string()),
            Entry { kind: CredentialKind::Password, value: password, passphrase: None },
        );
    }

    pub fn put_private_key(&self, host: &str, user: &str, path: String, passphrase: Option<String>) {
        let mut entries = self.entries.write().expect("keystore poisoned");
        entries.insert(
            (host.to_string(), user.to_string()),
            Entry { kind: CredentialKind::PrivateKey, value: path, passphrase },
        );
    }

    pub fn get(&self, host: &str, user: &str) -> Option<Credential> {
        let entries = self.entries.read().expect("keystore poisoned");
        let entry = entries.get(&(host.to_string(), user.to_string()))?;
        Some(match entry.kind {
            CredentialKind::Password => Credential::Password(entry.value.clone()),
            CredentialKind::PrivateKey => {
                Credential::PrivateKey { path: PathBuf::from(&entry.value), passphrase: entry.passphrase.clone() }
            }
        })
    }
}
