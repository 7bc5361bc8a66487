//! Capability check run before a session attempts a push channel.

use std::fs;
use std::path::PathBuf;

use change_feed::ChangeFeed;

/// Client signatures known to accept a subscription and then never deliver: embedded
/// webviews and in-app browsers that suspend long-lived connections.
pub const KNOWN_BAD_SIGNATURES: &[&str] = &[
    "SamsungBrowser/",
    "FBAN/",
    "FBAV/",
    "Instagram",
    "; wv)",
    "GSA/",
];

const STORAGE_MARKER: &str = ".ledger-sync-probe";

/// Result of one storage write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCheck {
    Writable,
    Failed(String),
    Unknown(String),
}

/// Runtime facts the probe needs; implementations must not mutate anything persistent.
pub trait RuntimeEnvironment: Send + Sync {
    fn storage_check(&self) -> StorageCheck;
    fn client_signature(&self) -> Option<String>;
}

/// Environment described up front; used by tests and headless embedders.
#[derive(Debug, Clone)]
pub struct StaticEnvironment {
    pub storage: StorageCheck,
    pub client_signature: Option<String>,
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        Self {
            storage: StorageCheck::Writable,
            client_signature: None,
        }
    }
}

impl StaticEnvironment {
    pub fn restricted_storage() -> Self {
        Self {
            storage: StorageCheck::Failed("storage quota is zero".into()),
            client_signature: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.client_signature = Some(signature.into());
        self
    }
}

impl RuntimeEnvironment for StaticEnvironment {
    fn storage_check(&self) -> StorageCheck {
        self.storage.clone()
    }

    fn client_signature(&self) -> Option<String> {
        self.client_signature.clone()
    }
}

/// Probes the real host: writes and removes a marker file in `storage_dir`.
#[derive(Debug, Clone, Default)]
pub struct HostEnvironment {
    pub storage_dir: Option<PathBuf>,
    pub user_agent: Option<String>,
}

impl RuntimeEnvironment for HostEnvironment {
    fn storage_check(&self) -> StorageCheck {
        let Some(dir) = &self.storage_dir else {
            return StorageCheck::Unknown("no storage directory configured".into());
        };
        if let Err(err) = fs::create_dir_all(dir) {
            return StorageCheck::Failed(format!("cannot create {}: {err}", dir.display()));
        }
        let marker = dir.join(STORAGE_MARKER);
        match fs::write(&marker, b"probe") {
            Ok(()) => {
                let _ = fs::remove_file(&marker);
                StorageCheck::Writable
            }
            Err(err) => StorageCheck::Failed(format!("cannot write {}: {err}", marker.display())),
        }
    }

    fn client_signature(&self) -> Option<String> {
        self.user_agent.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viability {
    pub viable: bool,
    pub reasons: Vec<String>,
    /// Nothing conclusive was found; `viable` is the optimistic default.
    pub inconclusive: bool,
}

pub struct ConnectionProbe<'a> {
    environment: &'a dyn RuntimeEnvironment,
    extra_signatures: &'a [String],
}

impl<'a> ConnectionProbe<'a> {
    pub fn new(environment: &'a dyn RuntimeEnvironment, extra_signatures: &'a [String]) -> Self {
        Self {
            environment,
            extra_signatures,
        }
    }

    pub fn detect_viability(&self, feed: &dyn ChangeFeed) -> Viability {
        let mut reasons = Vec::new();
        let mut blocked = false;
        let mut inconclusive = false;

        if !feed.is_available() {
            blocked = true;
            reasons.push("push channel primitive unavailable".to_string());
        }

        match self.environment.storage_check() {
            StorageCheck::Writable => {}
            StorageCheck::Failed(detail) => {
                blocked = true;
                reasons.push(format!("storage write failed: {detail}"));
            }
            StorageCheck::Unknown(detail) => {
                inconclusive = true;
                reasons.push(format!("storage check inconclusive: {detail}"));
            }
        }

        match self.environment.client_signature() {
            Some(signature) => {
                if let Some(hit) = self.matching_signature(&signature) {
                    blocked = true;
                    reasons.push(format!("client signature matches {hit:?}"));
                }
            }
            None => {
                inconclusive = true;
                reasons.push("client signature unknown".to_string());
            }
        }

        Viability {
            viable: !blocked,
            reasons,
            inconclusive: inconclusive && !blocked,
        }
    }

    fn matching_signature(&self, signature: &str) -> Option<String> {
        KNOWN_BAD_SIGNATURES
            .iter()
            .map(|s| s.to_string())
            .chain(self.extra_signatures.iter().cloned())
            .find(|needle| !needle.is_empty() && signature.contains(needle.as_str()))
    }
}
