//! # Warden Seal
//!
//! Seal/Unseal state machine and master key custody.
//!
//! The core has three states:
//! - **Uninitialized**: no master key exists yet
//! - **Sealed**: master key is not in memory, all cryptographic operations fail
//! - **Unsealed**: master key is in memory, the core is operational
//!
//! ## Shamir's Secret Sharing
//!
//! At initialization the master key is split into N shares over GF(251); a
//! threshold of K shares must be submitted to unseal. Submitted shares
//! accumulate in memory only. Once K are collected, the key is
//! reconstructed and checked against a persisted HMAC verification tag; a
//! mismatch discards every pending share.
//!
//! Other components never see the seal manager. They hold a [`KeyAccess`]
//! capability, which yields the master key only while unsealed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use tracing::{debug, info, warn};

use warden_crypto::random::generate_token;
use warden_crypto::shamir::Share;
use warden_crypto::MasterKey;
use warden_storage::StorageBackend;
use warden_storage_sqlite::SqliteBackend;

pub use error::SealError;

/// Domain separation tag for master key verification.
const SEAL_VERIFY_TAG: &[u8] = b"warden-seal-verify-v1";

/// Keys for seal metadata in the key/value store.
mod keys {
    pub const ROOT_TOKEN_HASH: &str = "seal/root_token_hash";
    pub const SHAMIR_THRESHOLD: &str = "seal/shamir_threshold";
    pub const SHAMIR_TOTAL: &str = "seal/shamir_total";
    pub const INITIALIZED_AT: &str = "seal/initialized_at";
    pub const VERIFY_TAG: &str = "seal/verify_tag";
}

/// State of the seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealState {
    /// Core has not been initialized yet.
    Uninitialized,
    /// Core is initialized but sealed.
    Sealed,
    /// Core is unsealed and operational.
    Unsealed,
}

/// Configuration for Shamir's Secret Sharing.
#[derive(Debug, Clone)]
pub struct SealConfig {
    /// Total number of shares to generate (N).
    pub shares: u8,
    /// Minimum shares required to unseal (K).
    pub threshold: u8,
}

/// Result of initialization. Both fields are shown exactly once and never
/// persisted.
pub struct InitResult {
    /// Root token granting the built-in admin policy.
    pub root_token: String,
    /// Shamir shares for key holders.
    pub shares: Vec<Share>,
}

/// Point-in-time seal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealStatus {
    /// Whether initialization has happened.
    pub initialized: bool,
    /// Whether the core is sealed.
    pub sealed: bool,
    /// Shares submitted toward the current unseal attempt.
    pub progress: u8,
    /// Threshold required to unseal.
    pub threshold: u8,
    /// Total shares generated at initialization.
    pub total_shares: u8,
}

/// Read-only capability through which components obtain the master key.
///
/// Backed by an atomic sealed flag checked before the short-held lock, so
/// a sealed core answers without blocking.
#[derive(Clone)]
pub struct KeyAccess {
    inner: Arc<KeyAccessInner>,
}

struct KeyAccessInner {
    sealed: AtomicBool,
    key: RwLock<Option<MasterKey>>,
}

impl KeyAccess {
    /// Creates a sealed handle with no key installed.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(KeyAccessInner {
                sealed: AtomicBool::new(true),
                key: RwLock::new(None),
            }),
        }
    }

    /// Returns whether the core is currently sealed. Never blocks.
    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::Acquire)
    }

    /// Returns a copy of the master key, or `Sealed`.
    pub fn master_key(&self) -> Result<MasterKey, SealError> {
        if self.is_sealed() {
            return Err(SealError::Sealed);
        }

        let guard = match self.inner.key.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        guard.clone().ok_or(SealError::Sealed)
    }

    fn install(&self, key: MasterKey) {
        let mut guard = match self.inner.key.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(key);
        self.inner.sealed.store(false, Ordering::Release);
    }

    fn clear(&self) {
        self.inner.sealed.store(true, Ordering::Release);
        let mut guard = match self.inner.key.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // MasterKey zeroizes on drop.
        *guard = None;
    }
}

impl Default for KeyAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyAccess")
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

/// The seal manager owns the master key lifecycle.
///
/// All mutating operations require `&mut self`; callers serialize them on a
/// single lock. [`SealManager::status`] reads plain fields and never blocks.
pub struct SealManager {
    storage: SqliteBackend,
    key_access: KeyAccess,
    state: SealState,
    pending_shares: Vec<Share>,
    pending_indices: HashSet<u8>,
    threshold: u8,
    total_shares: u8,
    expected_tag: Option<Vec<u8>>,
}

impl SealManager {
    /// Creates a seal manager over the given storage backend and loads the
    /// persisted seal state.
    pub async fn new(storage: SqliteBackend) -> Result<Self, SealError> {
        let mut manager = Self {
            storage,
            key_access: KeyAccess::new(),
            state: SealState::Uninitialized,
            pending_shares: Vec::new(),
            pending_indices: HashSet::new(),
            threshold: 0,
            total_shares: 0,
            expected_tag: None,
        };

        manager.load_state().await?;

        Ok(manager)
    }

    async fn load_state(&mut self) -> Result<(), SealError> {
        let initialized = self.storage.get(keys::INITIALIZED_AT).await?.is_some();

        if initialized {
            self.state = SealState::Sealed;

            if let Some(threshold) = self.storage.get(keys::SHAMIR_THRESHOLD).await? {
                self.threshold = *threshold.first().unwrap_or(&0);
            }
            if let Some(total) = self.storage.get(keys::SHAMIR_TOTAL).await? {
                self.total_shares = *total.first().unwrap_or(&0);
            }

            self.expected_tag = self.storage.get(keys::VERIFY_TAG).await?;
        }

        debug!(state = ?self.state, "Seal state loaded");
        Ok(())
    }

    /// Returns the capability handle other components use to read the
    /// master key.
    pub fn key_access(&self) -> KeyAccess {
        self.key_access.clone()
    }

    /// Returns the current seal status. Non-blocking.
    pub fn status(&self) -> SealStatus {
        SealStatus {
            initialized: self.state != SealState::Uninitialized,
            sealed: self.state != SealState::Unsealed,
            progress: self.pending_shares.len() as u8,
            threshold: self.threshold,
            total_shares: self.total_shares,
        }
    }

    /// Initializes the core: generates the master key, splits it, mints
    /// the root token. One-shot; a second call fails.
    pub async fn initialize(&mut self, config: SealConfig) -> Result<InitResult, SealError> {
        if self.state != SealState::Uninitialized {
            return Err(SealError::AlreadyInitialized);
        }

        info!(
            shares = config.shares,
            threshold = config.threshold,
            "Initializing core"
        );

        let master_key = MasterKey::generate();
        let verify_tag = master_key.verification_tag(SEAL_VERIFY_TAG).to_vec();

        let shares = master_key
            .split(config.shares, config.threshold)
            .map_err(|e| SealError::InvalidConfig(e.to_string()))?;

        let root_token = generate_token(32);
        let root_token_hash = hash_token(&root_token)?;

        let now = chrono_now_secs();

        self.storage
            .put(keys::ROOT_TOKEN_HASH, root_token_hash.as_bytes())
            .await?;
        self.storage
            .put(keys::SHAMIR_THRESHOLD, &[config.threshold])
            .await?;
        self.storage
            .put(keys::SHAMIR_TOTAL, &[config.shares])
            .await?;
        self.storage
            .put(keys::INITIALIZED_AT, &now.to_le_bytes())
            .await?;
        self.storage.put(keys::VERIFY_TAG, &verify_tag).await?;

        self.expected_tag = Some(verify_tag);
        self.state = SealState::Sealed;
        self.threshold = config.threshold;
        self.total_shares = config.shares;

        info!("Core initialized");

        Ok(InitResult { root_token, shares })
    }

    /// Submits one share toward unsealing.
    ///
    /// When the threshold is reached the master key is reconstructed and
    /// verified; on success the core transitions to unsealed and the share
    /// buffer is cleared.
    pub async fn submit_share(&mut self, share: &Share) -> Result<SealStatus, SealError> {
        match self.state {
            SealState::Uninitialized => return Err(SealError::NotInitialized),
            SealState::Unsealed => return Err(SealError::AlreadyUnsealed),
            SealState::Sealed => {}
        }

        if share.index == 0 || share.index > self.total_shares {
            return Err(SealError::InvalidShare(format!(
                "share index {} out of range 1..={}",
                share.index, self.total_shares
            )));
        }
        if self.pending_indices.contains(&share.index) {
            return Err(SealError::DuplicateShare(share.index));
        }

        self.pending_shares.push(share.clone());
        self.pending_indices.insert(share.index);

        debug!(
            index = share.index,
            progress = self.pending_shares.len(),
            threshold = self.threshold,
            "Share submitted"
        );

        if self.pending_shares.len() >= usize::from(self.threshold) {
            self.reconstruct_master_key()?;
        }

        Ok(self.status())
    }

    /// Reconstructs and verifies the master key from pending shares.
    fn reconstruct_master_key(&mut self) -> Result<(), SealError> {
        let master_key = match MasterKey::reconstruct(&self.pending_shares, self.threshold) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Master key reconstruction failed");
                self.discard_pending();
                return Err(SealError::InvalidShareSet);
            }
        };

        let Some(expected_tag) = self.expected_tag.as_ref() else {
            warn!("Missing seal verification tag (corrupted seal metadata?)");
            self.discard_pending();
            return Err(SealError::InvalidShareSet);
        };

        if !master_key.matches_tag(SEAL_VERIFY_TAG, expected_tag) {
            warn!("Reconstructed key does not match verification tag");
            self.discard_pending();
            return Err(SealError::InvalidShareSet);
        }

        self.discard_pending();
        self.key_access.install(master_key);
        self.state = SealState::Unsealed;

        info!("Core unsealed");

        Ok(())
    }

    fn discard_pending(&mut self) {
        self.pending_shares.clear();
        self.pending_indices.clear();
    }

    /// Seals the core: zeroes the master key and discards pending shares.
    pub fn seal(&mut self) -> Result<SealStatus, SealError> {
        if self.state == SealState::Uninitialized {
            return Err(SealError::NotInitialized);
        }

        self.key_access.clear();
        self.discard_pending();
        self.state = SealState::Sealed;

        info!("Core sealed");

        Ok(self.status())
    }

    /// Verifies a root token against the stored Argon2id hash.
    pub async fn verify_root_token(&self, token: &str) -> Result<bool, SealError> {
        let stored_hash = self
            .storage
            .get(keys::ROOT_TOKEN_HASH)
            .await?
            .ok_or(SealError::NotInitialized)?;

        let hash_str =
            std::str::from_utf8(&stored_hash).map_err(|e| SealError::Storage(e.to_string()))?;

        Ok(verify_token(token, hash_str))
    }
}

fn chrono_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Hashes a token with Argon2id.
fn hash_token(token: &str) -> Result<String, SealError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| SealError::Crypto(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verifies a token against an Argon2id hash.
fn verify_token(token: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(token.as_bytes(), &parsed_hash)
        .is_ok()
}
