//! Persistent policy store with a versioned in-memory snapshot.
//!
//! Mutations go to storage first, then refresh the cache and bump the
//! snapshot version. Session handlers compare the version to know when to
//! re-resolve a token's policy set instead of recompiling anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, info};

use warden_storage::records::PolicyRecord;
use warden_storage_sqlite::SqliteBackend;

use crate::engine::{self, Decision};
use crate::error::PolicyError;
use crate::types::{Capability, Policy, PolicyEffect, PolicyRule, RequestContext};

/// Policy store: storage-backed CRUD plus a lock-free-read snapshot.
pub struct PolicyStore {
    backend: SqliteBackend,
    cache: RwLock<HashMap<String, Arc<Policy>>>,
    version: AtomicU64,
}

impl PolicyStore {
    /// Creates the store and loads every persisted policy into the cache.
    pub async fn open(backend: SqliteBackend) -> Result<Self, PolicyError> {
        let store = Self {
            backend,
            cache: RwLock::new(HashMap::new()),
            version: AtomicU64::new(1),
        };

        store.reload().await?;

        Ok(store)
    }

    /// Reloads the cache from storage.
    pub async fn reload(&self) -> Result<(), PolicyError> {
        let records = self.backend.list_policies().await?;

        let mut loaded = HashMap::with_capacity(records.len());
        for record in records {
            let policy = parse_record(&record)?;
            loaded.insert(policy.name.clone(), Arc::new(policy));
        }

        debug!(count = loaded.len(), "Policies loaded");

        *self.write_cache() = loaded;
        self.bump();

        Ok(())
    }

    /// Current snapshot version. Bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Creates or updates a policy.
    pub async fn set_policy(&self, policy: Policy) -> Result<(), PolicyError> {
        validate(&policy)?;

        let now = Utc::now();
        let record = PolicyRecord {
            name: policy.name.clone(),
            effect: policy.effect.as_str().to_string(),
            rules_json: serde_json::to_string(&policy.rules)
                .map_err(|e| PolicyError::InvalidPolicy(e.to_string()))?,
            created_at: now,
            updated_at: now,
        };

        self.backend.upsert_policy(&record).await?;

        self.write_cache()
            .insert(policy.name.clone(), Arc::new(policy));
        self.bump();

        Ok(())
    }

    /// Deletes a policy. Returns `NotFound` when it does not exist.
    pub async fn delete_policy(&self, name: &str) -> Result<(), PolicyError> {
        if !self.backend.delete_policy(name).await? {
            return Err(PolicyError::NotFound(name.to_string()));
        }

        self.write_cache().remove(name);
        self.bump();

        info!(policy = %name, "Policy deleted");

        Ok(())
    }

    /// Fetches one policy from the snapshot.
    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.read_cache().get(name).cloned()
    }

    /// Lists the snapshot, sorted by name.
    pub fn list(&self) -> Vec<Arc<Policy>> {
        let mut policies: Vec<Arc<Policy>> = self.read_cache().values().cloned().collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        policies
    }

    /// Resolves policy names against the snapshot. Unknown names resolve
    /// to nothing, which evaluates as deny.
    pub fn resolve(&self, names: &[String]) -> Vec<Arc<Policy>> {
        let cache = self.read_cache();
        names
            .iter()
            .filter_map(|name| cache.get(name).cloned())
            .collect()
    }

    /// Evaluates `capability` on `path` for an entity bound to `names`.
    pub fn evaluate(
        &self,
        names: &[String],
        path: &str,
        capability: Capability,
        ctx: &RequestContext,
    ) -> Decision {
        let resolved = self.resolve(names);
        let refs: Vec<&Policy> = resolved.iter().map(Arc::as_ref).collect();
        engine::evaluate(&refs, path, capability, ctx)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Policy>>> {
        match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Policy>>> {
        match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn parse_record(record: &PolicyRecord) -> Result<Policy, PolicyError> {
    let effect = PolicyEffect::parse(&record.effect)
        .ok_or_else(|| PolicyError::InvalidPolicy(format!("bad effect: {}", record.effect)))?;

    let rules: Vec<PolicyRule> = serde_json::from_str(&record.rules_json)
        .map_err(|e| PolicyError::InvalidPolicy(e.to_string()))?;

    Ok(Policy {
        name: record.name.clone(),
        effect,
        rules,
    })
}

fn validate(policy: &Policy) -> Result<(), PolicyError> {
    if policy.name.is_empty() {
        return Err(PolicyError::InvalidPolicy("name cannot be empty".into()));
    }
    if policy.rules.is_empty() {
        return Err(PolicyError::InvalidPolicy(format!(
            "policy {} has no rules",
            policy.name
        )));
    }
    for rule in &policy.rules {
        if rule.path.is_empty() {
            return Err(PolicyError::InvalidPolicy(format!(
                "policy {} has a rule with an empty path",
                policy.name
            )));
        }
        if rule.capabilities.is_empty() {
            return Err(PolicyError::InvalidPolicy(format!(
                "policy {} has a rule with no capabilities",
                policy.name
            )));
        }
    }
    Ok(())
}
