use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::OidcError;
use crate::keyring::{KeyRing, ProtectionKey, is_key_id};
use crate::store::KeyMaterialStore;

const UNKNOWN_ID_RETRY_SECS: u64 = 1;
const MAX_UNKNOWN_IDS: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPolicy {
    pub lifetime_secs: u64,
    pub rotation_lead_secs: u64,
    pub refresh_secs: u64,
    pub max_session_lifetime_secs: u64,
}

#[derive(Debug, Default)]
struct KeyCache {
    ring: KeyRing,
    loaded_at: Option<u64>,
    /// Ids a forced reload did not find, with the time of that reload.
    unknown_ids: HashMap<String, u64>,
}

/// Process-side view of the shared key ring.
///
/// Holds a short-lived copy of the store's ring, provisions keys when the
/// ring runs dry, and prunes keys that can no longer protect a live cookie.
pub struct KeyManager {
    store: Arc<dyn KeyMaterialStore>,
    policy: KeyPolicy,
    cache: Mutex<KeyCache>,
    provisioning: Mutex<()>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyMaterialStore>, policy: KeyPolicy) -> Self {
        Self {
            store,
            policy,
            cache: Mutex::new(KeyCache::default()),
            provisioning: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// The key new cookies are sealed with, provisioning one if needed.
    pub fn encryption_key(&self, now: u64) -> Result<ProtectionKey, OidcError> {
        let ring = self.ring(now)?;
        if !ring.needs_new_key(now, self.policy.rotation_lead_secs)
            && let Some(current) = ring.current(now)
        {
            return Ok(current.clone());
        }

        let ring = self.provision(now)?;
        ring.current(now)
            .cloned()
            .ok_or_else(|| OidcError::Internal("no current key after provisioning".to_string()))
    }

    /// A non-expired key with this id. An unknown id forces a reload so keys
    /// provisioned by other instances are picked up without waiting for the
    /// cache to go stale. The same missing id is retried at most once per
    /// second.
    pub fn decryption_key(&self, id: &str, now: u64) -> Result<Option<ProtectionKey>, OidcError> {
        if let Some(key) = self.ring(now)?.decryption_key(id, now) {
            return Ok(Some(key.clone()));
        }
        if !is_key_id(id) || self.recently_missing(id, now)? {
            return Ok(None);
        }

        let ring = self.reload(now)?;
        let key = ring.decryption_key(id, now).cloned();
        if key.is_none() {
            debug!(key_id = id, "key id not found after reload");
            self.remember_missing(id, now)?;
        }
        Ok(key)
    }

    fn ring(&self, now: u64) -> Result<KeyRing, OidcError> {
        {
            let cache = self.lock_cache()?;
            if let Some(loaded_at) = cache.loaded_at
                && now < loaded_at.saturating_add(self.policy.refresh_secs)
            {
                return Ok(cache.ring.clone());
            }
        }

        self.reload(now)
    }

    fn reload(&self, now: u64) -> Result<KeyRing, OidcError> {
        let ring = self.store.load().inspect_err(|err| {
            warn!(error = %err, "failed to load key ring");
        })?;

        let mut cache = self.lock_cache()?;
        cache.ring = ring.clone();
        cache.loaded_at = Some(now);
        Ok(ring)
    }

    fn recently_missing(&self, id: &str, now: u64) -> Result<bool, OidcError> {
        let cache = self.lock_cache()?;
        Ok(cache
            .unknown_ids
            .get(id)
            .is_some_and(|&at| now < at.saturating_add(UNKNOWN_ID_RETRY_SECS)))
    }

    fn remember_missing(&self, id: &str, now: u64) -> Result<(), OidcError> {
        let mut cache = self.lock_cache()?;
        if cache.unknown_ids.len() >= MAX_UNKNOWN_IDS {
            cache
                .unknown_ids
                .retain(|_, at| now < at.saturating_add(UNKNOWN_ID_RETRY_SECS));
            if cache.unknown_ids.len() >= MAX_UNKNOWN_IDS {
                cache.unknown_ids.clear();
            }
        }
        cache.unknown_ids.insert(id.to_string(), now);
        Ok(())
    }

    fn provision(&self, now: u64) -> Result<KeyRing, OidcError> {
        let _guard = self
            .provisioning
            .lock()
            .map_err(|_| OidcError::Internal("key provisioning mutex poisoned".to_string()))?;

        // Another instance (or thread) may have provisioned in the meantime.
        let ring = self.reload(now)?;
        if !ring.needs_new_key(now, self.policy.rotation_lead_secs) {
            return Ok(ring);
        }

        let activation_at = self.successor_activation(&ring, now);
        let key = ProtectionKey::generate(now, activation_at, self.policy.lifetime_secs);
        self.store
            .save(&KeyRing::from_keys([key.clone()]))
            .inspect_err(|err| warn!(error = %err, "failed to persist new protection key"))?;
        info!(
            key_id = %key.id,
            activation_at = key.activation_at,
            expiration_at = key.expiration_at,
            "provisioned protection key"
        );

        self.prune(&ring, now);
        self.reload(now)
    }

    /// Successors wait one refresh interval so every instance has loaded them
    /// before they seal anything. When the current key would expire before a
    /// session sealed during that wait, the successor takes over at once.
    fn successor_activation(&self, ring: &KeyRing, now: u64) -> u64 {
        let Some(current) = ring.current(now) else {
            return now;
        };
        let delayed = now.saturating_add(self.policy.refresh_secs);
        if delayed.saturating_add(self.policy.max_session_lifetime_secs) > current.expiration_at {
            now
        } else {
            delayed
        }
    }

    fn prune(&self, ring: &KeyRing, now: u64) {
        for key_id in ring.prunable(now, self.policy.max_session_lifetime_secs) {
            match self.store.delete(&key_id) {
                Ok(()) => info!(key_id = %key_id, "pruned expired protection key"),
                Err(err) => warn!(key_id = %key_id, error = %err, "failed to prune protection key"),
            }
        }
    }

    fn lock_cache(&self) -> Result<std::sync::MutexGuard<'_, KeyCache>, OidcError> {
        self.cache
            .lock()
            .map_err(|_| OidcError::Internal("key cache mutex poisoned".to_string()))
    }
}
