use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::OidcError;

pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Everything needed to finish one login attempt. Lives server-side; the
/// browser only carries `state`.
#[derive(Clone, PartialEq, Eq)]
pub struct ChallengeState {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    pub return_to: String,
    pub expires_at: u64,
}

impl std::fmt::Debug for ChallengeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeState")
            .field("state", &self.state)
            .field("return_to", &self.return_to)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChallengeLookup {
    Found(ChallengeState),
    /// Taken by an earlier callback.
    Consumed,
    Expired,
    Unknown,
}

pub trait ChallengeStore: Send + Sync {
    fn insert(&self, challenge: ChallengeState, now: u64) -> Result<(), OidcError>;

    /// Looks up and invalidates `state` in one step. Of several concurrent
    /// takes of the same state, exactly one returns `Found`.
    fn take(&self, state: &str, now: u64) -> Result<ChallengeLookup, OidcError>;
}

#[derive(Debug)]
enum Entry {
    Pending(ChallengeState),
    Consumed { expires_at: u64 },
}

impl Entry {
    fn expires_at(&self) -> u64 {
        match self {
            Entry::Pending(challenge) => challenge.expires_at,
            Entry::Consumed { expires_at } => *expires_at,
        }
    }
}

/// In-process challenge store. Consumed entries are remembered until their
/// original expiry so a replayed callback is told apart from a forged one.
#[derive(Debug)]
pub struct MemoryChallengeStore {
    entries: Mutex<HashMap<String, Entry>>,
    max_pending: usize,
}

impl Default for MemoryChallengeStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_PENDING)
    }
}

impl MemoryChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_pending: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_pending: max_pending.max(1),
        }
    }

    pub fn pending(&self) -> usize {
        self.lock()
            .map(|entries| {
                entries
                    .values()
                    .filter(|e| matches!(e, Entry::Pending(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, OidcError> {
        self.entries
            .lock()
            .map_err(|_| OidcError::Internal("challenge store mutex poisoned".to_string()))
    }
}

impl ChallengeStore for MemoryChallengeStore {
    fn insert(&self, challenge: ChallengeState, now: u64) -> Result<(), OidcError> {
        let mut entries = self.lock()?;
        entries.retain(|_, entry| entry.expires_at() > now);

        if entries.contains_key(&challenge.state) {
            return Err(OidcError::Internal("duplicate challenge state".to_string()));
        }

        let pending = entries
            .values()
            .filter(|e| matches!(e, Entry::Pending(_)))
            .count();
        if pending >= self.max_pending {
            let oldest = entries
                .iter()
                .filter(|(_, e)| matches!(e, Entry::Pending(_)))
                .min_by_key(|(_, e)| e.expires_at())
                .map(|(state, _)| state.clone());
            if let Some(oldest) = oldest {
                warn!(max_pending = self.max_pending, "challenge store full, evicting oldest attempt");
                entries.remove(&oldest);
            }
        }

        entries.insert(challenge.state.clone(), Entry::Pending(challenge));
        Ok(())
    }

    fn take(&self, state: &str, now: u64) -> Result<ChallengeLookup, OidcError> {
        let mut entries = self.lock()?;
        let Some(entry) = entries.remove(state) else {
            return Ok(ChallengeLookup::Unknown);
        };

        match entry {
            Entry::Pending(challenge) if now < challenge.expires_at => {
                entries.insert(
                    state.to_string(),
                    Entry::Consumed {
                        expires_at: challenge.expires_at,
                    },
                );
                Ok(ChallengeLookup::Found(challenge))
            }
            Entry::Pending(_) => Ok(ChallengeLookup::Expired),
            Entry::Consumed { expires_at } => {
                entries.insert(state.to_string(), Entry::Consumed { expires_at });
                Ok(ChallengeLookup::Consumed)
            }
        }
    }
}
