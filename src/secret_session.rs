//! Ephemeral reconstructed secrets
//!
//! A `SecretSession` owns the assembled bytes for exactly as long as its
//! owning scope lives. The buffer is overwritten with zeros on every exit
//! path (explicit wipe, drop on return, drop on error or cancellation) and
//! the state moves `Active -> Wiped` once.

use crate::errors::ReconstructionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;
use zeroize::Zeroize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Active,
    Wiped,
}

pub struct SecretSession {
    secret_id: String,
    assembled_secret: Box<[u8]>,
    created_at: DateTime<Utc>,
    source_fragment_ids: BTreeSet<String>,
    state: SessionState,
}

impl SecretSession {
    pub(crate) fn new(
        secret_id: impl Into<String>,
        assembled_secret: Vec<u8>,
        source_fragment_ids: BTreeSet<String>,
    ) -> Self {
        Self {
            secret_id: secret_id.into(),
            assembled_secret: assembled_secret.into_boxed_slice(),
            created_at: Utc::now(),
            source_fragment_ids,
            state: SessionState::Active,
        }
    }

    pub fn secret_id(&self) -> &str {
        &self.secret_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn source_fragment_ids(&self) -> &BTreeSet<String> {
        &self.source_fragment_ids
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.assembled_secret.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assembled_secret.is_empty()
    }

    /// Borrow the secret. Fails once the session is wiped.
    pub fn expose(&self) -> Result<&[u8], ReconstructionError> {
        match self.state {
            SessionState::Active => Ok(&self.assembled_secret),
            SessionState::Wiped => Err(ReconstructionError::SessionWiped),
        }
    }

    /// Zero the buffer. Idempotent; the state transition happens once.
    pub fn wipe(&mut self) {
        if self.state == SessionState::Wiped {
            return;
        }
        self.assembled_secret.zeroize();
        self.state = SessionState::Wiped;
        debug!(secret_id = %self.secret_id, "Secret session wiped");
    }

    #[cfg(test)]
    pub(crate) fn raw_buffer(&self) -> &[u8] {
        &self.assembled_secret
    }
}

impl Drop for SecretSession {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for SecretSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretSession")
            .field("secret_id", &self.secret_id)
            .field("created_at", &self.created_at)
            .field("source_fragment_ids", &self.source_fragment_ids)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
