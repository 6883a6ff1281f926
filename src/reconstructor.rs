//! Secret reconstruction
//!
//! Combines verified fragments into a `SecretSession`. Every attempt, whether
//! it succeeds or not, produces exactly one audit entry before the caller
//! sees the outcome, and no attempt starts while the audit log is sealed.

use crate::audit_log::{AuditAction, AuditEntry, AuditLog, AuditResult, Severity};
use crate::config::ReconstructionScheme;
use crate::errors::{CynapseError, CynapseResult, FragmentError, ReconstructionError, SafeLock};
use crate::fragment_store::{is_valid_secret_id, Fragment, FragmentStore};
use crate::secret_session::SecretSession;
use crate::shamir;
use rand::RngCore;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Exclusive claim on one secret identifier, released on drop.
pub struct ReconstructionLease<'a> {
    active: &'a Mutex<HashSet<String>>,
    secret_id: String,
}

impl Drop for ReconstructionLease<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.secret_id);
        }
    }
}

pub struct SecretReconstructor {
    audit: Arc<AuditLog>,
    actor: String,
    active: Mutex<HashSet<String>>,
}

impl SecretReconstructor {
    pub fn new(audit: Arc<AuditLog>, actor: impl Into<String>) -> Self {
        Self {
            audit,
            actor: actor.into(),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Claim `secret_id` for the duration of the returned lease.
    pub fn try_acquire(&self, secret_id: &str) -> CynapseResult<ReconstructionLease<'_>> {
        let mut active = self.active.safe_lock()?;
        if !active.insert(secret_id.to_string()) {
            return Err(ReconstructionError::InProgress {
                secret_id: secret_id.to_string(),
            }
            .into());
        }
        Ok(ReconstructionLease {
            active: &self.active,
            secret_id: secret_id.to_string(),
        })
    }

    /// Combine `fragments` under `scheme`. The secret identifier is taken
    /// from the fragments themselves.
    pub fn combine(
        &self,
        fragments: Vec<Fragment>,
        threshold: u8,
        scheme: ReconstructionScheme,
    ) -> CynapseResult<SecretSession> {
        let secret_id = fragments
            .first()
            .map(|f| f.secret_id().to_string())
            .unwrap_or_default();
        self.combine_for(&secret_id, fragments, threshold, scheme)
    }

    /// Combine fragments that must all belong to `secret_id`.
    pub fn combine_for(
        &self,
        secret_id: &str,
        fragments: Vec<Fragment>,
        threshold: u8,
        scheme: ReconstructionScheme,
    ) -> CynapseResult<SecretSession> {
        self.reconstruct_with(secret_id, threshold, scheme, || Ok(fragments))
    }

    /// Load every fragment of `secret_id` from `store` and combine them.
    pub fn reconstruct(
        &self,
        store: &FragmentStore,
        secret_id: &str,
        threshold: u8,
        scheme: ReconstructionScheme,
    ) -> CynapseResult<SecretSession> {
        self.reconstruct_with(secret_id, threshold, scheme, || store.load_secret(secret_id))
    }

    /// Run `load` and the combination under the per-secret lease, then
    /// record exactly one audit entry for the attempt.
    pub fn reconstruct_with<F>(
        &self,
        secret_id: &str,
        threshold: u8,
        scheme: ReconstructionScheme,
        load: F,
    ) -> CynapseResult<SecretSession>
    where
        F: FnOnce() -> Result<Vec<Fragment>, FragmentError>,
    {
        self.audit.ensure_writable()?;

        let outcome = match self.try_acquire(secret_id) {
            Ok(_lease) => load()
                .map_err(ReconstructionError::from)
                .and_then(|fragments| assemble(secret_id, fragments, threshold, scheme)),
            Err(CynapseError::Reconstruction(e)) => Err(e),
            Err(other) => return Err(other),
        };

        let target = if secret_id.is_empty() { "<none>" } else { secret_id };
        let entry = match &outcome {
            Ok(session) => {
                info!(secret_id = %target, fragments = session.source_fragment_ids().len(), "Secret reconstructed");
                AuditEntry::new(&self.actor, AuditAction::Assemble, target, AuditResult::Success)
                    .with_detail(format!(
                        "scheme={scheme} fragments={}",
                        session
                            .source_fragment_ids()
                            .iter()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(",")
                    ))
            }
            Err(e) => {
                warn!(secret_id = %target, error = %e, "Secret reconstruction refused");
                let (result, severity) = classify(e);
                AuditEntry::new(&self.actor, AuditAction::Assemble, target, result)
                    .with_severity(severity)
                    .with_detail(e.to_string())
            }
        };

        // A session is only released once its audit entry is on disk; on
        // failure here the session drops and wipes.
        self.audit.append(entry)?;
        Ok(outcome?)
    }

    /// Split `secret` into fragments and record the split.
    pub fn split(
        &self,
        secret_id: &str,
        secret: &[u8],
        threshold: u8,
        total: u8,
        scheme: ReconstructionScheme,
    ) -> CynapseResult<Vec<Fragment>> {
        self.audit.ensure_writable()?;
        let fragments = split_secret(secret_id, secret, threshold, total, scheme)?;
        self.audit.append(
            AuditEntry::new(&self.actor, AuditAction::Split, secret_id, AuditResult::Success)
                .with_detail(format!(
                    "scheme={scheme} threshold={} total={}",
                    fragments.first().map(|f| f.threshold()).unwrap_or(threshold),
                    total
                )),
        )?;
        Ok(fragments)
    }
}

fn classify(error: &ReconstructionError) -> (AuditResult, Severity) {
    match error {
        ReconstructionError::ThresholdNotMet { .. } => (AuditResult::ThresholdNotMet, Severity::Warn),
        ReconstructionError::InProgress { .. } => (AuditResult::InProgress, Severity::Warn),
        ReconstructionError::Fragment(FragmentError::ChecksumMismatch { .. }) => {
            (AuditResult::ChecksumMismatch, Severity::Critical)
        }
        ReconstructionError::Fragment(FragmentError::DuplicateIndex { .. }) => {
            (AuditResult::DuplicateIndex, Severity::Warn)
        }
        ReconstructionError::Fragment(FragmentError::Missing { .. }) => {
            (AuditResult::FragmentMissing, Severity::Warn)
        }
        ReconstructionError::Fragment(FragmentError::Corrupt { .. }) => {
            (AuditResult::FragmentCorrupt, Severity::Critical)
        }
        _ => (AuditResult::Failure, Severity::Warn),
    }
}

fn invalid(message: impl Into<String>) -> ReconstructionError {
    ReconstructionError::InvalidParameters {
        message: message.into(),
    }
}

/// Validate the fragment set and run the combination. Either the whole
/// secret comes back or nothing does.
fn assemble(
    secret_id: &str,
    fragments: Vec<Fragment>,
    threshold: u8,
    scheme: ReconstructionScheme,
) -> Result<SecretSession, ReconstructionError> {
    if threshold == 0 {
        return Err(invalid("threshold must be at least 1"));
    }
    if fragments.iter().any(|f| f.secret_id() != secret_id) {
        return Err(ReconstructionError::MixedSecrets);
    }

    for fragment in &fragments {
        fragment.verify_checksum()?;
    }

    let mut seen = HashSet::new();
    for fragment in &fragments {
        if !seen.insert(fragment.index()) {
            return Err(FragmentError::DuplicateIndex {
                secret_id: secret_id.to_string(),
                index: fragment.index(),
            }
            .into());
        }
    }

    if let Some(f) = fragments.iter().find(|f| f.scheme() != scheme) {
        return Err(invalid(format!(
            "fragment {} was produced for {}, configured scheme is {scheme}",
            f.id(),
            f.scheme()
        )));
    }
    let declared_total = fragments.first().map(|f| f.total_count()).unwrap_or(0);
    if fragments.iter().any(|f| f.total_count() != declared_total) {
        return Err(invalid("fragments disagree on total count"));
    }

    // The fragments' own threshold is never lowered by the caller.
    let declared_threshold = fragments.iter().map(|f| f.threshold()).max().unwrap_or(0);
    let required = match scheme {
        ReconstructionScheme::ShamirThreshold => threshold.max(declared_threshold),
        ReconstructionScheme::XorExact => threshold.max(declared_total),
    } as usize;

    if fragments.len() < required {
        return Err(ReconstructionError::ThresholdNotMet {
            secret_id: secret_id.to_string(),
            required,
            available: fragments.len(),
        });
    }

    let len = fragments[0].payload().len();
    if fragments.iter().any(|f| f.payload().len() != len) {
        return Err(invalid("fragment payload lengths differ"));
    }

    let secret = match scheme {
        ReconstructionScheme::ShamirThreshold => {
            let shares: Vec<(u8, &[u8])> = fragments
                .iter()
                .map(|f| (f.index(), f.payload()))
                .collect();
            shamir::combine(&shares)
        }
        ReconstructionScheme::XorExact => {
            let mut secret = vec![0u8; len];
            for fragment in &fragments {
                for (out, b) in secret.iter_mut().zip(fragment.payload()) {
                    *out ^= b;
                }
            }
            secret
        }
    };

    let ids: BTreeSet<String> = fragments.iter().map(Fragment::id).collect();
    Ok(SecretSession::new(secret_id, secret, ids))
}

/// Produce `total` fragments for `secret`. For `xor_exact` every fragment
/// is required, so the threshold is forced to `total`.
pub fn split_secret(
    secret_id: &str,
    secret: &[u8],
    threshold: u8,
    total: u8,
    scheme: ReconstructionScheme,
) -> Result<Vec<Fragment>, ReconstructionError> {
    if !is_valid_secret_id(secret_id) {
        return Err(invalid(format!("invalid secret id {secret_id:?}")));
    }
    if secret.is_empty() {
        return Err(invalid("secret is empty"));
    }
    if total == 0 || threshold == 0 || threshold > total {
        return Err(invalid(format!(
            "need 1 <= threshold <= total, got threshold={threshold} total={total}"
        )));
    }

    let fragments = match scheme {
        ReconstructionScheme::ShamirThreshold => shamir::split(secret, threshold, total)
            .into_iter()
            .map(|(x, share)| Fragment::new(secret_id, x, total, threshold, scheme, share))
            .collect(),
        ReconstructionScheme::XorExact => {
            let mut rng = rand::rng();
            let mut last = Zeroizing::new(secret.to_vec());
            let mut fragments = Vec::with_capacity(total as usize);
            for index in 1..total {
                let mut pad = vec![0u8; secret.len()];
                rng.fill_bytes(&mut pad);
                for (acc, b) in last.iter_mut().zip(&pad) {
                    *acc ^= b;
                }
                fragments.push(Fragment::new(secret_id, index, total, total, scheme, pad));
            }
            fragments.push(Fragment::new(
                secret_id,
                total,
                total,
                total,
                scheme,
                last.to_vec(),
            ));
            fragments
        }
    };
    Ok(fragments)
}
