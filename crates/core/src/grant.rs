//! Grant Executor.
//!
//! The only component that calls [`CryptoService::reseal`]. It turns an approved decision into
//! an updated [`AccessPolicy`](crate::policy::AccessPolicy) on the affected records.
//!
//! ## Single record
//!
//! [`GrantExecutor::grant`] loads the record, computes `policy ∪ {principal}` and, if the
//! principal is already a member, succeeds without touching the crypto service. Otherwise it
//! reseals the wrapped key (bounded by the configured deadline) and writes the new policy with
//! [`RecordStore::update_policy`]. If another writer changed the record in the meantime the store
//! answers with a version mismatch and the executor starts over from a fresh read, up to
//! `grant_max_retries` attempts; exhaustion is surfaced as the retriable
//! [`ConsentError::PolicyConflict`].
//!
//! [`GrantExecutor::revoke`] is the mirror image (`policy \ {principal}`, owner never removed).
//!
//! ## Batches
//!
//! [`GrantExecutor::grant_batch`] runs one task per distinct record id, bounded by
//! `grant_concurrency`. Failures are folded into the [`BatchReport`]; a failing record never
//! aborts its siblings.

use crate::config::CoreConfig;
use crate::error::{ConsentError, ConsentResult};
use crate::external::{CryptoService, ExternalError, WrappedKey};
use crate::ids::RecordId;
use crate::policy::AccessPolicy;
use crate::records::RecordStore;
use chrono::{DateTime, Utc};
use consent_types::Principal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Which way a policy is being changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyChange {
    Grant,
    Revoke,
}

impl PolicyChange {
    fn apply(self, policy: &AccessPolicy, principal: &Principal) -> AccessPolicy {
        match self {
            PolicyChange::Grant => policy.with(principal),
            PolicyChange::Revoke => policy.without(principal),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            PolicyChange::Grant => "grant",
            PolicyChange::Revoke => "revoke",
        }
    }
}

/// Result of applying a [`PolicyChange`] to one record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GrantOutcome {
    /// The key was resealed and the new policy written.
    Resealed,
    /// The policy already had the requested shape; nothing was written.
    Unchanged,
    Failed { reason: String, retriable: bool },
}

impl GrantOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, GrantOutcome::Failed { .. })
    }

    fn from_error(err: &ConsentError) -> Self {
        GrantOutcome::Failed {
            reason: err.to_string(),
            retriable: err.is_retriable(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordGrantResult {
    pub record_id: RecordId,
    #[serde(flatten)]
    pub outcome: GrantOutcome,
}

impl RecordGrantResult {
    pub fn failed(record_id: RecordId, reason: impl Into<String>, retriable: bool) -> Self {
        Self {
            record_id,
            outcome: GrantOutcome::Failed {
                reason: reason.into(),
                retriable,
            },
        }
    }
}

/// Headline of a batch: every record delivered, or not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySummary {
    AccessGranted,
    PartialSuccess,
}

impl DeliverySummary {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliverySummary::AccessGranted => "Access Granted",
            DeliverySummary::PartialSuccess => "Partial Success",
        }
    }
}

/// Aggregate outcome of a batch, in the order the record ids were supplied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub success_count: usize,
    pub fail_count: usize,
    pub results: Vec<RecordGrantResult>,
    pub completed_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn from_results(results: Vec<RecordGrantResult>, completed_at: DateTime<Utc>) -> Self {
        let success_count = results.iter().filter(|r| r.outcome.is_success()).count();
        Self {
            success_count,
            fail_count: results.len() - success_count,
            results,
            completed_at,
        }
    }

    pub fn summary(&self) -> DeliverySummary {
        if self.fail_count == 0 {
            DeliverySummary::AccessGranted
        } else {
            DeliverySummary::PartialSuccess
        }
    }

    pub fn failed_record_ids(&self) -> Vec<RecordId> {
        self.results
            .iter()
            .filter(|r| !r.outcome.is_success())
            .map(|r| r.record_id)
            .collect()
    }
}

/// Applies grants and revocations to record policies.
#[derive(Clone)]
pub struct GrantExecutor {
    store: Arc<RecordStore>,
    crypto: Arc<dyn CryptoService>,
    max_retries: u32,
    reseal_timeout: Duration,
    concurrency: usize,
}

impl std::fmt::Debug for GrantExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantExecutor")
            .field("max_retries", &self.max_retries)
            .field("reseal_timeout", &self.reseal_timeout)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl GrantExecutor {
    pub fn new(store: Arc<RecordStore>, crypto: Arc<dyn CryptoService>, cfg: &CoreConfig) -> Self {
        Self {
            store,
            crypto,
            max_retries: cfg.grant_max_retries(),
            reseal_timeout: cfg.reseal_timeout(),
            concurrency: cfg.grant_concurrency(),
        }
    }

    /// Add `principal` to the record's policy.
    ///
    /// Idempotent: granting a principal that is already a member returns
    /// [`GrantOutcome::Unchanged`] without a reseal.
    ///
    /// # Errors
    ///
    /// - [`ConsentError::RecordNotFound`] if the record does not exist (or was deleted mid-way).
    /// - [`ConsentError::External`] if the reseal failed or missed its deadline.
    /// - [`ConsentError::PolicyConflict`] if every attempt lost a race with another writer.
    pub async fn grant(&self, record_id: &RecordId, principal: &Principal) -> ConsentResult<GrantOutcome> {
        self.apply(record_id, principal, PolicyChange::Grant).await
    }

    /// Remove `principal` from the record's policy. Revoking the owner is a no-op.
    pub async fn revoke(&self, record_id: &RecordId, principal: &Principal) -> ConsentResult<GrantOutcome> {
        self.apply(record_id, principal, PolicyChange::Revoke).await
    }

    pub async fn grant_batch(&self, record_ids: &[RecordId], principal: &Principal) -> BatchReport {
        self.batch(record_ids, principal, PolicyChange::Grant).await
    }

    pub async fn revoke_batch(&self, record_ids: &[RecordId], principal: &Principal) -> BatchReport {
        self.batch(record_ids, principal, PolicyChange::Revoke).await
    }

    async fn apply(
        &self,
        record_id: &RecordId,
        principal: &Principal,
        change: PolicyChange,
    ) -> ConsentResult<GrantOutcome> {
        for attempt in 1..=self.max_retries {
            let record = self.store.get(record_id)?;
            let next = change.apply(&record.policy, principal);
            if next == record.policy {
                tracing::debug!(%record_id, %principal, change = change.as_str(), "policy already up to date");
                return Ok(GrantOutcome::Unchanged);
            }

            let wrapped_key = self
                .reseal(&record.wrapped_key, &record.policy, &next)
                .await?;

            match self
                .store
                .update_policy(record_id, record.policy_version, next, wrapped_key)
            {
                Ok(updated) => {
                    tracing::info!(
                        %record_id,
                        %principal,
                        change = change.as_str(),
                        policy_version = updated.policy_version,
                        "record policy updated"
                    );
                    return Ok(GrantOutcome::Resealed);
                }
                Err(ConsentError::VersionMismatch { found, .. }) => {
                    tracing::debug!(%record_id, attempt, found, "policy write lost a race, retrying");
                }
                Err(err) => return Err(err),
            }
        }

        tracing::warn!(%record_id, %principal, attempts = self.max_retries, "policy update gave up");
        Err(ConsentError::PolicyConflict {
            record_id: *record_id,
            attempts: self.max_retries,
        })
    }

    async fn reseal(
        &self,
        wrapped_key: &WrappedKey,
        old_policy: &AccessPolicy,
        new_policy: &AccessPolicy,
    ) -> ConsentResult<WrappedKey> {
        match tokio::time::timeout(
            self.reseal_timeout,
            self.crypto.reseal(wrapped_key, old_policy, new_policy),
        )
        .await
        {
            Ok(resealed) => Ok(resealed?),
            Err(_) => Err(ExternalError::Timeout {
                service: "crypto service",
                after: self.reseal_timeout,
            }
            .into()),
        }
    }

    async fn batch(&self, record_ids: &[RecordId], principal: &Principal, change: PolicyChange) -> BatchReport {
        // Same id twice would only race with itself.
        let mut seen = HashSet::new();
        let unique: Vec<RecordId> = record_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (index, record_id) in unique.iter().copied().enumerate() {
            let executor = self.clone();
            let principal = principal.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = executor.apply(&record_id, &principal, change).await;
                (index, result)
            });
        }

        let mut slots: Vec<Option<GrantOutcome>> = vec![None; unique.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(outcome))) => slots[index] = Some(outcome),
                Ok((index, Err(err))) => {
                    tracing::warn!(
                        record_id = %unique[index],
                        %principal,
                        change = change.as_str(),
                        error = %err,
                        "policy change failed"
                    );
                    slots[index] = Some(GrantOutcome::from_error(&err));
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "policy change task aborted");
                }
            }
        }

        let results = unique
            .into_iter()
            .zip(slots)
            .map(|(record_id, outcome)| RecordGrantResult {
                record_id,
                outcome: outcome.unwrap_or(GrantOutcome::Failed {
                    reason: "policy change task aborted".into(),
                    retriable: true,
                }),
            })
            .collect();

        BatchReport::from_results(results, Utc::now())
    }
}
