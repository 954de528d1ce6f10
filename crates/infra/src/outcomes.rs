//! Per-request outcomes.
//!
//! Where the result store answers "what is the latest artifact for this
//! entity", outcomes answer "what happened to request R": the bundle's own
//! result plus one entry per dependant job, all keyed by the request id.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::{JobId, RequestId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutcomeStoreError {
    #[error("outcome backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl RequestOutcome {
    pub fn success(link: Option<String>) -> Self {
        Self {
            ok: true,
            link,
            errors: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            ok: false,
            link: None,
            errors,
            recorded_at: Utc::now(),
        }
    }
}

pub trait OutcomeStore: Send + Sync {
    /// Record the request's own outcome; a later call overwrites it.
    fn store(&self, request: RequestId, outcome: RequestOutcome) -> Result<(), OutcomeStoreError>;

    fn store_dependant(&self, request: RequestId, job_id: JobId, outcome: RequestOutcome) -> Result<(), OutcomeStoreError>;

    fn get(&self, request: RequestId) -> Result<Option<RequestOutcome>, OutcomeStoreError>;

    /// Dependant outcomes ordered by job id.
    fn dependants(&self, request: RequestId) -> Result<Vec<(JobId, RequestOutcome)>, OutcomeStoreError>;

    /// Drop requests whose own outcome was recorded before `before`, with
    /// their dependants. Returns how many requests were removed.
    fn prune(&self, before: DateTime<Utc>) -> Result<usize, OutcomeStoreError>;
}

impl<S> OutcomeStore for Arc<S>
where
    S: OutcomeStore + ?Sized,
{
    fn store(&self, request: RequestId, outcome: RequestOutcome) -> Result<(), OutcomeStoreError> {
        (**self).store(request, outcome)
    }

    fn store_dependant(&self, request: RequestId, job_id: JobId, outcome: RequestOutcome) -> Result<(), OutcomeStoreError> {
        (**self).store_dependant(request, job_id, outcome)
    }

    fn get(&self, request: RequestId) -> Result<Option<RequestOutcome>, OutcomeStoreError> {
        (**self).get(request)
    }

    fn dependants(&self, request: RequestId) -> Result<Vec<(JobId, RequestOutcome)>, OutcomeStoreError> {
        (**self).dependants(request)
    }

    fn prune(&self, before: DateTime<Utc>) -> Result<usize, OutcomeStoreError> {
        (**self).prune(before)
    }
}

#[derive(Debug, Default)]
struct Entry {
    own: Option<RequestOutcome>,
    dependants: BTreeMap<JobId, RequestOutcome>,
}

/// In-memory outcome store for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryOutcomeStore {
    entries: RwLock<HashMap<RequestId, Entry>>,
}

impl InMemoryOutcomeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> OutcomeStoreError {
    OutcomeStoreError::Backend("lock poisoned".to_string())
}

impl OutcomeStore for InMemoryOutcomeStore {
    fn store(&self, request: RequestId, outcome: RequestOutcome) -> Result<(), OutcomeStoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.entry(request).or_default().own = Some(outcome);
        Ok(())
    }

    fn store_dependant(&self, request: RequestId, job_id: JobId, outcome: RequestOutcome) -> Result<(), OutcomeStoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.entry(request).or_default().dependants.insert(job_id, outcome);
        Ok(())
    }

    fn get(&self, request: RequestId) -> Result<Option<RequestOutcome>, OutcomeStoreError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(&request).and_then(|e| e.own.clone()))
    }

    fn dependants(&self, request: RequestId) -> Result<Vec<(JobId, RequestOutcome)>, OutcomeStoreError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .get(&request)
            .map(|e| e.dependants.iter().map(|(id, o)| (*id, o.clone())).collect())
            .unwrap_or_default())
    }

    fn prune(&self, before: DateTime<Utc>) -> Result<usize, OutcomeStoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let len = entries.len();
        entries.retain(|_, e| !matches!(&e.own, Some(own) if own.recorded_at < before));
        Ok(len - entries.len())
    }
}
