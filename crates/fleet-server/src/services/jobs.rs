// ============================================
// File: crates/fleet-server/src/services/jobs.rs
// ============================================
//! # Job Store
//!
//! ## Creation Reason
//! Persists every executed batch so operators can page through history,
//! inspect per-step results and re-drive failures.
//!
//! ## Main Functionality
//! - `JobStore::create`: Persist a job, then apply retention
//! - `JobStore::list`: Filtered, newest-first pages
//! - `JobStore::get` / `delete` / `delete_all`
//!
//! ## ⚠️ Important Note for Next Developer
//! - Job ids sort chronologically, so store order is creation order
//! - Retention drops jobs older than `max_age_days` and then the oldest
//!   beyond `max_count`; it never drops the job just created
//!
//! ## Last Modified
//! v0.1.0 - Initial job store

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fleet_common::{JobId, NodeId};
use fleet_core::model::Job;
use fleet_core::{ActionDomain, ActionVerb};

use crate::config::JobsConfig;
use crate::error::{Result, ServerError};
use crate::store::{get_record, list_records, put_record, RecordStore};

const JOB_PREFIX: &str = "jobs/";

fn job_key(id: &JobId) -> String {
    format!("{JOB_PREFIX}{id}")
}

// ============================================
// Query Types
// ============================================

/// Job list filter; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Resource family.
    pub domain: Option<ActionDomain>,
    /// Verb.
    pub action: Option<ActionVerb>,
    /// Jobs with at least one result on this node.
    pub node: Option<NodeId>,
    /// Jobs with (or without) failures.
    pub has_failures: Option<bool>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.domain.map_or(true, |d| job.domain == d)
            && self.action.map_or(true, |a| job.action == a)
            && self.node.as_ref().map_or(true, |n| job.touches(n))
            && self.has_failures.map_or(true, |f| job.has_failures() == f)
    }
}

/// One page of jobs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    /// Jobs on this page, newest first.
    pub items: Vec<Job>,
    /// Jobs matching the filter.
    pub total: usize,
    /// 1-based page number.
    pub page: usize,
    /// Page size.
    pub per_page: usize,
}

// ============================================
// JobStore
// ============================================

/// Persisted batch history.
pub struct JobStore {
    store: Arc<dyn RecordStore>,
    config: JobsConfig,
    write_lock: Mutex<()>,
}

impl JobStore {
    /// Creates a job store.
    pub fn new(store: Arc<dyn RecordStore>, config: JobsConfig) -> Self {
        Self {
            store,
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// Persists a job and applies retention. A failed eviction is logged;
    /// the job itself is already stored.
    ///
    /// # Errors
    /// `Store` if the job cannot be written.
    pub async fn create(&self, job: &Job) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        put_record(self.store.as_ref(), &job_key(&job.id), job).await?;
        debug!(job_id = %job.id, total = job.summary.total, "Job stored");

        match self.evict(&job.id).await {
            Ok(0) => {}
            Ok(evicted) => info!(evicted, "Old jobs evicted"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Job retention pass failed"),
        }
        Ok(())
    }

    async fn evict(&self, keep: &JobId) -> Result<usize> {
        let jobs = list_records::<Job>(self.store.as_ref(), JOB_PREFIX).await?;
        let max_age = self.config.max_age_secs();

        let mut survivors = Vec::with_capacity(jobs.len());
        let mut evicted = 0;
        for (key, job) in jobs {
            let too_old = max_age.is_some_and(|max| job.created_at.age_secs() > max);
            if too_old && &job.id != keep {
                self.store.delete(&key).await?;
                evicted += 1;
            } else {
                survivors.push((key, job.id));
            }
        }

        // Oldest first; trim from the front.
        let excess = survivors.len().saturating_sub(self.config.max_count);
        for (key, id) in survivors.into_iter().filter(|(_, id)| id != keep).take(excess) {
            self.store.delete(&key).await?;
            debug!(job_id = %id, "Job evicted over count limit");
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Returns a job.
    ///
    /// # Errors
    /// `JobNotFound` if no such job exists.
    pub async fn get(&self, id: &JobId) -> Result<Job> {
        get_record(self.store.as_ref(), &job_key(id))
            .await?
            .ok_or_else(|| ServerError::JobNotFound(id.clone()))
    }

    /// Lists matching jobs, newest first. `page` is 1-based.
    ///
    /// # Errors
    /// `Store` on backend failure.
    pub async fn list(&self, filter: &JobFilter, page: usize, per_page: usize) -> Result<JobPage> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 500);

        let mut matching: Vec<Job> = list_records::<Job>(self.store.as_ref(), JOB_PREFIX)
            .await?
            .into_iter()
            .map(|(_, job)| job)
            .filter(|job| filter.matches(job))
            .collect();
        matching.reverse();

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();
        Ok(JobPage {
            items,
            total,
            page,
            per_page,
        })
    }

    /// Deletes a job.
    ///
    /// # Errors
    /// `JobNotFound` if no such job exists.
    pub async fn delete(&self, id: &JobId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.store.delete(&job_key(id)).await? {
            info!(job_id = %id, "Job deleted");
            Ok(())
        } else {
            Err(ServerError::JobNotFound(id.clone()))
        }
    }

    /// Deletes every job, returning how many were removed.
    ///
    /// # Errors
    /// `Store` on backend failure.
    pub async fn delete_all(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut removed = 0;
        for (key, _) in self.store.list(JOB_PREFIX).await? {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        info!(removed, "Job history cleared");
        Ok(removed)
    }
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("max_count", &self.config.max_count)
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::Timestamp;
    use fleet_core::action::InboundRefPayload;
    use fleet_core::model::{BatchRequest, ResultStatus, TargetResult, TargetSelector};
    use fleet_core::{BatchAction, StepScope};

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::store::MemoryStore;

    /// Memory store whose deletes always fail.
    struct StuckDeletes(MemoryStore);

    #[async_trait]
    impl RecordStore for StuckDeletes {
        async fn get(&self, key: &str) -> Result<Option<Value>> {
            self.0.get(key).await
        }

        async fn put(&self, key: &str, value: Value) -> Result<()> {
            self.0.put(key, value).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
            self.0.list(prefix).await
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(ServerError::store("delete", "read-only volume"))
        }
    }

    fn node(id: &str) -> NodeId {
        id.parse().unwrap()
    }

    fn job(millis: u64, server: &str, status: ResultStatus) -> Job {
        let request = BatchRequest::new(
            BatchAction::InboundsDisable(InboundRefPayload { inbound_ids: vec![1] }),
            TargetSelector::Nodes(vec![node(server)]),
        );
        let result = TargetResult::new(node(server), server, StepScope::Inbound { id: 1 }, status);
        let mut job = Job::new(request, vec![result]);
        job.id = JobId::with_millis(millis);
        job
    }

    fn jobs(config: JobsConfig) -> JobStore {
        JobStore::new(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn test_list_newest_first_with_filter() {
        let store = jobs(JobsConfig::default());
        let first = job(1_000, "a", ResultStatus::Success);
        let second = job(2_000, "b", ResultStatus::Failed);
        let third = job(3_000, "a", ResultStatus::Failed);
        for j in [&first, &second, &third] {
            store.create(j).await.unwrap();
        }

        let all = store.list(&JobFilter::default(), 1, 10).await.unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.items[0].id, third.id);

        let filter = JobFilter {
            node: Some(node("a")),
            has_failures: Some(true),
            ..JobFilter::default()
        };
        let page = store.list(&filter, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, third.id);
    }

    #[tokio::test]
    async fn test_pagination() {
        let store = jobs(JobsConfig::default());
        let mut created = Vec::new();
        for i in 1..=5 {
            let j = job(i * 1_000, "a", ResultStatus::Success);
            store.create(&j).await.unwrap();
            created.push(j.id);
        }
        let second = store.list(&JobFilter::default(), 2, 2).await.unwrap();
        assert_eq!(second.total, 5);
        assert_eq!(second.items.len(), 2);
        assert_eq!(second.items[0].id, created[2]);
    }

    #[tokio::test]
    async fn test_count_retention() {
        let store = jobs(JobsConfig {
            max_count: 2,
            max_age_days: 0,
        });
        let mut created = Vec::new();
        for i in 1..=4 {
            let j = job(i * 1_000, "a", ResultStatus::Success);
            store.create(&j).await.unwrap();
            created.push(j.id);
        }
        let page = store.list(&JobFilter::default(), 1, 10).await.unwrap();
        let ids: Vec<JobId> = page.items.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![created[3].clone(), created[2].clone()]);
    }

    #[tokio::test]
    async fn test_age_retention() {
        let store = jobs(JobsConfig {
            max_count: 100,
            max_age_days: 1,
        });
        let mut old = job(1_000, "a", ResultStatus::Success);
        old.created_at = Timestamp::from_secs(Timestamp::now().as_secs() - 3 * 86_400);
        let fresh = job(2_000, "a", ResultStatus::Success);
        store.create(&old).await.unwrap();
        store.create(&fresh).await.unwrap();

        assert!(store.get(&old.id).await.is_err());
        assert!(store.get(&fresh.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_eviction_keeps_new_job() {
        let store = JobStore::new(
            Arc::new(StuckDeletes(MemoryStore::new())),
            JobsConfig {
                max_count: 1,
                max_age_days: 0,
            },
        );
        let first = job(1_000, "a", ResultStatus::Success);
        let second = job(2_000, "a", ResultStatus::Success);
        store.create(&first).await.unwrap();
        store.create(&second).await.unwrap();

        assert!(store.get(&second.id).await.is_ok());
        assert!(store.get(&first.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = jobs(JobsConfig::default());
        let j = job(1_000, "a", ResultStatus::Success);
        store.create(&j).await.unwrap();
        store.delete(&j.id).await.unwrap();
        assert!(matches!(store.delete(&j.id).await, Err(ServerError::JobNotFound(_))));
        assert_eq!(store.delete_all().await.unwrap(), 0);
    }
}
