use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tracing::{debug, error, warn};

use crate::db::{GuardStore, WindowDecision};
use crate::errors::AppError;

pub const FREE_MODEL_BUCKET: &str = "free_model";
pub const IMAGE_BUCKET: &str = "image";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLimit {
    pub requests: u32,
    pub window: TimeDelta,
}

/// Per-user sliding windows and the in-flight job counter.
///
/// Every store failure is treated as "not allowed".
#[derive(Clone)]
pub struct RateGuard {
    store: Arc<dyn GuardStore>,
    buckets: HashMap<&'static str, BucketLimit>,
    max_concurrent_jobs: u32,
}

impl RateGuard {
    pub fn new(store: Arc<dyn GuardStore>, max_concurrent_jobs: u32) -> Self {
        Self { store, buckets: HashMap::new(), max_concurrent_jobs }
    }

    pub fn with_bucket(mut self, bucket: &'static str, requests: u32, window: TimeDelta) -> Self {
        self.buckets.insert(bucket, BucketLimit { requests, window });
        self
    }

    fn key(bucket: &str, user_id: &str) -> String {
        format!("{bucket}:{user_id}")
    }

    /// Consumes one request from `bucket`. Buckets without a configured limit
    /// are unlimited.
    pub async fn check_and_consume(&self, user_id: &str, bucket: &str) -> WindowDecision {
        let Some(limit) = self.buckets.get(bucket) else {
            return WindowDecision { allowed: true, remaining: u32::MAX };
        };
        let key = Self::key(bucket, user_id);
        match self.store.consume_window(&key, limit.requests, limit.window, Utc::now()).await {
            Ok(decision) => {
                if decision.allowed {
                    debug!("{key}: {} requests left in window", decision.remaining);
                } else {
                    warn!("{key}: rate window exhausted");
                }
                decision
            }
            Err(e) => {
                error!("Rate window check failed for {key}, refusing: {e}");
                WindowDecision { allowed: false, remaining: 0 }
            }
        }
    }

    /// Gives back the most recent consumption from `bucket`.
    pub async fn restore(&self, user_id: &str, bucket: &str) -> Result<(), AppError> {
        if !self.buckets.contains_key(bucket) {
            return Ok(());
        }
        self.store.restore_window(&Self::key(bucket, user_id)).await
    }

    pub async fn increment_concurrent_jobs(&self, user_id: &str) -> bool {
        match self.store.try_acquire_job_slot(user_id, self.max_concurrent_jobs).await {
            Ok(allowed) => allowed,
            Err(e) => {
                error!("Job slot acquisition failed for {user_id}, refusing: {e}");
                false
            }
        }
    }

    pub async fn decrement_concurrent_jobs(&self, user_id: &str) -> Result<(), AppError> {
        self.store.release_job_slot(user_id).await
    }
}
