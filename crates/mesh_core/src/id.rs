//! Global id generation.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("Id backend error: {0}")]
    Backend(String),
}

/// Source of cluster-wide unique entity ids.
///
/// Production deployments back this with a shared store; the defaults here
/// need no external service.
#[async_trait]
pub trait GlobalIdGenerator: Send + Sync {
    async fn generate_global_id(&self) -> Result<String, IdError>;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

#[async_trait]
impl GlobalIdGenerator for UuidIdGenerator {
    async fn generate_global_id(&self) -> Result<String, IdError> {
        Ok(Uuid::new_v4().to_string())
    }
}

/// `prefix_1`, `prefix_2`, ... Deterministic, unique within one process.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl GlobalIdGenerator for SequentialIdGenerator {
    async fn generate_global_id(&self) -> Result<String, IdError> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(format!("{}_{}", self.prefix, n))
    }
}
