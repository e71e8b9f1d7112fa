use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::database::Database;
use crate::models::{GradedAnswer, GradingCacheEntry};

/// Content address of one free-text grading input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(
        quiz_id: &str,
        question_id: &str,
        user_id: &str,
        answer: &str,
        strictness: &str,
    ) -> Self {
        let material = format!(
            "{}::{}::{}::{}::{}",
            quiz_id, question_id, user_id, answer, strictness
        );
        let digest = Sha256::digest(material.as_bytes());
        CacheKey(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key to graded-answer store. No expiry; `put` is an upsert.
#[async_trait]
pub trait GradingCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<GradedAnswer>>;
    async fn put(&self, entry: GradingCacheEntry) -> Result<()>;
}

/// Backed by the `ai_evaluations` table.
#[derive(Clone)]
pub struct DatabaseGradingCache {
    db: Database,
}

impl DatabaseGradingCache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl GradingCache for DatabaseGradingCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<GradedAnswer>> {
        self.db.get_evaluation(key.as_str()).await
    }

    async fn put(&self, entry: GradingCacheEntry) -> Result<()> {
        self.db.upsert_evaluation(&entry).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryGradingCache {
    entries: Arc<RwLock<HashMap<String, GradingCacheEntry>>>,
}

impl InMemoryGradingCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GradingCache for InMemoryGradingCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<GradedAnswer>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key.as_str()).map(|entry| entry.result.clone()))
    }

    async fn put(&self, entry: GradingCacheEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(entry.key.clone(), entry);
        debug!(cache_size = entries.len(), "Stored grading result in memory cache");
        Ok(())
    }
}
