use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Scope shared by every agent.
pub const GLOBAL_SCOPE: &str = "global";

// ---------------------------------------------------------------------------
// MemoryEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    /// Owning scope, usually an agent id or [`GLOBAL_SCOPE`].
    pub scope: String,
    pub category: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(
        scope: impl Into<String>,
        category: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope: scope.into(),
            category: category.into(),
            title: title.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    fn visible_in(&self, scope: &str) -> bool {
        self.scope == scope || self.scope == GLOBAL_SCOPE
    }

    /// Number of distinct query terms found in title, category or content.
    fn score(&self, terms: &[String]) -> usize {
        let haystack = format!("{} {} {}", self.title, self.category, self.content).to_lowercase();
        terms.iter().filter(|t| haystack.contains(t.as_str())).count()
    }
}

// ---------------------------------------------------------------------------
// Memory trait
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory entry rejected: {0}")]
    Rejected(String),
    #[error("memory backend unavailable: {0}")]
    Unavailable(String),
}

/// Long-term memory collaborator.
#[async_trait]
pub trait Memory: Send + Sync {
    async fn add(&self, entry: MemoryEntry) -> Result<Uuid, MemoryError>;

    /// Entries visible in `scope` that match `query`, best match first.
    async fn search(&self, query: &str, scope: &str) -> Result<Vec<MemoryEntry>, MemoryError>;

    /// Every entry visible in `scope`, oldest first.
    async fn list(&self, scope: &str) -> Result<Vec<MemoryEntry>, MemoryError>;
}

// ---------------------------------------------------------------------------
// InMemoryMemory
// ---------------------------------------------------------------------------

/// Process-local memory with term-overlap search.
#[derive(Debug, Default)]
pub struct InMemoryMemory {
    entries: RwLock<Vec<MemoryEntry>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
        .map(str::to_lowercase)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

#[async_trait]
impl Memory for InMemoryMemory {
    async fn add(&self, entry: MemoryEntry) -> Result<Uuid, MemoryError> {
        if entry.title.trim().is_empty() && entry.content.trim().is_empty() {
            return Err(MemoryError::Rejected("title and content are both empty".into()));
        }
        let id = entry.id;
        self.entries.write().await.push(entry);
        Ok(id)
    }

    async fn search(&self, query: &str, scope: &str) -> Result<Vec<MemoryEntry>, MemoryError> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let entries = self.entries.read().await;
        let mut scored: Vec<(usize, &MemoryEntry)> = entries
            .iter()
            .filter(|e| e.visible_in(scope))
            .map(|e| (e.score(&terms), e))
            .filter(|(score, _)| *score > 0)
            .collect();
        // Best score first; newer entries win ties.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.created_at.cmp(&a.1.created_at)));
        Ok(scored.into_iter().map(|(_, e)| e.clone()).collect())
    }

    async fn list(&self, scope: &str) -> Result<Vec<MemoryEntry>, MemoryError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.visible_in(scope))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
