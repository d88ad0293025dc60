use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use talent_common::redis::question_cache_key;
use talent_common::types::{Language, TestCase};
use tracing::info;

use crate::cache::ResultCache;

/// A coding question with its hidden and public test cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub test_cases: Vec<TestCase>,
    /// Empty means every supported language
    #[serde(default)]
    pub allowed_languages: Vec<Language>,
}

impl Problem {
    pub fn allows(&self, language: Language) -> bool {
        self.allowed_languages.is_empty() || self.allowed_languages.contains(&language)
    }
}

/// Read-only source of problems.
#[async_trait]
pub trait ProblemStore: Send + Sync {
    async fn get_problem(&self, problem_id: &str) -> anyhow::Result<Option<Problem>>;
}

pub struct InMemoryProblemStore {
    problems: HashMap<String, Problem>,
}

impl InMemoryProblemStore {
    pub fn new(problems: Vec<Problem>) -> anyhow::Result<Self> {
        let mut by_id = HashMap::with_capacity(problems.len());
        for problem in problems {
            if by_id.contains_key(&problem.id) {
                bail!("duplicate problem id {}", problem.id);
            }
            by_id.insert(problem.id.clone(), problem);
        }
        Ok(Self { problems: by_id })
    }

    /// Parse a JSON array of problems.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let problems: Vec<Problem> = serde_json::from_str(json).context("Failed to parse problems JSON")?;
        Self::new(problems)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read problems file {}", path.display()))?;
        let store = Self::from_json(&json).with_context(|| format!("Invalid problems file {}", path.display()))?;
        info!(path = %path.display(), count = store.len(), "Loaded problems");
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }
}

#[async_trait]
impl ProblemStore for InMemoryProblemStore {
    async fn get_problem(&self, problem_id: &str) -> anyhow::Result<Option<Problem>> {
        Ok(self.problems.get(problem_id).cloned())
    }
}

/// Read-through cache in front of another store, under the question TTL.
pub struct CachedProblemStore {
    inner: Arc<dyn ProblemStore>,
    cache: Arc<ResultCache>,
}

impl CachedProblemStore {
    pub fn new(inner: Arc<dyn ProblemStore>, cache: Arc<ResultCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl ProblemStore for CachedProblemStore {
    async fn get_problem(&self, problem_id: &str) -> anyhow::Result<Option<Problem>> {
        let ttl = self.cache.ttl().questions;
        self.cache
            .get_or_load(&question_cache_key(problem_id), ttl, || self.inner.get_problem(problem_id))
            .await
    }
}
