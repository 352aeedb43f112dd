use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use crate::executors::Executor;

/// Service-type pattern an executor registers under
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityPattern {
    Exact(String),
    /// `prefix*`: matches any service type starting with `prefix`
    Prefix(String),
    /// `*`
    Any,
}

impl CapabilityPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Self::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            Self::Prefix(prefix.to_string())
        } else {
            Self::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, service_type: &str) -> bool {
        match self {
            Self::Exact(s) => s == service_type,
            Self::Prefix(p) => service_type.starts_with(p.as_str()),
            Self::Any => true,
        }
    }
}

struct Entry {
    pattern: CapabilityPattern,
    executor: Arc<dyn Executor>,
}

/// Ordered capability table. The first matching entry wins.
#[derive(Default)]
pub struct ExecutorRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `executor` under each capability it declares
    pub fn register(&self, executor: Arc<dyn Executor>) {
        let mut entries = self.write();
        for capability in executor.capabilities() {
            entries.push(Entry {
                pattern: CapabilityPattern::parse(capability),
                executor: executor.clone(),
            });
        }
        info!(
            "Registered executor {} for {:?}",
            executor.id(),
            executor.capabilities()
        );
    }

    /// Register `executor` under one explicit pattern
    pub fn register_pattern(&self, pattern: &str, executor: Arc<dyn Executor>) {
        info!("Registered executor {} for {}", executor.id(), pattern);
        self.write().push(Entry {
            pattern: CapabilityPattern::parse(pattern),
            executor,
        });
    }

    /// Remove every entry of executor `id`
    pub fn unregister(&self, id: &str) -> bool {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|e| e.executor.id() != id);
        entries.len() != before
    }

    pub fn route(&self, service_type: &str) -> Option<Arc<dyn Executor>> {
        self.read()
            .iter()
            .find(|e| e.pattern.matches(service_type))
            .map(|e| e.executor.clone())
    }

    /// Every distinct executor able to take `service_type`, in priority order
    pub fn route_all(&self, service_type: &str) -> Vec<Arc<dyn Executor>> {
        let mut seen = HashSet::new();
        self.read()
            .iter()
            .filter(|e| e.pattern.matches(service_type))
            .filter(|e| seen.insert(e.executor.id().to_string()))
            .map(|e| e.executor.clone())
            .collect()
    }

    fn executors(&self) -> Vec<Arc<dyn Executor>> {
        let mut seen = HashSet::new();
        self.read()
            .iter()
            .filter(|e| seen.insert(e.executor.id().to_string()))
            .map(|e| e.executor.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Health of every registered executor, checked concurrently
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let executors = self.executors();
        let checks = executors.iter().map(|executor| {
            let executor = executor.clone();
            tokio::spawn(async move { executor.health_check().await })
        });
        let outcomes = join_all(checks).await;

        executors
            .iter()
            .zip(outcomes)
            .map(|(executor, outcome)| {
                let healthy = match outcome {
                    Ok(Ok(healthy)) => healthy,
                    Ok(Err(e)) => {
                        warn!("Health check of {} failed: {:#}", executor.id(), e);
                        false
                    }
                    Err(e) => {
                        warn!("Health check of {} panicked: {}", executor.id(), e);
                        false
                    }
                };
                (executor.id().to_string(), healthy)
            })
            .collect()
    }
}
