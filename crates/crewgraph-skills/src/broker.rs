//! Run-scoped tool broker.
//!
//! Sits between the tool loop and the [`SkillRegistry`]. Calls to cacheable
//! skills are deduplicated for the whole run (identical concurrent calls share
//! one execution) and calls that name the same external resource are
//! serialized. Each run gets its own broker from [`ToolBroker::for_run`], so
//! cached results never outlive the run that produced them.

use crate::budget::BudgetState;
use crate::registry::{SkillAllowlist, SkillRegistry};
use crewgraph_core::{CrewResult, ToolCall, ToolResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Outcome of a brokered call.
#[derive(Debug, Clone)]
pub struct BrokeredResult {
    pub result: ToolResult,
    /// Served from cache or from a coalesced in-flight call.
    pub cached: bool,
}

pub struct ToolBroker {
    registry: Arc<SkillRegistry>,
    cache: Mutex<HashMap<String, Arc<OnceCell<ToolResult>>>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ToolBroker {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Empty broker over the same registry, for a new run.
    pub fn for_run(&self) -> Self {
        Self::new(Arc::clone(&self.registry))
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.registry
    }

    /// Execute a call through the allowlist, cache and resource locks.
    pub async fn execute(
        &self,
        call: ToolCall,
        allowlist: &SkillAllowlist,
        budget: &BudgetState,
    ) -> CrewResult<BrokeredResult> {
        let skill = match self.registry.authorize(&call, allowlist)? {
            Ok(skill) => skill,
            Err(denied) => {
                return Ok(BrokeredResult {
                    result: denied,
                    cached: false,
                })
            }
        };
        let descriptor = skill.descriptor();
        let lock_key = descriptor.resource_key(&call);

        let Some(cache_key) = descriptor.cache_key(&call) else {
            let result = self
                .with_resource_lock(lock_key, skill.execute(call, budget))
                .await?;
            return Ok(BrokeredResult {
                result,
                cached: false,
            });
        };

        let cell = {
            let mut cache = self.cache.lock();
            Arc::clone(cache.entry(cache_key).or_default())
        };
        let call_id = call.id.clone();
        let mut executed = false;
        let shared = cell
            .get_or_try_init(|| {
                executed = true;
                self.with_resource_lock(lock_key, skill.execute(call, budget))
            })
            .await?;

        if executed {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(skill = %descriptor.name, "Tool call served from broker cache");
        }
        let mut result = shared.clone();
        result.call_id = call_id;
        Ok(BrokeredResult {
            result,
            cached: !executed,
        })
    }

    async fn with_resource_lock<F>(&self, key: Option<String>, fut: F) -> CrewResult<ToolResult>
    where
        F: Future<Output = CrewResult<ToolResult>>,
    {
        let Some(key) = key else {
            return fut.await;
        };
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key).or_default())
        };
        let _guard = lock.lock().await;
        fut.await
    }

    /// `(hits, misses)` for cacheable calls so far.
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
