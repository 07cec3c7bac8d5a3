use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::core::tokenizer::client::TokenizerClient;

struct TokenizerEntry {
    client: Arc<TokenizerClient>,
    last_used: Instant,
    last_healthy: bool,
}

/// Process-wide `model → tokenizerEntry` registry. `get_tokenizer` returns
/// a cached healthy client when one exists; otherwise it picks the first
/// candidate pod, builds a client against its `/tokenize` endpoint, probes
/// it, and caches the result. A background loop evicts entries idle longer
/// than the configured TTL and re-probes the rest.
pub struct TokenizerPool {
    entries: RwLock<HashMap<String, TokenizerEntry>>,
    port: u16,
}

impl TokenizerPool {
    pub fn new(port: u16) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            port,
        }
    }

    /// `candidate_pods` is `(pod_key, pod_ip)` pairs already filtered by
    /// the caller to pods serving `model` - the pool itself has no notion
    /// of model-to-pod membership, that lives in the datastore.
    pub async fn get_tokenizer(
        &self,
        model: &str,
        candidate_pods: &[(String, String)],
    ) -> Result<Arc<TokenizerClient>> {
        if let Some(client) = self.cached_healthy(model) {
            return Ok(client);
        }

        let (_pod_key, pod_ip) = candidate_pods
            .first()
            .ok_or_else(|| anyhow!("no candidate pod available to build a tokenizer for {model}"))?;

        let endpoint = format!("http://{pod_ip}:{}/tokenize", self.port);
        let client = Arc::new(TokenizerClient::new(endpoint));
        let healthy = client.probe().await;
        if !healthy {
            return Err(anyhow!("tokenizer probe failed for model {model} at pod {pod_ip}"));
        }

        self.entries.write().insert(
            model.to_string(),
            TokenizerEntry {
                client: client.clone(),
                last_used: Instant::now(),
                last_healthy: true,
            },
        );
        Ok(client)
    }

    fn cached_healthy(&self, model: &str) -> Option<Arc<TokenizerClient>> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(model)?;
        if !entry.last_healthy {
            return None;
        }
        entry.last_used = Instant::now();
        Some(entry.client.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Background health-check/TTL-eviction loop, driven by the task
    /// runner (SPEC_FULL.md §4.13). Snapshots entries, probes each without
    /// holding the registry lock across the `.await`, then applies health
    /// updates and TTL evictions in one short write-locked pass.
    pub async fn run(&self, health_check_period: Duration, ttl: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(health_check_period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.health_sweep(ttl).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("tokenizer pool health loop exiting: shutdown requested");
                        return;
                    }
                }
            }
        }
    }

    async fn health_sweep(&self, ttl: Duration) {
        let snapshot: Vec<(String, Arc<TokenizerClient>)> = self
            .entries
            .read()
            .iter()
            .map(|(model, e)| (model.clone(), e.client.clone()))
            .collect();

        let mut health: HashMap<String, bool> = HashMap::new();
        for (model, client) in snapshot {
            health.insert(model, client.probe().await);
        }

        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|model, entry| {
            if now.duration_since(entry.last_used) > ttl {
                info!(model, "evicting idle tokenizer entry");
                return false;
            }
            if let Some(&healthy) = health.get(model) {
                entry.last_healthy = healthy;
            }
            true
        });
    }

    /// Idempotent shutdown: drops every cached client so subsequent
    /// `get_tokenizer` calls rebuild from scratch.
    pub fn close(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_reports_empty() {
        let pool = TokenizerPool::new(8000);
        assert!(pool.is_empty());
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn get_tokenizer_errors_with_no_candidates() {
        let pool = TokenizerPool::new(8000);
        let result = pool.get_tokenizer("m1", &[]).await;
        assert!(result.is_err());
    }

    #[test]
    fn close_clears_all_entries() {
        let pool = TokenizerPool::new(8000);
        pool.entries.write().insert(
            "m1".to_string(),
            TokenizerEntry {
                client: Arc::new(TokenizerClient::new("http://x/tokenize")),
                last_used: Instant::now(),
                last_healthy: true,
            },
        );
        assert_eq!(pool.len(), 1);
        pool.close();
        assert!(pool.is_empty());
    }
}
