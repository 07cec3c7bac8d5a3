use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::core::cache::store::PrefixCacheStore;
use crate::core::hash::BlockHash;

/// Backing store for `(model, hash) → {pod}` lookups consulted by the
/// prefix/KV scoring plugins. The in-memory `PrefixCacheStore` is always
/// available; an optional `redis`-backed implementation can stand in for
/// it when the router is deployed with multiple replicas sharing cache
/// affinity state. Any backend error is advisory: callers fall back to
/// treating the query as a miss rather than failing the request.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn pods_for(&self, model: &str, hash: BlockHash) -> anyhow::Result<HashSet<String>>;
}

/// Wraps the local `PrefixCacheStore` so it can be used anywhere a
/// `KvBackend` is expected.
pub struct LocalKvBackend {
    store: Arc<PrefixCacheStore>,
}

impl LocalKvBackend {
    pub fn new(store: Arc<PrefixCacheStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl KvBackend for LocalKvBackend {
    async fn pods_for(&self, model: &str, hash: BlockHash) -> anyhow::Result<HashSet<String>> {
        Ok(self.store.pods_for_hash(model, hash))
    }
}

/// Default Redis pipeline timeout, per §5's "bounded by a 5s timeout".
pub const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

/// Key prefix for the distributed store, e.g. `"kvcache:"`.
pub fn redis_key(prefix: &str, model: &str, hash: BlockHash) -> String {
    format!("{prefix}{model}@{hash}")
}

/// Given the stringified pod identifiers Redis returns
/// (`podName.namespace.svc.cluster.local` or similar), keep only the first
/// dot-segment, which is the pod name.
pub fn pod_name_from_member(member: &str) -> &str {
    member.split('.').next().unwrap_or(member)
}

#[cfg(feature = "redis-backend")]
pub mod redis_impl {
    use super::*;
    use redis::AsyncCommands;
    use tokio::time::timeout;

    pub struct RedisKvBackend {
        client: redis::Client,
        key_prefix: String,
    }

    impl RedisKvBackend {
        pub fn new(redis_url: &str, key_prefix: impl Into<String>) -> anyhow::Result<Self> {
            Ok(Self {
                client: redis::Client::open(redis_url)?,
                key_prefix: key_prefix.into(),
            })
        }
    }

    #[async_trait]
    impl KvBackend for RedisKvBackend {
        async fn pods_for(
            &self,
            model: &str,
            hash: BlockHash,
        ) -> anyhow::Result<HashSet<String>> {
            let key = redis_key(&self.key_prefix, model, hash);
            let mut conn = timeout(REDIS_TIMEOUT, self.client.get_multiplexed_tokio_connection())
                .await??;
            let members: Vec<String> =
                timeout(REDIS_TIMEOUT, conn.smembers(&key)).await??;
            Ok(members
                .iter()
                .map(|m| pod_name_from_member(m).to_string())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_name_strips_service_suffix() {
        assert_eq!(
            pod_name_from_member("worker-0.ns.svc.cluster.local"),
            "worker-0"
        );
        assert_eq!(pod_name_from_member("worker-0"), "worker-0");
    }

    #[test]
    fn redis_key_format() {
        assert_eq!(redis_key("kvcache:", "llama3", 42), "kvcache:llama3@42");
    }

    #[tokio::test]
    async fn local_backend_round_trips_through_store() {
        let store = Arc::new(PrefixCacheStore::new(4, 1000));
        store.add("m1", &[7], "pod-a");
        let backend = LocalKvBackend::new(store);
        let pods = backend.pods_for("m1", 7).await.unwrap();
        assert!(pods.contains("pod-a"));
    }
}
