use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::core::datastore::engine_adapter::EngineAdapter;
use crate::core::datastore::types::{
    key_str, CallbackKind, ModelMatch, ModelRoute, ModelServer, PdGroupSpec, PodInfoMutable,
    PodMetrics, PodRecord, ResourceEvent, RouteRule, TargetModel,
};

/// A registered subscriber for one `CallbackKind`. Invoked with the event's
/// key only - never a live handle - so subscribers can't create reference
/// cycles back into datastore state.
pub type CallbackFn = Arc<dyn Fn(ResourceEvent) + Send + Sync>;

struct PodEntry {
    namespace: String,
    name: String,
    record: PodRecord,
    mutable: PodInfoMutable,
}

impl PodEntry {
    fn new(namespace: &str, name: &str, record: PodRecord) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            record,
            mutable: PodInfoMutable::default(),
        }
    }
}

/// Read-only snapshot of one `PodInfo`, returned to callers and the admin
/// surface - never a handle into live, lockable state.
#[derive(Debug, Clone, Serialize)]
pub struct PodSnapshot {
    pub namespace: String,
    pub name: String,
    pub record: PodRecord,
    pub engine: String,
    pub metrics: PodMetrics,
    pub models: HashSet<String>,
    pub model_servers: HashSet<String>,
}

#[derive(Default)]
struct ResourceMaps {
    model_servers: HashMap<String, Arc<RwLock<ModelServer>>>,
    pods: HashMap<String, Arc<RwLock<PodEntry>>>,
}

#[derive(Default)]
struct RouteMaps {
    routes: HashMap<String, ModelRoute>,
    by_model: HashMap<String, String>,
    by_lora: HashMap<String, String>,
}

/// Authoritative in-memory state of model-servers, pods and routes. See
/// SPEC_FULL.md §4.1: two top-level RW locks (`resources`, `routes`) sit
/// above per-MS and per-pod locks; lock order is always datastore → MS →
/// PodInfo, never the reverse.
pub struct Datastore {
    resources: RwLock<ResourceMaps>,
    routes: RwLock<RouteMaps>,
    callbacks: RwLock<HashMap<CallbackKind, Vec<CallbackFn>>>,
    started: AtomicBool,
    engine_adapter: Arc<dyn EngineAdapter>,
}

impl Datastore {
    pub fn new(engine_adapter: Arc<dyn EngineAdapter>) -> Self {
        Self {
            resources: RwLock::new(ResourceMaps::default()),
            routes: RwLock::new(RouteMaps::default()),
            callbacks: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            engine_adapter,
        }
    }

    fn get_ms_arc(&self, key: &str) -> Option<Arc<RwLock<ModelServer>>> {
        self.resources.read().model_servers.get(key).cloned()
    }

    fn get_pod_arc(&self, key: &str) -> Option<Arc<RwLock<PodEntry>>> {
        self.resources.read().pods.get(key).cloned()
    }

    fn rebuild_pd_groups(&self, ms_arc: &Arc<RwLock<ModelServer>>) {
        let pod_keys: Vec<String> = ms_arc.read().pods.iter().cloned().collect();
        let mut labels = HashMap::new();
        for pod_key in &pod_keys {
            if let Some(pod_arc) = self.get_pod_arc(pod_key) {
                labels.insert(pod_key.clone(), pod_arc.read().record.labels.clone());
            }
        }
        ms_arc.write().rebuild_pd_groups(&labels);
    }

    // ---------------------------------------------------------------
    // Model servers
    // ---------------------------------------------------------------

    /// Upsert an MS record and replace its pod set. Cross-linking the
    /// reverse `PodInfo.model_servers` edge happens here for pods already
    /// known to the datastore; pods that arrive later cross-link
    /// themselves in `add_or_update_pod`.
    pub fn add_or_update_model_server(
        &self,
        namespace: &str,
        name: &str,
        pod_keys: HashSet<String>,
        pd_group: Option<PdGroupSpec>,
        engine: Option<String>,
    ) {
        let key = key_str(namespace, name);
        let ms_arc = {
            let mut res = self.resources.write();
            res.model_servers
                .entry(key.clone())
                .or_insert_with(|| Arc::new(RwLock::new(ModelServer::new(namespace, name))))
                .clone()
        };

        let (old_pods, engine) = {
            let mut ms = ms_arc.write();
            let old = std::mem::replace(&mut ms.pods, pod_keys.clone());
            ms.pd_group = pd_group;
            if engine.is_some() {
                ms.engine = engine;
            }
            (old, ms.engine.clone())
        };

        for pod_key in pod_keys.difference(&old_pods) {
            if let Some(pod_arc) = self.get_pod_arc(pod_key) {
                let mut pod = pod_arc.write();
                pod.mutable.model_servers.insert(key.clone());
                if pod.mutable.engine.is_empty() {
                    if let Some(engine) = &engine {
                        pod.mutable.engine = engine.clone();
                    }
                }
            }
        }
        for pod_key in old_pods.difference(&pod_keys) {
            if let Some(pod_arc) = self.get_pod_arc(pod_key) {
                pod_arc.write().mutable.model_servers.remove(&key);
            }
        }

        self.rebuild_pd_groups(&ms_arc);
        self.fire(CallbackKind::ModelServerUpdate, ResourceEvent::ModelServer(key));
    }

    /// Remove an MS; every referenced pod has the MS stripped from its
    /// `model_servers` set, and any pod left with no model-servers is
    /// deleted outright (invariant 2 in SPEC_FULL.md §3).
    pub fn delete_model_server(&self, namespace: &str, name: &str) {
        let key = key_str(namespace, name);
        let ms_arc = {
            let mut res = self.resources.write();
            res.model_servers.remove(&key)
        };
        let Some(ms_arc) = ms_arc else {
            return;
        };

        let pod_keys: Vec<String> = ms_arc.read().pods.iter().cloned().collect();
        for pod_key in pod_keys {
            let should_delete = if let Some(pod_arc) = self.get_pod_arc(&pod_key) {
                let mut pod = pod_arc.write();
                pod.mutable.model_servers.remove(&key);
                pod.mutable.model_servers.is_empty()
            } else {
                false
            };
            if should_delete {
                self.delete_pod_by_key(&pod_key);
            }
        }

        self.fire(CallbackKind::ModelServerDelete, ResourceEvent::ModelServer(key));
    }

    pub fn get_model_server(&self, namespace: &str, name: &str) -> Option<ModelServer> {
        self.get_ms_arc(&key_str(namespace, name))
            .map(|arc| arc.read().clone())
    }

    pub fn get_pods_by_model_server(&self, namespace: &str, name: &str) -> Option<Vec<PodSnapshot>> {
        let ms_arc = self.get_ms_arc(&key_str(namespace, name))?;
        let pod_keys: Vec<String> = ms_arc.read().pods.iter().cloned().collect();
        Some(
            pod_keys
                .iter()
                .filter_map(|k| self.get_pod(k))
                .collect(),
        )
    }

    pub fn list_model_servers(&self) -> Vec<ModelServer> {
        self.resources
            .read()
            .model_servers
            .values()
            .map(|arc| arc.read().clone())
            .collect()
    }

    // ---------------------------------------------------------------
    // Pods
    // ---------------------------------------------------------------

    /// Upsert a `PodInfo`, set its engine from the first model-server in
    /// `model_server_keys` that names one, and cross-link each referenced
    /// MS's pod set. Unknown model-servers are logged and skipped (missing
    /// MS on pod operations is not an error per SPEC_FULL.md §4.1).
    pub fn add_or_update_pod(
        &self,
        namespace: &str,
        name: &str,
        record: PodRecord,
        model_server_keys: HashSet<String>,
    ) {
        let key = key_str(namespace, name);
        let pod_arc = {
            let mut res = self.resources.write();
            res.pods
                .entry(key.clone())
                .or_insert_with(|| Arc::new(RwLock::new(PodEntry::new(namespace, name, record.clone()))))
                .clone()
        };

        let engine = model_server_keys.iter().find_map(|ms_key| {
            self.get_ms_arc(ms_key).and_then(|arc| arc.read().engine.clone())
        });

        let old_mses = {
            let mut pod = pod_arc.write();
            pod.record = record;
            if let Some(engine) = engine {
                pod.mutable.engine = engine;
            } else if pod.mutable.engine.is_empty() {
                pod.mutable.engine = "vllm".to_string();
            }
            std::mem::replace(&mut pod.mutable.model_servers, model_server_keys.clone())
        };

        for ms_key in model_server_keys.difference(&old_mses) {
            match self.get_ms_arc(ms_key) {
                Some(ms_arc) => {
                    ms_arc.write().pods.insert(key.clone());
                    self.rebuild_pd_groups(&ms_arc);
                }
                None => warn!(ms = %ms_key, pod = %key, "AddOrUpdatePod referenced unknown model-server, skipping"),
            }
        }
        for ms_key in old_mses.difference(&model_server_keys) {
            if let Some(ms_arc) = self.get_ms_arc(ms_key) {
                ms_arc.write().pods.remove(&key);
                self.rebuild_pd_groups(&ms_arc);
            }
        }

        self.fire(CallbackKind::PodUpdate, ResourceEvent::Pod(key));
    }

    fn delete_pod_by_key(&self, key: &str) {
        let removed = self.resources.write().pods.remove(key);
        if removed.is_some() {
            self.fire(CallbackKind::PodDelete, ResourceEvent::Pod(key.to_string()));
        }
    }

    /// Remove a pod from every MS it referenced, then delete it.
    pub fn delete_pod(&self, namespace: &str, name: &str) {
        let key = key_str(namespace, name);
        let ms_keys = self
            .get_pod_arc(&key)
            .map(|arc| arc.read().mutable.model_servers.clone())
            .unwrap_or_default();
        for ms_key in ms_keys {
            if let Some(ms_arc) = self.get_ms_arc(&ms_key) {
                ms_arc.write().pods.remove(&key);
                self.rebuild_pd_groups(&ms_arc);
            }
        }
        self.delete_pod_by_key(&key);
    }

    pub fn get_pod(&self, key: &str) -> Option<PodSnapshot> {
        self.get_pod_arc(key).map(|arc| {
            let pod = arc.read();
            PodSnapshot {
                namespace: pod.namespace.clone(),
                name: pod.name.clone(),
                record: pod.record.clone(),
                engine: pod.mutable.engine.clone(),
                metrics: pod.mutable.metrics.clone(),
                models: pod.mutable.models.clone(),
                model_servers: pod.mutable.model_servers.clone(),
            }
        })
    }

    pub fn list_pods(&self) -> Vec<PodSnapshot> {
        let keys: Vec<String> = self.resources.read().pods.keys().cloned().collect();
        keys.iter().filter_map(|k| self.get_pod(k)).collect()
    }

    // ---------------------------------------------------------------
    // Routes
    // ---------------------------------------------------------------

    pub fn add_or_update_model_route(&self, route: ModelRoute) {
        let key = route.key();
        {
            let mut routes = self.routes.write();
            if !route.model_name.is_empty() {
                routes.by_model.insert(route.model_name.clone(), key.clone());
            }
            for lora in &route.lora_adapters {
                routes.by_lora.insert(lora.clone(), key.clone());
            }
            routes.routes.insert(key.clone(), route);
        }
        self.fire(CallbackKind::ModelRouteUpdate, ResourceEvent::ModelRoute(key));
    }

    pub fn delete_model_route(&self, namespace: &str, name: &str) {
        let key = key_str(namespace, name);
        {
            let mut routes = self.routes.write();
            if let Some(route) = routes.routes.remove(&key) {
                if routes.by_model.get(&route.model_name) == Some(&key) {
                    routes.by_model.remove(&route.model_name);
                }
                for lora in &route.lora_adapters {
                    if routes.by_lora.get(lora) == Some(&key) {
                        routes.by_lora.remove(lora);
                    }
                }
            }
        }
        self.fire(CallbackKind::ModelRouteDelete, ResourceEvent::ModelRoute(key));
    }

    /// Resolve `modelName` (or a LoRA adapter name) plus request headers/
    /// URI to a destination model-server, picking among `targetModels` by
    /// weighted random selection. `None` means no route matched.
    pub fn match_model_server(
        &self,
        model_name: &str,
        headers: &HashMap<String, String>,
        uri: &str,
    ) -> Option<(String, bool)> {
        let routes = self.routes.read();
        let (route_key, is_lora) = if let Some(k) = routes.by_model.get(model_name) {
            (k.clone(), false)
        } else if let Some(k) = routes.by_lora.get(model_name) {
            (k.clone(), true)
        } else {
            return None;
        };
        let route = routes.routes.get(&route_key)?;
        for rule in &route.rules {
            if rule_matches(rule, headers, uri) {
                let target = select_weighted_target(&rule.target_models)?;
                return Some((target, is_lora));
            }
        }
        None
    }

    // ---------------------------------------------------------------
    // Callbacks
    // ---------------------------------------------------------------

    /// Register a subscriber for one event kind. Must be called before
    /// `run` starts; registering afterward is rejected.
    pub fn register_callback(&self, kind: CallbackKind, f: CallbackFn) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(anyhow!("cannot register a datastore callback after Run has started"));
        }
        self.callbacks.write().entry(kind).or_default().push(f);
        Ok(())
    }

    /// Fan out an event to every subscriber of `kind`, each isolated in its
    /// own task with `catch_unwind` around the (synchronous) callback body
    /// so one panicking subscriber can't poison the refresh loop or any
    /// other caller.
    fn fire(&self, kind: CallbackKind, event: ResourceEvent) {
        let subs = self.callbacks.read().get(&kind).cloned().unwrap_or_default();
        for cb in subs {
            let event = event.clone();
            tokio::spawn(async move {
                if std::panic::catch_unwind(AssertUnwindSafe(|| cb(event))).is_err() {
                    error!("datastore callback panicked; subscriber isolated");
                }
            });
        }
    }

    // ---------------------------------------------------------------
    // Refresh loop
    // ---------------------------------------------------------------

    /// Periodic metrics/models refresh loop. Snapshots the pod set under a
    /// read lock, then issues per-pod adapter calls without holding any
    /// datastore lock across the `.await`. Exits when `shutdown` reports
    /// true.
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        self.started.store(true, Ordering::Release);
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh_tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("datastore refresh loop exiting: shutdown requested");
                        return;
                    }
                }
            }
        }
    }

    async fn refresh_tick(&self) {
        let snapshot: Vec<(String, String, String)> = {
            let res = self.resources.read();
            res.pods
                .values()
                .map(|arc| {
                    let pod = arc.read();
                    (key_str(&pod.namespace, &pod.name), pod.mutable.engine.clone(), pod.record.ip.clone())
                })
                .collect()
        };

        for (key, engine, ip) in snapshot {
            if ip.is_empty() {
                continue;
            }
            let (previous_tpot, previous_ttft) = self
                .get_pod_arc(&key)
                .map(|pod_arc| {
                    let pod = pod_arc.read();
                    (
                        pod.mutable.metrics.time_per_output_token.clone(),
                        pod.mutable.metrics.time_to_first_token.clone(),
                    )
                })
                .unwrap_or_default();

            match self
                .engine_adapter
                .get_pod_metrics(&engine, &ip, &previous_tpot, &previous_ttft)
                .await
            {
                Ok((gauges, tpot_delta, ttft_delta)) => {
                    if let Some(pod_arc) = self.get_pod_arc(&key) {
                        let mut pod = pod_arc.write();
                        let metrics = &mut pod.mutable.metrics;
                        metrics.gpu_cache_usage = gauges.gpu_cache_usage.clamp(0.0, 100.0);
                        metrics.request_waiting_num = gauges.request_waiting_num;
                        metrics.request_running_num = gauges.request_running_num;
                        if gauges.tpot != 0.0 {
                            metrics.tpot = gauges.tpot;
                        }
                        if gauges.ttft != 0.0 {
                            metrics.ttft = gauges.ttft;
                        }
                        metrics.time_per_output_token = tpot_delta;
                        metrics.time_to_first_token = ttft_delta;
                    }
                }
                Err(e) => {
                    warn!(pod = %key, error = %e, "pod metrics refresh failed, keeping last known values");
                }
            }

            match self.engine_adapter.get_pod_models(&engine, &ip).await {
                Ok(models) => {
                    if let Some(pod_arc) = self.get_pod_arc(&key) {
                        pod_arc.write().mutable.models = models.into_iter().collect();
                    }
                    self.fire(CallbackKind::PodUpdate, ResourceEvent::Pod(key.clone()));
                }
                Err(e) => {
                    warn!(pod = %key, error = %e, "pod models refresh failed, keeping last known set");
                }
            }
        }
    }
}

fn rule_matches(rule: &RouteRule, headers: &HashMap<String, String>, uri: &str) -> bool {
    rule.model_match
        .as_ref()
        .map(|m: &ModelMatch| m.matches(headers, uri))
        .unwrap_or(true)
}

/// Weighted-random destination selection. Weights are all-or-nothing: if
/// every target carries one, pick proportionally; otherwise pick uniformly
/// at random, ignoring any partial weights.
fn select_weighted_target(targets: &[TargetModel]) -> Option<String> {
    if targets.is_empty() {
        return None;
    }
    let all_weighted = targets.iter().all(|t| t.weight.is_some());
    if all_weighted {
        let total: u32 = targets.iter().filter_map(|t| t.weight).sum();
        if total == 0 {
            return Some(targets[0].model_server.clone());
        }
        let mut pick = rand::thread_rng().gen_range(0..total);
        for t in targets {
            let w = t.weight.unwrap_or(0);
            if pick < w {
                return Some(t.model_server.clone());
            }
            pick -= w;
        }
        Some(targets.last().unwrap().model_server.clone())
    } else {
        let idx = rand::thread_rng().gen_range(0..targets.len());
        Some(targets[idx].model_server.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::datastore::engine_adapter::PodGauges;
    use crate::core::datastore::types::StringMatch;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct StubAdapter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EngineAdapter for StubAdapter {
        async fn get_pod_metrics(
            &self,
            _engine: &str,
            _pod_ip: &str,
            _previous_tpot: &super::super::types::HistogramSnapshot,
            _previous_ttft: &super::super::types::HistogramSnapshot,
        ) -> Result<(PodGauges, super::super::types::HistogramSnapshot, super::super::types::HistogramSnapshot)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((
                PodGauges {
                    gpu_cache_usage: 0.5,
                    request_waiting_num: 2,
                    request_running_num: 4,
                    tpot: 0.02,
                    ttft: 0.1,
                },
                HashMap::new(),
                HashMap::new(),
            ))
        }

        async fn get_pod_models(&self, _engine: &str, _pod_ip: &str) -> Result<Vec<String>> {
            Ok(vec!["llama3".to_string()])
        }
    }

    fn ds() -> Datastore {
        Datastore::new(Arc::new(StubAdapter { calls: AtomicUsize::new(0) }))
    }

    #[test]
    fn adding_ms_then_pod_cross_links() {
        let store = ds();
        store.add_or_update_model_server(
            "ns",
            "ms1",
            HashSet::new(),
            None,
            Some("vllm".to_string()),
        );
        store.add_or_update_pod(
            "ns",
            "pod-a",
            PodRecord { ip: "10.0.0.1".into(), ..Default::default() },
            HashSet::from(["ns/ms1".to_string()]),
        );

        let ms = store.get_model_server("ns", "ms1").unwrap();
        assert!(ms.pods.contains("ns/pod-a"));
        let pod = store.get_pod("ns/pod-a").unwrap();
        assert!(pod.model_servers.contains("ns/ms1"));
        assert_eq!(pod.engine, "vllm");
    }

    #[test]
    fn deleting_ms_deletes_orphaned_pods() {
        let store = ds();
        store.add_or_update_model_server("ns", "ms1", HashSet::new(), None, None);
        store.add_or_update_pod(
            "ns",
            "pod-a",
            PodRecord::default(),
            HashSet::from(["ns/ms1".to_string()]),
        );
        store.delete_model_server("ns", "ms1");
        assert!(store.get_pod("ns/pod-a").is_none());
    }

    #[test]
    fn unknown_ms_on_pod_add_is_skipped_not_errored() {
        let store = ds();
        store.add_or_update_pod(
            "ns",
            "pod-a",
            PodRecord::default(),
            HashSet::from(["ns/ghost".to_string()]),
        );
        assert!(store.get_pod("ns/pod-a").is_some());
    }

    #[test]
    fn route_matching_exact_rule_and_weighted_targets() {
        let store = ds();
        let mut headers = HashMap::new();
        headers.insert("x-tenant".to_string(), StringMatch::Exact("gold".into()));
        let route = ModelRoute {
            namespace: "ns".into(),
            name: "r1".into(),
            model_name: "gpt".into(),
            lora_adapters: vec![],
            rules: vec![RouteRule {
                model_match: Some(ModelMatch { headers, uri: None }),
                target_models: vec![
                    TargetModel { model_server: "ns/a".into(), weight: Some(3) },
                    TargetModel { model_server: "ns/b".into(), weight: Some(1) },
                ],
            }],
        };
        store.add_or_update_model_route(route);

        let mut req_headers = HashMap::new();
        req_headers.insert("x-tenant".to_string(), "gold".to_string());
        let result = store.match_model_server("gpt", &req_headers, "/v1/chat");
        assert!(result.is_some());

        req_headers.insert("x-tenant".to_string(), "silver".to_string());
        assert!(store.match_model_server("gpt", &req_headers, "/v1/chat").is_none());
    }

    #[test]
    fn route_weighted_selection_distribution() {
        let store = ds();
        let route = ModelRoute {
            namespace: "ns".into(),
            name: "r1".into(),
            model_name: "gpt".into(),
            lora_adapters: vec![],
            rules: vec![RouteRule {
                model_match: None,
                target_models: vec![
                    TargetModel { model_server: "A".into(), weight: Some(3) },
                    TargetModel { model_server: "B".into(), weight: Some(1) },
                ],
            }],
        };
        store.add_or_update_model_route(route);

        let mut a_count = 0;
        for _ in 0..10_000 {
            let (target, _) = store.match_model_server("gpt", &HashMap::new(), "/").unwrap();
            if target == "A" {
                a_count += 1;
            }
        }
        let frac = a_count as f64 / 10_000.0;
        assert!((frac - 0.75).abs() < 0.03, "fraction routed to A was {frac}");
    }

    #[tokio::test]
    async fn refresh_tick_updates_pod_metrics_and_models() {
        let store = ds();
        store.add_or_update_pod(
            "ns",
            "pod-a",
            PodRecord { ip: "10.0.0.1".into(), ..Default::default() },
            HashSet::new(),
        );
        store.refresh_tick().await;
        let pod = store.get_pod("ns/pod-a").unwrap();
        assert_eq!(pod.metrics.request_waiting_num, 2);
        assert!(pod.models.contains("llama3"));
    }

    #[test]
    fn callback_registration_rejected_after_start() {
        let store = ds();
        store.started.store(true, Ordering::Release);
        let result = store.register_callback(CallbackKind::PodUpdate, Arc::new(|_| {}));
        assert!(result.is_err());
    }
}
