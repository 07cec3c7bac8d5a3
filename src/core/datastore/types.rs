use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Lightweight stand-in for the raw pod record the datastore caches per
/// `PodInfo` - IP, labels and status phase are all routing ever needs.
/// A full `k8s_openapi::api::core::v1::Pod` is heavier than this datastore
/// requires; informers (out of scope) are what would actually populate it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PodRecord {
    pub ip: String,
    pub labels: HashMap<String, String>,
    pub phase: String,
    pub ready: bool,
}

/// Cumulative histogram snapshot as reported by an engine adapter. Deltas
/// are computed by subtracting the previous snapshot bucket-by-bucket;
/// missing keys on either side are treated as zero.
pub type HistogramSnapshot = HashMap<String, f64>;

pub fn histogram_delta(prev: &HistogramSnapshot, next: &HistogramSnapshot) -> HistogramSnapshot {
    let mut delta = HistogramSnapshot::new();
    for (bucket, next_val) in next {
        let prev_val = prev.get(bucket).copied().unwrap_or(0.0);
        delta.insert(bucket.clone(), (next_val - prev_val).max(0.0));
    }
    delta
}

/// Snapshot of the mutable metric fields on a `PodInfo`, as returned to
/// admin-surface callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodMetrics {
    pub gpu_cache_usage: f64,
    pub request_waiting_num: u64,
    pub request_running_num: u64,
    pub tpot: f64,
    pub ttft: f64,
    pub time_per_output_token: HistogramSnapshot,
    pub time_to_first_token: HistogramSnapshot,
}

impl Default for PodMetrics {
    fn default() -> Self {
        Self {
            gpu_cache_usage: 0.0,
            request_waiting_num: 0,
            request_running_num: 0,
            tpot: 0.0,
            ttft: 0.0,
            time_per_output_token: HistogramSnapshot::new(),
            time_to_first_token: HistogramSnapshot::new(),
        }
    }
}

/// `(namespace, name)` identity shared by `ModelServer` and `PodInfo`.
pub type Key = (String, String);

pub fn key_str(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// PD-group membership rule carried by a `ModelServer`: a label name to
/// group pods by, plus label selectors that classify a pod as decode
/// and/or prefill within its group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdGroupSpec {
    pub group_key: String,
    pub decode_labels: HashMap<String, String>,
    pub prefill_labels: HashMap<String, String>,
}

/// Derived decode/prefill pod sets for one PD group value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PdGroupPods {
    pub decode_pods: HashSet<String>,
    pub prefill_pods: HashSet<String>,
}

/// A registered model-server: an owner of a pod set, optionally split into
/// PD groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelServer {
    pub namespace: String,
    pub name: String,
    pub pods: HashSet<String>,
    pub pd_group: Option<PdGroupSpec>,
    pub pd_groups: HashMap<String, PdGroupPods>,
    /// Inference backend its pods run (e.g. `"vllm"`). A newly-admitted pod
    /// inherits this from the first model-server naming it, per
    /// `AddOrUpdatePod`'s "set engine from the first matching MS" rule.
    pub engine: Option<String>,
}

impl ModelServer {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            pods: HashSet::new(),
            pd_group: None,
            pd_groups: HashMap::new(),
            engine: None,
        }
    }

    pub fn key(&self) -> String {
        key_str(&self.namespace, &self.name)
    }

    /// Recompute `pd_groups` from the current pod label snapshot. Called
    /// whenever the pod set or a member's labels change.
    pub fn rebuild_pd_groups(&mut self, pod_labels: &HashMap<String, HashMap<String, String>>) {
        self.pd_groups.clear();
        let Some(spec) = &self.pd_group else {
            return;
        };
        for pod_name in &self.pods {
            let Some(labels) = pod_labels.get(pod_name) else {
                continue;
            };
            let Some(group_value) = labels.get(&spec.group_key) else {
                continue;
            };
            let entry = self.pd_groups.entry(group_value.clone()).or_default();
            if labels_match(labels, &spec.decode_labels) {
                entry.decode_pods.insert(pod_name.clone());
            }
            if labels_match(labels, &spec.prefill_labels) {
                entry.prefill_pods.insert(pod_name.clone());
            }
        }
    }
}

fn labels_match(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
    if selector.is_empty() {
        return false;
    }
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
}

/// Mutable metric/model fields of a `PodInfo`, guarded by a per-pod lock.
#[derive(Debug, Clone)]
pub struct PodInfoMutable {
    pub engine: String,
    pub metrics: PodMetrics,
    pub models: HashSet<String>,
    pub model_servers: HashSet<String>,
}

impl Default for PodInfoMutable {
    fn default() -> Self {
        Self {
            engine: String::new(),
            metrics: PodMetrics::default(),
            models: HashSet::new(),
            model_servers: HashSet::new(),
        }
    }
}

/// One of `exact`, `prefix` or `regex` string matching modes, used by route
/// rules to match request headers/URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

impl StringMatch {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            StringMatch::Exact(want) => value == want,
            StringMatch::Prefix(want) => value.starts_with(want.as_str()),
            StringMatch::Regex(pattern) => Regex::new(pattern)
                .map(|re| re.is_match(value))
                .unwrap_or(false),
        }
    }
}

/// A named target model-server with an optional selection weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetModel {
    pub model_server: String,
    pub weight: Option<u32>,
}

/// Request-match predicate for one route rule: header-name to
/// `StringMatch` plus an optional URI matcher. `None` matches
/// unconditionally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMatch {
    pub headers: HashMap<String, StringMatch>,
    pub uri: Option<StringMatch>,
}

impl ModelMatch {
    pub fn matches(&self, headers: &HashMap<String, String>, uri: &str) -> bool {
        if let Some(uri_match) = &self.uri {
            if !uri_match.matches(uri) {
                return false;
            }
        }
        self.headers.iter().all(|(name, matcher)| {
            headers
                .get(name)
                .is_some_and(|value| matcher.matches(value))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub model_match: Option<ModelMatch>,
    pub target_models: Vec<TargetModel>,
}

/// A declared mapping from an external model (or LoRA adapter) name to one
/// or more candidate model-servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoute {
    pub namespace: String,
    pub name: String,
    pub model_name: String,
    pub lora_adapters: Vec<String>,
    pub rules: Vec<RouteRule>,
}

impl ModelRoute {
    pub fn key(&self) -> String {
        key_str(&self.namespace, &self.name)
    }
}

/// Kind of lifecycle event the datastore can fire to subscribers. Matches
/// the `RegisterCallback(kind, fn)` taxonomy named in the datastore spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    ModelServerUpdate,
    ModelServerDelete,
    PodUpdate,
    PodDelete,
    ModelRouteUpdate,
    ModelRouteDelete,
}

/// Payload delivered with a callback invocation. Subscribers only ever see
/// keys, never live object handles, which is what keeps the MS/PodInfo
/// cross-reference acyclic.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    ModelServer(String),
    Pod(String),
    ModelRoute(String),
}
