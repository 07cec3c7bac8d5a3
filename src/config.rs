use std::env;
use std::time::Duration;

/// Time unit used by the token tracker's sliding window, matching the
/// `timeUnit` plugin option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Millis,
    Seconds,
    Minutes,
}

impl TimeUnit {
    fn from_env_str(s: &str) -> Self {
        match s {
            "ms" => TimeUnit::Millis,
            "min" => TimeUnit::Minutes,
            _ => TimeUnit::Seconds,
        }
    }

    pub fn as_duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Millis => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount * 60),
        }
    }
}

/// Environment-driven configuration for the whole router. Mirrors the
/// teacher's scattered `env::var(...).unwrap_or_else(...)` reads, but
/// consolidated into one typed struct built once at startup.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    // --- datastore (C6) ---
    pub datastore_refresh_period: Duration,

    // --- tokenizer pool (C2) ---
    pub tokenizer_health_check_period: Duration,
    pub tokenizer_ttl: Duration,

    // --- prefix / kv cache store (C3) ---
    pub block_size_to_hash: usize,
    pub max_blocks_to_match: usize,
    pub max_hash_cache_size: usize,
    pub prefix_store_shards: usize,

    // --- least-latency plugin (C8) ---
    pub ttft_tpot_weight_factor: f64,

    // --- global scoring ceiling ---
    pub max_score: f64,

    // --- token tracker (C4) ---
    pub window_size: u64,
    pub time_unit: TimeUnit,
    pub input_token_weight: f64,
    pub output_token_weight: f64,

    // --- priority queue (C5) ---
    pub queue_qps: f64,
    pub queue_capacity: usize,

    // --- least-request plugin (C8) ---
    pub max_waiting_requests: u64,

    // --- VTC fair router (C8) ---
    pub vtc_fairness_weight: f64,
    pub vtc_utilization_weight: f64,
    pub vtc_random_weight: f64,
    pub vtc_min_token_bucket: f64,
    pub vtc_max_load: f64,

    // --- admin HTTP surface (C12) ---
    pub bind_addr: String,

    // --- outbound adapters (engine metrics, tokenizer pool) ---
    pub engine_metrics_port: u16,
    pub tokenizer_port: u16,

    // --- distributed kv-cache plugin (C3, redis-backend feature) ---
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            datastore_refresh_period: Duration::from_secs(1),
            tokenizer_health_check_period: Duration::from_secs(30),
            tokenizer_ttl: Duration::from_secs(300),
            block_size_to_hash: 128,
            max_blocks_to_match: 128,
            max_hash_cache_size: 50_000,
            prefix_store_shards: 64,
            ttft_tpot_weight_factor: 0.5,
            max_score: 100.0,
            window_size: 60,
            time_unit: TimeUnit::Seconds,
            input_token_weight: 1.0,
            output_token_weight: 2.0,
            queue_qps: 50.0,
            queue_capacity: 4096,
            max_waiting_requests: 128,
            vtc_fairness_weight: 1.0,
            vtc_utilization_weight: 1.0,
            vtc_random_weight: 0.1,
            vtc_min_token_bucket: 1.0,
            vtc_max_load: 64.0,
            bind_addr: "0.0.0.0:8080".to_string(),
            engine_metrics_port: 8000,
            tokenizer_port: 8000,
            redis_url: None,
            redis_key_prefix: "kvcache:".to_string(),
        }
    }
}

impl RouterConfig {
    /// Build configuration from the process environment, falling back to
    /// the documented defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            datastore_refresh_period: Duration::from_millis(env_or(
                "ROUTER_DATASTORE_REFRESH_MS",
                default.datastore_refresh_period.as_millis() as u64,
            )),
            tokenizer_health_check_period: Duration::from_millis(env_or(
                "ROUTER_TOKENIZER_HEALTH_CHECK_MS",
                default.tokenizer_health_check_period.as_millis() as u64,
            )),
            tokenizer_ttl: Duration::from_millis(env_or(
                "ROUTER_TOKENIZER_TTL_MS",
                default.tokenizer_ttl.as_millis() as u64,
            )),
            block_size_to_hash: env_or("ROUTER_BLOCK_SIZE_TO_HASH", default.block_size_to_hash),
            max_blocks_to_match: env_or(
                "ROUTER_MAX_BLOCKS_TO_MATCH",
                default.max_blocks_to_match,
            ),
            max_hash_cache_size: env_or(
                "ROUTER_MAX_HASH_CACHE_SIZE",
                default.max_hash_cache_size,
            ),
            prefix_store_shards: env_or(
                "ROUTER_PREFIX_STORE_SHARDS",
                default.prefix_store_shards,
            ),
            ttft_tpot_weight_factor: env_or(
                "ROUTER_TTFT_TPOT_WEIGHT_FACTOR",
                default.ttft_tpot_weight_factor,
            ),
            max_score: env_or("ROUTER_MAX_SCORE", default.max_score),
            window_size: env_or("ROUTER_WINDOW_SIZE", default.window_size),
            time_unit: env::var("ROUTER_TIME_UNIT")
                .ok()
                .map(|v| TimeUnit::from_env_str(&v))
                .unwrap_or(default.time_unit),
            input_token_weight: env_or(
                "ROUTER_INPUT_TOKEN_WEIGHT",
                default.input_token_weight,
            ),
            output_token_weight: env_or(
                "ROUTER_OUTPUT_TOKEN_WEIGHT",
                default.output_token_weight,
            ),
            queue_qps: env_or("ROUTER_QUEUE_QPS", default.queue_qps),
            queue_capacity: env_or("ROUTER_QUEUE_CAPACITY", default.queue_capacity),
            max_waiting_requests: env_or(
                "ROUTER_MAX_WAITING_REQUESTS",
                default.max_waiting_requests,
            ),
            vtc_fairness_weight: env_or(
                "ROUTER_VTC_FAIRNESS_WEIGHT",
                default.vtc_fairness_weight,
            ),
            vtc_utilization_weight: env_or(
                "ROUTER_VTC_UTILIZATION_WEIGHT",
                default.vtc_utilization_weight,
            ),
            vtc_random_weight: env_or("ROUTER_VTC_RANDOM_WEIGHT", default.vtc_random_weight),
            vtc_min_token_bucket: env_or(
                "ROUTER_VTC_MIN_TOKEN_BUCKET",
                default.vtc_min_token_bucket,
            ),
            vtc_max_load: env_or("ROUTER_VTC_MAX_LOAD", default.vtc_max_load),
            bind_addr: env::var("ROUTER_BIND_ADDR").unwrap_or(default.bind_addr),
            engine_metrics_port: env_or("ROUTER_ENGINE_METRICS_PORT", default.engine_metrics_port),
            tokenizer_port: env_or("ROUTER_TOKENIZER_PORT", default.tokenizer_port),
            redis_url: env::var("ROUTER_REDIS_URL").ok(),
            redis_key_prefix: env::var("ROUTER_REDIS_KEY_PREFIX").unwrap_or(default.redis_key_prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RouterConfig::default();
        assert_eq!(cfg.block_size_to_hash, 128);
        assert_eq!(cfg.max_blocks_to_match, 128);
        assert_eq!(cfg.max_score, 100.0);
    }

    #[test]
    fn from_env_overrides_defaults() {
        env::set_var("ROUTER_MAX_SCORE", "50");
        let cfg = RouterConfig::from_env();
        assert_eq!(cfg.max_score, 50.0);
        env::remove_var("ROUTER_MAX_SCORE");
    }
}
