use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::warn;

use crate::core::datastore::types::{histogram_delta, HistogramSnapshot};

/// Freshly-observed gauge metrics for one pod, as reported by an engine
/// adapter's metrics endpoint. `tpot`/`ttft` of `0.0` means "engine
/// reported nothing new this tick" - the datastore keeps the prior value
/// for those two fields ("last non-zero wins").
#[derive(Debug, Clone, Default)]
pub struct PodGauges {
    pub gpu_cache_usage: f64,
    pub request_waiting_num: u64,
    pub request_running_num: u64,
    pub tpot: f64,
    pub ttft: f64,
}

/// Outbound collaborator the datastore's refresh loop consults for live
/// pod state. Implementations talk to whatever the inference engine
/// exposes (vLLM's Prometheus-style `/metrics`, a custom `/v1/models`,
/// etc.) - none of that wire format is in scope here, only this seam.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Returns fresh gauges plus per-tick TPOT/TTFT histogram deltas. The
    /// engine exposes cumulative bucket counters, so the adapter - not the
    /// datastore - is responsible for diffing against `previous_tpot`/
    /// `previous_ttft` (the datastore's last-stored snapshots) before
    /// handing the deltas back.
    async fn get_pod_metrics(
        &self,
        engine: &str,
        pod_ip: &str,
        previous_tpot: &HistogramSnapshot,
        previous_ttft: &HistogramSnapshot,
    ) -> Result<(PodGauges, HistogramSnapshot, HistogramSnapshot)>;

    async fn get_pod_models(&self, engine: &str, pod_ip: &str) -> Result<Vec<String>>;
}

/// Default adapter for vLLM-family engines: scrapes a Prometheus-style
/// `/metrics` endpoint for gauges/histograms and `/v1/models` for the
/// loaded-model list, retrying transient failures with exponential
/// backoff.
pub struct VllmEngineAdapter {
    client: Client,
    metrics_port: u16,
    max_retries: u32,
    base_backoff: Duration,
}

impl VllmEngineAdapter {
    pub fn new(metrics_port: u16) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("engine adapter http client"),
            metrics_port,
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
        }
    }

    async fn get_with_retry(&self, url: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            let outcome = self.client.get(url).send().await;
            match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .text()
                            .await
                            .map_err(|e| anyhow!("reading body from {url}: {e}"));
                    }
                    if !is_retryable_status(status) || attempt >= self.max_retries {
                        return Err(anyhow!("{url} returned {status}"));
                    }
                }
                Err(e) if attempt >= self.max_retries => {
                    return Err(anyhow!("calling {url}: {e}"));
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "engine adapter request failed, retrying");
                }
            }
            tokio::time::sleep(self.base_backoff * 2u32.pow(attempt)).await;
            attempt += 1;
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

#[async_trait]
impl EngineAdapter for VllmEngineAdapter {
    async fn get_pod_metrics(
        &self,
        _engine: &str,
        pod_ip: &str,
        previous_tpot: &HistogramSnapshot,
        previous_ttft: &HistogramSnapshot,
    ) -> Result<(PodGauges, HistogramSnapshot, HistogramSnapshot)> {
        let url = format!("http://{pod_ip}:{}/metrics", self.metrics_port);
        let body = self.get_with_retry(&url).await?;
        let (gauges, tpot_cumulative, ttft_cumulative) = parse_vllm_metrics(&body);
        let tpot_delta = histogram_delta(previous_tpot, &tpot_cumulative);
        let ttft_delta = histogram_delta(previous_ttft, &ttft_cumulative);
        Ok((gauges, tpot_delta, ttft_delta))
    }

    async fn get_pod_models(&self, _engine: &str, pod_ip: &str) -> Result<Vec<String>> {
        let url = format!("http://{pod_ip}:{}/v1/models", self.metrics_port);
        let body = self.get_with_retry(&url).await?;
        let parsed: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| anyhow!("decoding models list from {url}: {e}"))?;
        let models = parsed
            .get("data")
            .and_then(|d| d.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.get("id").and_then(|id| id.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

/// Minimal Prometheus text-format scraper for the handful of gauge/
/// histogram families this router cares about. Unknown lines are ignored.
fn parse_vllm_metrics(body: &str) -> (PodGauges, HistogramSnapshot, HistogramSnapshot) {
    let mut gauges = PodGauges::default();
    let mut tpot_hist = HistogramSnapshot::new();
    let mut ttft_hist = HistogramSnapshot::new();

    for line in body.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let Some((metric, value)) = line.rsplit_once(' ') else {
            continue;
        };
        let Ok(value): Result<f64, _> = value.trim().parse() else {
            continue;
        };

        if let Some(bucket) = bucket_label(metric, "vllm:time_per_output_token_seconds_bucket") {
            tpot_hist.insert(bucket, value);
        } else if let Some(bucket) =
            bucket_label(metric, "vllm:time_to_first_token_seconds_bucket")
        {
            ttft_hist.insert(bucket, value);
        } else if metric.starts_with("vllm:gpu_cache_usage_perc") {
            gauges.gpu_cache_usage = value * 100.0;
        } else if metric.starts_with("vllm:num_requests_waiting") {
            gauges.request_waiting_num = value.max(0.0) as u64;
        } else if metric.starts_with("vllm:num_requests_running") {
            gauges.request_running_num = value.max(0.0) as u64;
        }
    }

    (gauges, tpot_hist, ttft_hist)
}

fn bucket_label(metric_line: &str, family: &str) -> Option<String> {
    if !metric_line.starts_with(family) {
        return None;
    }
    let le_start = metric_line.find("le=\"")?;
    let rest = &metric_line[le_start + 4..];
    let le_end = rest.find('"')?;
    Some(rest[..le_end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gauges_and_histogram_buckets() {
        let body = "\
# HELP vllm:gpu_cache_usage_perc
vllm:gpu_cache_usage_perc{model=\"m\"} 0.42
vllm:num_requests_waiting{model=\"m\"} 3
vllm:num_requests_running{model=\"m\"} 7
vllm:time_to_first_token_seconds_bucket{le=\"0.1\"} 12
vllm:time_to_first_token_seconds_bucket{le=\"0.5\"} 20
";
        let (gauges, _tpot, ttft) = parse_vllm_metrics(body);
        assert!((gauges.gpu_cache_usage - 42.0).abs() < 1e-6);
        assert_eq!(gauges.request_waiting_num, 3);
        assert_eq!(gauges.request_running_num, 7);
        assert_eq!(ttft["0.1"], 12.0);
        assert_eq!(ttft["0.5"], 20.0);
    }

    #[test]
    fn ignores_unrelated_lines() {
        let (gauges, tpot, ttft) = parse_vllm_metrics("something_unrelated 1\n");
        assert_eq!(gauges.request_waiting_num, 0);
        assert!(tpot.is_empty());
        assert!(ttft.is_empty());
    }

    #[test]
    fn diffs_cumulative_buckets_into_a_per_tick_delta() {
        let first = "vllm:time_to_first_token_seconds_bucket{le=\"0.1\"} 12\n";
        let second = "vllm:time_to_first_token_seconds_bucket{le=\"0.1\"} 19\n";
        let (_, _, ttft_first) = parse_vllm_metrics(first);
        let (_, _, ttft_second) = parse_vllm_metrics(second);
        let delta = histogram_delta(&ttft_first, &ttft_second);
        assert_eq!(delta["0.1"], 7.0);
    }

    #[test]
    fn retryable_status_set() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }
}
