//! Range queries against the metrics backend and per-timestamp averaging of
//! the returned series.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::MetricsConfig;
use crate::validator_name;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDef {
    pub key: &'static str,
    /// Metric name as exported by the nodes.
    pub query: &'static str,
    /// Result file column.
    pub column: &'static str,
}

/// Metrics collected for every run, in result-column order.
pub const METRIC_REGISTRY: [MetricDef; 7] = [
    MetricDef {
        key: "bytes_sent",
        query: "cometbft_mempool_bytes_sent",
        column: "Bytes Sent",
    },
    MetricDef {
        key: "bytes_received",
        query: "cometbft_mempool_bytes_received",
        column: "Bytes Received",
    },
    MetricDef {
        key: "transactions_sent",
        query: "cometbft_mempool_transactions_sent",
        column: "Tx Sent",
    },
    MetricDef {
        key: "transactions_received",
        query: "cometbft_mempool_transactions_received",
        column: "Tx Received",
    },
    // The signature pair is crossed on purpose: exported datasets have
    // always been produced with this mapping.
    MetricDef {
        key: "signatures_received",
        query: "cometbft_mempool_signatures_sent_size",
        column: "Signatures Received",
    },
    MetricDef {
        key: "signatures_sent",
        query: "cometbft_mempool_signatures_received_size",
        column: "Signatures Sent",
    },
    MetricDef {
        key: "total_transactions_in_consensus",
        query: "cometbft_consensus_total_txs",
        column: "Total Tx In Consensus",
    },
];

/// Epoch interval over which metrics are collected for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunWindow {
    start: f64,
    end: f64,
}

impl RunWindow {
    pub fn new(start: f64, end: f64) -> Result<Self> {
        if start.is_nan() || end.is_nan() || end <= start {
            return Err(anyhow!(
                "invalid run window: end {} is not after start {}",
                end,
                start
            ));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }
}

/// Selector restricting a query to the given validators, or `None` when all
/// sources should be included.
pub fn label_selector(sources: &BTreeSet<u32>) -> Option<String> {
    if sources.is_empty() {
        return None;
    }
    let pattern = sources
        .iter()
        .map(|i| validator_name(*i))
        .collect::<Vec<_>>()
        .join("|");
    Some(format!("{{job=~\"{}\"}}", pattern))
}

/// Canonical second-resolution key for an epoch timestamp (UTC).
pub fn timestamp_key(epoch_seconds: f64) -> Option<String> {
    if !epoch_seconds.is_finite() {
        return None;
    }
    DateTime::<Utc>::from_timestamp(epoch_seconds.floor() as i64, 0)
        .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
}

/// One metric's averaged values keyed by timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSeries {
    values: BTreeMap<String, f64>,
}

impl MetricSeries {
    /// Value at `timestamp`, or 0 when nothing was observed there.
    pub fn value_at(&self, timestamp: &str) -> f64 {
        self.get(timestamp).unwrap_or(0.0)
    }

    /// Value at `timestamp` when one was observed.
    pub fn get(&self, timestamp: &str) -> Option<f64> {
        self.values.get(timestamp).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// How a single metric query went.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchStatus {
    Fetched { samples: usize },
    /// The backend answered but matched no series.
    Empty,
    /// The query failed; the metric reads as zero for this run.
    Degraded { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedMetrics {
    timestamps: Vec<String>,
    series: BTreeMap<&'static str, MetricSeries>,
    status: BTreeMap<&'static str, FetchStatus>,
}

impl AggregatedMetrics {
    /// Timestamps seen across all metrics, first-seen order, no duplicates.
    pub fn timestamps(&self) -> &[String] {
        &self.timestamps
    }

    pub fn series(&self, key: &str) -> Option<&MetricSeries> {
        self.series.get(key)
    }

    /// Value of `key` at `timestamp`; 0 for unknown metrics or timestamps.
    pub fn value(&self, key: &str, timestamp: &str) -> f64 {
        self.series
            .get(key)
            .map(|s| s.value_at(timestamp))
            .unwrap_or(0.0)
    }

    pub fn status(&self, key: &str) -> Option<&FetchStatus> {
        self.status.get(key)
    }

    pub fn empty_metrics(&self) -> Vec<&'static str> {
        self.status
            .iter()
            .filter(|(_, s)| matches!(s, FetchStatus::Empty))
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn degraded_metrics(&self) -> Vec<&'static str> {
        self.status
            .iter()
            .filter(|(_, s)| matches!(s, FetchStatus::Degraded { .. }))
            .map(|(k, _)| *k)
            .collect()
    }
}

/// Collects raw samples and reduces them to per-timestamp means.
#[derive(Debug, Default)]
pub(crate) struct Aggregator {
    timestamps: Vec<String>,
    seen: HashSet<String>,
    samples: BTreeMap<&'static str, BTreeMap<String, Vec<f64>>>,
    status: BTreeMap<&'static str, FetchStatus>,
}

impl Aggregator {
    /// Returns false when the timestamp cannot be represented.
    pub(crate) fn record(&mut self, key: &'static str, epoch_seconds: f64, value: f64) -> bool {
        let Some(ts) = timestamp_key(epoch_seconds) else {
            return false;
        };
        if self.seen.insert(ts.clone()) {
            self.timestamps.push(ts.clone());
        }
        self.samples
            .entry(key)
            .or_default()
            .entry(ts)
            .or_default()
            .push(value);
        true
    }

    /// Records every parsable sample of `series`. A response with no usable
    /// sample counts as empty.
    fn record_series(&mut self, key: &'static str, series: Vec<QuerySeries>) -> FetchStatus {
        let mut samples = 0usize;
        for s in series {
            for (ts, raw) in s.values {
                match raw.parse::<f64>() {
                    Ok(v) => {
                        if self.record(key, ts, v) {
                            samples += 1;
                        }
                    }
                    Err(_) => debug!(
                        metric = key,
                        source = ?s.metric.get("job"),
                        value = %raw,
                        "skipping unparsable sample"
                    ),
                }
            }
        }
        if samples == 0 {
            FetchStatus::Empty
        } else {
            FetchStatus::Fetched { samples }
        }
    }

    pub(crate) fn set_status(&mut self, key: &'static str, status: FetchStatus) {
        self.status.insert(key, status);
    }

    pub(crate) fn finish(self) -> AggregatedMetrics {
        let mut series = BTreeMap::new();
        for metric in METRIC_REGISTRY.iter() {
            let values = self
                .samples
                .get(metric.key)
                .map(|by_ts| {
                    by_ts
                        .iter()
                        .map(|(ts, vals)| (ts.clone(), mean(vals)))
                        .collect::<BTreeMap<_, _>>()
                })
                .unwrap_or_default();
            series.insert(metric.key, MetricSeries { values });
        }
        AggregatedMetrics {
            timestamps: self.timestamps,
            series,
            status: self.status,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Source of aggregated metrics for one run. Failures stay inside the
/// implementation and surface as [`FetchStatus`] entries.
pub trait MetricsSource {
    fn fetch_aggregated(
        &self,
        window: &RunWindow,
        step: &str,
        sources: &BTreeSet<u32>,
    ) -> AggregatedMetrics;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySeries>,
}

#[derive(Debug, Deserialize)]
struct QuerySeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Client for a Prometheus-compatible `query_range` endpoint.
pub struct PrometheusClient {
    client: reqwest::blocking::Client,
    url: String,
}

impl PrometheusClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build metrics http client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_config(config: &MetricsConfig) -> Result<Self> {
        Self::new(
            config.url.clone(),
            Duration::from_secs(config.timeout_seconds.max(1)),
        )
    }

    fn query_range(&self, query: &str, window: &RunWindow, step: &str) -> Result<Vec<QuerySeries>> {
        let start = window.start().to_string();
        let end = window.end().to_string();
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("query", query),
                ("start", start.as_str()),
                ("end", end.as_str()),
                ("step", step),
            ])
            .send()
            .with_context(|| format!("request to {} failed", self.url))?;
        let status = response.status();
        let body = response
            .text()
            .with_context(|| format!("failed to read response body from {}", self.url))?;
        if !status.is_success() {
            return Err(anyhow!("metrics backend returned HTTP {}", status));
        }
        let parsed: QueryResponse =
            serde_json::from_str(&body).context("malformed query_range response")?;
        if let Some(s) = parsed.status.as_deref() {
            if s != "success" {
                return Err(anyhow!(
                    "query status {}: {}",
                    s,
                    parsed.error.as_deref().unwrap_or("no error message")
                ));
            }
        }
        let data = parsed
            .data
            .ok_or_else(|| anyhow!("query_range response has no data section"))?;
        Ok(data.result)
    }
}

impl MetricsSource for PrometheusClient {
    fn fetch_aggregated(
        &self,
        window: &RunWindow,
        step: &str,
        sources: &BTreeSet<u32>,
    ) -> AggregatedMetrics {
        let selector = label_selector(sources);
        let mut agg = Aggregator::default();
        for metric in METRIC_REGISTRY.iter() {
            let query = match selector.as_deref() {
                Some(sel) => format!("{}{}", metric.query, sel),
                None => metric.query.to_string(),
            };
            match self.query_range(&query, window, step) {
                Ok(series) => {
                    let status = agg.record_series(metric.key, series);
                    if status == FetchStatus::Empty {
                        warn!(metric = metric.key, query = %query, "no data found for query");
                    } else {
                        debug!(metric = metric.key, status = ?status, "metric fetched");
                    }
                    agg.set_status(metric.key, status);
                }
                Err(err) => {
                    let reason = format!("{:#}", err);
                    warn!(
                        metric = metric.key,
                        query = %query,
                        error = %reason,
                        "metric query failed; recording zeros"
                    );
                    agg.set_status(metric.key, FetchStatus::Degraded { reason });
                }
            }
        }
        let metrics = agg.finish();
        info!(
            timestamps = metrics.timestamps().len(),
            start = window.start(),
            end = window.end(),
            "metrics aggregated"
        );
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_only_requested_validators() {
        let sources: BTreeSet<u32> = [0, 1].into_iter().collect();
        let sel = label_selector(&sources).expect("selector");
        assert_eq!(sel, "{job=~\"validator00|validator01\"}");
        assert!(!sel.contains("validator02"));
        assert!(!sel.contains("validator03"));
    }

    #[test]
    fn empty_filter_leaves_query_unfiltered() {
        assert_eq!(label_selector(&BTreeSet::new()), None);
    }

    #[test]
    fn timestamp_key_truncates_to_seconds() {
        assert_eq!(
            timestamp_key(1_700_000_000.0).as_deref(),
            Some("2023-11-14 22:13:20")
        );
        assert_eq!(
            timestamp_key(1_700_000_000.999).as_deref(),
            Some("2023-11-14 22:13:20")
        );
        assert_eq!(timestamp_key(f64::NAN), None);
    }

    #[test]
    fn samples_from_several_sources_are_averaged() {
        let mut agg = Aggregator::default();
        for v in [10.0, 20.0, 30.0] {
            assert!(agg.record("bytes_sent", 1_700_000_000.0, v));
        }
        agg.record("bytes_sent", 1_700_000_001.0, 7.0);
        let metrics = agg.finish();
        assert_eq!(metrics.value("bytes_sent", "2023-11-14 22:13:20"), 20.0);
        assert_eq!(metrics.value("bytes_sent", "2023-11-14 22:13:21"), 7.0);
    }

    #[test]
    fn timestamps_keep_first_seen_order_across_metrics() {
        let mut agg = Aggregator::default();
        agg.record("bytes_sent", 1_700_000_002.0, 1.0);
        agg.record("bytes_sent", 1_700_000_000.0, 1.0);
        agg.record("bytes_received", 1_700_000_000.0, 1.0);
        agg.record("bytes_received", 1_700_000_001.0, 1.0);
        let metrics = agg.finish();
        assert_eq!(
            metrics.timestamps(),
            &[
                "2023-11-14 22:13:22".to_string(),
                "2023-11-14 22:13:20".to_string(),
                "2023-11-14 22:13:21".to_string(),
            ]
        );
    }

    #[test]
    fn absent_values_read_as_zero() {
        let mut agg = Aggregator::default();
        agg.record("bytes_sent", 1_700_000_000.0, 5.0);
        let metrics = agg.finish();
        assert_eq!(metrics.value("bytes_received", "2023-11-14 22:13:20"), 0.0);
        assert_eq!(metrics.value("bytes_sent", "2023-11-14 22:13:59"), 0.0);
        assert_eq!(metrics.value("not_a_metric", "whenever"), 0.0);
        assert!(metrics
            .series("total_transactions_in_consensus")
            .expect("every registry metric has a series")
            .is_empty());
    }

    #[test]
    fn status_lists_split_empty_and_degraded() {
        let mut agg = Aggregator::default();
        agg.set_status("bytes_sent", FetchStatus::Degraded { reason: "HTTP 500".into() });
        agg.set_status("bytes_received", FetchStatus::Empty);
        agg.set_status("transactions_sent", FetchStatus::Fetched { samples: 3 });
        let metrics = agg.finish();
        assert_eq!(metrics.degraded_metrics(), vec!["bytes_sent"]);
        assert_eq!(metrics.empty_metrics(), vec!["bytes_received"]);
    }

    #[test]
    fn series_without_usable_samples_count_as_empty() {
        let body = r#"{"status":"success","data":{"resultType":"matrix","result":[
            {"metric":{"job":"validator00"},"values":[[1700000000,"NaN-ish"],[1700000001,""]]},
            {"metric":{"job":"validator01"},"values":[]}
        ]}}"#;
        let parsed: QueryResponse = serde_json::from_str(body).expect("decode");
        let mut agg = Aggregator::default();
        let status = agg.record_series("bytes_sent", parsed.data.expect("data").result);
        assert_eq!(status, FetchStatus::Empty);
        assert_eq!(agg.record_series("bytes_received", Vec::new()), FetchStatus::Empty);

        let body = r#"{"status":"success","data":{"result":[
            {"metric":{},"values":[[1700000000,"bad"],[1700000001,"3"]]}
        ]}}"#;
        let parsed: QueryResponse = serde_json::from_str(body).expect("decode");
        let status = agg.record_series("transactions_sent", parsed.data.expect("data").result);
        assert_eq!(status, FetchStatus::Fetched { samples: 1 });
        let metrics = agg.finish();
        assert!(metrics.timestamps().contains(&"2023-11-14 22:13:21".to_string()));
        assert_eq!(metrics.value("transactions_sent", "2023-11-14 22:13:21"), 3.0);
        assert_eq!(
            metrics.series("transactions_sent").and_then(|s| s.get("2023-11-14 22:13:20")),
            None
        );
    }

    #[test]
    fn run_window_rejects_inverted_bounds() {
        assert!(RunWindow::new(10.0, 12.0).is_ok());
        assert!(RunWindow::new(10.0, 10.0).is_err());
        assert!(RunWindow::new(10.0, 9.0).is_err());
        assert!(RunWindow::new(f64::NAN, 9.0).is_err());
    }

    #[test]
    fn registry_keys_are_unique() {
        let keys: HashSet<_> = METRIC_REGISTRY.iter().map(|m| m.key).collect();
        assert_eq!(keys.len(), METRIC_REGISTRY.len());
    }

    #[test]
    fn query_response_decodes_prometheus_matrix() {
        let body = r#"{"status":"success","data":{"resultType":"matrix","result":[
            {"metric":{"job":"validator00"},"values":[[1700000000,"10"],[1700000001.5,"11"]]}
        ]}}"#;
        let parsed: QueryResponse = serde_json::from_str(body).expect("decode");
        let result = parsed.data.expect("data").result;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].metric.get("job").map(String::as_str), Some("validator00"));
        assert_eq!(result[0].values[1], (1_700_000_001.5, "11".to_string()));
    }
}
