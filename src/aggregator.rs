//! Telemetry aggregator.
//!
//! One ring buffer per `(satellite, metric)`, newest point first, trimmed to
//! a 24h window and capped at 10 000 entries. `dashmap` gives the
//! process-wide table used elsewhere in this repository; each buffer itself is behind a
//! `parking_lot::Mutex` since a single `record` touches several fields at
//! once.

use crate::bus::PubSubBus;
use crate::store::{HourlyAggregate, SharedStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

const MAX_POINTS: usize = 10_000;
const WINDOW_SECONDS: i64 = 86_400;

#[derive(Debug, Clone, Copy)]
struct Point {
    ts: DateTime<Utc>,
    value: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WindowStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
    pub stddev: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
    Unknown,
}

struct Buffer {
    points: VecDeque<Point>,
    last_1m_avg: Option<f64>,
    updated_at: DateTime<Utc>,
}

impl Buffer {
    fn new() -> Self {
        Self {
            points: VecDeque::new(),
            last_1m_avg: None,
            updated_at: Utc::now(),
        }
    }

    fn record(&mut self, value: f64, ts: DateTime<Utc>) {
        let idx = self.points.iter().position(|p| p.ts <= ts).unwrap_or(self.points.len());
        self.points.insert(idx, Point { ts, value });
        let cutoff = ts - chrono::Duration::seconds(WINDOW_SECONDS);
        while self.points.back().is_some_and(|p| p.ts <= cutoff) {
            self.points.pop_back();
        }
        while self.points.len() > MAX_POINTS {
            self.points.pop_back();
        }
        self.updated_at = ts;
    }

    fn window_points(&self, now: DateTime<Utc>, seconds: i64) -> Vec<Point> {
        let cutoff = now - chrono::Duration::seconds(seconds);
        self.points.iter().filter(|p| p.ts > cutoff).copied().collect()
    }
}

fn stats_of(points: &[Point]) -> Option<WindowStats> {
    if points.is_empty() {
        return None;
    }
    let count = points.len() as u64;
    let sum: f64 = points.iter().map(|p| p.value).sum();
    let avg = sum / points.len() as f64;
    let min = points.iter().map(|p| p.value).fold(f64::INFINITY, f64::min);
    let max = points.iter().map(|p| p.value).fold(f64::NEG_INFINITY, f64::max);
    let variance: f64 = points.iter().map(|p| (p.value - avg).powi(2)).sum::<f64>() / points.len() as f64;
    Some(WindowStats { avg, min, max, count, stddev: variance.sqrt() })
}

fn ols_slope(points: &[(f64, f64)]) -> Option<f64> {
    let n = points.len() as f64;
    if n < 2.0 {
        return None;
    }
    let mean_x: f64 = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y: f64 = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in points {
        num += (x - mean_x) * (y - mean_y);
        den += (x - mean_x).powi(2);
    }
    if den == 0.0 {
        return Some(0.0);
    }
    Some(num / den)
}

pub struct TelemetryAggregator {
    buffers: DashMap<(String, String), Mutex<Buffer>>,
    bus: PubSubBus,
}

impl TelemetryAggregator {
    pub fn new(bus: PubSubBus) -> Self {
        Self { buffers: DashMap::new(), bus }
    }

    pub fn record(&self, satellite_id: &str, metric: &str, value: f64, ts: Option<DateTime<Utc>>) {
        let ts = ts.unwrap_or_else(Utc::now);
        let key = (satellite_id.to_string(), metric.to_string());
        let entry = self.buffers.entry(key).or_insert_with(|| Mutex::new(Buffer::new()));
        let mut buffer = entry.lock();

        let previous_1m = buffer.last_1m_avg;
        buffer.record(value, ts);
        let current_1m = stats_of(&buffer.window_points(ts, 60)).map(|s| s.avg);
        buffer.last_1m_avg = current_1m;
        drop(buffer);

        let should_broadcast = match (previous_1m, current_1m) {
            (None, Some(_)) => true,
            (Some(prev), Some(cur)) => {
                if prev == 0.0 {
                    cur != 0.0
                } else {
                    ((cur - prev) / prev).abs() > 0.05
                }
            }
            _ => false,
        };
        if should_broadcast {
            self.bus.publish(
                &format!("satellites:{satellite_id}"),
                serde_json::json!({
                    "event": "aggregate_update",
                    "satellite_id": satellite_id,
                    "metric": metric,
                    "avg_1m": current_1m,
                }),
            );
        }
    }

    pub fn get_stats(&self, satellite_id: &str, metric: &str) -> std::collections::HashMap<String, WindowStats> {
        let key = (satellite_id.to_string(), metric.to_string());
        let Some(entry) = self.buffers.get(&key) else {
            return std::collections::HashMap::new();
        };
        let buffer = entry.lock();
        let now = buffer.points.front().map(|p| p.ts).unwrap_or_else(Utc::now);
        let windows: [(&str, i64); 5] = [("1m", 60), ("5m", 300), ("15m", 900), ("1h", 3600), ("24h", 86_400)];
        let mut out = std::collections::HashMap::new();
        for (name, seconds) in windows {
            if let Some(stats) = stats_of(&buffer.window_points(now, seconds)) {
                out.insert(name.to_string(), stats);
            }
        }
        out
    }

    pub fn get_trend(&self, satellite_id: &str, metric: &str) -> Trend {
        let key = (satellite_id.to_string(), metric.to_string());
        let Some(entry) = self.buffers.get(&key) else {
            return Trend::Unknown;
        };
        let buffer = entry.lock();
        if buffer.points.is_empty() {
            return Trend::Unknown;
        }
        let now = buffer.points.front().map(|p| p.ts).unwrap();
        let recent = buffer.window_points(now, 300);
        if recent.len() < 2 {
            return Trend::Stable;
        }
        let base_ts = recent.last().unwrap().ts;
        let xy: Vec<(f64, f64)> = recent
            .iter()
            .map(|p| ((p.ts - base_ts).num_milliseconds() as f64 / 1000.0, p.value))
            .collect();
        let Some(slope) = ols_slope(&xy) else {
            return Trend::Stable;
        };
        let mean: f64 = xy.iter().map(|(_, y)| y).sum::<f64>() / xy.len() as f64;
        if mean == 0.0 {
            return Trend::Stable;
        }
        let relative = slope / mean.abs();
        if relative > 0.01 {
            Trend::Increasing
        } else if relative < -0.01 {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }

    /// Every 60s: upsert the "1h" aggregate of each buffer to the store.
    pub async fn persist_hourly(&self, store: &SharedStore) {
        let keys: Vec<(String, String)> = self.buffers.iter().map(|e| e.key().clone()).collect();
        for (satellite_id, metric) in keys {
            let stats = self.get_stats(&satellite_id, &metric);
            if let Some(hour) = stats.get("1h") {
                let aggregate = HourlyAggregate {
                    satellite_id: satellite_id.clone(),
                    metric: metric.clone(),
                    window: "1h".to_string(),
                    recorded_at: Utc::now(),
                    avg: hour.avg,
                    min: hour.min,
                    max: hour.max,
                    count: hour.count,
                    stddev: hour.stddev,
                };
                if let Err(err) = store.upsert_hourly_aggregate(aggregate).await {
                    tracing::warn!(%satellite_id, %metric, error = %err, "failed to persist hourly aggregate");
                }
            }
        }
    }

    /// Every 5min: drop buffers untouched for more than 24h.
    pub fn cleanup_stale(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        self.buffers.retain(|_, buffer| buffer.lock().updated_at > cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds_ago: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::seconds(seconds_ago)
    }

    #[test]
    fn stats_omit_empty_windows() {
        let aggregator = TelemetryAggregator::new(PubSubBus::new());
        aggregator.record("SAT-A", "energy", 80.0, Some(at(30)));
        let stats = aggregator.get_stats("SAT-A", "energy");
        assert!(stats.contains_key("1m"));
        assert!(stats.contains_key("24h"));
        let one_m = &stats["1m"];
        assert_eq!(one_m.count, 1);
        assert_eq!(one_m.avg, 80.0);
        assert_eq!(one_m.stddev, 0.0);
    }

    #[test]
    fn trend_detects_increasing_series() {
        let aggregator = TelemetryAggregator::new(PubSubBus::new());
        for i in (0..10).rev() {
            aggregator.record("SAT-A", "energy", 100.0 - i as f64, Some(at(i * 10)));
        }
        assert_eq!(aggregator.get_trend("SAT-A", "energy"), Trend::Increasing);
    }

    #[test]
    fn trend_unknown_when_no_data() {
        let aggregator = TelemetryAggregator::new(PubSubBus::new());
        assert_eq!(aggregator.get_trend("SAT-Z", "energy"), Trend::Unknown);
    }

    #[test]
    fn trend_stable_for_single_point() {
        let aggregator = TelemetryAggregator::new(PubSubBus::new());
        aggregator.record("SAT-A", "energy", 50.0, Some(at(1)));
        assert_eq!(aggregator.get_trend("SAT-A", "energy"), Trend::Stable);
    }

    #[test]
    fn cleanup_drops_buffers_older_than_24h() {
        let aggregator = TelemetryAggregator::new(PubSubBus::new());
        aggregator.record("SAT-A", "energy", 50.0, Some(Utc::now() - chrono::Duration::hours(25)));
        aggregator.cleanup_stale();
        assert!(aggregator.get_stats("SAT-A", "energy").is_empty());
    }
}
