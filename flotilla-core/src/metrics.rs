//! In-memory metrics rings feeding the auto-scaler.
//!
//! One ring per `(node, service)` key, capped at 100 samples. Nothing is
//! persisted; a restart starts the window empty.

use crate::types::{MetricAverages, MetricSample, ServiceId};
use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

/// Samples kept per key.
pub const MAX_SAMPLES: usize = 100;

/// Key identifying one ring: a service instance on one node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub node_ip: String,
    pub service: ServiceId,
}

impl MetricKey {
    pub fn new(node_ip: &str, service: &ServiceId) -> Self {
        Self {
            node_ip: node_ip.to_string(),
            service: service.clone(),
        }
    }
}

/// Rolling metrics store shared by the collector and the scaler.
#[derive(Default)]
pub struct MetricsRing {
    rings: Mutex<HashMap<MetricKey, VecDeque<MetricSample>>>,
}

impl MetricsRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, evicting the oldest past the ring capacity.
    pub async fn sample(&self, key: MetricKey, sample: MetricSample) {
        let mut rings = self.rings.lock().await;
        let ring = rings.entry(key).or_default();
        if ring.len() == MAX_SAMPLES {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    /// Mean over samples within the window, or `None` if the window is empty.
    pub async fn average(&self, key: &MetricKey, window: Duration) -> Option<MetricAverages> {
        let rings = self.rings.lock().await;
        let ring = rings.get(key)?;
        let cutoff = Utc::now() - window;
        let recent: Vec<&MetricSample> = ring.iter().filter(|s| s.at >= cutoff).collect();
        if recent.is_empty() {
            return None;
        }
        let n = recent.len() as f64;
        Some(MetricAverages {
            cpu_percent: recent.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
            memory_percent: recent.iter().map(|s| s.memory_percent).sum::<f64>() / n,
            requests_per_second: recent.iter().map(|s| s.requests_per_second).sum::<f64>() / n,
            sample_count: recent.len(),
        })
    }

    /// Average across several nodes running the same service: the per-node
    /// windows are averaged first, then averaged together.
    pub async fn service_average(
        &self,
        service: &ServiceId,
        node_ips: &[String],
        window: Duration,
    ) -> Option<MetricAverages> {
        let mut per_node = Vec::new();
        for ip in node_ips {
            let key = MetricKey::new(ip, service);
            if let Some(avg) = self.average(&key, window).await {
                per_node.push(avg);
            }
        }
        if per_node.is_empty() {
            return None;
        }
        let n = per_node.len() as f64;
        Some(MetricAverages {
            cpu_percent: per_node.iter().map(|a| a.cpu_percent).sum::<f64>() / n,
            memory_percent: per_node.iter().map(|a| a.memory_percent).sum::<f64>() / n,
            requests_per_second: per_node.iter().map(|a| a.requests_per_second).sum::<f64>() / n,
            sample_count: per_node.iter().map(|a| a.sample_count).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f64, age_secs: i64) -> MetricSample {
        MetricSample {
            at: Utc::now() - Duration::seconds(age_secs),
            cpu_percent: cpu,
            memory_percent: 40.0,
            requests_per_second: 100.0,
        }
    }

    fn key() -> MetricKey {
        MetricKey::new("10.0.0.1", &ServiceId::new("u1", "shop", "prod", "api"))
    }

    #[tokio::test]
    async fn ring_caps_at_one_hundred() {
        let ring = MetricsRing::new();
        for i in 0..150 {
            ring.sample(key(), sample(i as f64, 0)).await;
        }
        let avg = ring.average(&key(), Duration::minutes(10)).await.unwrap();
        assert_eq!(avg.sample_count, MAX_SAMPLES);
        // oldest 50 evicted: mean of 50..=149
        assert!((avg.cpu_percent - 99.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn window_excludes_stale_samples() {
        let ring = MetricsRing::new();
        ring.sample(key(), sample(90.0, 3600)).await;
        ring.sample(key(), sample(10.0, 10)).await;

        let avg = ring.average(&key(), Duration::minutes(10)).await.unwrap();
        assert_eq!(avg.sample_count, 1);
        assert!((avg.cpu_percent - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_window_is_none() {
        let ring = MetricsRing::new();
        assert!(ring.average(&key(), Duration::minutes(10)).await.is_none());
        ring.sample(key(), sample(50.0, 3600)).await;
        assert!(ring.average(&key(), Duration::minutes(10)).await.is_none());
    }

    #[tokio::test]
    async fn service_average_spans_replicas() {
        let ring = MetricsRing::new();
        let service = ServiceId::new("u1", "shop", "prod", "api");
        ring.sample(MetricKey::new("a", &service), sample(20.0, 0)).await;
        ring.sample(MetricKey::new("b", &service), sample(60.0, 0)).await;

        let avg = ring
            .service_average(
                &service,
                &["a".to_string(), "b".to_string(), "c".to_string()],
                Duration::minutes(10),
            )
            .await
            .unwrap();
        assert!((avg.cpu_percent - 40.0).abs() < 1e-9);
    }
}
