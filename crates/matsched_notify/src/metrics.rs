//! Metric collectors feeding the alert checker.
//!
//! Collectors surface real readings only; on failure they return an error
//! and the checker skips them. Fabricated fallback values are never fed to
//! rule evaluation.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::future::Future;
use std::pin::Pin;
use sysinfo::Disks;

/// One source of named metric values.
#[async_trait]
pub trait MetricCollector: Send + Sync {
    async fn collect(&self) -> Result<IndexMap<String, f64>, String>;
}

type CollectorFn = Box<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<IndexMap<String, f64>, String>> + Send>>
        + Send
        + Sync,
>;

/// Adapter turning an async closure into a collector; used to wire GPU
/// summary, queue length, and worker counts without coupling this crate to
/// the scheduler types.
pub struct FnCollector {
    collect: CollectorFn,
}

impl FnCollector {
    pub fn new<F, Fut>(collect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<IndexMap<String, f64>, String>> + Send + 'static,
    {
        Self {
            collect: Box::new(move || Box::pin(collect())),
        }
    }
}

#[async_trait]
impl MetricCollector for FnCollector {
    async fn collect(&self) -> Result<IndexMap<String, f64>, String> {
        (self.collect)().await
    }
}

/// Free space on the fullest-relevant disk, in GB, as `disk_free_gb`.
#[derive(Debug, Default)]
pub struct DiskFreeCollector;

#[async_trait]
impl MetricCollector for DiskFreeCollector {
    async fn collect(&self) -> Result<IndexMap<String, f64>, String> {
        let disks = Disks::new_with_refreshed_list();
        let min_free = disks
            .iter()
            .map(|disk| disk.available_space() as f64 / 1e9)
            .fold(f64::INFINITY, f64::min);
        if min_free.is_infinite() {
            return Err("no disks visible".into());
        }
        let mut metrics = IndexMap::new();
        metrics.insert("disk_free_gb".to_string(), min_free);
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_collector() {
        let collector = FnCollector::new(|| async {
            let mut metrics = IndexMap::new();
            metrics.insert("queue_length".to_string(), 3.0);
            Ok(metrics)
        });
        let sample = collector.collect().await.unwrap();
        assert_eq!(sample["queue_length"], 3.0);
    }

    #[tokio::test]
    async fn test_disk_collector_reports_or_errors() {
        // Either real disks are visible or the collector reports an error;
        // it must never fabricate a value.
        match DiskFreeCollector.collect().await {
            Ok(sample) => assert!(sample["disk_free_gb"] >= 0.0),
            Err(err) => assert!(!err.is_empty()),
        }
    }
}
