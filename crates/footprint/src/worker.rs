//! The per-slot loop: identity, fetch, reconstruct, persist, link by link.

use crate::element::QueryResponse;
use crate::error::CollectError;
use crate::fetch::{fetch_with_retry, FetchPolicy, Transport};
use crate::geometry::{reconstruct, GeometryLookup};
use crate::headers::HeaderSource;
use crate::identity::{IdentityBackend, IdentityController};
use crate::metrics::WorkerMetrics;
use crate::partition::Shard;
use crate::progress::ProgressTracker;
use crate::store::CheckpointStore;
use std::sync::Arc;

/// How a shard run ended.
#[derive(Debug)]
pub enum ShardOutcome {
    Completed(ShardStats),
    /// The worker stopped at `position`; links after it were not attempted.
    Aborted {
        position: usize,
        stats: ShardStats,
        error: CollectError,
    },
}

impl ShardOutcome {
    pub fn stats(&self) -> &ShardStats {
        match self {
            ShardOutcome::Completed(stats) | ShardOutcome::Aborted { stats, .. } => stats,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub links_processed: usize,
    pub empty_responses: usize,
    pub undecodable_responses: usize,
    pub records_appended: usize,
    pub batches_dropped: usize,
}

pub struct Worker<B, T, H, L> {
    pub controller: IdentityController<B>,
    pub transport: T,
    pub headers: H,
    pub lookup: L,
    pub store: CheckpointStore,
    pub policy: FetchPolicy,
    pub metrics: Arc<WorkerMetrics>,
}

impl<B, T, H, L> Worker<B, T, H, L>
where
    B: IdentityBackend,
    T: Transport,
    H: HeaderSource,
    L: GeometryLookup,
{
    /// Processes `shard` in order. Only connectivity loss or an exhausted
    /// link ends the run early; everything else is logged and skipped.
    pub async fn run(&mut self, shard: &Shard) -> ShardOutcome {
        let slot = self.controller.slot();
        let mut stats = ShardStats::default();

        if let Err(error) = self.controller.connect().await {
            tracing::error!(slot, error = %error, "Worker could not connect; abandoning shard");
            return ShardOutcome::Aborted {
                position: 0,
                stats,
                error,
            };
        }

        let mut progress = ProgressTracker::new(shard.len());
        for (position, link) in shard.links.iter().enumerate() {
            if let Some(pct) = progress.observe(position) {
                self.metrics.shard_progress_percent.set(i64::from(pct));
                tracing::info!(slot, percent = pct, "Worker progress");
            }
            let Some(link) = link else {
                continue;
            };

            let body = match fetch_with_retry(
                link,
                &mut self.controller,
                &self.transport,
                &self.headers,
                &self.policy,
                &self.metrics,
            )
            .await
            {
                Ok(body) => body,
                Err(error) => {
                    tracing::error!(slot, position, coord = %link.key, error = %error, "Abandoning shard");
                    return ShardOutcome::Aborted {
                        position,
                        stats,
                        error,
                    };
                }
            };
            stats.links_processed += 1;
            self.metrics.links_completed_total.inc();

            let response: QueryResponse = match serde_json::from_str(&body) {
                Ok(response) => response,
                Err(e) => {
                    stats.undecodable_responses += 1;
                    tracing::warn!(slot, coord = %link.key, error = %e, "Response is not Overpass JSON");
                    continue;
                }
            };
            if response.elements.is_empty() {
                stats.empty_responses += 1;
                tracing::debug!(slot, coord = %link.key, "No buildings for link");
                continue;
            }

            let (batch, built) = reconstruct(&response, link, &self.lookup).await;
            self.metrics.geometry_failures_total.inc_by(built.failures as u64);
            if batch.is_empty() {
                continue;
            }

            let store = self.store.clone();
            let appended = tokio::task::spawn_blocking(move || store.append(&batch))
                .await
                .unwrap_or_else(|join| Err(CollectError::Io(std::io::Error::other(join))));
            match appended {
                Ok(rows) => {
                    stats.records_appended += rows;
                    self.metrics.records_appended_total.inc_by(rows as u64);
                }
                Err(e) => {
                    stats.batches_dropped += 1;
                    self.metrics.persist_failures_total.inc();
                    tracing::error!(slot, coord = %link.key, error = %e, "Dropping batch after append failure");
                }
            }
        }

        self.metrics.shard_progress_percent.set(100);
        tracing::info!(
            slot,
            links = stats.links_processed,
            records = stats.records_appended,
            "Worker finished shard"
        );
        ShardOutcome::Completed(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::RawResponse;
    use crate::headers::BrowserHeaders;
    use crate::identity::testing::ScriptedBackend;
    use crate::identity::{ControllerSettings, Identity};
    use crate::error::CollectResult;
    use crate::link::QueryLink;
    use async_trait::async_trait;
    use reqwest::header::HeaderMap;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves bodies by URL; unknown URLs are transport failures.
    struct Routes {
        bodies: HashMap<String, String>,
        hits: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Routes {
        async fn get(&self, _identity: &Identity, url: &str, _h: HeaderMap) -> CollectResult<RawResponse> {
            self.hits.lock().unwrap().push(url.to_owned());
            self.bodies
                .get(url)
                .map(|body| RawResponse {
                    status: 200,
                    body: body.clone(),
                })
                .ok_or_else(|| CollectError::TransportFailure("connection refused".into()))
        }
    }

    struct NoRelations;

    #[async_trait]
    impl GeometryLookup for NoRelations {
        async fn relation_wkt(&self, relation_id: i64) -> CollectResult<String> {
            Err(CollectError::GeometryResolution {
                kind: "relation",
                id: relation_id,
                reason: "offline".into(),
            })
        }
    }

    const ONE_WAY: &str = r#"{"elements":[
        {"type":"node","id":1,"lat":40.0,"lon":-73.0},
        {"type":"node","id":2,"lat":40.0,"lon":-72.999},
        {"type":"node","id":3,"lat":40.001,"lon":-72.999},
        {"type":"way","id":10,"nodes":[1,2,3,1],"tags":{"building":"yes"}}
    ]}"#;

    fn link(n: u32) -> QueryLink {
        QueryLink {
            url: format!("http://overpass/{n}"),
            key: format!("-73.0,4{n}.0"),
        }
    }

    fn worker(
        routes: &[(u32, &str)],
        store: CheckpointStore,
    ) -> Worker<ScriptedBackend, Routes, BrowserHeaders, NoRelations> {
        Worker {
            controller: IdentityController::new(
                0,
                ScriptedBackend::healthy(),
                ControllerSettings {
                    rotation_ceiling: 2,
                    control_error_backoff: Duration::ZERO,
                },
            ),
            transport: Routes {
                bodies: routes
                    .iter()
                    .map(|(n, body)| (link(*n).url, body.to_string()))
                    .collect(),
                hits: Mutex::new(Vec::new()),
            },
            headers: BrowserHeaders,
            lookup: NoRelations,
            store,
            policy: FetchPolicy::default(),
            metrics: Arc::new(WorkerMetrics::new(0).unwrap()),
        }
    }

    #[tokio::test]
    async fn empty_and_undecodable_responses_append_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::attach(dir.path().join("b.csv"));
        let mut worker = worker(&[(0, r#"{"elements":[]}"#), (1, "<html>busy</html>")], store.clone());
        let shard = Shard {
            slot: 0,
            links: vec![Some(link(0)), Some(link(1)), None],
        };

        let outcome = worker.run(&shard).await;

        let ShardOutcome::Completed(stats) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(stats.links_processed, 2);
        assert_eq!(stats.empty_responses, 1);
        assert_eq!(stats.undecodable_responses, 1);
        assert_eq!(stats.records_appended, 0);
        assert!(!store.table().exists());
    }

    #[tokio::test]
    async fn exhausted_link_aborts_remaining_shard() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("b.csv"), false).unwrap();
        // Link 1 has no route and fails every attempt.
        let mut worker = worker(&[(0, ONE_WAY), (2, ONE_WAY)], store.clone());
        let shard = Shard {
            slot: 0,
            links: vec![Some(link(0)), Some(link(1)), Some(link(2))],
        };

        let outcome = worker.run(&shard).await;

        match outcome {
            ShardOutcome::Aborted {
                position, stats, error,
            } => {
                assert_eq!(position, 1);
                assert_eq!(stats.records_appended, 1);
                assert!(matches!(error, CollectError::RetriesExhausted { attempts: 3, .. }));
            }
            other => panic!("expected abort, got {other:?}"),
        }
        let hits = worker.transport.hits.lock().unwrap().clone();
        assert_eq!(hits.iter().filter(|u| u.ends_with("/1")).count(), 3);
        assert!(!hits.iter().any(|u| u.ends_with("/2")));
        assert_eq!(store.load_keys().unwrap(), HashSet::from([link(0).key]));
    }

    #[tokio::test]
    async fn unwritable_table_drops_batches_and_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("buildings.csv");
        std::fs::create_dir(&table).unwrap();
        let mut worker = worker(&[(0, ONE_WAY), (1, ONE_WAY)], CheckpointStore::attach(&table));
        let shard = Shard {
            slot: 0,
            links: vec![Some(link(0)), Some(link(1))],
        };

        let outcome = worker.run(&shard).await;

        let ShardOutcome::Completed(stats) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(stats.links_processed, 2);
        assert_eq!(stats.records_appended, 0);
        assert_eq!(stats.batches_dropped, 2);
        assert_eq!(worker.metrics.persist_failures_total.get(), 2);
        assert_eq!(worker.transport.hits.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn padding_is_skipped_without_requests() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("b.csv"), false).unwrap();
        let mut worker = worker(&[(3, ONE_WAY)], store);
        let shard = Shard {
            slot: 0,
            links: vec![Some(link(3)), None, None],
        };

        let outcome = worker.run(&shard).await;

        assert_eq!(outcome.stats().records_appended, 1);
        assert_eq!(worker.transport.hits.lock().unwrap().len(), 1);
        assert_eq!(worker.metrics.shard_progress_percent.get(), 100);
    }
}
