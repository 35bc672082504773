//! Drives whole shards through the worker loop against in-process fakes.

use async_trait::async_trait;
use footprint::fetch::{FetchPolicy, RawResponse, Transport};
use footprint::geometry::GeometryLookup;
use footprint::headers::BrowserHeaders;
use footprint::identity::{ControllerSettings, Identity, IdentityBackend, IdentityController};
use footprint::link::LinkBuilder;
use footprint::metrics::WorkerMetrics;
use footprint::partition::partition;
use footprint::record::PolygonRecord;
use footprint::seed::{load_seeds, SearchMode};
use footprint::store::{pending, CheckpointStore};
use footprint::worker::{ShardOutcome, Worker};
use footprint::{CollectError, CollectResult};
use reqwest::header::HeaderMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct AlwaysUp;

#[async_trait]
impl IdentityBackend for AlwaysUp {
    fn open(&self, slot: u16, generation: u32) -> CollectResult<Identity> {
        Ok(Identity::new(slot, generation, None, reqwest::Client::new()))
    }

    async fn probe(&self, _identity: &Identity) -> CollectResult<()> {
        Ok(())
    }

    async fn request_new_identity(&self, _slot: u16) -> CollectResult<Duration> {
        Ok(Duration::ZERO)
    }
}

/// Answers every query with the same body and counts requests.
#[derive(Clone)]
struct Canned {
    body: &'static str,
    hits: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for Canned {
    async fn get(&self, _identity: &Identity, _url: &str, _h: HeaderMap) -> CollectResult<RawResponse> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(RawResponse {
            status: 200,
            body: self.body.to_owned(),
        })
    }
}

struct NoLookup;

#[async_trait]
impl GeometryLookup for NoLookup {
    async fn relation_wkt(&self, relation_id: i64) -> CollectResult<String> {
        Err(CollectError::GeometryResolution {
            kind: "relation",
            id: relation_id,
            reason: "not expected in this test".into(),
        })
    }
}

const SQUARE_WAY: &str = r#"{"elements":[
    {"type":"way","id":500,"nodes":[1,2,3,1],"tags":{"building":"yes","name":"Depot","addr:city":"Springfield"}},
    {"type":"node","id":1,"lat":40.0,"lon":-73.0},
    {"type":"node","id":2,"lat":40.0,"lon":-72.999},
    {"type":"node","id":3,"lat":40.001,"lon":-72.999}
]}"#;

const SEEDS: &str = "lat,lon\n\
\"40.0,-73.0\",\"40.001,-72.999\"\n\
\"41.0,-74.0\",\"41.001,-73.999\"\n\
,\n\
\"42.5,-75.25\",\"42.501,-75.249\"\n";

/// One collection pass: filter, partition over `workers` slots, run each shard.
async fn collect(seed_file: &Path, store: &CheckpointStore, transport: &Canned, workers: usize) -> usize {
    let seeds = load_seeds(seed_file, SearchMode::Boundary).unwrap();
    let todo = pending(seeds, &store.load_keys().unwrap());
    let links = LinkBuilder::new("http://overpass.test/api", SearchMode::Boundary, 0).build_all(&todo);
    let shards = partition(links, workers).unwrap();

    let mut appended = 0;
    for shard in &shards {
        let mut worker = Worker {
            controller: IdentityController::new(shard.slot, AlwaysUp, ControllerSettings::default()),
            transport: transport.clone(),
            headers: BrowserHeaders,
            lookup: NoLookup,
            store: store.clone(),
            policy: FetchPolicy::default(),
            metrics: Arc::new(WorkerMetrics::new(shard.slot).unwrap()),
        };
        match worker.run(shard).await {
            ShardOutcome::Completed(stats) => appended += stats.records_appended,
            aborted => panic!("shard {} aborted: {aborted:?}", shard.slot),
        }
    }
    appended
}

fn rows(path: &Path) -> Vec<PolygonRecord> {
    csv::Reader::from_path(path)
        .unwrap()
        .deserialize()
        .map(Result::unwrap)
        .collect()
}

#[tokio::test]
async fn rerun_after_completion_issues_no_queries() {
    let dir = tempfile::tempdir().unwrap();
    let seed_file = dir.path().join("start.csv");
    std::fs::write(&seed_file, SEEDS).unwrap();
    let store = CheckpointStore::open(dir.path().join("buildings.csv"), false).unwrap();
    let transport = Canned {
        body: SQUARE_WAY,
        hits: Arc::default(),
    };

    let first = collect(&seed_file, &store, &transport, 2).await;
    assert_eq!(first, 3);
    assert_eq!(transport.hits.load(Ordering::SeqCst), 3);

    let second = collect(&seed_file, &store, &transport, 2).await;
    assert_eq!(second, 0);
    assert_eq!(transport.hits.load(Ordering::SeqCst), 3);
    assert_eq!(rows(store.table()).len(), 3);
}

#[tokio::test]
async fn boundary_seed_yields_one_ring_keyed_by_its_corner() {
    let dir = tempfile::tempdir().unwrap();
    let seed_file = dir.path().join("start.csv");
    std::fs::write(&seed_file, "lat,lon\n\"40.0,-73.0\",\"40.001,-72.999\"\n").unwrap();
    let store = CheckpointStore::open(dir.path().join("buildings.csv"), false).unwrap();
    let transport = Canned {
        body: SQUARE_WAY,
        hits: Arc::default(),
    };

    assert_eq!(collect(&seed_file, &store, &transport, 4).await, 1);

    let rows = rows(store.table());
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.id, 500);
    assert_eq!(row.coord, "-73.0,40.0");
    assert_eq!(row.name.as_deref(), Some("Depot"));
    assert_eq!(row.addr_city.as_deref(), Some("Springfield"));
    let wkt = row.geometry.as_deref().unwrap();
    assert_eq!(wkt, "POLYGON ((-73 40, -72.999 40, -72.999 40.001, -73 40))");
}

#[tokio::test]
async fn empty_responses_leave_the_table_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let seed_file = dir.path().join("start.csv");
    std::fs::write(&seed_file, SEEDS).unwrap();
    let store = CheckpointStore::open(dir.path().join("buildings.csv"), false).unwrap();
    let before = std::fs::read_to_string(store.table()).unwrap();
    let transport = Canned {
        body: r#"{"elements":[]}"#,
        hits: Arc::default(),
    };

    assert_eq!(collect(&seed_file, &store, &transport, 3).await, 0);
    assert_eq!(transport.hits.load(Ordering::SeqCst), 3);
    assert_eq!(std::fs::read_to_string(store.table()).unwrap(), before);
    // Nothing persisted, so the next pass asks again.
    assert_eq!(collect(&seed_file, &store, &transport, 3).await, 0);
    assert_eq!(transport.hits.load(Ordering::SeqCst), 6);
}
