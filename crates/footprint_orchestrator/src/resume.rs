use crate::config::Config;
use anyhow::Context;
use footprint::link::{LinkBuilder, QueryLink};
use footprint::seed::load_seeds;
use footprint::store::{pending, CheckpointStore};

/// Validates the seed file, prepares the table and returns the links still
/// to collect. The table is only created or truncated once the seeds parse.
pub fn prepare(config: &Config) -> anyhow::Result<Vec<QueryLink>> {
    let seeds = load_seeds(&config.seed_file, config.mode)?;
    let total = seeds.len();

    let store = CheckpointStore::open(&config.table, config.force)
        .with_context(|| format!("Failed to prepare table '{}'", config.table.display()))?;
    let persisted = store.load_keys().context("Failed to read persisted keys")?;
    let todo = pending(seeds, &persisted);
    tracing::info!(total, skipped = total - todo.len(), pending = todo.len(), "Filtered seed points");

    Ok(LinkBuilder::new(&config.overpass_endpoint, config.mode, config.radius).build_all(&todo))
}
