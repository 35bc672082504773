//! Splits the link list into equal-length shards, one per worker slot.

use crate::error::{CollectError, CollectResult};
use crate::link::QueryLink;
use serde::{Deserialize, Serialize};

/// The contiguous run of links a single worker owns for its lifetime.
///
/// `None` entries are padding so every shard of a run has the same length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub slot: u16,
    pub links: Vec<Option<QueryLink>>,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Number of real (non-padding) links.
    pub fn work_len(&self) -> usize {
        self.links.iter().filter(|link| link.is_some()).count()
    }
}

/// Cuts `links` into `slots.len()` shards of `ceil(len / n)` entries each,
/// padding the tail with `None`. Shard `i` is assigned to `slots[i]`.
pub fn partition_for_slots(links: Vec<QueryLink>, slots: &[u16]) -> CollectResult<Vec<Shard>> {
    let n = slots.len();
    if n == 0 {
        return Err(CollectError::InvalidConfig(
            "worker count must be at least 1".into(),
        ));
    }

    let shard_len = links.len().div_ceil(n);
    let mut remaining = links.into_iter();
    let shards = slots
        .iter()
        .map(|&slot| {
            let mut shard: Vec<Option<QueryLink>> =
                remaining.by_ref().take(shard_len).map(Some).collect();
            shard.resize(shard_len, None);
            Shard { slot, links: shard }
        })
        .collect();

    Ok(shards)
}

/// [`partition_for_slots`] over slots `0..workers`.
pub fn partition(links: Vec<QueryLink>, workers: usize) -> CollectResult<Vec<Shard>> {
    let slots = (0..workers)
        .map(|slot| {
            u16::try_from(slot).map_err(|_| {
                CollectError::InvalidConfig(format!("worker count {workers} is too large"))
            })
        })
        .collect::<CollectResult<Vec<u16>>>()?;
    partition_for_slots(links, &slots)
}
