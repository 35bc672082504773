/// Shard-completion percentages worth a log line.
pub const MILESTONES: [u8; 11] = [5, 10, 20, 30, 40, 50, 60, 70, 80, 90, 95];

/// Maps positions in a shard onto [`MILESTONES`].
#[derive(Debug)]
pub struct ProgressTracker {
    thresholds: Vec<(usize, u8)>,
    next: usize,
}

impl ProgressTracker {
    pub fn new(shard_len: usize) -> Self {
        let thresholds = MILESTONES
            .iter()
            .map(|&pct| (shard_len * pct as usize / 100, pct))
            .collect();
        Self {
            thresholds,
            next: 0,
        }
    }

    /// The highest milestone crossed on reaching `position`, if any new one was.
    pub fn observe(&mut self, position: usize) -> Option<u8> {
        let mut reached = None;
        while let Some(&(threshold, pct)) = self.thresholds.get(self.next) {
            if position < threshold {
                break;
            }
            reached = Some(pct);
            self.next += 1;
        }
        reached
    }
}
