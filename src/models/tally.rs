use chrono::{DateTime, Utc};
use log::warn;
use std::collections::BTreeMap;

/// A complete reading of the vote counts at one point in time.
///
/// Snapshots are never patched: a newer one replaces the held one wholesale,
/// and `total` is computed here so it always equals the sum of `counts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallySnapshot {
    counts: BTreeMap<String, u64>,
    total: u64,
    last_updated: DateTime<Utc>,
}

// One row of the ranked view of a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Standing {
    pub key: String,
    pub count: u64,
    pub rank: usize,
    pub percentage: f64,
}

impl TallySnapshot {
    pub fn new(counts: BTreeMap<String, u64>, last_updated: DateTime<Utc>) -> Self {
        let total = counts.values().fold(0u64, |sum, count| {
            sum.checked_add(*count).unwrap_or_else(|| {
                warn!("Vote total overflows, capping at {}", u64::MAX);
                u64::MAX
            })
        });
        Self {
            counts,
            total,
            last_updated,
        }
    }

    // Repeated keys are summed rather than overwritten
    pub fn from_pairs<I, K>(pairs: I, last_updated: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for (key, count) in pairs {
            let key = key.into();
            let held = counts.entry(key).or_insert(0);
            *held = held.checked_add(count).unwrap_or_else(|| {
                warn!("Vote count overflows, capping at {}", u64::MAX);
                u64::MAX
            });
        }
        Self::new(counts, last_updated)
    }

    pub fn empty(last_updated: DateTime<Utc>) -> Self {
        Self::new(BTreeMap::new(), last_updated)
    }

    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn is_older_than(&self, other: &TallySnapshot) -> bool {
        self.last_updated < other.last_updated
    }

    pub fn standings(&self) -> Vec<Standing> {
        let mut sorted: Vec<(&String, u64)> =
            self.counts.iter().map(|(key, count)| (key, *count)).collect();
        // Highest count first, ties broken by key so the order is stable
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut standings = Vec::with_capacity(sorted.len());
        let mut rank = 0;
        let mut previous: Option<u64> = None;
        for (position, (key, count)) in sorted.into_iter().enumerate() {
            // Equal counts share a rank
            if previous != Some(count) {
                rank = position + 1;
                previous = Some(count);
            }
            let percentage = if self.total > 0 {
                (count as f64 * 1000.0 / self.total as f64).round() / 10.0
            } else {
                0.0
            };
            standings.push(Standing {
                key: key.clone(),
                count,
                rank,
                percentage,
            });
        }
        standings
    }
}
