//! Restrict policies bounding the size of a table.
//!
//! A dynamic embedding table accepts an unbounded key space, so something has
//! to decide which keys to drop. A restrict policy keeps one `u64` score per
//! key, stored next to the key's value inside its shard slot: the score is
//! created with the key, refreshed whenever the key is looked up or written,
//! and removed together with the key. There is no separate side table that
//! could end up holding metadata for keys that no longer exist.
//!
//! # Available Policies
//!
//! - [`TimestampRestrictPolicy`] - score is the logical time of the last touch;
//!   the oldest keys are evicted first
//! - [`FrequencyRestrictPolicy`] - score is the number of touches; the least
//!   frequently used keys are evicted first

use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, Result};

/// What a [`DynamicEmbeddingTable::restrict`](crate::DynamicEmbeddingTable::restrict)
/// call should enforce.
///
/// # Example
///
/// ```
/// use dynemb_hash_table::RestrictRequest;
///
/// // Keep at most 1000 keys, but only bother once the table exceeds 1200.
/// let request = RestrictRequest::max_entries(1000).with_trigger(1200);
/// assert_eq!(request.max_entries, Some(1000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RestrictRequest {
    /// Evict until the table holds at most this many keys.
    pub max_entries: Option<usize>,
    /// Evict every key not touched within this many clock ticks.
    pub max_age: Option<u64>,
    /// Skip restriction entirely while the table holds at most this many keys.
    pub trigger: Option<usize>,
}

impl RestrictRequest {
    /// Restrict to at most `max_entries` keys.
    pub fn max_entries(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Default::default()
        }
    }

    /// Restrict to keys touched within the last `max_age` ticks.
    pub fn max_age(max_age: u64) -> Self {
        Self {
            max_age: Some(max_age),
            ..Default::default()
        }
    }

    /// Also enforce an entry limit.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Only restrict once the table exceeds `trigger` keys.
    pub fn with_trigger(mut self, trigger: usize) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_entries.is_none() && self.max_age.is_none() {
            return Err(EmbeddingError::Configuration(
                "restrict request needs max_entries or max_age".to_string(),
            ));
        }
        if let (Some(trigger), Some(max_entries)) = (self.trigger, self.max_entries) {
            if trigger < max_entries {
                return Err(EmbeddingError::Configuration(format!(
                    "restrict trigger ({trigger}) must not be below max_entries ({max_entries})"
                )));
            }
        }
        Ok(())
    }
}

/// A strategy for scoring keys and choosing which ones to evict.
///
/// Implementations must be `Send + Sync`; `touch` runs inside concurrent
/// shard lookups.
pub trait RestrictPolicy: Send + Sync {
    /// Returns the name of this policy, for logging and checkpoints.
    fn name(&self) -> &str;

    /// Computes the new score of a key touched at logical time `tick`.
    ///
    /// `previous` is `None` when the touch inserts the key.
    fn touch(&self, previous: Option<u64>, tick: u64) -> u64;

    /// Chooses the keys to evict among `candidates` (every `(key, score)` in
    /// the table) so that `request` is satisfied. `now` is the current tick.
    ///
    /// The returned pairs carry the score observed here; a key whose score
    /// changed before removal was touched in between and is kept.
    fn select_victims(
        &self,
        candidates: Vec<(i64, u64)>,
        request: &RestrictRequest,
        now: u64,
    ) -> Result<Vec<(i64, u64)>>;
}

/// Picks the `excess` lowest-scored candidates, ties broken by key.
fn lowest_scored(mut candidates: Vec<(i64, u64)>, keep: usize) -> Vec<(i64, u64)> {
    if candidates.len() <= keep {
        return Vec::new();
    }
    let excess = candidates.len() - keep;
    candidates.sort_unstable_by_key(|&(key, score)| (score, key));
    candidates.truncate(excess);
    candidates
}

/// Evicts the least recently touched keys.
///
/// Scores are ticks of the owning table's logical clock, which advances once
/// per touched key in input order, so keys written later in a batch count as
/// more recent than keys written earlier.
///
/// # Example
///
/// ```
/// use dynemb_hash_table::{RestrictPolicy, RestrictRequest, TimestampRestrictPolicy};
///
/// let policy = TimestampRestrictPolicy;
/// let victims = policy
///     .select_victims(vec![(1, 10), (2, 30), (3, 20)], &RestrictRequest::max_entries(2), 30)
///     .unwrap();
/// assert_eq!(victims, vec![(1, 10)]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampRestrictPolicy;

impl RestrictPolicy for TimestampRestrictPolicy {
    fn name(&self) -> &str {
        "timestamp"
    }

    fn touch(&self, previous: Option<u64>, tick: u64) -> u64 {
        previous.map_or(tick, |prev| prev.max(tick))
    }

    fn select_victims(
        &self,
        candidates: Vec<(i64, u64)>,
        request: &RestrictRequest,
        now: u64,
    ) -> Result<Vec<(i64, u64)>> {
        let (mut victims, survivors): (Vec<_>, Vec<_>) = match request.max_age {
            Some(max_age) => candidates
                .into_iter()
                .partition(|&(_, score)| now.saturating_sub(score) > max_age),
            None => (Vec::new(), candidates),
        };
        if let Some(max_entries) = request.max_entries {
            victims.extend(lowest_scored(survivors, max_entries));
        }
        Ok(victims)
    }
}

/// Evicts the least frequently touched keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrequencyRestrictPolicy;

impl RestrictPolicy for FrequencyRestrictPolicy {
    fn name(&self) -> &str {
        "frequency"
    }

    fn touch(&self, previous: Option<u64>, _tick: u64) -> u64 {
        previous.map_or(1, |count| count.saturating_add(1))
    }

    fn select_victims(
        &self,
        candidates: Vec<(i64, u64)>,
        request: &RestrictRequest,
        _now: u64,
    ) -> Result<Vec<(i64, u64)>> {
        if request.max_age.is_some() {
            return Err(EmbeddingError::Configuration(
                "frequency restrict policy does not track key age; use max_entries".to_string(),
            ));
        }
        Ok(request
            .max_entries
            .map(|max_entries| lowest_scored(candidates, max_entries))
            .unwrap_or_default())
    }
}

/// Score updates to apply while touching keys inside a shard.
///
/// `ticks` is aligned with the keys handed to the shard.
#[derive(Clone, Copy)]
pub(crate) struct Touch<'a> {
    pub(crate) policy: &'a dyn RestrictPolicy,
    pub(crate) ticks: &'a [u64],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_touch_is_monotonic() {
        let policy = TimestampRestrictPolicy;
        assert_eq!(policy.touch(None, 5), 5);
        assert_eq!(policy.touch(Some(5), 9), 9);
        // A late-arriving older tick never moves a key back in time.
        assert_eq!(policy.touch(Some(9), 7), 9);
    }

    #[test]
    fn test_timestamp_keeps_most_recent() {
        let policy = TimestampRestrictPolicy;
        let candidates: Vec<(i64, u64)> = (0..10).map(|k| (k, k as u64 + 1)).collect();
        let mut victims = policy
            .select_victims(candidates, &RestrictRequest::max_entries(3), 10)
            .unwrap();
        victims.sort_unstable();
        let keys: Vec<i64> = victims.iter().map(|&(k, _)| k).collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_timestamp_max_age() {
        let policy = TimestampRestrictPolicy;
        let candidates = vec![(1, 10), (2, 50), (3, 95)];
        let victims = policy
            .select_victims(candidates, &RestrictRequest::max_age(40), 100)
            .unwrap();
        assert_eq!(victims, vec![(1, 10), (2, 50)]);
    }

    #[test]
    fn test_timestamp_age_and_entries_combined() {
        let policy = TimestampRestrictPolicy;
        let candidates = vec![(1, 10), (2, 80), (3, 90), (4, 95)];
        let request = RestrictRequest::max_age(50).with_max_entries(2);
        let mut victims = policy.select_victims(candidates, &request, 100).unwrap();
        victims.sort_unstable();
        assert_eq!(victims, vec![(1, 10), (2, 80)]);
    }

    #[test]
    fn test_frequency_evicts_least_used() {
        let policy = FrequencyRestrictPolicy;
        assert_eq!(policy.touch(None, 100), 1);
        assert_eq!(policy.touch(Some(1), 101), 2);

        let candidates = vec![(7, 3), (8, 1), (9, 5), (10, 1)];
        let victims = policy
            .select_victims(candidates, &RestrictRequest::max_entries(2), 0)
            .unwrap();
        assert_eq!(victims, vec![(8, 1), (10, 1)]);
    }

    #[test]
    fn test_frequency_rejects_max_age() {
        let err = FrequencyRestrictPolicy
            .select_victims(vec![(1, 1)], &RestrictRequest::max_age(10), 0)
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Configuration(_)));
    }

    #[test]
    fn test_request_validation() {
        assert!(RestrictRequest::default().validate().is_err());
        assert!(RestrictRequest::max_entries(10)
            .with_trigger(5)
            .validate()
            .is_err());
        assert!(RestrictRequest::max_entries(10)
            .with_trigger(20)
            .validate()
            .is_ok());
    }
}
