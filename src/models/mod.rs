mod tally;

pub use tally::{Standing, TallySnapshot};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Upcoming,
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollMetadata {
    pub id: String,
    pub title: Option<String>,
    pub active: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl PollPhase {
    // A missing start means the poll has already started, a missing end means it never ends
    pub fn at(poll: &PollMetadata, now: DateTime<Utc>) -> Self {
        if poll.start_time.is_some_and(|start| now < start) {
            return PollPhase::Upcoming;
        }
        let before_end = poll.end_time.is_none_or(|end| now <= end);
        if poll.active && before_end {
            PollPhase::Active
        } else {
            PollPhase::Ended
        }
    }
}

impl std::fmt::Display for PollPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PollPhase::Upcoming => "upcoming",
            PollPhase::Active => "active",
            PollPhase::Ended => "ended",
        };
        f.write_str(label)
    }
}

impl PollMetadata {
    // The next instant at which the derived phase changes on its own
    pub fn next_boundary(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match PollPhase::at(self, now) {
            PollPhase::Upcoming => self.start_time,
            PollPhase::Active => self.end_time,
            PollPhase::Ended => None,
        }
    }
}

// Metadata plus tally from one pull
#[derive(Debug, Clone, PartialEq)]
pub struct PollSnapshot {
    pub metadata: PollMetadata,
    pub tally: TallySnapshot,
}

// --- Wire records ---

#[derive(Debug, Clone, Deserialize)]
pub struct PollRecord {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub votes: Vec<VoteRecord>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

// The poll endpoint answers either with the record itself or wrapped in `poll`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PollEnvelope {
    Wrapped { poll: PollRecord },
    Bare(PollRecord),
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoteRecord {
    pub contestant: ContestantRef,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_votes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ContestantRef {
    Id(i64),
    Name(String),
    Detailed {
        #[serde(default)]
        id: Option<Value>,
        #[serde(default)]
        name: Option<String>,
    },
}

impl ContestantRef {
    pub fn key(&self) -> String {
        match self {
            ContestantRef::Id(id) => id.to_string(),
            ContestantRef::Name(name) => name.clone(),
            ContestantRef::Detailed { name: Some(name), .. } => name.clone(),
            ContestantRef::Detailed { id: Some(id), .. } => value_key(id),
            ContestantRef::Detailed { .. } => "unknown".to_string(),
        }
    }
}

// The server sends `null` for counts it has not computed yet
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl PollEnvelope {
    pub fn into_record(self) -> PollRecord {
        match self {
            PollEnvelope::Wrapped { poll } => poll,
            PollEnvelope::Bare(record) => record,
        }
    }
}

impl PollRecord {
    pub fn metadata(&self, fallback_id: &str) -> PollMetadata {
        PollMetadata {
            id: self
                .id
                .as_ref()
                .map(value_key)
                .unwrap_or_else(|| fallback_id.to_string()),
            title: self.title.clone(),
            active: self.active,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    // `observed_at` is used only when the record carries no timestamp of its own
    pub fn tally(&self, observed_at: DateTime<Utc>) -> TallySnapshot {
        TallySnapshot::from_pairs(
            self.votes
                .iter()
                .map(|vote| (vote.contestant.key(), vote.total_votes)),
            self.last_updated.unwrap_or(observed_at),
        )
    }

    pub fn into_snapshot(self, fallback_id: &str, observed_at: DateTime<Utc>) -> PollSnapshot {
        PollSnapshot {
            metadata: self.metadata(fallback_id),
            tally: self.tally(observed_at),
        }
    }
}

// Per-category breakdown from the results endpoint
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResultsBreakdown {
    #[serde(default)]
    pub poll_title: Option<String>,
    #[serde(default)]
    pub categories: BTreeMap<String, CategoryResults>,
    #[serde(default)]
    pub category_list: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_votes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CategoryResults {
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_votes: u64,
    #[serde(default)]
    pub contestants: Vec<ContestantResult>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContestantResult {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub vote_count: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub percentage: f64,
}

impl ResultsBreakdown {
    // Categories in the order the server lists them, skipping names it has no data for
    pub fn ordered_categories(&self) -> impl Iterator<Item = (&str, &CategoryResults)> {
        self.category_list.iter().filter_map(|name| {
            self.categories
                .get(name)
                .map(|category| (name.as_str(), category))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn poll(active: bool, start: Option<i64>, end: Option<i64>, now: DateTime<Utc>) -> PollMetadata {
        PollMetadata {
            id: "7".to_string(),
            title: None,
            active,
            start_time: start.map(|m| now + Duration::minutes(m)),
            end_time: end.map(|m| now + Duration::minutes(m)),
        }
    }

    #[test]
    fn phase_follows_window_and_flag() {
        let now = Utc::now();
        assert_eq!(PollPhase::at(&poll(true, Some(-10), Some(10), now), now), PollPhase::Active);
        assert_eq!(PollPhase::at(&poll(true, Some(5), Some(10), now), now), PollPhase::Upcoming);
        assert_eq!(PollPhase::at(&poll(false, Some(5), Some(10), now), now), PollPhase::Upcoming);
        assert_eq!(PollPhase::at(&poll(true, Some(-10), Some(-1), now), now), PollPhase::Ended);
        assert_eq!(PollPhase::at(&poll(false, Some(-10), Some(10), now), now), PollPhase::Ended);
    }

    #[test]
    fn missing_times_are_open_ended() {
        let now = Utc::now();
        assert_eq!(PollPhase::at(&poll(true, None, None, now), now), PollPhase::Active);
        assert_eq!(PollPhase::at(&poll(false, None, None, now), now), PollPhase::Ended);
    }

    #[test]
    fn next_boundary_depends_on_phase() {
        let now = Utc::now();
        let upcoming = poll(true, Some(5), Some(10), now);
        assert_eq!(upcoming.next_boundary(now), upcoming.start_time);
        let active = poll(true, Some(-5), Some(10), now);
        assert_eq!(active.next_boundary(now), active.end_time);
        assert_eq!(poll(true, Some(-5), Some(-1), now).next_boundary(now), None);
    }

    #[test]
    fn accepts_wrapped_and_bare_poll_records() {
        let wrapped: PollEnvelope = serde_json::from_str(
            r#"{"poll": {"id": 7, "active": true, "start_time": "2024-01-01T10:00:00Z", "end_time": "2024-01-02T10:00:00Z", "votes": []}}"#,
        )
        .unwrap();
        let bare: PollEnvelope =
            serde_json::from_str(r#"{"id": 7, "active": false, "votes": []}"#).unwrap();

        let wrapped = wrapped.into_record();
        assert!(wrapped.active);
        assert!(wrapped.start_time.is_some());
        assert_eq!(wrapped.metadata("x").id, "7");
        assert!(!bare.into_record().active);
    }

    #[test]
    fn null_counts_read_as_zero() {
        let envelope: PollEnvelope = serde_json::from_str(
            r#"{"id": 7, "active": true, "votes": [
                {"contestant": "ada", "total_votes": null},
                {"contestant": "bob", "total_votes": 3}]}"#,
        )
        .unwrap();
        let tally = envelope.into_record().tally(Utc::now());
        assert_eq!(tally.count("ada"), 0);
        assert_eq!(tally.count("bob"), 3);
        assert_eq!(tally.total(), 3);

        let breakdown: ResultsBreakdown = serde_json::from_str(
            r#"{"categories": {"Rock": {"total_votes": null, "contestants": [
                {"name": "Ada", "vote_count": null, "percentage": null}]}},
                "category_list": ["Rock"], "total_votes": null}"#,
        )
        .unwrap();
        assert_eq!(breakdown.total_votes, 0);
        let rock = &breakdown.categories["Rock"];
        assert_eq!(rock.total_votes, 0);
        assert_eq!(rock.contestants[0].vote_count, 0);
        assert_eq!(rock.contestants[0].percentage, 0.0);
    }

    #[test]
    fn contestant_keys_prefer_names() {
        let record: PollRecord = serde_json::from_str(
            r#"{"votes": [
                {"contestant": 3, "total_votes": 2},
                {"contestant": "Ada", "total_votes": 4},
                {"contestant": {"id": 9, "name": "Bob"}, "total_votes": 1},
                {"contestant": {"id": "c-1"}, "total_votes": 5},
                {"contestant": {"name": "Ada"}, "total_votes": 1}
            ]}"#,
        )
        .unwrap();
        let tally = record.tally(Utc::now());
        assert_eq!(tally.count("3"), 2);
        assert_eq!(tally.count("Ada"), 5);
        assert_eq!(tally.count("Bob"), 1);
        assert_eq!(tally.count("c-1"), 5);
        assert_eq!(tally.total(), 13);
    }

    #[test]
    fn record_timestamp_wins_over_observation_time() {
        let record: PollRecord =
            serde_json::from_str(r#"{"last_updated": "2024-03-01T12:00:00Z", "votes": []}"#).unwrap();
        let observed = Utc::now();
        assert_ne!(record.tally(observed).last_updated(), observed);

        let untimed: PollRecord = serde_json::from_str(r#"{"votes": []}"#).unwrap();
        assert_eq!(untimed.tally(observed).last_updated(), observed);
    }

    #[test]
    fn breakdown_orders_by_category_list() {
        let breakdown: ResultsBreakdown = serde_json::from_str(
            r#"{
                "poll_title": "Best Band",
                "categories": {
                    "Rock": {"total_votes": 3, "contestants": [{"name": "A", "vote_count": 3, "percentage": 100.0}]},
                    "Jazz": {"total_votes": 1, "contestants": [{"name": "B", "vote_count": 1, "percentage": 100.0}]}
                },
                "category_list": ["Jazz", "Rock", "Folk"],
                "total_votes": 4
            }"#,
        )
        .unwrap();
        let names: Vec<&str> = breakdown.ordered_categories().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Jazz", "Rock"]);
        assert_eq!(breakdown.total_votes, 4);
    }
}
