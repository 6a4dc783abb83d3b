use crate::channel::ConnectionState;
use crate::error::{ErrorKind, SyncError};
use crate::models::{PollMetadata, PollPhase, ResultsBreakdown, TallySnapshot};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

// How many standings the summary line shows
const SUMMARY_LEADERS: usize = 3;

/// Everything display code may read. Published whole through a `watch`
/// channel; nobody outside the controller ever mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncView {
    pub phase: PollPhase,
    pub connectivity: ConnectionState,
    pub tally: Arc<TallySnapshot>,
    pub last_error: Option<ErrorKind>,
    // None until the first successful load
    pub poll: Option<PollMetadata>,
    pub results: Option<Arc<ResultsBreakdown>>,
    pub server_notice: Option<String>,
}

impl Default for SyncView {
    fn default() -> Self {
        Self {
            phase: PollPhase::Upcoming,
            connectivity: ConnectionState::Idle,
            tally: Arc::new(TallySnapshot::empty(DateTime::<Utc>::UNIX_EPOCH)),
            last_error: None,
            poll: None,
            results: None,
            server_notice: None,
        }
    }
}

impl SyncView {
    pub fn is_loaded(&self) -> bool {
        self.poll.is_some()
    }

    // Last snapshot wins unless it is strictly older than the held one
    pub fn merge_tally(&mut self, incoming: TallySnapshot) -> Result<(), SyncError> {
        if incoming.is_older_than(&self.tally) {
            return Err(SyncError::StaleData {
                incoming: incoming.last_updated(),
                held: self.tally.last_updated(),
            });
        }
        self.tally = Arc::new(incoming);
        Ok(())
    }

    // Errors that only describe a failed fetch and go away with the next good one
    pub fn clear_fetch_error(&mut self) {
        if matches!(
            self.last_error,
            Some(ErrorKind::Network | ErrorKind::Server | ErrorKind::NotFound)
        ) {
            self.last_error = None;
        }
    }
}

impl fmt::Display for SyncView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(poll) = &self.poll else {
            return match self.last_error {
                Some(error) => write!(f, "loading failed: {}", error),
                None => write!(f, "loading..."),
            };
        };

        let title = poll.title.as_deref().unwrap_or(&poll.id);
        write!(
            f,
            "[{}] {} | live: {} | {} votes",
            self.phase, title, self.connectivity, self.tally.total()
        )?;

        let leaders: Vec<String> = self
            .tally
            .standings()
            .into_iter()
            .take(SUMMARY_LEADERS)
            .map(|s| format!("#{} {} {} ({}%)", s.rank, s.key, s.count, s.percentage))
            .collect();
        if !leaders.is_empty() {
            write!(f, " | {}", leaders.join(", "))?;
        }
        if let Some(error) = self.last_error {
            write!(f, " | error: {}", error)?;
        }
        if let Some(notice) = &self.server_notice {
            write!(f, " | server: {}", notice)?;
        }
        Ok(())
    }
}
