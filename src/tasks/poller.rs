use crate::api::PollSource;
use crate::error::SyncError;
use crate::models::PollSnapshot;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

// One fetch result, tagged with the run that produced it
#[derive(Debug)]
pub struct PollerTick {
    pub generation: u64,
    pub result: Result<PollSnapshot, SyncError>,
}

type TickHandler = Arc<dyn Fn(PollerTick) + Send + Sync>;

/// Re-fetches a poll on a fixed interval and hands each result to a callback.
///
/// `stop()` (or a restart at a new interval) aborts the timer task. Ticks that
/// were already delivered carry the old generation so the receiver can drop
/// them with [`FallbackPoller::is_current`].
pub struct FallbackPoller<S: PollSource> {
    source: Arc<S>,
    on_tick: TickHandler,
    task: Option<JoinHandle<()>>,
    generation: u64,
    period: Option<Duration>,
}

impl<S: PollSource> FallbackPoller<S> {
    pub fn new(source: Arc<S>, on_tick: impl Fn(PollerTick) + Send + Sync + 'static) -> Self {
        Self {
            source,
            on_tick: Arc::new(on_tick),
            task: None,
            generation: 0,
            period: None,
        }
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && generation == self.generation
    }

    pub fn start(&mut self, poll_id: &str, period: Duration) {
        self.stop();
        self.generation += 1;
        self.period = Some(period);
        info!("Polling poll {} every {:?}", poll_id, period);

        let source = self.source.clone();
        let on_tick = self.on_tick.clone();
        let generation = self.generation;
        let poll_id = poll_id.to_string();
        self.task = Some(tokio::spawn(async move {
            // First fetch one full period after start
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                debug!("Fallback fetch for poll {}", poll_id);
                let result = source.fetch_poll_snapshot(&poll_id).await;
                on_tick(PollerTick { generation, result });
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.period = None;
    }
}

impl<S: PollSource> Drop for FallbackPoller<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{PollMetadata, ResultsBreakdown, TallySnapshot};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // Replays queued responses, then repeats the last one
    #[derive(Default)]
    pub(crate) struct ScriptedSource {
        responses: Mutex<VecDeque<Result<PollSnapshot, SyncError>>>,
        last: Mutex<Option<Result<PollSnapshot, SyncError>>>,
        results: Mutex<Option<Result<ResultsBreakdown, SyncError>>>,
        // Artificial latency applied to each snapshot fetch, in order
        delays: Mutex<VecDeque<Duration>>,
        calls: Mutex<u32>,
        results_calls: Mutex<u32>,
    }

    impl ScriptedSource {
        pub fn new(responses: Vec<Result<PollSnapshot, SyncError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            })
        }

        pub fn push(&self, response: Result<PollSnapshot, SyncError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        pub fn delay_next(&self, delay: Duration) {
            self.delays.lock().unwrap().push_back(delay);
        }

        pub fn set_results(&self, results: Result<ResultsBreakdown, SyncError>) {
            *self.results.lock().unwrap() = Some(results);
        }

        pub fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }

        pub fn results_calls(&self) -> u32 {
            *self.results_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PollSource for ScriptedSource {
        async fn fetch_poll_snapshot(&self, poll_id: &str) -> Result<PollSnapshot, SyncError> {
            *self.calls.lock().unwrap() += 1;
            let delay = self.delays.lock().unwrap().pop_front();
            let response = {
                let mut responses = self.responses.lock().unwrap();
                let mut last = self.last.lock().unwrap();
                match responses.pop_front() {
                    Some(response) => {
                        *last = Some(response.clone());
                        response
                    }
                    None => last
                        .clone()
                        .unwrap_or_else(|| Err(SyncError::NotFound(poll_id.to_string()))),
                }
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            response
        }

        async fn fetch_results(&self, _poll_id: &str) -> Result<ResultsBreakdown, SyncError> {
            *self.results_calls.lock().unwrap() += 1;
            self.results
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Ok(ResultsBreakdown::default()))
        }
    }

    pub(crate) fn snapshot(
        active: bool,
        start_offset_mins: i64,
        end_offset_mins: i64,
        counts: &[(&str, u64)],
        at: DateTime<Utc>,
    ) -> PollSnapshot {
        let now = Utc::now();
        PollSnapshot {
            metadata: PollMetadata {
                id: "7".to_string(),
                title: Some("Best Band".to_string()),
                active,
                start_time: Some(now + chrono::Duration::minutes(start_offset_mins)),
                end_time: Some(now + chrono::Duration::minutes(end_offset_mins)),
            },
            tally: TallySnapshot::from_pairs(counts.iter().map(|(k, v)| (*k, *v)), at),
        }
    }

    fn collecting() -> (Arc<Mutex<Vec<PollerTick>>>, impl Fn(PollerTick) + Send + Sync + 'static) {
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = ticks.clone();
        (ticks, move |tick| sink.lock().unwrap().push(tick))
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_once_per_period() {
        let source = ScriptedSource::new(vec![Ok(snapshot(true, -5, 5, &[("ada", 1)], Utc::now()))]);
        let (ticks, on_tick) = collecting();
        let mut poller = FallbackPoller::new(source.clone(), on_tick);

        poller.start("7", Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(source.calls(), 0);
        tokio::time::sleep(Duration::from_millis(10_200)).await;
        assert_eq!(source.calls(), 3);

        let ticks = ticks.lock().unwrap();
        assert_eq!(ticks.len(), 3);
        assert!(ticks.iter().all(|tick| tick.generation == 1 && tick.result.is_ok()));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_leaves_no_pending_timer() {
        let source = ScriptedSource::new(vec![Ok(snapshot(true, -5, 5, &[], Utc::now()))]);
        let (ticks, on_tick) = collecting();
        let mut poller = FallbackPoller::new(source.clone(), on_tick);

        poller.start("7", Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;
        poller.stop();
        assert_eq!(poller.period(), None);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(source.calls(), 1);
        assert_eq!(ticks.lock().unwrap().len(), 1);
        assert!(!poller.is_current(1));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_bumps_generation() {
        let source = ScriptedSource::new(vec![Ok(snapshot(true, -5, 5, &[], Utc::now()))]);
        let (ticks, on_tick) = collecting();
        let mut poller = FallbackPoller::new(source.clone(), on_tick);

        poller.start("7", Duration::from_secs(300));
        poller.start("7", Duration::from_secs(5));
        assert_eq!(poller.period(), Some(Duration::from_secs(5)));
        assert!(!poller.is_current(1));
        assert!(poller.is_current(2));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(ticks.lock().unwrap()[0].generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_forwarded_not_retried() {
        let source = ScriptedSource::new(vec![
            Err(SyncError::Network("reset".to_string())),
            Ok(snapshot(true, -5, 5, &[], Utc::now())),
        ]);
        let (ticks, on_tick) = collecting();
        let mut poller = FallbackPoller::new(source.clone(), on_tick);

        poller.start("7", Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(11)).await;

        let ticks = ticks.lock().unwrap();
        assert_eq!(ticks.len(), 2);
        assert!(ticks[0].result.is_err());
        assert!(ticks[1].result.is_ok());
    }
}
