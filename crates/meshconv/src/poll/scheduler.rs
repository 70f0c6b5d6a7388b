//! Deadline-ordered driver for many poll state machines.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::{ClientCache, FetchError, JobSnapshot, PollIntervals, PollState, StatusSource, StopReason};

/// The result of one fetch, reported to the caller of [`PollScheduler::run_due`].
#[derive(Debug, Clone, PartialEq)]
pub struct PollUpdate {
    pub job_id: String,
    pub outcome: Result<JobSnapshot, FetchError>,
    pub state: PollState,
}

#[derive(Debug)]
struct Tracked {
    state: PollState,
    generation: u64,
}

/// Heap entry: deadline, insertion order, job id, generation.
type Deadline = Reverse<(Instant, u64, String, u64)>;

/// Polls each tracked job on its own schedule until it stops.
///
/// Deadlines live in a min-heap. Re-tracking or cancelling a job bumps its
/// generation so stale heap entries are skipped instead of removed.
pub struct PollScheduler<S: StatusSource> {
    source: S,
    intervals: PollIntervals,
    cache: Option<ClientCache>,
    tracked: HashMap<String, Tracked>,
    deadlines: BinaryHeap<Deadline>,
    seq: u64,
}

impl<S: StatusSource> PollScheduler<S> {
    pub fn new(source: S, intervals: PollIntervals) -> Self {
        Self {
            source,
            intervals,
            cache: None,
            tracked: HashMap::new(),
            deadlines: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Persists every observed state to `cache`.
    pub fn with_cache(mut self, cache: ClientCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&ClientCache> {
        self.cache.as_ref()
    }

    /// Starts polling `job_id`. The first fetch is due at `now`.
    pub fn track(&mut self, job_id: &str, now: Instant) {
        let generation = match self.tracked.get_mut(job_id) {
            Some(tracked) => {
                tracked.generation += 1;
                tracked.state = PollState::ActivePolling;
                tracked.generation
            }
            None => {
                self.tracked.insert(
                    job_id.to_string(),
                    Tracked {
                        state: PollState::ActivePolling,
                        generation: 0,
                    },
                );
                0
            }
        };
        if let Some(cache) = self.cache.as_mut() {
            if cache.get(job_id).is_none() {
                cache.record_submitted(job_id);
                save_cache(cache);
            }
        }
        self.schedule(job_id, now, generation);
    }

    /// Stops polling `job_id` without touching its cached state.
    pub fn cancel(&mut self, job_id: &str) {
        if let Some(tracked) = self.tracked.get_mut(job_id) {
            tracked.generation += 1;
            tracked.state = PollState::Stopped(StopReason::Cancelled);
            tracing::debug!(job_id, "polling cancelled");
        }
    }

    /// Tracks every cached job whose last known status was not terminal.
    /// Returns the resumed ids.
    pub fn resume(&mut self, now: Instant) -> Vec<String> {
        let ids = match self.cache.as_ref() {
            Some(cache) => cache.resumable(),
            None => return Vec::new(),
        };
        for id in &ids {
            self.track(id, now);
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "resumed polling from cache");
        }
        ids
    }

    pub fn state(&self, job_id: &str) -> Option<PollState> {
        self.tracked.get(job_id).map(|t| t.state)
    }

    /// True when no job is waiting for another fetch.
    pub fn is_idle(&self) -> bool {
        self.tracked.values().all(|t| t.state.is_stopped())
    }

    /// Earliest pending deadline, discarding stale entries on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, _, id, generation))) = self.deadlines.peek() {
            if self.is_current(id, *generation) {
                return Some(*at);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Fetches every job whose deadline is at or before `now`.
    pub fn run_due(&mut self, now: Instant) -> Vec<PollUpdate> {
        let mut updates = Vec::new();
        while let Some(Reverse((at, _, _, _))) = self.deadlines.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((_, _, id, generation))) = self.deadlines.pop() else {
                break;
            };
            if !self.is_current(&id, generation) {
                continue;
            }
            updates.push(self.poll_one(&id, generation, now));
        }
        if !updates.is_empty() {
            if let Some(cache) = self.cache.as_ref() {
                save_cache(cache);
            }
        }
        updates
    }

    /// Drives polling until every job has stopped or `stop` fires.
    ///
    /// `on_update` sees each fetch result in deadline order.
    pub fn run<F>(&mut self, stop: &Receiver<()>, mut on_update: F)
    where
        F: FnMut(&PollUpdate),
    {
        loop {
            for update in self.run_due(Instant::now()) {
                on_update(&update);
            }
            let Some(deadline) = self.next_deadline() else {
                return;
            };
            let wait = deadline.saturating_duration_since(Instant::now());
            match stop.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("poll scheduler stopping");
                    return;
                }
            }
        }
    }

    fn poll_one(&mut self, job_id: &str, generation: u64, now: Instant) -> PollUpdate {
        let outcome = self.source.fetch(job_id);
        let previous = self
            .tracked
            .get(job_id)
            .map(|t| t.state)
            .unwrap_or(PollState::ActivePolling);
        let state = previous.next(&outcome);

        match &outcome {
            Ok(snapshot) => {
                if let Some(cache) = self.cache.as_mut() {
                    cache.apply_snapshot(snapshot);
                }
            }
            Err(FetchError::NotFound) => {
                if let Some(cache) = self.cache.as_mut() {
                    cache.mark_gone(job_id);
                }
                tracing::info!(job_id, "job no longer exists, polling stopped");
            }
            Err(FetchError::Transient(reason)) => {
                tracing::warn!(job_id, %reason, "status fetch failed, backing off");
            }
        }

        if let Some(tracked) = self.tracked.get_mut(job_id) {
            tracked.state = state;
        }
        if let Some(delay) = state.delay(&self.intervals) {
            self.schedule(job_id, now + delay, generation);
        } else if let PollState::Stopped(StopReason::Terminal(status)) = state {
            tracing::debug!(job_id, status = status.as_str(), "job reached terminal state");
        }

        PollUpdate {
            job_id: job_id.to_string(),
            outcome,
            state,
        }
    }

    fn schedule(&mut self, job_id: &str, at: Instant, generation: u64) {
        self.seq += 1;
        self.deadlines
            .push(Reverse((at, self.seq, job_id.to_string(), generation)));
    }

    fn is_current(&self, job_id: &str, generation: u64) -> bool {
        self.tracked
            .get(job_id)
            .map(|t| t.generation == generation && !t.state.is_stopped())
            .unwrap_or(false)
    }
}

fn save_cache(cache: &ClientCache) {
    if let Err(e) = cache.save() {
        tracing::warn!(path = %cache.path().display(), error = %e, "failed to persist poll cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Replays scripted responses per job and records every fetch.
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<HashMap<String, VecDeque<Result<JobSnapshot, FetchError>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn push(&self, id: &str, response: Result<JobSnapshot, FetchError>) {
            self.responses
                .lock()
                .unwrap()
                .entry(id.to_string())
                .or_default()
                .push_back(response);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StatusSource for Scripted {
        fn fetch(&self, job_id: &str) -> Result<JobSnapshot, FetchError> {
            self.calls.lock().unwrap().push(job_id.to_string());
            self.responses
                .lock()
                .unwrap()
                .get_mut(job_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(Err(FetchError::NotFound))
        }
    }

    fn snap(id: &str, status: JobStatus) -> Result<JobSnapshot, FetchError> {
        Ok(JobSnapshot {
            id: id.to_string(),
            status,
            progress: 10,
            message: String::new(),
            error: None,
            result: None,
            ttl_remaining_secs: 3600,
        })
    }

    fn scheduler(source: std::sync::Arc<Scripted>) -> PollScheduler<std::sync::Arc<Scripted>> {
        PollScheduler::new(source, PollIntervals::default())
    }

    #[test]
    fn test_active_then_terminal() {
        let source = std::sync::Arc::new(Scripted::default());
        source.push("a", snap("a", JobStatus::Queued));
        source.push("a", snap("a", JobStatus::Processing));
        source.push("a", snap("a", JobStatus::Completed));
        let mut sched = scheduler(source.clone());

        let t0 = Instant::now();
        sched.track("a", t0);
        assert_eq!(sched.run_due(t0).len(), 1);
        assert_eq!(sched.next_deadline(), Some(t0 + Duration::from_millis(1500)));

        // Nothing is due before the active interval elapses.
        assert!(sched.run_due(t0 + Duration::from_millis(1000)).is_empty());

        let t1 = t0 + Duration::from_millis(1500);
        sched.run_due(t1);
        let t2 = t1 + Duration::from_millis(1500);
        let updates = sched.run_due(t2);
        assert_eq!(
            updates[0].state,
            PollState::Stopped(StopReason::Terminal(JobStatus::Completed))
        );
        assert!(sched.is_idle());
        assert_eq!(sched.next_deadline(), None);
        assert_eq!(source.calls().len(), 3);
    }

    #[test]
    fn test_transient_failure_backs_off_then_recovers() {
        let source = std::sync::Arc::new(Scripted::default());
        source.push("a", Err(FetchError::Transient("503".into())));
        source.push("a", snap("a", JobStatus::Processing));
        let mut sched = scheduler(source.clone());

        let t0 = Instant::now();
        sched.track("a", t0);
        sched.run_due(t0);
        assert_eq!(sched.state("a"), Some(PollState::BackoffPolling));
        assert_eq!(sched.next_deadline(), Some(t0 + Duration::from_millis(3000)));

        assert!(sched.run_due(t0 + Duration::from_millis(1500)).is_empty());
        sched.run_due(t0 + Duration::from_millis(3000));
        assert_eq!(sched.state("a"), Some(PollState::ActivePolling));
    }

    #[test]
    fn test_not_found_stops() {
        let source = std::sync::Arc::new(Scripted::default());
        let mut sched = scheduler(source.clone());
        let t0 = Instant::now();
        sched.track("gone", t0);
        sched.run_due(t0);
        assert_eq!(
            sched.state("gone"),
            Some(PollState::Stopped(StopReason::NotFound))
        );
        assert!(sched.is_idle());
    }

    #[test]
    fn test_cancel_drops_pending_deadline() {
        let source = std::sync::Arc::new(Scripted::default());
        source.push("a", snap("a", JobStatus::Processing));
        source.push("a", snap("a", JobStatus::Processing));
        let mut sched = scheduler(source.clone());

        let t0 = Instant::now();
        sched.track("a", t0);
        sched.run_due(t0);
        sched.cancel("a");

        assert!(sched.run_due(t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(source.calls().len(), 1);
        assert_eq!(
            sched.state("a"),
            Some(PollState::Stopped(StopReason::Cancelled))
        );
    }

    #[test]
    fn test_jobs_poll_independently() {
        let source = std::sync::Arc::new(Scripted::default());
        source.push("a", Err(FetchError::Transient("timeout".into())));
        source.push("b", snap("b", JobStatus::Processing));
        source.push("b", snap("b", JobStatus::Processing));
        let mut sched = scheduler(source.clone());

        let t0 = Instant::now();
        sched.track("a", t0);
        sched.track("b", t0);
        sched.run_due(t0);

        let updates = sched.run_due(t0 + Duration::from_millis(1500));
        let ids: Vec<_> = updates.iter().map(|u| u.job_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn test_resume_from_cache() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("poll.json");
        {
            let mut cache = ClientCache::open(&path).unwrap();
            cache.record_submitted("pending");
            cache.apply_snapshot(&snap("done", JobStatus::Completed).unwrap());
            cache.save().unwrap();
        }

        let source = std::sync::Arc::new(Scripted::default());
        source.push("pending", snap("pending", JobStatus::Completed));
        let mut sched = scheduler(source.clone()).with_cache(ClientCache::open(&path).unwrap());

        let t0 = Instant::now();
        assert_eq!(sched.resume(t0), vec!["pending"]);
        sched.run_due(t0);
        assert_eq!(source.calls(), vec!["pending"]);

        let reopened = ClientCache::open(&path).unwrap();
        assert_eq!(reopened.get("pending").unwrap().status, JobStatus::Completed);
        assert!(reopened.resumable().is_empty());
    }

    #[test]
    fn test_run_returns_when_idle() {
        let source = std::sync::Arc::new(Scripted::default());
        source.push("a", snap("a", JobStatus::Failed));
        let mut sched = PollScheduler::new(
            source,
            PollIntervals {
                active: Duration::from_millis(5),
                backoff: Duration::from_millis(10),
            },
        );
        sched.track("a", Instant::now());

        let (_stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let mut seen = Vec::new();
        sched.run(&stop_rx, |u| seen.push(u.state));
        assert_eq!(
            seen,
            vec![PollState::Stopped(StopReason::Terminal(JobStatus::Failed))]
        );
    }
}
