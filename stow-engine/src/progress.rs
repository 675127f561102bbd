// SPDX-License-Identifier: AGPL-3.0-or-later
//! Progress pub/sub bus
//!
//! One broadcast channel per job plus a global one. Sequence numbers are
//! assigned and sent while holding the bus lock, so every subscriber sees a
//! job's events in one total order. A lagging subscriber loses the oldest
//! events rather than slowing publishers down.

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast::{self, error::RecvError};

use stow_core::{StowError, StowResult};

use crate::job::{JobId, JobStatus};

/// Per-subscriber queue depth
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressKind {
    Queued,
    Started,
    Progress,
    ItemDone,
    ItemFailed,
    Finished,
    Cancelled,
}

impl ProgressKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressKind::Finished | ProgressKind::Cancelled)
    }
}

/// Job counters at the moment an event was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub status: JobStatus,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub items_done: usize,
    pub items_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// Strictly increasing per job, starting at 1
    pub seq: u64,
    pub kind: ProgressKind,
    pub counters: Counters,
    /// The item an item event refers to
    pub item: Option<String>,
    pub at: DateTime<Utc>,
}

/// Which events a subscription receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Job(JobId),
    All,
}

struct JobChannel {
    sender: broadcast::Sender<ProgressEvent>,
    next_seq: u64,
    last: Option<ProgressEvent>,
}

struct BusState {
    jobs: HashMap<JobId, JobChannel>,
}

pub struct ProgressBus {
    state: Mutex<BusState>,
    global: broadcast::Sender<ProgressEvent>,
    capacity: usize,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BusState { jobs: HashMap::new() }),
            global: broadcast::channel(capacity).0,
            capacity,
        }
    }

    /// Create the channel for a new job
    pub(crate) fn open(&self, job_id: JobId) {
        let mut state = self.state.lock();
        state.jobs.entry(job_id).or_insert_with(|| JobChannel {
            sender: broadcast::channel(self.capacity).0,
            next_seq: 1,
            last: None,
        });
    }

    /// Drop a job's channel; its subscriptions end once drained
    pub(crate) fn close(&self, job_id: JobId) {
        self.state.lock().jobs.remove(&job_id);
    }

    /// Publish an event for `job_id`. Nothing is published after a terminal
    /// event. Returns the sequence number assigned, if published.
    pub(crate) fn publish(
        &self,
        job_id: JobId,
        kind: ProgressKind,
        counters: Counters,
        item: Option<String>,
    ) -> Option<u64> {
        let mut state = self.state.lock();
        let channel = state.jobs.get_mut(&job_id)?;
        if channel.last.as_ref().is_some_and(|e| e.kind.is_terminal()) {
            return None;
        }

        let event = ProgressEvent {
            job_id,
            seq: channel.next_seq,
            kind,
            counters,
            item,
            at: Utc::now(),
        };
        channel.next_seq += 1;
        // No receivers is not an error
        let _ = channel.sender.send(event.clone());
        let _ = self.global.send(event.clone());
        let seq = event.seq;
        channel.last = Some(event);
        Some(seq)
    }

    /// Subscribe to one job or to all jobs. The latest event of each matching
    /// job is delivered first, then everything published afterwards.
    pub fn subscribe(&self, topic: Topic) -> StowResult<Subscription> {
        let state = self.state.lock();
        let (initial, receiver) = match topic {
            Topic::Job(job_id) => {
                let channel = state
                    .jobs
                    .get(&job_id)
                    .ok_or_else(|| StowError::JobNotFound(job_id.to_string()))?;
                (channel.last.iter().cloned().collect(), channel.sender.subscribe())
            }
            Topic::All => {
                let mut latest: Vec<ProgressEvent> =
                    state.jobs.values().filter_map(|c| c.last.clone()).collect();
                latest.sort_by_key(|e| e.at);
                (latest.into(), self.global.subscribe())
            }
        };
        Ok(Subscription {
            initial,
            receiver,
            skipped: 0,
        })
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        match topic {
            Topic::Job(job_id) => self
                .state
                .lock()
                .jobs
                .get(&job_id)
                .map_or(0, |c| c.sender.receiver_count()),
            Topic::All => self.global.receiver_count(),
        }
    }

    /// The latest event published for `job_id`
    pub fn last_event(&self, job_id: JobId) -> Option<ProgressEvent> {
        self.state.lock().jobs.get(&job_id).and_then(|c| c.last.clone())
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A stream of events for one topic
pub struct Subscription {
    initial: VecDeque<ProgressEvent>,
    receiver: broadcast::Receiver<ProgressEvent>,
    skipped: u64,
}

impl Subscription {
    /// Next event, or `None` once the topic's channel is closed
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.initial.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => self.skipped += n,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// How many events were lost to overflow so far
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn counters(bytes_done: u64) -> Counters {
        Counters {
            status: JobStatus::Running,
            bytes_done,
            bytes_total: 100,
            items_done: 0,
            items_failed: 0,
        }
    }

    #[tokio::test]
    async fn test_sequences_strictly_increase() {
        let bus = ProgressBus::new();
        let job = JobId::new();
        bus.open(job);
        let mut sub = bus.subscribe(Topic::Job(job)).unwrap();

        for i in 0..5 {
            bus.publish(job, ProgressKind::Progress, counters(i), None);
        }
        let mut last = 0;
        for _ in 0..5 {
            let event = sub.recv().await.unwrap();
            assert!(event.seq > last);
            last = event.seq;
        }
        assert_eq!(last, 5);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_last_snapshot_once() {
        let bus = ProgressBus::new();
        let job = JobId::new();
        bus.open(job);
        bus.publish(job, ProgressKind::Started, counters(0), None);
        bus.publish(job, ProgressKind::Progress, counters(40), None);

        let mut sub = bus.subscribe(Topic::Job(job)).unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(first.seq, 2);
        assert_eq!(first.counters.bytes_done, 40);

        bus.publish(job, ProgressKind::Progress, counters(80), None);
        assert_eq!(sub.recv().await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn test_nothing_after_terminal() {
        let bus = ProgressBus::new();
        let job = JobId::new();
        bus.open(job);
        assert!(bus.publish(job, ProgressKind::Cancelled, counters(0), None).is_some());
        assert!(bus.publish(job, ProgressKind::Progress, counters(1), None).is_none());
        assert_eq!(bus.last_event(job).unwrap().kind, ProgressKind::Cancelled);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let bus = ProgressBus::with_capacity(4);
        let job = JobId::new();
        bus.open(job);
        let mut sub = bus.subscribe(Topic::Job(job)).unwrap();
        for i in 0..10 {
            bus.publish(job, ProgressKind::Progress, counters(i), None);
        }
        let event = sub.recv().await.unwrap();
        assert_eq!(sub.skipped(), 6);
        assert_eq!(event.seq, 7);
    }

    #[tokio::test]
    async fn test_global_topic_and_close() {
        let bus = ProgressBus::new();
        let (a, b) = (JobId::new(), JobId::new());
        bus.open(a);
        bus.open(b);
        let all = bus.subscribe(Topic::All).unwrap();
        let single = bus.subscribe(Topic::Job(a)).unwrap();

        bus.publish(a, ProgressKind::Started, counters(0), None);
        bus.publish(b, ProgressKind::Started, counters(0), None);
        bus.close(a);

        let events: Vec<_> = single.into_stream().collect().await;
        assert_eq!(events.len(), 1);

        let mut all = all;
        assert_eq!(all.recv().await.unwrap().job_id, a);
        assert_eq!(all.recv().await.unwrap().job_id, b);
        assert!(matches!(bus.subscribe(Topic::Job(a)), Err(StowError::JobNotFound(_))));
    }
}
