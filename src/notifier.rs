//! Live fan-out of newly ingested records
//!
//! Subscribers register through `LiveNotifier::subscribe`, receive a
//! snapshot of stored data first and then every `new_data` event. The
//! registry lock is held while taking the snapshot, while adding and
//! removing subscribers, and while a broadcast copies out its targets, so
//! a broadcast never iterates a set that is being mutated.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{DbError, SensorRecordRepository};
use crate::logger::SensorRecord;

/// Message pushed to live subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    InitialData {
        data: Vec<SensorRecord>,
        timestamp: DateTime<Utc>,
    },
    NewData {
        data: Vec<SensorRecord>,
        timestamp: DateTime<Utc>,
    },
}

impl LiveEvent {
    pub fn record_count(&self) -> usize {
        match self {
            LiveEvent::InitialData { data, .. } | LiveEvent::NewData { data, .. } => data.len(),
        }
    }
}

/// Source of the snapshot a new subscriber receives
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<SensorRecord>, DbError>;
}

#[async_trait]
impl SnapshotSource for SensorRecordRepository {
    async fn snapshot(&self) -> Result<Vec<SensorRecord>, DbError> {
        self.find_all().await
    }
}

/// A registered live subscriber
pub struct Subscription {
    pub id: Uuid,
    pub events: mpsc::Receiver<Arc<LiveEvent>>,
}

/// Result of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct LiveNotifier {
    subscribers: Arc<Mutex<HashMap<Uuid, mpsc::Sender<Arc<LiveEvent>>>>>,
    snapshot_source: Arc<dyn SnapshotSource>,
    send_timeout: Duration,
    channel_capacity: usize,
}

impl LiveNotifier {
    pub fn new(
        snapshot_source: Arc<dyn SnapshotSource>,
        send_timeout: Duration,
        channel_capacity: usize,
    ) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            snapshot_source,
            send_timeout,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Register a subscriber: snapshot first, then live events
    ///
    /// The snapshot is queued on the subscriber's channel before the
    /// subscriber joins the broadcast set, and both happen under the
    /// registry lock, so no broadcast can slip in between.
    #[instrument(skip(self))]
    pub async fn subscribe(&self) -> Result<Subscription, DbError> {
        let mut subscribers = self.subscribers.lock().await;

        let snapshot = self.snapshot_source.snapshot().await?;
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let id = Uuid::new_v4();

        debug!("Queueing snapshot of {} records for {}", snapshot.len(), id);
        let initial = Arc::new(LiveEvent::InitialData {
            data: snapshot,
            timestamp: Utc::now(),
        });
        // Fresh channel with capacity >= 1, so this cannot fail for lack of room
        if tx.try_send(initial).is_err() {
            warn!("Subscriber {} closed before receiving its snapshot", id);
        }

        subscribers.insert(id, tx);
        info!(
            "Live subscriber {} connected ({} total)",
            id,
            subscribers.len()
        );

        Ok(Subscription { id, events: rx })
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.remove(&id).is_some() {
            info!(
                "Live subscriber {} disconnected ({} remaining)",
                id,
                subscribers.len()
            );
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Deliver a just-ingested batch to every subscriber
    ///
    /// Sends to all subscribers run concurrently outside the registry lock,
    /// so the whole broadcast is bounded by a single send timeout. A
    /// subscriber that is closed or does not accept the event in time is
    /// dropped. Failures are logged and never returned.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn broadcast(&self, records: &[SensorRecord]) -> BroadcastReport {
        let event = Arc::new(LiveEvent::NewData {
            data: records.to_vec(),
            timestamp: Utc::now(),
        });

        let targets: Vec<(Uuid, mpsc::Sender<Arc<LiveEvent>>)> = self
            .subscribers
            .lock()
            .await
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let sends = targets.into_iter().map(|(id, tx)| {
            let event = Arc::clone(&event);
            async move { (id, tx.send_timeout(event, self.send_timeout).await) }
        });

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Dropping live subscriber {}: {}", id, e);
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.lock().await;
            for id in failed {
                subscribers.remove(&id);
                report.dropped += 1;
            }
        }

        debug!(
            "Broadcast {} records: {} delivered, {} dropped",
            records.len(),
            report.delivered,
            report.dropped
        );
        report
    }
}
