use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

use crate::{
    error::{Result, ScanError},
    models::Scan,
};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Change notifications published by a [`ScanStore`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    BatchStarted { batch_id: String, files: usize },
    ScanAppended { index: usize, scan: Scan },
    BatchFinished { batch_id: String, appended: usize },
}

/// Append-only, ordered log of scans.
///
/// Records are never edited or removed once appended; readers get owned
/// snapshots or subscribe to [`ScanEvent`]s. Only the ingestion controller appends.
#[derive(Clone)]
pub struct ScanStore {
    scans: Arc<RwLock<Vec<Scan>>>,
    index: Arc<DashMap<String, usize>>,
    events: broadcast::Sender<ScanEvent>,
    capacity: Option<usize>,
}

impl ScanStore {
    pub fn new() -> Self {
        Self::with_limits(None, DEFAULT_EVENT_CAPACITY)
    }

    /// Store refusing appends past `capacity` records, buffering `event_capacity`
    /// notifications per subscriber.
    pub fn with_limits(capacity: Option<usize>, event_capacity: usize) -> Self {
        let (events, _rx) = broadcast::channel(event_capacity.max(1));
        Self {
            scans: Arc::new(RwLock::new(Vec::new())),
            index: Arc::new(DashMap::new()),
            events,
            capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: ScanEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Append a record, returning its position in the log.
    pub(crate) async fn append(&self, scan: Scan) -> Result<usize> {
        let mut scans = self.scans.write().await;

        if let Some(capacity) = self.capacity {
            if scans.len() >= capacity {
                return Err(ScanError::StoreFull { capacity });
            }
        }
        if self.index.contains_key(&scan.id) {
            return Err(ScanError::DuplicateScanId(scan.id));
        }

        let position = scans.len();
        self.index.insert(scan.id.clone(), position);
        scans.push(scan.clone());
        drop(scans);

        self.publish(ScanEvent::ScanAppended {
            index: position,
            scan,
        });
        Ok(position)
    }

    pub async fn snapshot(&self) -> Vec<Scan> {
        self.scans.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Scan> {
        let position = *self.index.get(id)?;
        self.scans.read().await.get(position).cloned()
    }

    /// Most recently appended scan
    pub async fn last(&self) -> Option<Scan> {
        self.scans.read().await.last().cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.scans.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.scans.read().await.is_empty()
    }
}

impl Default for ScanStore {
    fn default() -> Self {
        Self::new()
    }
}
