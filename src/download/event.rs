//! Engine event broadcast.
//!
//! The engine fans out lifecycle and progress notifications on a
//! [`tokio::sync::broadcast`] channel: subscribers read at their own
//! pace, a slow subscriber lags and drops (it never stalls emission),
//! and no event is emitted while a core lock is held. Per-download
//! events are causally ordered with the state changes that caused them;
//! events for different downloads interleave arbitrarily.

use tokio::sync::broadcast;

use super::segment::Segment;

/// Buffered events per subscriber before lagging sets in.
const CHANNEL_CAPACITY: usize = 1024;

/// Tagged engine event, delivered to every subscriber.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A download entry was added to the catalog.
    Added {
        /// Entry ID.
        id: String,
    },
    /// A download was started (or restarted).
    Started {
        /// Entry ID.
        id: String,
    },
    /// Periodic progress sample for one download.
    Progress {
        /// Entry ID.
        id: String,
        /// Bytes downloaded so far.
        downloaded: i64,
        /// Total size; -1 when unknown.
        total: i64,
        /// Current speed, bytes/sec.
        speed: f64,
    },
    /// The segment map changed shape or progressed.
    SegmentMapChanged {
        /// Entry ID.
        id: String,
        /// Snapshot of the current segment list.
        segments: Vec<Segment>,
    },
    /// The download was paused (user pause or stop).
    Paused {
        /// Entry ID.
        id: String,
    },
    /// A paused download was started again.
    Resumed {
        /// Entry ID.
        id: String,
    },
    /// The download finalized successfully.
    Complete {
        /// Entry ID.
        id: String,
    },
    /// The download failed.
    Error {
        /// Entry ID.
        id: String,
        /// Last observed cause.
        message: String,
    },
    /// The entry was removed from the catalog.
    Removed {
        /// Entry ID.
        id: String,
    },
    /// Aggregate speed across all active downloads.
    SpeedUpdate {
        /// Total speed, bytes/sec.
        total_speed: f64,
        /// Number of active downloads.
        active: usize,
    },
}

/// Broadcast hub owned by the engine context.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a hub with the default per-subscriber buffer.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Registers a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Emits an event to all current subscribers. Fire-and-forget: with
    /// no subscribers the event is simply dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::Added { id: "a1".to_string() });
        bus.emit(EngineEvent::Started { id: "a1".to_string() });

        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::Added { id } if id == "a1"));
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::Started { id } if id == "a1"));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::SpeedUpdate {
            total_speed: 0.0,
            active: 0,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_per_id_ordering_preserved() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for downloaded in [100i64, 200, 300] {
            bus.emit(EngineEvent::Progress {
                id: "a1".to_string(),
                downloaded,
                total: 300,
                speed: 1.0,
            });
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            if let EngineEvent::Progress { downloaded, .. } = rx.recv().await.unwrap() {
                seen.push(downloaded);
            }
        }
        assert_eq!(seen, vec![100, 200, 300]);
    }
}
