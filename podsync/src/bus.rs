//! Per-pod fan-out of change events with backpressure.
//!
//! One tokio broadcast channel per pod: O(1) publish to all attached
//! sessions, each with an independent bounded buffer. The publish path never
//! blocks — a session that falls `capacity` messages behind observes
//! `Lagged` and is expected to re-fetch, not to stall the writer.
//!
//! ```text
//! WriteCoordinator ── publish(origin, event)
//!        │ encode once
//!        ▼
//! PodChannel (broadcast::Sender<BusMessage>)
//!        ├──► session A receiver ──► WebSocket
//!        ├──► session B receiver ──► WebSocket
//!        └──► (zero receivers: event dropped, never queued)
//! ```
//!
//! Performance target: 1,000 events to 100 sessions < 10ms
//! Reference: Kleppmann, Chapter 11 — Messaging Systems

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ChangeEvent, ProtocolError, ServerMessage};

/// One broadcast payload: the event pre-encoded as a `ServerMessage::Event`
/// frame, shared between all receivers, plus the originating session so the
/// connection loop can skip echoing without decoding.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub origin: Uuid,
    pub frame: Arc<Vec<u8>>,
}

/// Statistics snapshot for one pod channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub events_published: u64,
    pub subscribers: usize,
}

/// Lock-free channel stats — publish never takes a lock.
struct AtomicChannelStats {
    events_published: AtomicU64,
}

impl AtomicChannelStats {
    fn new() -> Self {
        Self {
            events_published: AtomicU64::new(0),
        }
    }
}

/// Broadcast channel for a single pod.
///
/// Every session attached to the pod holds one receiver. Events are encoded
/// once and fanned out as shared bytes; the sender is unaffected by slow
/// receivers.
pub struct PodChannel {
    sender: broadcast::Sender<BusMessage>,
    /// Messages buffered per receiver before it lags
    capacity: usize,
    atomic_stats: Arc<AtomicChannelStats>,
}

impl PodChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicChannelStats::new()),
        }
    }

    /// Subscribe a session to this pod's events.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Encode the event once and fan it out.
    ///
    /// Returns the number of receivers it reached; zero receivers means the
    /// event is dropped on the floor, which is fine — attach always starts
    /// from a fresh snapshot.
    pub fn publish(&self, origin: Uuid, event: ChangeEvent) -> Result<usize, ProtocolError> {
        let frame = ServerMessage::event(origin, event).encode()?;
        Ok(self.publish_raw(BusMessage {
            origin,
            frame: Arc::new(frame),
        }))
    }

    /// Fan out a pre-encoded frame (zero-copy fast path).
    pub fn publish_raw(&self, msg: BusMessage) -> usize {
        let count = self.sender.send(msg).unwrap_or(0);
        self.atomic_stats
            .events_published
            .fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Live receivers on this channel.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            events_published: self.atomic_stats.events_published.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Aggregate bus statistics.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub channels: usize,
    pub events_published: u64,
    /// Events published for pods with no live channel
    pub events_unrouted: u64,
}

/// Notification bus: maps pod ids to broadcast channels.
///
/// Channels are created on first attach and torn down when their pod is
/// deleted or the last session detaches, so the map tracks live interest,
/// not the full pod population.
pub struct PodBus {
    channels: Arc<RwLock<HashMap<Uuid, Arc<PodChannel>>>>,
    default_capacity: usize,
    events_unrouted: AtomicU64,
}

impl PodBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
            events_unrouted: AtomicU64::new(0),
        }
    }

    /// Get or create the channel for a pod.
    pub async fn get_or_create(&self, pod_id: Uuid) -> Arc<PodChannel> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(&pod_id) {
                return channel.clone();
            }
        }

        // Slow path: write lock to create
        let mut channels = self.channels.write().await;
        // Double-check after acquiring write lock
        if let Some(channel) = channels.get(&pod_id) {
            return channel.clone();
        }

        let channel = Arc::new(PodChannel::new(self.default_capacity));
        channels.insert(pod_id, channel.clone());
        channel
    }

    pub async fn get(&self, pod_id: Uuid) -> Option<Arc<PodChannel>> {
        self.channels.read().await.get(&pod_id).cloned()
    }

    /// Publish an event to its pod's channel, if one is live.
    ///
    /// Returns the number of receivers reached. No channel or no receivers
    /// means nobody is attached; the event is dropped, never buffered.
    pub async fn publish(&self, origin: Uuid, event: ChangeEvent) -> usize {
        let pod_id = event.pod_id();
        let channel = self.get(pod_id).await;
        match channel {
            Some(channel) => match channel.publish(origin, event) {
                Ok(count) => count,
                Err(e) => {
                    log::error!("Failed to encode event for pod {pod_id}: {e}");
                    0
                }
            },
            None => {
                self.events_unrouted.fetch_add(1, Ordering::Relaxed);
                log::debug!("No live channel for pod {pod_id}, event dropped");
                0
            }
        }
    }

    /// Tear down a pod's channel. Receivers observe `Closed` once they
    /// drain; used by pod deletion.
    pub async fn close(&self, pod_id: Uuid) -> bool {
        let mut channels = self.channels.write().await;
        channels.remove(&pod_id).is_some()
    }

    /// Drop the channel if no session is subscribed.
    pub async fn remove_if_idle(&self, pod_id: Uuid) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(&pod_id) {
            if channel.subscriber_count() == 0 {
                channels.remove(&pod_id);
                return true;
            }
        }
        false
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_pods(&self) -> Vec<Uuid> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> BusStats {
        let channels = self.channels.read().await;
        let mut stats = BusStats {
            channels: channels.len(),
            events_published: 0,
            events_unrouted: self.events_unrouted.load(Ordering::Relaxed),
        };
        for channel in channels.values() {
            stats.events_published += channel.stats().events_published;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Item, MemberProfile, MemberRef};
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn item_event(pod_id: Uuid) -> ChangeEvent {
        let by = MemberProfile::new(Uuid::new_v4(), "ava".to_string(), "ava.png".to_string());
        ChangeEvent::ItemAdded {
            pod_id,
            item: Item::new(
                "sku-1".to_string(),
                "Milk".to_string(),
                2.0,
                MemberRef::from_profile(&by),
            ),
        }
    }

    #[tokio::test]
    async fn test_channel_fan_out() {
        let channel = PodChannel::new(16);
        let mut rx1 = channel.subscribe();
        let mut rx2 = channel.subscribe();
        let mut rx3 = channel.subscribe();

        let pod_id = Uuid::new_v4();
        let origin = Uuid::new_v4();
        let count = channel.publish(origin, item_event(pod_id)).unwrap();
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.origin, origin);
            let decoded = ServerMessage::decode(&msg.frame).unwrap();
            match decoded {
                ServerMessage::Event { origin: o, event } => {
                    assert_eq!(o, origin);
                    assert_eq!(event.pod_id(), pod_id);
                }
                other => panic!("wrong frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let channel = PodChannel::new(16);
        let count = channel.publish(Uuid::nil(), item_event(Uuid::new_v4())).unwrap();
        assert_eq!(count, 0);
        // Late subscriber sees nothing from before it attached
        let mut rx = channel.subscribe();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_frame_shared_not_copied() {
        let channel = PodChannel::new(16);
        let mut rx1 = channel.subscribe();
        let mut rx2 = channel.subscribe();

        channel.publish(Uuid::nil(), item_event(Uuid::new_v4())).unwrap();
        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&a.frame, &b.frame));
    }

    #[tokio::test]
    async fn test_lagging_receiver_drops_not_blocks() {
        let channel = PodChannel::new(2);
        let mut rx = channel.subscribe();

        let pod_id = Uuid::new_v4();
        for _ in 0..5 {
            channel.publish(Uuid::nil(), item_event(pod_id)).unwrap();
        }

        // Oldest events were evicted; receiver learns it lagged, then resumes
        match rx.recv().await {
            Err(RecvError::Lagged(missed)) => assert!(missed >= 1),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_bus_channels_isolated() {
        let bus = PodBus::new(16);
        let pod_a = Uuid::new_v4();
        let pod_b = Uuid::new_v4();

        let mut rx_a = bus.get_or_create(pod_a).await.subscribe();
        let mut rx_b = bus.get_or_create(pod_b).await.subscribe();

        let reached = bus.publish(Uuid::nil(), item_event(pod_a)).await;
        assert_eq!(reached, 1);

        assert!(rx_a.recv().await.is_ok());
        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_bus_get_or_create_idempotent() {
        let bus = PodBus::new(16);
        let pod_id = Uuid::new_v4();

        let first = bus.get_or_create(pod_id).await;
        let second = bus.get_or_create(pod_id).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(bus.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_bus_publish_unrouted() {
        let bus = PodBus::new(16);
        let reached = bus.publish(Uuid::nil(), item_event(Uuid::new_v4())).await;
        assert_eq!(reached, 0);

        let stats = bus.stats().await;
        assert_eq!(stats.events_unrouted, 1);
        assert_eq!(stats.channels, 0);
    }

    #[tokio::test]
    async fn test_close_disconnects_receivers() {
        let bus = PodBus::new(16);
        let pod_id = Uuid::new_v4();
        let mut rx = bus.get_or_create(pod_id).await.subscribe();

        assert!(bus.close(pod_id).await);
        assert!(!bus.close(pod_id).await);
        match rx.recv().await {
            Err(RecvError::Closed) => {}
            other => panic!("expected closed channel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remove_if_idle() {
        let bus = PodBus::new(16);
        let pod_id = Uuid::new_v4();

        let rx = bus.get_or_create(pod_id).await.subscribe();
        assert!(!bus.remove_if_idle(pod_id).await);

        drop(rx);
        assert!(bus.remove_if_idle(pod_id).await);
        assert_eq!(bus.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_bus_stats() {
        let bus = PodBus::new(16);
        let pod_id = Uuid::new_v4();
        let _rx = bus.get_or_create(pod_id).await.subscribe();

        bus.publish(Uuid::nil(), item_event(pod_id)).await;
        bus.publish(Uuid::nil(), item_event(pod_id)).await;

        let stats = bus.stats().await;
        assert_eq!(stats.channels, 1);
        assert_eq!(stats.events_published, 2);
        assert_eq!(stats.events_unrouted, 0);
    }
}
