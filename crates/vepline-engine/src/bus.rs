use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use vepline_core::Lane;

use crate::error::BusError;

pub type LaneReceiver = mpsc::Receiver<Bytes>;

/// Durable-bus seam. Messages are encoded envelopes; the bus never looks
/// inside them.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Waits for room when the lane is full.
    async fn publish(&self, lane: Lane, message: Bytes) -> Result<(), BusError>;

    /// Each lane has exactly one consumer.
    fn subscribe(&self, lane: Lane) -> Result<LaneReceiver, BusError>;

    /// Messages published but not yet consumed.
    fn depth(&self, lane: Lane) -> usize;
}

struct LaneSlot {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<Option<LaneReceiver>>,
}

/// Process-local bus: one bounded channel per lane.
pub struct InMemoryBus {
    lanes: HashMap<Lane, LaneSlot>,
}

impl InMemoryBus {
    /// A bus serving every lane.
    pub fn new(capacity: usize) -> Self {
        Self::with_lanes(&Lane::ALL, capacity)
    }

    pub fn with_lanes(lanes: &[Lane], capacity: usize) -> Self {
        let lanes = lanes
            .iter()
            .map(|&lane| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (
                    lane,
                    LaneSlot {
                        tx,
                        rx: Mutex::new(Some(rx)),
                    },
                )
            })
            .collect();
        Self { lanes }
    }

    fn slot(&self, lane: Lane) -> Result<&LaneSlot, BusError> {
        self.lanes.get(&lane).ok_or(BusError::UnknownLane(lane))
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, lane: Lane, message: Bytes) -> Result<(), BusError> {
        let slot = self.slot(lane)?;
        trace!(lane = %lane, bytes = message.len(), "publishing");
        slot.tx.send(message).await.map_err(|_| BusError::Closed(lane))
    }

    fn subscribe(&self, lane: Lane) -> Result<LaneReceiver, BusError> {
        self.slot(lane)?
            .rx
            .lock()
            .take()
            .ok_or(BusError::AlreadySubscribed(lane))
    }

    fn depth(&self, lane: Lane) -> usize {
        self.lanes
            .get(&lane)
            .map(|slot| slot.tx.max_capacity() - slot.tx.capacity())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_receive_in_order() {
        let bus = InMemoryBus::new(8);
        let mut rx = bus.subscribe(Lane::Standard).unwrap();

        bus.publish(Lane::Standard, Bytes::from_static(b"one")).await.unwrap();
        bus.publish(Lane::Standard, Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(bus.depth(Lane::Standard), 2);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(bus.depth(Lane::Standard), 0);
    }

    #[tokio::test]
    async fn lanes_are_independent() {
        let bus = InMemoryBus::new(8);
        bus.publish(Lane::ClusterScale, Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(bus.depth(Lane::ClusterScale), 1);
        assert_eq!(bus.depth(Lane::Standard), 0);
        assert_eq!(bus.depth(Lane::Annotated), 0);
    }

    #[test]
    fn second_subscriber_is_rejected() {
        let bus = InMemoryBus::new(8);
        let _rx = bus.subscribe(Lane::Annotated).unwrap();
        assert!(matches!(
            bus.subscribe(Lane::Annotated),
            Err(BusError::AlreadySubscribed(Lane::Annotated))
        ));
    }

    #[tokio::test]
    async fn unknown_and_closed_lanes() {
        let bus = InMemoryBus::with_lanes(&[Lane::Standard], 4);
        assert!(matches!(
            bus.publish(Lane::LagProbe, Bytes::new()).await,
            Err(BusError::UnknownLane(Lane::LagProbe))
        ));

        drop(bus.subscribe(Lane::Standard).unwrap());
        assert!(matches!(
            bus.publish(Lane::Standard, Bytes::new()).await,
            Err(BusError::Closed(Lane::Standard))
        ));
    }
}
