//! Consumer-facing events and their fan-out

use log::debug;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::error::ScaleError;
use crate::models::{ScaleDevice, ScaleReading};

/// Everything the manager reports to its consumers, in emission order
#[derive(Debug, Clone)]
pub enum ScaleEvent {
    ScanStart,
    ScanEnd,
    DeviceFound(ScaleDevice),
    Connecting(ScaleDevice),
    Connected(ScaleDevice),
    Disconnected(ScaleDevice),
    WeightData(ScaleReading),
    BodyCompositionData(ScaleReading),
    Error(Arc<ScaleError>),
}

impl ScaleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ScaleEvent::ScanStart => "scanStart",
            ScaleEvent::ScanEnd => "scanEnd",
            ScaleEvent::DeviceFound(_) => "deviceFound",
            ScaleEvent::Connecting(_) => "connecting",
            ScaleEvent::Connected(_) => "connected",
            ScaleEvent::Disconnected(_) => "disconnected",
            ScaleEvent::WeightData(_) => "weightData",
            ScaleEvent::BodyCompositionData(_) => "bodyCompositionData",
            ScaleEvent::Error(_) => "error",
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<ScaleEvent>;

/// Delivers every event to every live subscriber, in order.
///
/// Subscribers whose receiver has been dropped are pruned on the next emit.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ScaleEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn emit(&self, event: ScaleEvent) {
        debug!("Emitting {}", event.name());
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn error(&self, error: ScaleError) {
        self.emit(ScaleEvent::Error(Arc::new(error)));
    }

    /// Drop every sender so that all receivers observe end-of-stream
    pub fn close(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fans_out_in_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(ScaleEvent::ScanStart);
        bus.emit(ScaleEvent::ScanEnd);

        for rx in [&mut first, &mut second] {
            assert!(matches!(rx.try_recv(), Ok(ScaleEvent::ScanStart)));
            assert!(matches!(rx.try_recv(), Ok(ScaleEvent::ScanEnd)));
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        drop(rx);
        bus.emit(ScaleEvent::ScanStart);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn close_ends_streams() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.error(ScaleError::Disposed);
        bus.close();
        assert_eq!(rx.try_recv().unwrap().name(), "error");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
