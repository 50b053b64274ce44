//! Boundary between the scale manager and a BLE central-role stack

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::error::RadioError;
use crate::models::{Advertisement, PeripheralInfo};

/// Power state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unsupported,
}

/// Advertisements observed while a scan runs
pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// Raw characteristic values. The stream ending on its own means the link
/// to the peripheral is gone.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// A Bluetooth LE central.
///
/// Implementations: [`crate::bluetooth::bluez::BluezRadio`] for real
/// hardware, [`crate::bluetooth::simulated::SimulatedRadio`] for development
/// and tests. The manager picks one at construction time.
#[async_trait]
pub trait RadioClient: Send + Sync + 'static {
    async fn state(&self) -> Result<RadioState, RadioError>;

    /// Start discovery for peripherals advertising any of `services`.
    /// Dropping the returned stream ends delivery.
    async fn start_scan(
        &self,
        services: &[Uuid],
        allow_duplicates: bool,
    ) -> Result<AdvertisementStream, RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    /// Connect using the stack's own timeout and read device information
    async fn connect(&self, id: &str) -> Result<PeripheralInfo, RadioError>;

    /// Service UUIDs exposed by a connected peripheral
    async fn services(&self, id: &str) -> Result<Vec<Uuid>, RadioError>;

    async fn subscribe(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, RadioError>;

    async fn disconnect(&self, id: &str) -> Result<(), RadioError>;

    /// Release the underlying stack. Called once from manager teardown.
    async fn shutdown(&self);
}
