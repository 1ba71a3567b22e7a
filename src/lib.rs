#![warn(missing_docs)]

//! Blelink bridges an event/callback-driven BLE GATT transport into a
//! sequential async request/response programming model.
//!
//! BLE stacks complete each GATT operation with a callback and allow at most
//! one outstanding operation of a kind at a time. Blelink models that
//! contract directly: a [`GattClient`] keeps one single-occupancy completion
//! cell per operation kind, so a `read` arms its cell, issues the command
//! over the abstract [`GattLink`] transport, and suspends until the link's
//! completion event resolves it. Unsolicited value-changed events never touch
//! the completion cells; they fan out as [`NotificationEvent`]s to every
//! [`notifications`][GattClient::notifications] subscriber.
//!
//! Device discovery is handled separately by a [`Scanner`], which folds the
//! sighting stream of a [`ScanLink`] into a deduplicated, address-keyed
//! registry of [`Device`]s and re-publishes the full list whenever it
//! changes.
//!
//! The transport itself is out of scope: applications implement [`ScanLink`]
//! and [`GattLink`] over their platform's radio stack and feed the resulting
//! event streams into the coordinator, typically by spawning
//! [`GattClient::run`] and [`Scanner::run`] on background tasks. Blelink
//! itself is runtime-agnostic.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use futures_lite::StreamExt;
//! # async fn example(link: impl blelink::GattLink) -> blelink::Result<()> {
//! use blelink::btuuid::bluetooth_uuid_from_u16;
//!
//! let client = blelink::GattClient::new(link);
//!
//! // Feed the link's callbacks into the coordinator from a background task.
//! let driver = client.clone();
//! tokio::spawn(async move { driver.run().await });
//!
//! let battery = bluetooth_uuid_from_u16(0x180f);
//! let battery_level = bluetooth_uuid_from_u16(0x2a19);
//!
//! client.connect(&blelink::Device::new("00:11:22:33:44:55")).await?;
//! let value = client.read_characteristic(battery, battery_level).await?;
//! println!("battery level: {value:?}");
//!
//! let mut notifications = client.notifications();
//! client.set_notification(battery, battery_level, true).await?;
//! while let Some(event) = notifications.next().await {
//!     println!("{}: {:?}", event.characteristic, event.value);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! Operations of different kinds (a read, a write, a descriptor write) may
//! be outstanding at the same time; they complete through distinct events.
//! Issuing a second operation of the same kind before the first resolves
//! fails fast with [`ErrorKind::OperationInProgress`][error::ErrorKind]:
//! the transport has no queue, so neither does Blelink. Timeouts are the
//! caller's business: the coordinator keeps no timers, and the only thing
//! that abandons a suspended operation is loss of the connection, which
//! fails it with [`ErrorKind::ConnectionLost`][error::ErrorKind].
//!
//! # Feature flags
//!
//! The `serde` feature enables serializing/deserializing the public data
//! model.

pub mod btuuid;
pub mod error;

mod bus;
mod client;
mod link;
mod scanner;
mod slot;

pub use bus::Subscription;
pub use client::GattClient;
pub use error::Error;
pub use link::{
    Advertisement, Advertisements, CharacteristicInfo, GattLink, LinkCapabilities, LinkEvent, LinkEvents, ScanLink,
    ServiceInfo, WriteMode, GATT_SUCCESS,
};
pub use scanner::{ScanConfig, Scanner};
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Connection lifecycle of the link to a peripheral.
///
/// Only [`Connected`][ConnectionState::Connected] permits characteristic and
/// descriptor operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link is established.
    #[default]
    Disconnected,
    /// A connection request was issued and its terminal event is pending.
    Connecting,
    /// The link is established.
    Connected,
    /// A disconnect was requested or the link is going down.
    Disconnecting,
}

/// A BLE peripheral, discovered by scanning or addressed directly.
///
/// The `address` is the device's identity: equality, hashing and scan
/// deduplication all use the address alone, while `name` and
/// `manufacturer_data` are mutable attributes of the same logical device.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Device {
    /// Stable address identifying the device.
    pub address: String,
    /// The advertised local name, if one has been seen.
    pub name: Option<String>,
    /// Opaque manufacturer specific data from the latest sighting.
    pub manufacturer_data: Option<Vec<u8>>,
    /// The device's current connection lifecycle state.
    pub connection_state: ConnectionState,
}

impl Device {
    /// Creates a disconnected device with only an address.
    pub fn new(address: impl Into<String>) -> Self {
        Device {
            address: address.into(),
            name: None,
            manufacturer_data: None,
            connection_state: ConnectionState::Disconnected,
        }
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Device {}

impl std::hash::Hash for Device {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// A point-in-time snapshot of a characteristic value, delivered as an
/// unsolicited notification. Never mutated after publish.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NotificationEvent {
    /// The characteristic whose value changed.
    pub characteristic: Uuid,
    /// The value carried by the notification.
    pub value: Vec<u8>,
}
