//! The abstract transport boundary.
//!
//! Applications implement [`ScanLink`] and [`GattLink`] over whatever radio
//! stack they sit on. Each trait pairs a set of command-issue methods with a
//! stream of events: issuing a command returns as soon as the transport has
//! accepted it, and the outcome arrives later as exactly one terminal event
//! on the stream. Unsolicited [`LinkEvent::CharacteristicChanged`] events may
//! appear on the same stream at any time while notifications are enabled.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use uuid::Uuid;

use crate::{ConnectionState, Result};

/// The completion status reported by a transport for a successful operation.
///
/// Any other value is classified through [`AttError`][crate::error::AttError].
pub const GATT_SUCCESS: u8 = 0x00;

/// Boxed stream of [`LinkEvent`] produced by [`GattLink::events`].
pub type LinkEvents = Pin<Box<dyn Stream<Item = LinkEvent> + Send>>;

/// Boxed stream of [`Advertisement`] produced by [`ScanLink::advertisements`].
pub type Advertisements = Pin<Box<dyn Stream<Item = Advertisement> + Send>>;

/// A single peripheral sighting reported by the scanning radio.
///
/// The same peripheral may be sighted any number of times; deduplication is
/// performed by the [`Scanner`][crate::Scanner], keyed on `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Stable address of the advertising peripheral.
    pub address: String,
    /// Advertised local name, if present in this packet.
    pub local_name: Option<String>,
    /// Opaque manufacturer specific data, if present in this packet.
    pub manufacturer_data: Option<Vec<u8>>,
}

/// A GATT service discovered on the connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// The [`Uuid`] identifying the type of this service.
    pub uuid: Uuid,
    /// The characteristics contained in this service.
    pub characteristics: Vec<CharacteristicInfo>,
}

/// A GATT characteristic discovered within a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// The [`Uuid`] identifying the type of this characteristic.
    pub uuid: Uuid,
    /// The descriptors attached to this characteristic.
    pub descriptors: Vec<Uuid>,
}

/// Write paths supported by a [`GattLink`].
///
/// Some transports accept the value and write type in a single call; older
/// ones require staging the value on the characteristic before issuing the
/// write. Both produce the same [`LinkEvent::CharacteristicWritten`]
/// completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LinkCapabilities {
    /// The transport supports [`WriteMode::Atomic`].
    pub atomic_write: bool,
}

/// The encoding used for a characteristic write. See [`LinkCapabilities`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// Value and write type are submitted in one call.
    Atomic,
    /// The value is staged on the characteristic, then written.
    Staged,
}

/// Events emitted by a [`GattLink`].
///
/// The transport delivers events one at a time, in order. Completion events
/// do not name the attribute they complete: at most one operation of each
/// kind is outstanding, so the pairing is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The connection state changed, either as the terminal event of a
    /// `connect`/`disconnect` request or spontaneously on link loss.
    ConnectionChanged {
        /// The state the link moved into.
        state: ConnectionState,
        /// Transport status; nonzero indicates an abnormal transition.
        status: u8,
    },
    /// Terminal event of a `discover_services` request.
    ServicesDiscovered {
        /// The full service tree of the peripheral. Empty on failure.
        services: Vec<ServiceInfo>,
        /// Transport status for the discovery procedure.
        status: u8,
    },
    /// Terminal event of a `read_characteristic` request.
    CharacteristicRead {
        /// The delivered value. Empty on failure.
        value: Vec<u8>,
        /// Transport status for the read.
        status: u8,
    },
    /// Terminal event of a `write_characteristic` request.
    CharacteristicWritten {
        /// Transport status for the write.
        status: u8,
    },
    /// Terminal event of a `write_descriptor` request.
    DescriptorWritten {
        /// Transport status for the write.
        status: u8,
    },
    /// Unsolicited value change for a characteristic with notifications
    /// enabled. Not a completion; may arrive at any time.
    CharacteristicChanged {
        /// The characteristic whose value changed.
        characteristic: Uuid,
        /// The new value.
        value: Vec<u8>,
    },
}

/// A radio capable of scanning for advertising peripherals.
#[async_trait]
pub trait ScanLink: Send + Sync + 'static {
    /// Starts the radio scan. Sightings are delivered on [`advertisements`][Self::advertisements].
    async fn start_scan(&self) -> Result<()>;

    /// Stops the radio scan.
    async fn stop_scan(&self) -> Result<()>;

    /// The stream of peripheral sightings.
    ///
    /// Expected to be called once and driven for the lifetime of the link.
    fn advertisements(&self) -> Advertisements;
}

/// A transport handle for one peripheral connection and its GATT operations.
///
/// Every command method issues the request and returns once the transport has
/// accepted it; an `Err` means the command was never started and no event
/// will follow. The transport must emit exactly one terminal [`LinkEvent`]
/// per accepted command.
#[async_trait]
pub trait GattLink: Send + Sync + 'static {
    /// The write paths this transport supports.
    fn capabilities(&self) -> LinkCapabilities {
        LinkCapabilities::default()
    }

    /// The stream of link events.
    ///
    /// Expected to be called once and driven for the lifetime of the link,
    /// typically via [`GattClient::run`][crate::GattClient::run].
    fn events(&self) -> LinkEvents;

    /// Requests a connection to the peripheral at `address`.
    async fn connect(&self, address: &str) -> Result<()>;

    /// Requests disconnection and release of the connection handle.
    async fn disconnect(&self) -> Result<()>;

    /// Requests discovery of the peripheral's service tree.
    async fn discover_services(&self) -> Result<()>;

    /// Requests the value of a characteristic.
    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Requests a characteristic write using the given encoding.
    async fn write_characteristic(&self, service: Uuid, characteristic: Uuid, value: &[u8], mode: WriteMode)
        -> Result<()>;

    /// Requests a descriptor write.
    async fn write_descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid, value: &[u8])
        -> Result<()>;

    /// Registers or deregisters local interest in value changes for a
    /// characteristic. Takes effect immediately; no event follows.
    ///
    /// Remote delivery is controlled separately through the characteristic's
    /// configuration descriptor.
    async fn set_characteristic_notification(&self, service: Uuid, characteristic: Uuid, enable: bool) -> Result<()>;
}
