//! The GATT client coordinator.

use std::sync::{Arc, Mutex};

use futures_lite::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{Bus, Subscription};
use crate::error::ErrorKind;
use crate::link::{CharacteristicInfo, GattLink, LinkEvent, ServiceInfo, WriteMode, GATT_SUCCESS};
use crate::slot::Slot;
use crate::{btuuid, ConnectionState, Device, Error, NotificationEvent, Result};

/// Coordinates sequential request/response GATT operations over a
/// callback-driven [`GattLink`].
///
/// The transport completes each accepted command with exactly one event, so
/// the client keeps one single-occupancy completion cell per operation kind:
/// an operation arms its cell, issues the command, and suspends until the
/// matching completion event resolves it. A second operation of the same kind
/// fails fast with [`ErrorKind::OperationInProgress`] while the first is
/// outstanding; operations of different kinds may overlap freely.
///
/// Unsolicited value changes are fanned out to every
/// [`notifications`][Self::notifications] subscriber and never interact with
/// the completion cells.
///
/// All events from the link flow through [`handle_event`][Self::handle_event]
/// in arrival order, normally by spawning [`run`][Self::run] on a background
/// task. Losing the connection rejects every suspended operation with
/// [`ErrorKind::ConnectionLost`] and clears the per-connection service cache.
///
/// The client is cheap to clone; clones share the same connection.
pub struct GattClient<L: GattLink> {
    inner: Arc<ClientInner<L>>,
}

impl<L: GattLink> Clone for GattClient<L> {
    fn clone(&self) -> Self {
        GattClient {
            inner: self.inner.clone(),
        }
    }
}

struct ClientInner<L: GattLink> {
    link: L,
    session: Mutex<SessionState>,
    slots: Slots,
    notifications: Bus<NotificationEvent>,
    updates: Bus<Device>,
}

#[derive(Default)]
struct SessionState {
    connection: ConnectionState,
    device: Option<Device>,
    services: Vec<ServiceInfo>,
}

struct Slots {
    connect: Slot<()>,
    discovery: Slot<()>,
    read: Slot<Vec<u8>>,
    write: Slot<()>,
    descriptor: Slot<()>,
}

impl Slots {
    fn new() -> Self {
        Slots {
            connect: Slot::new(),
            discovery: Slot::new(),
            read: Slot::new(),
            write: Slot::new(),
            descriptor: Slot::new(),
        }
    }

    fn reject_all(&self) {
        self.connect.reject(ErrorKind::ConnectionLost.into());
        self.discovery.reject(ErrorKind::ConnectionLost.into());
        self.read.reject(ErrorKind::ConnectionLost.into());
        self.write.reject(ErrorKind::ConnectionLost.into());
        self.descriptor.reject(ErrorKind::ConnectionLost.into());
    }
}

impl<L: GattLink> GattClient<L> {
    /// Creates a client for `link`. The link starts disconnected.
    pub fn new(link: L) -> Self {
        GattClient {
            inner: Arc::new(ClientInner {
                link,
                session: Mutex::new(SessionState::default()),
                slots: Slots::new(),
                notifications: Bus::new(1),
                updates: Bus::new(1),
            }),
        }
    }

    /// Drives callback ingestion from the link's event stream.
    ///
    /// Runs until the stream ends, which is treated as loss of the link.
    /// Typically spawned once on a background task; suspended operations make
    /// no progress unless something is feeding events in.
    pub async fn run(&self) {
        let mut events = self.inner.link.events();
        while let Some(event) = events.next().await {
            self.handle_event(event);
        }
        debug!("link event stream ended");
        self.inner.enter_disconnected(GATT_SUCCESS);
    }

    /// Routes one link event to the matching completion cell or to the
    /// notification subscribers.
    ///
    /// This is the single ingestion path for the whole client; calling it
    /// directly is an alternative to [`run`][Self::run] for drivers that
    /// already own a callback loop. Events must be delivered one at a time,
    /// in arrival order.
    pub fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::ConnectionChanged { state, status } => self.inner.on_connection_changed(state, status),
            LinkEvent::ServicesDiscovered { services, status } => self.inner.on_services_discovered(services, status),
            LinkEvent::CharacteristicRead { value, status } => {
                let delivered = if status == GATT_SUCCESS {
                    self.inner.slots.read.resolve(value)
                } else {
                    self.inner.slots.read.reject(Error::transport(status))
                };
                if !delivered {
                    debug!("read completion with no pending read");
                }
            }
            LinkEvent::CharacteristicWritten { status } => {
                let delivered = if status == GATT_SUCCESS {
                    self.inner.slots.write.resolve(())
                } else {
                    self.inner.slots.write.reject(Error::transport(status))
                };
                if !delivered {
                    debug!("write completion with no pending write");
                }
            }
            LinkEvent::DescriptorWritten { status } => {
                let delivered = if status == GATT_SUCCESS {
                    self.inner.slots.descriptor.resolve(())
                } else {
                    self.inner.slots.descriptor.reject(Error::transport(status))
                };
                if !delivered {
                    debug!("descriptor write completion with no pending write");
                }
            }
            LinkEvent::CharacteristicChanged { characteristic, value } => {
                debug!("value changed for characteristic {characteristic}");
                self.inner
                    .notifications
                    .publish(NotificationEvent { characteristic, value });
            }
        }
    }

    /// Connects to `device` and discovers its services.
    ///
    /// Suspends until the link reports the connection established and service
    /// discovery has completed, so characteristic operations are valid as
    /// soon as this returns. Fails with [`ErrorKind::OperationInProgress`] if
    /// the client is not currently disconnected.
    pub async fn connect(&self, device: &Device) -> Result<()> {
        {
            let mut session = self.inner.session.lock().unwrap();
            if session.connection != ConnectionState::Disconnected {
                return Err(Error::new(
                    ErrorKind::OperationInProgress,
                    None,
                    "a connection is already established or in progress".to_string(),
                ));
            }
            session.connection = ConnectionState::Connecting;
            let mut target = device.clone();
            target.connection_state = ConnectionState::Connecting;
            session.device = Some(target);
        }
        self.inner.publish_device();

        let pending = match self.inner.slots.connect.arm() {
            Ok(pending) => pending,
            Err(err) => {
                self.inner.enter_disconnected(GATT_SUCCESS);
                return Err(err);
            }
        };
        if let Err(err) = self.inner.link.connect(&device.address).await {
            self.inner.enter_disconnected(GATT_SUCCESS);
            return Err(err);
        }
        pending.wait().await?;
        debug!("connected to {}, discovering services", device.address);

        let discovery = self.inner.slots.discovery.arm()?;
        self.inner.link.discover_services().await?;
        discovery.wait().await
    }

    /// Requests disconnection from the connected device.
    ///
    /// Issue-only: the state machine completes when the link delivers its
    /// terminal disconnect event, at which point every still-suspended
    /// operation fails with [`ErrorKind::ConnectionLost`]. Returns
    /// immediately if already disconnected or disconnecting.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut session = self.inner.session.lock().unwrap();
            match session.connection {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Connected => {
                    session.connection = ConnectionState::Disconnecting;
                    if let Some(device) = session.device.as_mut() {
                        device.connection_state = ConnectionState::Disconnecting;
                    }
                }
            }
        }
        self.inner.publish_device();
        self.inner.link.disconnect().await
    }

    /// Reads the value of `characteristic` within `service`.
    ///
    /// Fails with [`ErrorKind::NotConnected`] unless connected, with
    /// [`ErrorKind::NotFound`] if the attribute was not discovered, and with
    /// [`ErrorKind::TransportFailure`] if the link completes the read with a
    /// non-success status.
    pub async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        self.inner.ensure_connected()?;
        self.inner.find_characteristic(service, characteristic)?;
        let pending = self.inner.slots.read.arm()?;
        self.inner.link.read_characteristic(service, characteristic).await?;
        pending.wait().await
    }

    /// Writes `value` to `characteristic` within `service`.
    ///
    /// Uses [`WriteMode::Atomic`] when the link supports it and
    /// [`WriteMode::Staged`] otherwise; both complete through the same write
    /// event. Errors as [`read_characteristic`][Self::read_characteristic].
    pub async fn write_characteristic(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<()> {
        self.inner.ensure_connected()?;
        self.inner.find_characteristic(service, characteristic)?;
        let mode = if self.inner.link.capabilities().atomic_write {
            WriteMode::Atomic
        } else {
            WriteMode::Staged
        };
        let pending = self.inner.slots.write.arm()?;
        self.inner
            .link
            .write_characteristic(service, characteristic, value, mode)
            .await?;
        pending.wait().await
    }

    /// Enables or disables notification delivery for `characteristic`.
    ///
    /// Two phases: local interest is registered with the link, then the
    /// enable/disable value is written to the characteristic's Client
    /// Characteristic Configuration descriptor and awaited. Fails with
    /// [`ErrorKind::InvalidDescriptor`] if the characteristic has no such
    /// descriptor.
    ///
    /// If the descriptor write fails after interest was registered, interest
    /// stays registered; callers that care must retry or explicitly
    /// deregister with another call.
    pub async fn set_notification(&self, service: Uuid, characteristic: Uuid, enable: bool) -> Result<()> {
        self.inner.ensure_connected()?;
        let info = self.inner.find_characteristic(service, characteristic)?;
        let descriptor = info
            .descriptors
            .iter()
            .copied()
            .find(|&uuid| uuid == btuuid::CLIENT_CHARACTERISTIC_CONFIGURATION)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidDescriptor,
                    None,
                    format!("characteristic {characteristic} has no configuration descriptor"),
                )
            })?;
        let value = if enable {
            btuuid::ENABLE_NOTIFICATION_VALUE
        } else {
            btuuid::DISABLE_NOTIFICATION_VALUE
        };
        let pending = self.inner.slots.descriptor.arm()?;
        self.inner
            .link
            .set_characteristic_notification(service, characteristic, enable)
            .await?;
        self.inner
            .link
            .write_descriptor(service, characteristic, descriptor, &value)
            .await?;
        pending.wait().await
    }

    /// Subscribes to unsolicited characteristic value changes.
    ///
    /// Every subscriber gets its own infinite stream of
    /// [`NotificationEvent`]s. Events published before subscribing are never
    /// replayed, and a subscriber that falls behind sees only the most recent
    /// unconsumed event; notifications are state snapshots, so staleness
    /// beats backlog.
    pub fn notifications(&self) -> Subscription<NotificationEvent> {
        self.inner.notifications.subscribe()
    }

    /// Subscribes to connected-device snapshots, published on every
    /// connection state transition.
    pub fn connection_updates(&self) -> Subscription<Device> {
        self.inner.updates.subscribe()
    }

    /// The current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.session.lock().unwrap().connection
    }

    /// The device this client is connecting or connected to, if any.
    pub fn connected_device(&self) -> Option<Device> {
        self.inner.session.lock().unwrap().device.clone()
    }

    /// The service tree cached by the most recent discovery, empty when
    /// disconnected.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.inner.session.lock().unwrap().services.clone()
    }
}

impl<L: GattLink> ClientInner<L> {
    fn ensure_connected(&self) -> Result<()> {
        if self.session.lock().unwrap().connection == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ErrorKind::NotConnected.into())
        }
    }

    fn find_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<CharacteristicInfo> {
        let session = self.session.lock().unwrap();
        let service_info = session.services.iter().find(|s| s.uuid == service).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                None,
                format!("service {service} is not present on the connected device"),
            )
        })?;
        service_info
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    None,
                    format!("characteristic {characteristic} is not present in service {service}"),
                )
            })
    }

    fn publish_device(&self) {
        let device = self.session.lock().unwrap().device.clone();
        if let Some(device) = device {
            self.updates.publish(device);
        }
    }

    fn on_connection_changed(&self, state: ConnectionState, status: u8) {
        match state {
            ConnectionState::Disconnected => self.enter_disconnected(status),
            ConnectionState::Connected => {
                {
                    let mut session = self.session.lock().unwrap();
                    session.connection = ConnectionState::Connected;
                    if let Some(device) = session.device.as_mut() {
                        device.connection_state = ConnectionState::Connected;
                    }
                }
                if !self.slots.connect.resolve(()) {
                    debug!("connected event with no pending connect");
                }
                self.publish_device();
            }
            transitional => {
                {
                    let mut session = self.session.lock().unwrap();
                    session.connection = transitional;
                    if let Some(device) = session.device.as_mut() {
                        device.connection_state = transitional;
                    }
                }
                self.publish_device();
            }
        }
    }

    fn on_services_discovered(&self, services: Vec<ServiceInfo>, status: u8) {
        if status == GATT_SUCCESS {
            debug!("discovered {} services", services.len());
            self.session.lock().unwrap().services = services;
            if !self.slots.discovery.resolve(()) {
                debug!("service discovery completion with no pending discovery");
            }
        } else if !self.slots.discovery.reject(Error::transport(status)) {
            debug!("service discovery failure with no pending discovery");
        }
    }

    /// The one reclamation path for loss of connection. Idempotent: a
    /// duplicate disconnect event finds the session already torn down and
    /// does nothing.
    fn enter_disconnected(&self, status: u8) {
        let device = {
            let mut session = self.session.lock().unwrap();
            if session.connection == ConnectionState::Disconnected {
                return;
            }
            session.connection = ConnectionState::Disconnected;
            session.services.clear();
            session.device.take()
        };
        if status == GATT_SUCCESS {
            debug!("link disconnected");
        } else {
            warn!("link lost with status {status}");
        }
        self.slots.reject_all();
        if let Some(mut device) = device {
            device.connection_state = ConnectionState::Disconnected;
            self.updates.publish(device);
        }
    }
}
