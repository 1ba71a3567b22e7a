//! Behavioral tests for the GATT client coordinator, driven through a
//! scripted mock link.

use std::sync::Mutex;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use blelink::btuuid::{self, bluetooth_uuid_from_u16};
use blelink::error::ErrorKind;
use blelink::{
    CharacteristicInfo, ConnectionState, Device, GattClient, GattLink, LinkCapabilities, LinkEvent, LinkEvents,
    NotificationEvent, ServiceInfo, Uuid, WriteMode, GATT_SUCCESS,
};
use futures_lite::{future, StreamExt};

const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
const SERVICE: Uuid = bluetooth_uuid_from_u16(0x180f);
const CHARACTERISTIC: Uuid = bluetooth_uuid_from_u16(0x2a19);
const BARE_CHARACTERISTIC: Uuid = bluetooth_uuid_from_u16(0x2a20);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Connect(String),
    Disconnect,
    DiscoverServices,
    Read(Uuid, Uuid),
    Write(Uuid, Uuid, Vec<u8>, WriteMode),
    WriteDescriptor(Uuid, Uuid, Uuid, Vec<u8>),
    SetNotification(Uuid, Uuid, bool),
}

struct MockLink {
    commands: Sender<Command>,
    events: Mutex<Option<Receiver<LinkEvent>>>,
    capabilities: LinkCapabilities,
}

#[async_trait]
impl GattLink for MockLink {
    fn capabilities(&self) -> LinkCapabilities {
        self.capabilities
    }

    fn events(&self) -> LinkEvents {
        match self.events.lock().unwrap().take() {
            Some(receiver) => Box::pin(receiver),
            None => Box::pin(futures_lite::stream::pending::<LinkEvent>()),
        }
    }

    async fn connect(&self, address: &str) -> blelink::Result<()> {
        self.commands.send(Command::Connect(address.to_string())).await.unwrap();
        Ok(())
    }

    async fn disconnect(&self) -> blelink::Result<()> {
        self.commands.send(Command::Disconnect).await.unwrap();
        Ok(())
    }

    async fn discover_services(&self) -> blelink::Result<()> {
        self.commands.send(Command::DiscoverServices).await.unwrap();
        Ok(())
    }

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> blelink::Result<()> {
        self.commands.send(Command::Read(service, characteristic)).await.unwrap();
        Ok(())
    }

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> blelink::Result<()> {
        self.commands
            .send(Command::Write(service, characteristic, value.to_vec(), mode))
            .await
            .unwrap();
        Ok(())
    }

    async fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> blelink::Result<()> {
        self.commands
            .send(Command::WriteDescriptor(service, characteristic, descriptor, value.to_vec()))
            .await
            .unwrap();
        Ok(())
    }

    async fn set_characteristic_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> blelink::Result<()> {
        self.commands
            .send(Command::SetNotification(service, characteristic, enable))
            .await
            .unwrap();
        Ok(())
    }
}

struct Harness {
    client: GattClient<MockLink>,
    commands: Receiver<Command>,
    events: Sender<LinkEvent>,
}

fn harness_with(capabilities: LinkCapabilities) -> Harness {
    let (command_tx, command_rx) = async_channel::unbounded();
    let (event_tx, event_rx) = async_channel::unbounded();
    let link = MockLink {
        commands: command_tx,
        events: Mutex::new(Some(event_rx)),
        capabilities,
    };
    Harness {
        client: GattClient::new(link),
        commands: command_rx,
        events: event_tx,
    }
}

fn harness() -> Harness {
    harness_with(LinkCapabilities::default())
}

fn service_tree() -> Vec<ServiceInfo> {
    vec![ServiceInfo {
        uuid: SERVICE,
        characteristics: vec![
            CharacteristicInfo {
                uuid: CHARACTERISTIC,
                descriptors: vec![btuuid::CLIENT_CHARACTERISTIC_CONFIGURATION],
            },
            CharacteristicInfo {
                uuid: BARE_CHARACTERISTIC,
                descriptors: Vec::new(),
            },
        ],
    }]
}

/// Drives a full connect handshake against the mock link.
async fn connect(harness: &Harness) {
    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.connect(&Device::new(ADDRESS)).await });
    assert_eq!(
        harness.commands.recv().await.unwrap(),
        Command::Connect(ADDRESS.to_string())
    );
    harness.client.handle_event(LinkEvent::ConnectionChanged {
        state: ConnectionState::Connected,
        status: GATT_SUCCESS,
    });
    assert_eq!(harness.commands.recv().await.unwrap(), Command::DiscoverServices);
    harness.client.handle_event(LinkEvent::ServicesDiscovered {
        services: service_tree(),
        status: GATT_SUCCESS,
    });
    task.await.unwrap().unwrap();
}

async fn connected() -> Harness {
    let harness = harness();
    connect(&harness).await;
    harness
}

#[tokio::test]
async fn read_returns_delivered_bytes() {
    let harness = connected().await;
    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.read_characteristic(SERVICE, CHARACTERISTIC).await });
    assert_eq!(
        harness.commands.recv().await.unwrap(),
        Command::Read(SERVICE, CHARACTERISTIC)
    );
    harness.client.handle_event(LinkEvent::CharacteristicRead {
        value: vec![0x01, 0x02, 0x03],
        status: GATT_SUCCESS,
    });
    assert_eq!(task.await.unwrap().unwrap(), vec![0x01, 0x02, 0x03]);
}

#[tokio::test]
async fn read_failure_surfaces_transport_status() {
    let harness = connected().await;
    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.read_characteristic(SERVICE, CHARACTERISTIC).await });
    harness.commands.recv().await.unwrap();
    harness.client.handle_event(LinkEvent::CharacteristicRead {
        value: Vec::new(),
        status: 0x02,
    });
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TransportFailure(_)));
}

#[tokio::test]
async fn second_read_fails_fast_without_disturbing_the_first() {
    let harness = connected().await;
    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.read_characteristic(SERVICE, CHARACTERISTIC).await });
    harness.commands.recv().await.unwrap();

    let err = harness
        .client
        .read_characteristic(SERVICE, CHARACTERISTIC)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationInProgress);

    harness.client.handle_event(LinkEvent::CharacteristicRead {
        value: vec![0x2a],
        status: GATT_SUCCESS,
    });
    assert_eq!(task.await.unwrap().unwrap(), vec![0x2a]);
}

#[tokio::test]
async fn unsolicited_change_reaches_every_subscriber_not_the_read_slot() {
    let harness = connected().await;
    let mut first = harness.client.notifications();
    let mut second = harness.client.notifications();

    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.read_characteristic(SERVICE, CHARACTERISTIC).await });
    harness.commands.recv().await.unwrap();

    harness.client.handle_event(LinkEvent::CharacteristicChanged {
        characteristic: CHARACTERISTIC,
        value: vec![0x07],
    });
    let expected = NotificationEvent {
        characteristic: CHARACTERISTIC,
        value: vec![0x07],
    };
    assert_eq!(first.next().await.unwrap(), expected);
    assert_eq!(second.next().await.unwrap(), expected);

    // The read is still pending and resolves only on its own completion.
    harness.client.handle_event(LinkEvent::CharacteristicRead {
        value: vec![0x64],
        status: GATT_SUCCESS,
    });
    assert_eq!(task.await.unwrap().unwrap(), vec![0x64]);
}

#[tokio::test]
async fn link_loss_rejects_the_pending_write() {
    let harness = connected().await;
    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.write_characteristic(SERVICE, CHARACTERISTIC, &[0x05]).await });
    assert_eq!(
        harness.commands.recv().await.unwrap(),
        Command::Write(SERVICE, CHARACTERISTIC, vec![0x05], WriteMode::Staged)
    );

    harness.client.handle_event(LinkEvent::ConnectionChanged {
        state: ConnectionState::Disconnected,
        status: 0x08,
    });
    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    assert_eq!(harness.client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(harness.client.connected_device(), None);
    assert!(harness.client.services().is_empty());
}

#[tokio::test]
async fn write_uses_the_atomic_encoding_when_the_link_supports_it() {
    let harness = harness_with(LinkCapabilities { atomic_write: true });
    connect(&harness).await;
    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.write_characteristic(SERVICE, CHARACTERISTIC, &[0x01]).await });
    assert_eq!(
        harness.commands.recv().await.unwrap(),
        Command::Write(SERVICE, CHARACTERISTIC, vec![0x01], WriteMode::Atomic)
    );
    harness
        .client
        .handle_event(LinkEvent::CharacteristicWritten { status: GATT_SUCCESS });
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn late_subscriber_never_sees_earlier_events() {
    let harness = connected().await;
    let mut first = harness.client.notifications();

    harness.client.handle_event(LinkEvent::CharacteristicChanged {
        characteristic: CHARACTERISTIC,
        value: vec![0x01],
    });
    assert_eq!(first.next().await.unwrap().value, vec![0x01]);

    let mut second = harness.client.notifications();
    assert!(future::poll_once(second.next()).await.is_none());

    harness.client.handle_event(LinkEvent::CharacteristicChanged {
        characteristic: CHARACTERISTIC,
        value: vec![0x02],
    });
    assert_eq!(first.next().await.unwrap().value, vec![0x02]);
    assert_eq!(second.next().await.unwrap().value, vec![0x02]);
}

#[tokio::test]
async fn slow_subscriber_sees_only_the_latest_event() {
    let harness = connected().await;
    let mut subscriber = harness.client.notifications();
    for value in [vec![0x01], vec![0x02], vec![0x03]] {
        harness.client.handle_event(LinkEvent::CharacteristicChanged {
            characteristic: CHARACTERISTIC,
            value,
        });
    }
    assert_eq!(subscriber.next().await.unwrap().value, vec![0x03]);
    assert!(future::poll_once(subscriber.next()).await.is_none());
}

#[tokio::test]
async fn set_notification_round_trip() {
    let harness = connected().await;
    let mut subscriber = harness.client.notifications();

    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.set_notification(SERVICE, CHARACTERISTIC, true).await });
    assert_eq!(
        harness.commands.recv().await.unwrap(),
        Command::SetNotification(SERVICE, CHARACTERISTIC, true)
    );
    assert_eq!(
        harness.commands.recv().await.unwrap(),
        Command::WriteDescriptor(
            SERVICE,
            CHARACTERISTIC,
            btuuid::CLIENT_CHARACTERISTIC_CONFIGURATION,
            vec![0x01, 0x00]
        )
    );
    harness
        .client
        .handle_event(LinkEvent::DescriptorWritten { status: GATT_SUCCESS });
    task.await.unwrap().unwrap();

    harness.client.handle_event(LinkEvent::CharacteristicChanged {
        characteristic: CHARACTERISTIC,
        value: vec![0x63],
    });
    assert_eq!(subscriber.next().await.unwrap().value, vec![0x63]);

    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.set_notification(SERVICE, CHARACTERISTIC, false).await });
    assert_eq!(
        harness.commands.recv().await.unwrap(),
        Command::SetNotification(SERVICE, CHARACTERISTIC, false)
    );
    assert_eq!(
        harness.commands.recv().await.unwrap(),
        Command::WriteDescriptor(
            SERVICE,
            CHARACTERISTIC,
            btuuid::CLIENT_CHARACTERISTIC_CONFIGURATION,
            vec![0x00, 0x00]
        )
    );
    harness
        .client
        .handle_event(LinkEvent::DescriptorWritten { status: GATT_SUCCESS });
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn set_notification_requires_the_configuration_descriptor() {
    let harness = connected().await;
    let err = harness
        .client
        .set_notification(SERVICE, BARE_CHARACTERISTIC, true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
}

#[tokio::test]
async fn operations_require_a_connection() {
    let harness = harness();
    let err = harness
        .client
        .read_characteristic(SERVICE, CHARACTERISTIC)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = harness
        .client
        .write_characteristic(SERVICE, CHARACTERISTIC, &[0x01])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = harness
        .client
        .set_notification(SERVICE, CHARACTERISTIC, true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test]
async fn undiscovered_attributes_are_not_found() {
    let harness = connected().await;
    let unknown = bluetooth_uuid_from_u16(0xfff0);
    let err = harness
        .client
        .read_characteristic(unknown, CHARACTERISTIC)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = harness.client.read_characteristic(SERVICE, unknown).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn stale_completions_are_ignored() {
    let harness = connected().await;
    harness.client.handle_event(LinkEvent::CharacteristicRead {
        value: vec![0x01],
        status: GATT_SUCCESS,
    });
    harness
        .client
        .handle_event(LinkEvent::CharacteristicWritten { status: GATT_SUCCESS });

    // The slots are still usable afterwards.
    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.read_characteristic(SERVICE, CHARACTERISTIC).await });
    harness.commands.recv().await.unwrap();
    harness.client.handle_event(LinkEvent::CharacteristicRead {
        value: vec![0x09],
        status: GATT_SUCCESS,
    });
    assert_eq!(task.await.unwrap().unwrap(), vec![0x09]);
}

#[tokio::test]
async fn duplicate_disconnects_reclaim_once() {
    let harness = connected().await;
    harness.client.handle_event(LinkEvent::ConnectionChanged {
        state: ConnectionState::Disconnected,
        status: 0x08,
    });
    harness.client.handle_event(LinkEvent::ConnectionChanged {
        state: ConnectionState::Disconnected,
        status: GATT_SUCCESS,
    });
    assert_eq!(harness.client.connection_state(), ConnectionState::Disconnected);

    // The client can connect again after teardown.
    connect(&harness).await;
    assert_eq!(harness.client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn connect_fails_fast_while_a_connection_exists() {
    let harness = connected().await;
    let err = harness.client.connect(&Device::new(ADDRESS)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationInProgress);
}

#[tokio::test]
async fn disconnect_completes_through_the_link_event() {
    let harness = connected().await;
    harness.client.disconnect().await.unwrap();
    assert_eq!(harness.commands.recv().await.unwrap(), Command::Disconnect);
    assert_eq!(harness.client.connection_state(), ConnectionState::Disconnecting);

    harness.client.handle_event(LinkEvent::ConnectionChanged {
        state: ConnectionState::Disconnected,
        status: GATT_SUCCESS,
    });
    assert_eq!(harness.client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(harness.client.connected_device(), None);
}

#[tokio::test]
async fn connection_updates_track_the_device_lifecycle() {
    let harness = harness();
    let mut updates = harness.client.connection_updates();
    connect(&harness).await;

    let device = updates.next().await.unwrap();
    assert_eq!(device.address, ADDRESS);
    assert_eq!(device.connection_state, ConnectionState::Connected);

    harness.client.disconnect().await.unwrap();
    harness.commands.recv().await.unwrap();
    harness.client.handle_event(LinkEvent::ConnectionChanged {
        state: ConnectionState::Disconnected,
        status: GATT_SUCCESS,
    });
    let device = updates.next().await.unwrap();
    assert_eq!(device.connection_state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn run_ingests_the_link_event_stream() {
    let harness = harness();
    let driver = harness.client.clone();
    tokio::spawn(async move { driver.run().await });

    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.connect(&Device::new(ADDRESS)).await });
    harness.commands.recv().await.unwrap();
    harness
        .events
        .send(LinkEvent::ConnectionChanged {
            state: ConnectionState::Connected,
            status: GATT_SUCCESS,
        })
        .await
        .unwrap();
    harness.commands.recv().await.unwrap();
    harness
        .events
        .send(LinkEvent::ServicesDiscovered {
            services: service_tree(),
            status: GATT_SUCCESS,
        })
        .await
        .unwrap();
    task.await.unwrap().unwrap();

    let mut subscriber = harness.client.notifications();
    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.read_characteristic(SERVICE, CHARACTERISTIC).await });
    harness.commands.recv().await.unwrap();
    harness
        .events
        .send(LinkEvent::CharacteristicChanged {
            characteristic: CHARACTERISTIC,
            value: vec![0x11],
        })
        .await
        .unwrap();
    harness
        .events
        .send(LinkEvent::CharacteristicRead {
            value: vec![0x22],
            status: GATT_SUCCESS,
        })
        .await
        .unwrap();

    // Events flow through in arrival order: the unsolicited change reaches
    // subscribers and the completion resolves the read.
    assert_eq!(subscriber.next().await.unwrap().value, vec![0x11]);
    assert_eq!(task.await.unwrap().unwrap(), vec![0x22]);
}

#[tokio::test]
async fn event_stream_end_is_treated_as_link_loss() {
    let harness = harness();
    let driver = harness.client.clone();
    let run = tokio::spawn(async move { driver.run().await });

    let client = harness.client.clone();
    let task = tokio::spawn(async move { client.connect(&Device::new(ADDRESS)).await });
    harness.commands.recv().await.unwrap();

    drop(harness.events);
    run.await.unwrap();
    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    assert_eq!(harness.client.connection_state(), ConnectionState::Disconnected);
}
