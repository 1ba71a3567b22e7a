//! Deduplicating aggregation of peripheral discovery events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_lite::StreamExt;
use indexmap::map::Entry;
use indexmap::IndexMap;
use tracing::debug;

use crate::bus::{Bus, Subscription};
use crate::error::ErrorKind;
use crate::link::{Advertisement, ScanLink};
use crate::{ConnectionState, Device, Result};

/// Policy knobs for a [`Scanner`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanConfig {
    /// Reset the device registry every time a scan session starts.
    ///
    /// Off by default: discoveries accumulate across stop/start cycles and
    /// the caller decides when to [`clear`][Scanner::clear].
    pub clear_on_start: bool,
}

/// Aggregates the sightings reported by a [`ScanLink`] into a deduplicated,
/// address-keyed registry of [`Device`]s.
///
/// Repeat sightings of an address update the existing entry in place,
/// merging in the latest name and manufacturer data; the registry keeps
/// first-discovery order. Each change re-publishes the full device list to
/// every [`device_lists`][Self::device_lists] subscriber.
///
/// Cheap to clone; clones share the same registry.
pub struct Scanner<L: ScanLink> {
    inner: Arc<ScannerInner<L>>,
}

impl<L: ScanLink> Clone for Scanner<L> {
    fn clone(&self) -> Self {
        Scanner {
            inner: self.inner.clone(),
        }
    }
}

struct ScannerInner<L: ScanLink> {
    link: L,
    config: ScanConfig,
    active: AtomicBool,
    registry: Mutex<IndexMap<String, Device>>,
    snapshots: Bus<Vec<Device>>,
}

impl<L: ScanLink> Scanner<L> {
    /// Creates a scanner with the default [`ScanConfig`].
    pub fn new(link: L) -> Self {
        Self::with_config(link, ScanConfig::default())
    }

    /// Creates a scanner with an explicit [`ScanConfig`].
    pub fn with_config(link: L, config: ScanConfig) -> Self {
        Scanner {
            inner: Arc::new(ScannerInner {
                link,
                config,
                active: AtomicBool::new(false),
                registry: Mutex::new(IndexMap::new()),
                snapshots: Bus::new(1),
            }),
        }
    }

    /// Starts a scan session.
    ///
    /// Fails with [`ErrorKind::AlreadyScanning`] if a session is running.
    pub async fn start(&self) -> Result<()> {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return Err(ErrorKind::AlreadyScanning.into());
        }
        if self.inner.config.clear_on_start {
            self.inner.registry.lock().unwrap().clear();
        }
        if let Err(err) = self.inner.link.start_scan().await {
            self.inner.active.store(false, Ordering::SeqCst);
            return Err(err);
        }
        debug!("scan started");
        Ok(())
    }

    /// Stops the scan session. The registry is retained; sightings arriving
    /// after this call are ignored. Returns immediately if not scanning.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("scan stopped");
        self.inner.link.stop_scan().await
    }

    /// Whether a scan session is currently running.
    pub fn is_scanning(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Drives aggregation from the link's advertisement stream.
    ///
    /// Runs until the stream ends. Typically spawned once on a background
    /// task alongside the scanner's whole lifetime; sightings are only
    /// aggregated while a session is running.
    pub async fn run(&self) {
        let mut advertisements = self.inner.link.advertisements();
        while let Some(advertisement) = advertisements.next().await {
            self.handle_advertisement(advertisement);
        }
        debug!("advertisement stream ended");
    }

    /// Folds one sighting into the registry.
    ///
    /// The single ingestion path for discovery events; an alternative to
    /// [`run`][Self::run] for drivers that already own a callback loop.
    /// Ignored unless a scan session is running.
    pub fn handle_advertisement(&self, advertisement: Advertisement) {
        if !self.inner.active.load(Ordering::SeqCst) {
            return;
        }
        let changed = {
            let mut registry = self.inner.registry.lock().unwrap();
            upsert(&mut registry, advertisement)
        };
        if changed {
            self.inner.snapshots.publish(self.devices());
        }
    }

    /// A point-in-time snapshot of every device discovered so far, in
    /// first-discovery order.
    pub fn devices(&self) -> Vec<Device> {
        self.inner.registry.lock().unwrap().values().cloned().collect()
    }

    /// Subscribes to full device-list snapshots, re-published whenever a
    /// sighting changes the registry. A subscriber that falls behind sees
    /// only the most recent list.
    pub fn device_lists(&self) -> Subscription<Vec<Device>> {
        self.inner.snapshots.subscribe()
    }

    /// Empties the registry and publishes the empty list.
    pub fn clear(&self) {
        self.inner.registry.lock().unwrap().clear();
        self.inner.snapshots.publish(Vec::new());
    }
}

fn upsert(registry: &mut IndexMap<String, Device>, advertisement: Advertisement) -> bool {
    match registry.entry(advertisement.address) {
        Entry::Occupied(mut entry) => {
            let device = entry.get_mut();
            let mut changed = false;
            if advertisement.local_name.is_some() && device.name != advertisement.local_name {
                device.name = advertisement.local_name;
                changed = true;
            }
            if advertisement.manufacturer_data.is_some() && device.manufacturer_data != advertisement.manufacturer_data
            {
                device.manufacturer_data = advertisement.manufacturer_data;
                changed = true;
            }
            changed
        }
        Entry::Vacant(entry) => {
            debug!("discovered {}", entry.key());
            let device = Device {
                address: entry.key().clone(),
                name: advertisement.local_name,
                manufacturer_data: advertisement.manufacturer_data,
                connection_state: ConnectionState::Disconnected,
            };
            entry.insert(device);
            true
        }
    }
}
