//! Shared Bambu MQTT connection pool.
//!
//! The printer firmware accepts a single MQTT client, so the pool is the only owner of device
//! connections. Everything else (status queries, print start) borrows a link through
//! [`BambuMqttPool::client`].

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use printfleet_shared::{Printer, PrinterRoster, PrinterType};

use super::commands::{pushall, report_topic, request_topic};
use super::connection::{DeviceConnector, DeviceEvent, DeviceLink, DeviceTarget};
use super::{BambuError, Result};
use crate::dispatch::validation;

pub type ListenerId = u64;
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every parsed report from every pooled printer.
pub trait ReportListener: Send + Sync {
    fn on_report(&self, serial: &str, printer_name: &str, report: &Value) -> std::result::Result<(), ListenerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Absent,
    Connecting,
    Connected,
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ReportListener>)>>,
}

impl ListenerRegistry {
    fn add(&self, listener: Arc<dyn ReportListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn clear(&self) {
        self.listeners.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn deliver(&self, serial: &str, name: &str, report: &Value) {
        let snapshot: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener.on_report(serial, name, report))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Report listener {} failed for {}: {}", id, serial, e),
                Err(_) => error!("Report listener {} panicked for {}", id, serial),
            }
        }
    }
}

struct PoolEntry {
    name: String,
    ip: String,
    credential: String,
    link: Arc<dyn DeviceLink>,
    connected: Arc<AtomicBool>,
    acks: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl PoolEntry {
    async fn close(self, serial: &str) {
        if let Err(e) = self.link.disconnect().await {
            warn!("Disconnecting {} failed: {}", serial, e);
        }
        self.task.abort();
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub connected: usize,
    pub disconnected: usize,
    pub pooled: usize,
}

pub struct BambuMqttPool {
    roster: Arc<dyn PrinterRoster>,
    connector: Arc<dyn DeviceConnector>,
    mqtt_port: u16,
    sync_interval: Duration,
    entries: Mutex<HashMap<String, PoolEntry>>,
    listeners: Arc<ListenerRegistry>,
    sync_lock: tokio::sync::Mutex<()>,
    interval_task: Mutex<Option<JoinHandle<()>>>,
}

impl BambuMqttPool {
    pub fn new(
        roster: Arc<dyn PrinterRoster>,
        connector: Arc<dyn DeviceConnector>,
        mqtt_port: u16,
        sync_interval: Duration,
    ) -> Self {
        Self {
            roster,
            connector,
            mqtt_port,
            sync_interval,
            entries: Mutex::new(HashMap::new()),
            listeners: Arc::new(ListenerRegistry::default()),
            sync_lock: tokio::sync::Mutex::new(()),
            interval_task: Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ReportListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Live link for `serial`, only once the session is established and subscribed.
    pub fn client(&self, serial: &str) -> Option<Arc<dyn DeviceLink>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(serial)
            .filter(|entry| entry.connected.load(Ordering::Acquire))
            .map(|entry| entry.link.clone())
    }

    pub fn connection_state(&self, serial: &str) -> ConnectionState {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(serial) {
            None => ConnectionState::Absent,
            Some(entry) if entry.connected.load(Ordering::Acquire) => ConnectionState::Connected,
            Some(_) => ConnectionState::Connecting,
        }
    }

    pub fn pooled_serials(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut serials: Vec<_> = entries.keys().cloned().collect();
        serials.sort();
        serials
    }

    /// Ask a connected printer for a full status dump.
    pub async fn request_pushall(&self, serial: &str) -> Result<()> {
        let link = self
            .client(serial)
            .ok_or_else(|| BambuError::ConnectionFailed(format!("{} is not connected", serial)))?;
        link.publish(&request_topic(serial), pushall().to_string().into_bytes()).await
    }

    /// Publish on the pooled link of `serial` and wait for the broker's next acknowledgement.
    pub async fn publish_acked(&self, serial: &str, topic: &str, payload: Vec<u8>, timeout: Duration) -> Result<()> {
        let (link, mut acks) = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let entry = entries
                .get(serial)
                .filter(|entry| entry.connected.load(Ordering::Acquire))
                .ok_or_else(|| BambuError::ConnectionFailed(format!("{} is not connected", serial)))?;
            (entry.link.clone(), entry.acks.subscribe())
        };
        let acked = async move {
            link.publish(topic, payload).await?;
            match acks.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Ok(()),
                Err(broadcast::error::RecvError::Closed) => {
                    Err(BambuError::ConnectionFailed(format!("{} disconnected before acknowledging", serial)))
                }
            }
        };
        tokio::time::timeout(timeout, acked)
            .await
            .map_err(|_| BambuError::Timeout(format!("{} did not acknowledge within {:?}", serial, timeout)))
            .and_then(|acked| acked)
    }

    /// Reconcile pooled connections with the Bambu roster.
    ///
    /// Passes are serialized, so concurrent callers never create two entries for one serial.
    pub async fn sync(&self) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        let printers = self
            .roster
            .list_by_type(PrinterType::Bambu)
            .await
            .map_err(|e| BambuError::Roster(e.to_string()))?;

        let mut wanted: HashMap<String, Printer> = HashMap::new();
        for printer in printers {
            let Some(serial) = printer.serial().map(str::to_string) else {
                debug!("Skipping Bambu printer {} without serial number", printer.name);
                continue;
            };
            if let Err(e) = validation::validate_serial(&serial).and_then(|_| validation::validate_ip(&printer.ip_address)) {
                warn!("Skipping Bambu printer {}: {}", printer.name, e);
                continue;
            }
            wanted.insert(serial, printer);
        }

        let stale: Vec<(String, PoolEntry)> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let drop_keys: Vec<String> = entries
                .iter()
                .filter(|(serial, entry)| match wanted.get(*serial) {
                    None => true,
                    Some(p) => p.ip_address != entry.ip || p.credential() != entry.credential,
                })
                .map(|(serial, _)| serial.clone())
                .collect();
            drop_keys
                .into_iter()
                .filter_map(|serial| entries.remove(&serial).map(|entry| (serial, entry)))
                .collect()
        };

        let mut report = SyncReport {
            disconnected: stale.len(),
            ..SyncReport::default()
        };
        for (serial, entry) in stale {
            info!("Disconnecting Bambu printer {} ({})", entry.name, serial);
            entry.close(&serial).await;
        }

        for (serial, printer) in wanted {
            let present = self
                .entries
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&serial);
            if present {
                continue;
            }
            match self.open(&serial, &printer) {
                Ok(entry) => {
                    info!("Connecting Bambu printer {} ({}) at {}", printer.name, serial, printer.ip_address);
                    self.entries
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(serial, entry);
                    report.connected += 1;
                }
                Err(e) => warn!("Could not connect Bambu printer {} ({}): {}", printer.name, serial, e),
            }
        }

        report.pooled = self.entries.lock().unwrap_or_else(|e| e.into_inner()).len();
        Ok(report)
    }

    fn open(&self, serial: &str, printer: &Printer) -> Result<PoolEntry> {
        let target = DeviceTarget {
            serial: serial.to_string(),
            host: printer.ip_address.clone(),
            port: self.mqtt_port,
            access_code: printer.credential().to_string(),
        };
        let session = self.connector.connect(&target)?;
        let connected = Arc::new(AtomicBool::new(false));
        let (acks, _) = broadcast::channel(16);
        let task = tokio::spawn(drive_session(
            serial.to_string(),
            printer.name.clone(),
            session.link.clone(),
            session.events,
            connected.clone(),
            acks.clone(),
            self.listeners.clone(),
        ));
        Ok(PoolEntry {
            name: printer.name.clone(),
            ip: printer.ip_address.clone(),
            credential: printer.credential().to_string(),
            link: session.link,
            connected,
            acks,
            task,
        })
    }

    /// Sync once, then keep syncing on the configured interval.
    pub async fn init(self: &Arc<Self>) {
        match self.sync().await {
            Ok(report) => info!("Bambu MQTT pool started with {} printer(s)", report.pooled),
            Err(e) => warn!("Initial Bambu pool sync failed: {}", e),
        }
        let pool = Arc::clone(self);
        let period = self.sync_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = pool.sync().await {
                    warn!("Bambu pool sync failed: {}", e);
                }
            }
        });
        if let Some(previous) = self
            .interval_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            previous.abort();
        }
    }

    /// Stop syncing, disconnect every printer and drop all listeners.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.interval_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        let _guard = self.sync_lock.lock().await;
        let drained: Vec<(String, PoolEntry)> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (serial, entry) in drained {
            entry.close(&serial).await;
        }
        self.listeners.clear();
        info!("Bambu MQTT pool shut down");
    }
}

async fn drive_session(
    serial: String,
    name: String,
    link: Arc<dyn DeviceLink>,
    mut events: tokio::sync::mpsc::Receiver<DeviceEvent>,
    connected: Arc<AtomicBool>,
    acks: broadcast::Sender<()>,
    listeners: Arc<ListenerRegistry>,
) {
    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::Connected => {
                if let Err(e) = link.subscribe(&report_topic(&serial)).await {
                    warn!("Subscribing to {} failed: {}", serial, e);
                    continue;
                }
                // Without pushall the printer only reports on its own schedule.
                if let Err(e) = link
                    .publish(&request_topic(&serial), pushall().to_string().into_bytes())
                    .await
                {
                    warn!("pushall to {} failed: {}", serial, e);
                }
                connected.store(true, Ordering::Release);
                info!("Bambu printer {} ({}) connected", name, serial);
            }
            DeviceEvent::Disconnected(reason) => {
                if connected.swap(false, Ordering::AcqRel) {
                    warn!("Bambu printer {} ({}) disconnected: {}", name, serial, reason);
                } else {
                    debug!("Bambu printer {} ({}) still unreachable: {}", name, serial, reason);
                }
            }
            DeviceEvent::Message(payload) => match serde_json::from_slice::<Value>(&payload) {
                Ok(report) => listeners.deliver(&serial, &name, &report),
                Err(e) => debug!("Ignoring non-JSON message from {}: {}", serial, e),
            },
            DeviceEvent::PublishAcked => {
                // No waiter is the common case.
                let _ = acks.send(());
            }
        }
    }
    connected.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;
    impl ReportListener for Failing {
        fn on_report(&self, _: &str, _: &str, _: &Value) -> std::result::Result<(), ListenerError> {
            Err("nope".into())
        }
    }

    struct Panicking;
    impl ReportListener for Panicking {
        fn on_report(&self, _: &str, _: &str, _: &Value) -> std::result::Result<(), ListenerError> {
            panic!("listener bug")
        }
    }

    #[derive(Default)]
    struct Counting(AtomicU64);
    impl ReportListener for Counting {
        fn on_report(&self, _: &str, _: &str, _: &Value) -> std::result::Result<(), ListenerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn faulty_listeners_do_not_block_delivery() {
        let registry = ListenerRegistry::default();
        let counter = Arc::new(Counting::default());
        registry.add(Arc::new(Failing));
        registry.add(Arc::new(Panicking));
        registry.add(counter.clone());
        registry.deliver("S1", "p", &Value::Null);
        registry.deliver("S1", "p", &Value::Null);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listeners_can_be_removed() {
        let registry = ListenerRegistry::default();
        let counter = Arc::new(Counting::default());
        let id = registry.add(counter.clone());
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.deliver("S1", "p", &Value::Null);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }
}
