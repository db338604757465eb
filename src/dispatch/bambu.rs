//! Bambu dispatch: FTPS upload into `cache/`, then a `project_file` command over MQTT.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ftps::FileTransfer;
use super::validation::{validate_access_code, validate_bambu_filename, validate_ip, validate_serial};
use super::{sanitize_device_message, DispatchError, DispatchReceipt, DispatchRequest};
use crate::bambu::commands::{request_topic, ProjectFile};
use crate::bambu::{
    BambuError, BambuMqttPool, BambuStatusCache, ConnectionState, DeviceConnector, DeviceEvent, DeviceLink,
    DeviceTarget,
};

/// `gcode_state` values that mean a job owns the printer.
pub const BUSY_STATES: &[&str] = &["RUNNING", "PAUSE", "PREPARE"];

const POOL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BambuDispatchSettings {
    pub mqtt_port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for BambuDispatchSettings {
    fn default() -> Self {
        Self {
            mqtt_port: 8883,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(15),
        }
    }
}

pub struct BambuDispatcher {
    pool: Arc<BambuMqttPool>,
    status: Arc<BambuStatusCache>,
    transfer: Arc<dyn FileTransfer>,
    connector: Arc<dyn DeviceConnector>,
    settings: BambuDispatchSettings,
}

impl BambuDispatcher {
    pub fn new(
        pool: Arc<BambuMqttPool>,
        status: Arc<BambuStatusCache>,
        transfer: Arc<dyn FileTransfer>,
        connector: Arc<dyn DeviceConnector>,
        settings: BambuDispatchSettings,
    ) -> Self {
        Self {
            pool,
            status,
            transfer,
            connector,
            settings,
        }
    }

    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        validate_ip(&request.ip_address)?;
        validate_access_code(&request.credential)?;
        let serial = request
            .serial
            .as_deref()
            .ok_or_else(|| DispatchError::Validation("a serial number is required for Bambu printers".to_string()))?;
        validate_serial(serial)?;
        validate_bambu_filename(&request.filename)?;

        self.ensure_idle(serial).await?;

        let project = ProjectFile {
            plate: request.bambu.plate.max(1),
            use_ams: request.bambu.use_ams,
            ams_mapping: request.bambu.ams_mapping.clone(),
            ..ProjectFile::new(&request.filename)
        };

        if request.mode.uploads() {
            self.transfer
                .upload(&request.ip_address, &request.credential, &request.filename, &request.file)
                .await?;
        }

        let mut detail = if request.mode.uploads() {
            format!("uploaded to {}", project.remote_path())
        } else {
            format!("selected {}", project.remote_path())
        };
        if request.mode.starts() {
            let target = DeviceTarget {
                serial: serial.to_string(),
                host: request.ip_address.clone(),
                port: self.settings.mqtt_port,
                access_code: request.credential.clone(),
            };
            let via = self.start(&target, &project).await?;
            detail = format!("{}; project_file sent via {}", detail, via);
        }
        info!("Bambu dispatch to {} finished: {}", serial, detail);

        Ok(DispatchReceipt {
            mode: request.mode,
            storage: None,
            remote_path: Some(project.remote_path()),
            started: request.mode.starts(),
            confirmed: None,
            detail,
        })
    }

    /// Refuse while a job is active. An unknown state does not block.
    async fn ensure_idle(&self, serial: &str) -> Result<(), DispatchError> {
        let view = self.status.query(serial, &self.pool).await;
        match view.gcode_state.as_deref() {
            Some(state) if BUSY_STATES.contains(&state) => Err(DispatchError::Busy(state.to_string())),
            Some(_) => Ok(()),
            None => {
                warn!("State of {} unknown ({}), dispatching anyway", serial, view.status);
                Ok(())
            }
        }
    }

    /// Publish the start command, preferring the pooled connection. Returns how it was sent.
    async fn start(&self, target: &DeviceTarget, project: &ProjectFile) -> Result<&'static str, DispatchError> {
        let topic = request_topic(&target.serial);
        let payload = project.to_json().to_string().into_bytes();

        if self.wait_for_pool(&target.serial).await? {
            self.pool
                .publish_acked(&target.serial, &topic, payload, self.settings.command_timeout)
                .await
                .map_err(|e| match e {
                    BambuError::Timeout(_) => DispatchError::Start("printer did not acknowledge the command".to_string()),
                    other => start_error(other),
                })?;
            return Ok("pooled connection");
        }

        self.publish_direct(target, &topic, payload).await?;
        Ok("dedicated connection")
    }

    /// Whether the pool holds a live connection, waiting out a handshake in progress. `false`
    /// when the printer is not pooled.
    async fn wait_for_pool(&self, serial: &str) -> Result<bool, DispatchError> {
        let deadline = Instant::now() + self.settings.connect_timeout;
        loop {
            match self.pool.connection_state(serial) {
                ConnectionState::Absent => return Ok(false),
                ConnectionState::Connected => return Ok(true),
                ConnectionState::Connecting => {}
            }
            if Instant::now() >= deadline {
                return Err(DispatchError::Unreachable(format!(
                    "pooled connection to {} did not come up within {:?}",
                    serial, self.settings.connect_timeout
                )));
            }
            tokio::time::sleep(POOL_POLL).await;
        }
    }

    /// Short-lived session for printers the pool does not hold. Always closed before returning.
    async fn publish_direct(&self, target: &DeviceTarget, topic: &str, payload: Vec<u8>) -> Result<(), DispatchError> {
        debug!("Opening dedicated MQTT session to {}", target.serial);
        let session = self.connector.connect(target)?;
        let link = session.link;
        let mut events = session.events;

        let connect_timeout = self.settings.connect_timeout;
        let outcome = tokio::time::timeout(self.settings.command_timeout, async {
            tokio::time::timeout(connect_timeout, wait_for(&mut events, |e| *e == DeviceEvent::Connected))
                .await
                .map_err(|_| DispatchError::Unreachable(format!("MQTT connect timed out after {:?}", connect_timeout)))?
                .map_err(DispatchError::from)?;
            link.publish(topic, payload).await.map_err(start_error)?;
            wait_for(&mut events, |e| *e == DeviceEvent::PublishAcked)
                .await
                .map_err(start_error)
        })
        .await
        .unwrap_or_else(|_| Err(DispatchError::Start("printer did not acknowledge the command".to_string())));

        if let Err(e) = link.disconnect().await {
            debug!("Closing dedicated session to {} failed: {}", target.serial, e);
        }
        outcome
    }
}

fn start_error(e: BambuError) -> DispatchError {
    DispatchError::Start(sanitize_device_message(&e.to_string()))
}

async fn wait_for<F>(events: &mut mpsc::Receiver<DeviceEvent>, wanted: F) -> Result<(), BambuError>
where
    F: Fn(&DeviceEvent) -> bool,
{
    while let Some(event) = events.recv().await {
        if wanted(&event) {
            return Ok(());
        }
        if let DeviceEvent::Disconnected(reason) = event {
            debug!("Session dropped while waiting: {}", reason);
        }
    }
    Err(BambuError::ConnectionFailed("session closed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bambu::{DeviceSession, Result as BambuResult};
    use crate::dispatch::{BambuStartOptions, DispatchMode};
    use async_trait::async_trait;
    use printfleet_shared::memory::InMemoryRoster;
    use printfleet_shared::PrinterType;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransfer {
        uploads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FileTransfer for RecordingTransfer {
        async fn upload(&self, ip: &str, _code: &str, filename: &str, _bytes: &[u8]) -> BambuResult<()> {
            self.uploads.lock().unwrap().push(format!("{}/{}", ip, filename));
            Ok(())
        }
    }

    struct AckingLink {
        published: Arc<Mutex<Vec<(String, String)>>>,
        events: mpsc::Sender<DeviceEvent>,
        silent: bool,
    }

    #[async_trait]
    impl DeviceLink for AckingLink {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> BambuResult<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), String::from_utf8(payload).unwrap()));
            if !self.silent {
                let _ = self.events.try_send(DeviceEvent::PublishAcked);
            }
            Ok(())
        }
        async fn subscribe(&self, _topic: &str) -> BambuResult<()> {
            Ok(())
        }
        async fn disconnect(&self) -> BambuResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct AckingConnector {
        published: Arc<Mutex<Vec<(String, String)>>>,
        /// Links never acknowledge a publish.
        silent: bool,
    }

    impl DeviceConnector for AckingConnector {
        fn connect(&self, _target: &DeviceTarget) -> BambuResult<DeviceSession> {
            let (tx, rx) = mpsc::channel(8);
            tx.try_send(DeviceEvent::Connected).unwrap();
            Ok(DeviceSession {
                link: Arc::new(AckingLink {
                    published: self.published.clone(),
                    events: tx,
                    silent: self.silent,
                }),
                events: rx,
            })
        }
    }

    fn dispatcher(transfer: Arc<RecordingTransfer>, connector: Arc<AckingConnector>) -> BambuDispatcher {
        let pool = Arc::new(BambuMqttPool::new(
            Arc::new(InMemoryRoster::default()),
            connector.clone(),
            8883,
            Duration::from_secs(60),
        ));
        with_pool(pool, transfer, connector, Duration::from_secs(2))
    }

    fn with_pool(
        pool: Arc<BambuMqttPool>,
        transfer: Arc<RecordingTransfer>,
        connector: Arc<AckingConnector>,
        command_timeout: Duration,
    ) -> BambuDispatcher {
        BambuDispatcher::new(
            pool,
            Arc::new(BambuStatusCache::new(Duration::from_secs(300))),
            transfer,
            connector,
            BambuDispatchSettings {
                mqtt_port: 8883,
                connect_timeout: Duration::from_secs(1),
                command_timeout,
            },
        )
    }

    /// Pool holding the printer from `request`, already connected.
    async fn connected_pool(connector: Arc<AckingConnector>) -> Arc<BambuMqttPool> {
        let roster = InMemoryRoster::new(vec![printfleet_shared::Printer {
            id: 1,
            name: "x1c".into(),
            printer_type: PrinterType::Bambu,
            ip_address: "192.168.1.50".into(),
            auth_token: Some("12345678".into()),
            serial_number: Some("01P00A123456789".into()),
            webcam_url: None,
            created_by_user_id: None,
        }]);
        let pool = Arc::new(BambuMqttPool::new(Arc::new(roster), connector, 8883, Duration::from_secs(60)));
        pool.sync().await.unwrap();
        for _ in 0..100 {
            if pool.connection_state("01P00A123456789") == ConnectionState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.connection_state("01P00A123456789"), ConnectionState::Connected);
        pool
    }

    fn request(filename: &str) -> DispatchRequest {
        DispatchRequest {
            printer_type: PrinterType::Bambu,
            ip_address: "192.168.1.50".into(),
            file: b"PK".to_vec(),
            filename: filename.into(),
            credential: "12345678".into(),
            serial: Some("01P00A123456789".into()),
            mode: DispatchMode::UploadAndStart,
            bambu: BambuStartOptions {
                plate: 2,
                use_ams: true,
                ams_mapping: vec![0, -1],
            },
        }
    }

    #[tokio::test]
    async fn invalid_input_never_reaches_the_network() {
        let transfer = Arc::new(RecordingTransfer::default());
        let connector = Arc::new(AckingConnector::default());
        let d = dispatcher(transfer.clone(), connector.clone());

        let err = d.dispatch(&request("../evil.3mf")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        let mut bad_serial = request("part.3mf");
        bad_serial.serial = Some("01P/#".into());
        assert!(matches!(d.dispatch(&bad_serial).await, Err(DispatchError::Validation(_))));

        assert!(transfer.uploads.lock().unwrap().is_empty());
        assert!(connector.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unpooled_printer_gets_a_dedicated_session() {
        let transfer = Arc::new(RecordingTransfer::default());
        let connector = Arc::new(AckingConnector::default());
        let d = dispatcher(transfer.clone(), connector.clone());

        let receipt = d.dispatch(&request("Benchy.3mf")).await.unwrap();
        assert!(receipt.started);
        assert_eq!(receipt.remote_path.as_deref(), Some("cache/Benchy.3mf"));
        assert_eq!(*transfer.uploads.lock().unwrap(), vec!["192.168.1.50/Benchy.3mf".to_string()]);

        let published = connector.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "device/01P00A123456789/request");
        let body: serde_json::Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(body["print"]["param"], "Metadata/plate_2.gcode");
        assert_eq!(body["print"]["ams_mapping"], serde_json::json!([0, -1]));
        assert_eq!(body["print"]["use_ams"], true);
    }

    #[tokio::test]
    async fn pooled_start_waits_for_the_acknowledgement() {
        let transfer = Arc::new(RecordingTransfer::default());
        let connector = Arc::new(AckingConnector::default());
        let pool = connected_pool(connector.clone()).await;
        let d = with_pool(pool, transfer, connector.clone(), Duration::from_secs(2));

        let receipt = d.dispatch(&request("Benchy.3mf")).await.unwrap();
        assert!(receipt.detail.ends_with("via pooled connection"));
        // pushall on connect, then the project_file command.
        let published = connector.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert!(published[1].1.contains("project_file"));
    }

    #[tokio::test]
    async fn unacknowledged_pooled_start_fails() {
        let transfer = Arc::new(RecordingTransfer::default());
        let connector = Arc::new(AckingConnector {
            silent: true,
            ..Default::default()
        });
        let pool = connected_pool(connector.clone()).await;
        let d = with_pool(pool, transfer, connector, Duration::from_millis(200));

        match d.dispatch(&request("Benchy.3mf")).await {
            Err(DispatchError::Start(message)) => assert!(message.contains("acknowledge")),
            other => panic!("expected a start failure, got {:?}", other.map(|r| r.detail)),
        }
    }

    #[tokio::test]
    async fn upload_only_skips_mqtt() {
        let transfer = Arc::new(RecordingTransfer::default());
        let connector = Arc::new(AckingConnector::default());
        let d = dispatcher(transfer.clone(), connector.clone());

        let mut req = request("part.3mf");
        req.mode = DispatchMode::UploadOnly;
        let receipt = d.dispatch(&req).await.unwrap();
        assert!(!receipt.started);
        assert_eq!(transfer.uploads.lock().unwrap().len(), 1);
        assert!(connector.published.lock().unwrap().is_empty());
    }
}
