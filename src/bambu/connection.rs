//! Device connections.
//!
//! The pool and the dispatch path talk to printers through [`DeviceConnector`] so they can be
//! driven by an in-process fake in tests. [`MqttConnector`] is the real implementation.

use async_trait::async_trait;
use rumqttc::tokio_rustls::rustls;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::{BambuError, Result};

/// Username for LAN-mode MQTT and FTPS.
pub const LAN_USER: &str = "bblp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub serial: String,
    pub host: String,
    pub port: u16,
    pub access_code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Broker accepted the session (also after an automatic reconnect).
    Connected,
    Disconnected(String),
    /// Raw payload of a message on a subscribed topic.
    Message(Vec<u8>),
    /// The broker acknowledged a QoS 1 publish.
    PublishAcked,
}

#[async_trait]
pub trait DeviceLink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

/// A live link plus the stream of events for it. Dropping the receiver stops event delivery.
pub struct DeviceSession {
    pub link: Arc<dyn DeviceLink>,
    pub events: mpsc::Receiver<DeviceEvent>,
}

pub trait DeviceConnector: Send + Sync + 'static {
    /// Start connecting without waiting for the handshake; progress arrives as events.
    fn connect(&self, target: &DeviceTarget) -> Result<DeviceSession>;
}

/// MQTT over TLS with certificate checks turned off.
///
/// Printers present self-signed certificates, so the trust boundary is the local network.
pub struct MqttConnector {
    tls: Arc<ClientConfig>,
    reconnect_delay: Duration,
}

impl MqttConnector {
    pub fn new() -> Self {
        Self {
            tls: Arc::new(insecure_tls_config()),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceConnector for MqttConnector {
    fn connect(&self, target: &DeviceTarget) -> Result<DeviceSession> {
        let client_id = format!("printfleet_{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, target.host.clone(), target.port);
        options.set_credentials(LAN_USER, target.access_code.clone());
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        // Full status dumps are far larger than the 10 KiB default.
        options.set_max_packet_size(1024 * 1024, 64 * 1024);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(self.tls.clone())));

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let reconnect_delay = self.reconnect_delay;
        let serial = target.serial.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop_rx.changed() => break,
                    polled = eventloop.poll() => match polled {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => Some(DeviceEvent::Connected),
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            Some(DeviceEvent::Message(publish.payload.to_vec()))
                        }
                        Ok(Event::Incoming(Packet::PubAck(_))) => Some(DeviceEvent::PublishAcked),
                        Ok(_) => None,
                        Err(e) => {
                            if *stop_rx.borrow() {
                                break;
                            }
                            if events_tx.send(DeviceEvent::Disconnected(e.to_string())).await.is_err() {
                                break;
                            }
                            tracing::debug!("MQTT {} reconnecting in {:?}", serial, reconnect_delay);
                            tokio::time::sleep(reconnect_delay).await;
                            None
                        }
                    },
                };
                if let Some(event) = event {
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            tracing::debug!("MQTT event loop for {} stopped", serial);
        });

        Ok(DeviceSession {
            link: Arc::new(MqttLink { client, stop: stop_tx }),
            events: events_rx,
        })
    }
}

struct MqttLink {
    client: AsyncClient,
    stop: watch::Sender<bool>,
}

#[async_trait]
impl DeviceLink for MqttLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BambuError::Mqtt(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BambuError::Mqtt(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        let _ = self.stop.send(true);
        // The event loop may already be gone; a failed disconnect request is not an error.
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("MQTT disconnect request not delivered: {}", e);
        }
        Ok(())
    }
}

fn insecure_tls_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptDeviceCertificate))
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptDeviceCertificate;

impl ServerCertVerifier for AcceptDeviceCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
