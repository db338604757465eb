//! Fakes shared by the integration tests: a scriptable HTTP device and an in-process MQTT
//! connector.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use printfleet_rs::bambu::{DeviceConnector, DeviceEvent, DeviceLink, DeviceSession, DeviceTarget, Result as BambuResult};
use printfleet_shared::{Printer, PrinterType};

pub fn printer(id: i64, printer_type: PrinterType, ip: &str, token: &str, serial: Option<&str>) -> Printer {
    Printer {
        id,
        name: format!("printer-{}", id),
        printer_type,
        ip_address: ip.to_string(),
        auth_token: Some(token.to_string()),
        serial_number: serial.map(str::to_string),
        webcam_url: None,
        created_by_user_id: None,
    }
}

/// HTTP device answering scripted `(status, body)` per `"METHOD /path"`. The last queued answer
/// repeats; unscripted routes answer 404. Every request is logged.
#[derive(Clone, Default)]
pub struct FakeDevice {
    routes: Arc<Mutex<HashMap<String, VecDeque<(u16, String)>>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeDevice {
    pub fn on(&self, route: &str, status: u16, body: &str) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .entry(route.to_string())
            .or_default()
            .push_back((status, body.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Serve on an ephemeral local port; returns `host:port`.
    pub async fn serve(&self) -> String {
        let app = Router::new().fallback(answer).with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }
}

async fn answer(State(device): State<FakeDevice>, method: Method, uri: Uri) -> Response {
    let key = format!("{} {}", method, uri.path());
    device.log.lock().unwrap().push(key.clone());
    let mut routes = device.routes.lock().unwrap();
    let Some(queue) = routes.get_mut(&key) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (status, body) = if queue.len() > 1 {
        queue.pop_front().unwrap()
    } else {
        queue.front().cloned().unwrap()
    };
    (StatusCode::from_u16(status).unwrap(), body).into_response()
}

#[derive(Default)]
pub struct LinkLog {
    pub subscribed: Vec<String>,
    pub published: Vec<(String, String)>,
    pub disconnects: usize,
}

pub struct FakeLink {
    log: Arc<Mutex<LinkLog>>,
}

#[async_trait]
impl DeviceLink for FakeLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BambuResult<()> {
        self.log
            .lock()
            .unwrap()
            .published
            .push((topic.to_string(), String::from_utf8_lossy(&payload).into_owned()));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> BambuResult<()> {
        self.log.lock().unwrap().subscribed.push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> BambuResult<()> {
        self.log.lock().unwrap().disconnects += 1;
        Ok(())
    }
}

/// Connector whose sessions are driven by the test through [`FakeConnector::send`].
#[derive(Default)]
pub struct FakeConnector {
    pub connects: Mutex<Vec<DeviceTarget>>,
    senders: Mutex<HashMap<String, mpsc::Sender<DeviceEvent>>>,
    pub links: Mutex<HashMap<String, Arc<Mutex<LinkLog>>>>,
}

impl FakeConnector {
    pub fn connect_count(&self, serial: &str) -> usize {
        self.connects.lock().unwrap().iter().filter(|t| t.serial == serial).count()
    }

    pub async fn send(&self, serial: &str, event: DeviceEvent) {
        let sender = self.senders.lock().unwrap().get(serial).cloned().unwrap();
        sender.send(event).await.unwrap();
    }

    pub fn link_log(&self, serial: &str) -> Arc<Mutex<LinkLog>> {
        self.links.lock().unwrap().get(serial).cloned().unwrap()
    }
}

impl DeviceConnector for FakeConnector {
    fn connect(&self, target: &DeviceTarget) -> BambuResult<DeviceSession> {
        let (tx, rx) = mpsc::channel(32);
        let log = Arc::new(Mutex::new(LinkLog::default()));
        self.connects.lock().unwrap().push(target.clone());
        self.senders.lock().unwrap().insert(target.serial.clone(), tx);
        self.links.lock().unwrap().insert(target.serial.clone(), log.clone());
        Ok(DeviceSession {
            link: Arc::new(FakeLink { log }),
            events: rx,
        })
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
