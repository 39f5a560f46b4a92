use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::{LastWill, Packet, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, MqttOptions};
use rumqttc::{Outgoing, Transport};

use super::{PublishMessage, Publisher};
use crate::error::ScanError;

const AVAILABILITY_TOPIC_SUFFIX: &str = "status";
const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";
const CONTENT_TYPE_JSON: &str = "application/json";

/// Pause between reconnection attempts after a broker error.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    /// Accepts `host:port`, `[v6]:port`, and `mqtt://`, `tcp://`, `mqtts://`, `ssl://` schemes.
    pub fn parse(addr: &str, tls_override: bool) -> Result<Self> {
        let mut use_tls = tls_override;
        let mut remainder = addr.trim();

        if let Some((scheme, rest)) = remainder.split_once("://") {
            match scheme {
                "mqtt" | "tcp" => {}
                "mqtts" | "ssl" => use_tls = true,
                other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
            }
            remainder = rest;
        }

        let (host, port) = split_host_port(remainder)?;
        Ok(Self {
            host,
            port,
            use_tls,
        })
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

/// PEM material for MQTT over TLS.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA {}", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read MQTT TLS client cert {}", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT TLS client key {}", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "MQTT TLS client cert and key must be provided together"
                ))
            }
        };

        Ok(Self { ca, client_auth })
    }

    fn is_empty(&self) -> bool {
        self.ca.is_none() && self.client_auth.is_none()
    }
}

fn build_transport(endpoint: &MqttEndpoint, tls: &TlsMaterials) -> Result<Transport> {
    if !endpoint.use_tls {
        if !tls.is_empty() {
            return Err(anyhow!(
                "MQTT TLS materials provided but TLS is disabled (use --mqtt-use-tls or mqtts://)"
            ));
        }
        return Ok(Transport::tcp());
    }

    if tls.is_empty() {
        return Ok(Transport::tls_with_default_config());
    }

    let ca = tls.ca.clone().ok_or_else(|| {
        anyhow!("MQTT TLS CA certificate is required when providing client certificates")
    })?;
    Ok(Transport::tls(ca, tls.client_auth.clone(), None))
}

/// Everything needed to open the broker session.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Prefix of the availability topic (`<prefix>/status`).
    pub topic_prefix: String,
    pub reconnect_delay: Duration,
}

impl MqttSettings {
    pub fn availability_topic(&self) -> String {
        format!("{}/{}", self.topic_prefix, AVAILABILITY_TOPIC_SUFFIX)
    }
}

/// MQTT v5 publisher. Publishes are queued on the client and driven by a
/// background connection thread that reconnects until [`MqttPublisher::disconnect`];
/// QoS 1, never retained.
pub struct MqttPublisher {
    client: Client,
    availability_topic: String,
    closing: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = &settings.endpoint;
        let availability_topic = settings.availability_topic();

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            &availability_topic,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        options.set_transport(build_transport(endpoint, &settings.tls)?);

        let (client, connection) = Client::new(options, 64);
        let closing = Arc::new(AtomicBool::new(false));
        let handle = {
            let session = Session {
                client: client.clone(),
                availability_topic: availability_topic.clone(),
                closing: closing.clone(),
                reconnect_delay: settings.reconnect_delay,
            };
            std::thread::Builder::new()
                .name("mqtt-connection".to_string())
                .spawn(move || session.drive(connection))
                .context("spawn MQTT connection thread")?
        };

        log::info!(
            "MQTT publisher started for {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            availability_topic,
            closing,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    /// Mark the pipeline offline and close the session.
    pub fn disconnect(&self) -> Result<()> {
        let _ = self.client.try_publish(
            self.availability_topic.as_str(),
            QoS::AtLeastOnce,
            true,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
        );
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            log::warn!("MQTT disconnect not queued, leaving connection thread: {}", e);
            return Ok(());
        }
        let handle = self
            .connection_handle
            .lock()
            .map_err(|_| anyhow!("MQTT handle lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

/// State owned by the connection thread.
struct Session {
    client: Client,
    availability_topic: String,
    closing: Arc<AtomicBool>,
    reconnect_delay: Duration,
}

impl Session {
    /// Poll the event loop until the session is closed. Polling again after an
    /// error reconnects; requests queued meanwhile go out once the broker is back.
    fn drive(self, mut connection: Connection) {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    log::info!("MQTT connected");
                    self.announce_online();
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) if self.is_closing() => break,
                Ok(_) => {}
                Err(e) => {
                    if self.is_closing() {
                        break;
                    }
                    log::error!(
                        "MQTT connection error: {}. Reconnecting in {:?}...",
                        e,
                        self.reconnect_delay
                    );
                    std::thread::sleep(self.reconnect_delay);
                }
            }
        }
        log::debug!("MQTT connection thread exiting");
    }

    /// Retained "online" after every (re)connect; the broker may have fired the
    /// last will while we were away.
    fn announce_online(&self) {
        if let Err(e) = self.client.try_publish(
            self.availability_topic.as_str(),
            QoS::AtLeastOnce,
            true,
            PAYLOAD_ONLINE.as_bytes().to_vec(),
        ) {
            log::warn!("failed to queue availability message: {}", e);
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, message: &PublishMessage) -> Result<(), ScanError> {
        let properties = PublishProperties {
            user_properties: message.headers.clone(),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            ..Default::default()
        };
        self.client
            .try_publish_with_properties(
                message.topic.as_str(),
                QoS::AtLeastOnce,
                false,
                message.payload.clone(),
                properties,
            )
            .map_err(|e| ScanError::Publish(e.to_string()))
    }
}
