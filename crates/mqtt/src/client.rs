//! MQTT client construction with TLS and last-will support.
//!
//! `ClientBuilder` turns a validated [`Config`] into rumqttc's `AsyncClient`
//! and `EventLoop` pair. The client id is generated per connection purpose
//! (see [`generate_client_id`]) so two bridge instances never kick each
//! other off the broker.
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::from_config(&config, "bridge")?
//!     .set_last_will(LastWill::retained("homeassistant_integrations/bridge/availability", "offline"))
//!     .build()?;
//! ```

use std::{fs, time::Duration};

use rand::{distributions::Alphanumeric, Rng};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, TlsConfiguration, Transport};
use validator::Validate;

use super::{
    config::{qos_from_u8, Config, TlsConfig},
    error::TransferError,
};

/// Upper bound on client id length that every MQTT 3.1.1 broker must accept.
pub const CLIENT_ID_MAX_LENGTH: usize = 23;

const CLIENT_ID_PREFIX: &str = "hass_";

/// Random characters every generated id keeps, however long the purpose.
const CLIENT_ID_MIN_RANDOM: usize = 8;

/// Builds a client id of exactly [`CLIENT_ID_MAX_LENGTH`] characters.
///
/// The layout is `hass_{purpose}_{random}`. The purpose is lowercased,
/// stripped to `[a-z0-9_]` and truncated so that at least eight random
/// alphanumeric characters remain. An empty purpose yields `hass_{random}`.
pub fn generate_client_id(purpose: &str) -> String {
    let max_purpose =
        CLIENT_ID_MAX_LENGTH - CLIENT_ID_PREFIX.len() - 1 - CLIENT_ID_MIN_RANDOM;

    let purpose: String = purpose
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .take(max_purpose)
        .collect();

    let mut id = String::with_capacity(CLIENT_ID_MAX_LENGTH);
    id.push_str(CLIENT_ID_PREFIX);
    if !purpose.is_empty() {
        id.push_str(&purpose);
        id.push('_');
    }

    let remaining = CLIENT_ID_MAX_LENGTH - id.len();
    id.extend(
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(remaining)
            .map(|b| char::from(b).to_ascii_lowercase()),
    );
    id
}

/// Message the broker publishes on our behalf after an unclean disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl LastWill {
    /// QoS 1, retained. The shape every availability topic uses.
    pub fn retained(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 1,
            retain: true,
        }
    }
}

pub struct ClientBuilder {
    client_id: String,
    opts: MqttOptions,
    cap: usize,
    tls_config: Option<TlsConfig>,
    last_will: Option<LastWill>,
}

impl ClientBuilder {
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cap: usize,
    ) -> Result<Self, TransferError> {
        let client_id = client_id.into();
        if client_id.is_empty() || client_id.len() > CLIENT_ID_MAX_LENGTH {
            return Err(TransferError::InvalidOptions(format!(
                "Client id must be between 1 and {CLIENT_ID_MAX_LENGTH} characters, got {}",
                client_id.len()
            )));
        }

        Ok(Self {
            opts: MqttOptions::new(client_id.clone(), host, port),
            client_id,
            cap,
            tls_config: None,
            last_will: None,
        })
    }

    /// Validates `config` and prepares a builder with a fresh id for `purpose`.
    pub fn from_config(config: &Config, purpose: &str) -> Result<Self, TransferError> {
        config.validate()?;

        let mut builder = Self::new(
            generate_client_id(purpose),
            config.host.clone(),
            config.port,
            config.request_channel_capacity,
        )?;

        builder.opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        builder.opts.set_clean_session(config.clean_session);
        builder.opts.set_inflight(config.max_inflight);
        builder
            .opts
            .set_max_packet_size(config.max_packet_size, config.max_packet_size);

        if let Some(username) = &config.username {
            builder.opts.set_credentials(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            );
        }

        builder.tls_config = config.tls.clone().filter(TlsConfig::is_enabled);
        Ok(builder)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn with_tls_ca_only(mut self, ca_cert_path: impl Into<String>) -> Self {
        self.tls_config = Some(TlsConfig::with_ca_only(ca_cert_path));
        self
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs));
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    pub fn set_last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }

    fn build_tls_config(tls_config: &TlsConfig) -> Result<Transport, TransferError> {
        tls_config
            .check_client_auth()
            .map_err(|e| TransferError::ClientSetup(format!("Invalid TLS configuration: {e}")))?;

        let ca_path = tls_config
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| TransferError::ClientSetup("TLS CA certificate is not set".into()))?;
        let ca = fs::read(ca_path)?;

        let client_auth = match tls_config.client_auth() {
            Some((cert, key)) => Some((fs::read(cert)?, fs::read(key)?)),
            None => None,
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            client_auth,
            alpn: None,
        }))
    }

    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let mut opts = self.opts;

        if let Some(tls) = &self.tls_config {
            opts.set_transport(Self::build_tls_config(tls)?);
        }

        if let Some(will) = self.last_will {
            if will.topic.is_empty() {
                return Err(TransferError::InvalidOptions(
                    "Last will topic cannot be empty".into(),
                ));
            }
            opts.set_last_will(rumqttc::LastWill::new(
                will.topic,
                will.payload,
                qos_from_u8(will.qos)?,
                will.retain,
            ));
        }

        Ok(AsyncClient::new(opts, self.cap))
    }
}
