//! Kafka source configuration.
//!
//! Mirrors the librdkafka property surface the pipeline actually uses,
//! with typed fields for the common knobs and a passthrough map for the
//! rest. `enable.auto.commit` is always forced off: offset progress is
//! owned by the checkpoint store, and the broker group offsets are only
//! updated best-effort after a checkpoint lands.

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};

/// Transport security protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    /// Unencrypted, unauthenticated.
    #[default]
    Plaintext,
    /// TLS without SASL.
    Ssl,
    /// SASL over plaintext.
    SaslPlaintext,
    /// SASL over TLS.
    SaslSsl,
}

impl SecurityProtocol {
    /// The librdkafka property value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    /// Plain username/password.
    Plain,
    /// SCRAM-SHA-256.
    ScramSha256,
    /// SCRAM-SHA-512.
    ScramSha512,
    /// Kerberos.
    Gssapi,
}

impl SaslMechanism {
    /// The librdkafka property value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
            Self::Gssapi => "GSSAPI",
        }
    }
}

/// Where to start reading when a partition has no stored checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPosition {
    /// Start from the oldest retained offset.
    #[default]
    Earliest,
    /// Start from the log head.
    Latest,
}

impl BootstrapPosition {
    /// The `auto.offset.reset` property value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

/// Starting-offset policy for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum StartingOffsets {
    /// Always start from the oldest retained offsets, ignoring checkpoints.
    Earliest,
    /// Always start from the log head, ignoring checkpoints.
    Latest,
    /// Resume from stored checkpoints; partitions without one fall back
    /// to `bootstrap`.
    Resume {
        /// Fallback position for unchecked partitions and first runs.
        bootstrap: BootstrapPosition,
    },
}

impl Default for StartingOffsets {
    fn default() -> Self {
        Self::Resume {
            bootstrap: BootstrapPosition::Earliest,
        }
    }
}

impl StartingOffsets {
    /// The `auto.offset.reset` value this policy implies for partitions
    /// the consumer has no explicit position for.
    #[must_use]
    pub fn auto_offset_reset(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
            Self::Resume { bootstrap } => bootstrap.as_str(),
        }
    }

    /// Whether stored checkpoints should be applied at startup.
    #[must_use]
    pub fn resumes_from_checkpoint(self) -> bool {
        matches!(self, Self::Resume { .. })
    }
}

/// Configuration for [`KafkaSource`](crate::kafka::KafkaSource).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSourceConfig {
    /// Broker list, `host:port` comma-separated.
    pub bootstrap_servers: String,

    /// Topic to consume.
    pub topic: String,

    /// Consumer group id.
    pub group_id: String,

    /// Transport security protocol.
    #[serde(default)]
    pub security_protocol: SecurityProtocol,

    /// SASL mechanism, required for the SASL protocols.
    #[serde(default)]
    pub sasl_mechanism: Option<SaslMechanism>,

    /// SASL username.
    #[serde(default)]
    pub sasl_username: Option<String>,

    /// SASL password.
    #[serde(default)]
    pub sasl_password: Option<String>,

    /// Kerberos service name, for GSSAPI.
    #[serde(default)]
    pub kerberos_service_name: Option<String>,

    /// CA certificate path for TLS.
    #[serde(default)]
    pub ssl_ca_location: Option<String>,

    /// Client certificate path for mutual TLS.
    #[serde(default)]
    pub ssl_certificate_location: Option<String>,

    /// Client key path for mutual TLS.
    #[serde(default)]
    pub ssl_key_location: Option<String>,

    /// Starting-offset policy.
    #[serde(default)]
    pub starting_offsets: StartingOffsets,

    /// Consumer session timeout.
    #[serde(default = "default_session_timeout", with = "humantime_millis")]
    pub session_timeout: Duration,

    /// Additional librdkafka properties, passed through verbatim.
    /// Typed fields above win on conflict, and `enable.auto.commit`
    /// cannot be overridden.
    #[serde(default)]
    pub kafka_properties: HashMap<String, String>,
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(45)
}

/// Serde adapter storing a `Duration` as integer milliseconds.
mod humantime_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(de)?;
        Ok(Duration::from_millis(millis))
    }
}

impl KafkaSourceConfig {
    /// Minimal config for `topic` on `bootstrap_servers` with the
    /// default resume policy.
    #[must_use]
    pub fn new(
        bootstrap_servers: impl Into<String>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            topic: topic.into(),
            group_id: group_id.into(),
            security_protocol: SecurityProtocol::default(),
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            kerberos_service_name: None,
            ssl_ca_location: None,
            ssl_certificate_location: None,
            ssl_key_location: None,
            starting_offsets: StartingOffsets::default(),
            session_timeout: default_session_timeout(),
            kafka_properties: HashMap::new(),
        }
    }

    /// Render the librdkafka client configuration.
    #[must_use]
    pub fn to_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        // Passthrough first, so the typed fields below take precedence.
        for (key, value) in &self.kafka_properties {
            config.set(key, value);
        }

        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &self.group_id)
            .set("security.protocol", self.security_protocol.as_str())
            .set("auto.offset.reset", self.starting_offsets.auto_offset_reset())
            .set(
                "session.timeout.ms",
                self.session_timeout.as_millis().to_string(),
            )
            .set("enable.partition.eof", "false")
            // Offset ownership lives in the checkpoint store.
            .set("enable.auto.commit", "false");

        if let Some(mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism.as_str());
        }
        if let Some(username) = &self.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(password) = &self.sasl_password {
            config.set("sasl.password", password);
        }
        if let Some(service) = &self.kerberos_service_name {
            config.set("sasl.kerberos.service.name", service);
        }
        if let Some(ca) = &self.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(cert) = &self.ssl_certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(key) = &self.ssl_key_location {
            config.set("ssl.key.location", key);
        }

        config
    }
}
