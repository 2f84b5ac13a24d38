// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Strategies
//!
//! A strategy turns a validated [`Config`] into a live broker connection.
//! Three variants are supported: a plain local broker, certificate based TLS,
//! and managed/cloud brokers reached over `amqps://` with system roots.

use crate::{
    broker::BrokerConnection,
    config::{Config, StrategyKind},
    errors::AmqpError,
    lapin_broker::LapinConnection,
};
use async_trait::async_trait;
use lapin::{
    tcp::{OwnedIdentity, OwnedTLSConfig},
    types::LongString,
    uri::AMQPUri,
    Connection, ConnectionProperties,
};
use std::{fs, path::Path, sync::Arc};
use tracing::{debug, error};

const PEM_CERTIFICATE_MARKER: &str = "-----BEGIN CERTIFICATE-----";

/// Produces broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, cfg: &Config) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// Loaded client certificate material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca_chain: String,
    pub identity: Option<Vec<u8>>,
    pub identity_password: String,
}

/// The connection variants the client can dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStrategy {
    Plain,
    Tls(TlsMaterial),
    Cloud,
}

impl ConnectionStrategy {
    /// Selects and prepares the strategy described by the configuration.
    ///
    /// Certificates are read here so that a broken TLS setup fails at
    /// construction time instead of on the first dial.
    pub fn from_config(cfg: &Config) -> Result<ConnectionStrategy, AmqpError> {
        match cfg.strategy {
            StrategyKind::Plain => Ok(ConnectionStrategy::Plain),
            StrategyKind::Cloud => {
                if !cfg.url.starts_with("amqps://") {
                    return Err(AmqpError::InvalidStrategy(
                        "cloud strategy requires an amqps:// url".to_owned(),
                    ));
                }
                Ok(ConnectionStrategy::Cloud)
            }
            StrategyKind::Tls => {
                let tls = cfg.tls.as_ref().ok_or_else(|| {
                    AmqpError::MissingTlsConfig("tls strategy requires a ca certificate".to_owned())
                })?;

                let ca_chain = read_pem_chain(&tls.ca_cert_path)?;
                let identity = match &tls.client_identity_path {
                    Some(path) => Some(fs::read(path).map_err(|err| {
                        error!(error = err.to_string(), "failure to read client identity");
                        AmqpError::InvalidCertificate(path.display().to_string())
                    })?),
                    None => None,
                };

                Ok(ConnectionStrategy::Tls(TlsMaterial {
                    ca_chain,
                    identity,
                    identity_password: tls.identity_password.clone(),
                }))
            }
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            ConnectionStrategy::Plain => StrategyKind::Plain,
            ConnectionStrategy::Tls(_) => StrategyKind::Tls,
            ConnectionStrategy::Cloud => StrategyKind::Cloud,
        }
    }
}

#[async_trait]
impl Connector for ConnectionStrategy {
    async fn dial(&self, cfg: &Config) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(strategy = ?self.kind(), "creating amqp connection...");

        let uri = amqp_uri(cfg)?;
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.service_name.clone()));

        let connecting = async {
            match self {
                ConnectionStrategy::Plain => Connection::connect_uri(uri, options).await,
                ConnectionStrategy::Cloud => {
                    Connection::connect_uri_with_config(uri, options, OwnedTLSConfig::default())
                        .await
                }
                ConnectionStrategy::Tls(material) => {
                    let tls = OwnedTLSConfig {
                        identity: material.identity.clone().map(|der| OwnedIdentity {
                            der,
                            password: material.identity_password.clone(),
                        }),
                        cert_chain: Some(material.ca_chain.clone()),
                    };
                    Connection::connect_uri_with_config(uri, options, tls).await
                }
            }
        };

        let conn = match tokio::time::timeout(cfg.connection_timeout, connecting).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(AmqpError::ConnectionError(err.to_string()));
            }
            Err(_) => {
                error!("connection attempt timed out");
                return Err(AmqpError::ConnectionError(
                    "connection attempt timed out".to_owned(),
                ));
            }
        };

        debug!("amqp connected");
        Ok(LapinConnection::new(conn))
    }
}

/// Parses the broker URL and applies heartbeat and connection timeout.
fn amqp_uri(cfg: &Config) -> Result<AMQPUri, AmqpError> {
    let mut uri: AMQPUri = cfg.url.parse().map_err(|_| AmqpError::InvalidConfig {
        field: "url",
        reason: "not a valid amqp uri",
    })?;

    let heartbeat = u16::try_from(cfg.heartbeat.as_secs()).unwrap_or(u16::MAX);
    uri.query.heartbeat = Some(heartbeat.max(1));
    uri.query.connection_timeout = Some(cfg.connection_timeout.as_millis() as u64);

    Ok(uri)
}

fn read_pem_chain(path: &Path) -> Result<String, AmqpError> {
    let pem = fs::read_to_string(path).map_err(|err| {
        error!(error = err.to_string(), "failure to read ca certificate");
        AmqpError::InvalidCertificate(path.display().to_string())
    })?;

    if !pem.contains(PEM_CERTIFICATE_MARKER) {
        return Err(AmqpError::InvalidCertificate(path.display().to_string()));
    }

    Ok(pem)
}
