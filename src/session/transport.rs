//! Broker transport: plain TCP or mutually authenticated TLS

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::tls::{load_client_config, server_name};
use super::SessionError;
use crate::config::{ConfigError, EndpointConfig};

/// Byte stream to a broker
pub trait BrokerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BrokerStream for T {}

pub type BoxedStream = Box<dyn BrokerStream>;

enum Transport {
    Tcp,
    Tls {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

/// Opens streams to one endpoint.
///
/// TLS material is loaded when the connector is built, so a bad certificate
/// fails the relay at startup instead of on every reconnect.
#[derive(Clone)]
pub struct Connector {
    address: String,
    connect_timeout: Duration,
    transport: Arc<Transport>,
}

impl Connector {
    pub fn new(endpoint: &EndpointConfig) -> Result<Self, ConfigError> {
        let transport = match endpoint.tls {
            Some(ref tls) => Transport::Tls {
                connector: TlsConnector::from(load_client_config(tls)?),
                server_name: server_name(endpoint.server_name())?,
            },
            None => Transport::Tcp,
        };

        Ok(Self {
            address: endpoint.address(),
            connect_timeout: endpoint.connect_timeout_duration(),
            transport: Arc::new(transport),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_tls(&self) -> bool {
        matches!(*self.transport, Transport::Tls { .. })
    }

    /// Open a stream, including the TLS handshake, within the connect timeout
    pub async fn connect(&self) -> Result<BoxedStream, SessionError> {
        timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| SessionError::Timeout("connect"))?
    }

    async fn open(&self) -> Result<BoxedStream, SessionError> {
        let tcp = TcpStream::connect(&self.address).await?;
        tcp.set_nodelay(true)?;
        debug!("TCP connected to {}", self.address);

        match &*self.transport {
            Transport::Tcp => Ok(Box::new(tcp)),
            Transport::Tls {
                connector,
                server_name,
            } => {
                let stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| SessionError::Handshake(e.to_string()))?;
                debug!("TLS established with {}", self.address);
                Ok(Box::new(stream))
            }
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("address", &self.address)
            .field("tls", &self.is_tls())
            .finish()
    }
}
