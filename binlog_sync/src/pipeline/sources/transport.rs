use std::{io, time::Duration};

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::{info, warn};

use crate::config::SourceConfig;

use super::SourceError;

/// Opens the byte stream a replication decoder talks over.
#[async_trait]
pub trait SocketTransport: Send + Sync {
    type Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, SourceError>;

    fn endpoint(&self) -> String;
}

pub struct TcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    attempts: usize,
    delay: Duration,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> TcpTransport {
        TcpTransport {
            host: host.into(),
            port,
            timeout: Duration::from_secs(3),
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }

    /// Single attempt per connect, bounded by `connect_timeout_ms`. Retrying
    /// is left to the pipeline's reconnect loop so the budgets do not
    /// multiply.
    pub fn from_config(config: &SourceConfig) -> TcpTransport {
        TcpTransport::new(&config.host, config.port)
            .with_timeout(config.connect_timeout())
            .with_retry(1, config.reconnect_delay())
    }

    /// Bounds every single connection attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> TcpTransport {
        self.timeout = timeout;
        self
    }

    /// `attempts` counts the first try.
    pub fn with_retry(mut self, attempts: usize, delay: Duration) -> TcpTransport {
        self.attempts = attempts.max(1);
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SocketTransport for TcpTransport {
    type Connection = TcpStream;

    async fn connect(&self) -> Result<TcpStream, SourceError> {
        let endpoint = self.endpoint();
        let timeout = self.timeout;

        let attempt = || {
            let endpoint = endpoint.clone();
            async move {
                match tokio::time::timeout(timeout, TcpStream::connect(endpoint.as_str())).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no answer within {timeout:?}"),
                    )),
                }
            }
        };

        let stream = attempt
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.delay)
                    .with_max_times(self.attempts - 1),
            )
            .notify(|e: &io::Error, after: Duration| {
                warn!(endpoint = %endpoint, error = %e, "connect failed, retrying in {after:?}");
            })
            .await
            .map_err(|source| SourceError::Connection {
                endpoint: endpoint.clone(),
                source,
            })?;

        stream.set_nodelay(true)?;
        info!(endpoint = %endpoint, "connected to upstream");
        Ok(stream)
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
