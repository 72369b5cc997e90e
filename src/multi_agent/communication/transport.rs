use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result, agent_error::AgentError},
    shared::config::TransportConfig,
    utils::retry::{RetryError, RetryPolicy},
};

/// Point-to-point JSON delivery: one connection carries exactly one message.
#[derive(Debug, Clone)]
pub struct Transport {
    config: TransportConfig,
    retry: RetryPolicy,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let retry = RetryPolicy::from_transport(&config);
        Self { config, retry }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Delivers `payload`, retrying connection failures with backoff.
    ///
    /// Returns [`AgentError::Transport`] once `max_attempts` attempts have failed.
    pub async fn send<T: Serialize>(&self, host: &str, port: u16, payload: &T) -> Result<()> {
        let frame = serde_json::to_vec(payload)?;
        let target = format!("{host}:{port}");

        let outcome = self
            .retry
            .run(
                |_| self.write_frame(&target, &frame),
                Error::is_transport,
            )
            .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(RetryError::Exhausted { attempts, last }) => Err(AgentError::Transport {
                target,
                attempts,
                reason: last.to_string(),
            }
            .into()),
            Err(RetryError::Fatal { error, .. }) => Err(error),
            Err(RetryError::Cancelled { attempts }) => Err(AgentError::Transport {
                target,
                attempts,
                reason: "cancelled".into(),
            }
            .into()),
        }
    }

    /// Exactly one delivery attempt; callers own any retry.
    pub async fn try_send<T: Serialize>(&self, host: &str, port: u16, payload: &T) -> Result<()> {
        let frame = serde_json::to_vec(payload)?;
        self.write_frame(&format!("{host}:{port}"), &frame).await
    }

    /// Binds `host:port`, waits for a single message, then releases the port.
    pub async fn receive<T: DeserializeOwned>(&self, host: &str, port: u16) -> Result<T> {
        let listener = MessageListener::bind(host, port, &self.config).await?;
        listener.recv().await
    }

    async fn write_frame(&self, target: &str, frame: &[u8]) -> Result<()> {
        let attempt = async {
            let mut stream = TcpStream::connect(target).await?;
            stream.write_all(frame).await?;
            stream.shutdown().await?;
            Ok::<_, Error>(())
        };

        match tokio::time::timeout(self.config.attempt_timeout(), attempt).await {
            Ok(result) => {
                if result.is_ok() {
                    debug!("Delivered {} bytes to {}", frame.len(), target);
                }
                result
            }
            Err(_) => Err(AgentError::Transport {
                target: target.to_string(),
                attempts: 1,
                reason: format!("timed out after {:?}", self.config.attempt_timeout()),
            }
            .into()),
        }
    }
}

/// A bound socket that yields one decoded message per accepted connection.
#[derive(Debug)]
pub struct MessageListener {
    listener: TcpListener,
    max_frame_bytes: usize,
    read_timeout: Duration,
}

impl MessageListener {
    pub async fn bind(host: &str, port: u16, config: &TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self {
            listener,
            max_frame_bytes: config.max_frame_bytes,
            read_timeout: config.attempt_timeout(),
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accepts one connection and returns its payload as raw JSON.
    pub async fn recv_value(&self) -> Result<serde_json::Value> {
        let (stream, peer) = self.listener.accept().await?;
        debug!("Accepted connection from {}", peer);

        let frame = match tokio::time::timeout(self.read_timeout, self.read_frame(stream)).await {
            Ok(frame) => frame?,
            Err(_) => {
                warn!("Peer {} did not finish its frame in {:?}", peer, self.read_timeout);
                return Err(AgentError::Transport {
                    target: peer.to_string(),
                    attempts: 1,
                    reason: "read timed out".into(),
                }
                .into());
            }
        };

        Ok(serde_json::from_slice(&frame)?)
    }

    pub async fn recv<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.recv_value().await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn read_frame(&self, stream: TcpStream) -> Result<Vec<u8>> {
        let mut frame = Vec::new();
        let limit = self.max_frame_bytes as u64 + 1;
        stream.take(limit).read_to_end(&mut frame).await?;

        if frame.len() > self.max_frame_bytes {
            return Err(AgentError::InvalidMessage(format!(
                "frame exceeds {} bytes",
                self.max_frame_bytes
            ))
            .into());
        }
        Ok(frame)
    }
}

/// Asks the OS for a free port by binding port 0 and releasing it.
pub fn ephemeral_port(host: &str) -> Result<u16> {
    let listener = std::net::TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}
