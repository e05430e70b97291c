//! Change notification bridge.
//!
//! Keeps a push connection to one server open, reconnecting with a doubling
//! delay after every failure, and forwards what arrives over an unbounded
//! channel. The receiving side sees connection state changes and messages in
//! exactly the order they happened.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::types::NotificationMessage;

/// What the bridge reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
  Connected,
  Disconnected,
  Message(NotificationMessage),
}

/// Opens push connections to a server.
pub trait NotificationTransport: Send + Sync + 'static {
  type Connection: NotificationConnection;

  fn connect(&self, server: &str) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// One open push connection.
pub trait NotificationConnection: Send + 'static {
  /// The next message, or `None` once the server closes the channel.
  fn next_message(&mut self) -> impl Future<Output = Result<Option<NotificationMessage>>> + Send;
}

// ============================================================================
// Reconnect delay
// ============================================================================

/// Doubling reconnect delay, capped at a maximum and reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
  initial: Duration,
  max: Duration,
  current: Duration,
}

impl Backoff {
  pub fn new(initial: Duration, max: Duration) -> Self {
    Self {
      initial,
      max,
      current: initial,
    }
  }

  /// Delay before the next attempt. Each call doubles the following one.
  pub fn next_delay(&mut self) -> Duration {
    let delay = self.current;
    self.current = (self.current * 2).min(self.max);
    delay
  }

  pub fn reset(&mut self) {
    self.current = self.initial;
  }
}

impl From<&ReconnectConfig> for Backoff {
  fn from(config: &ReconnectConfig) -> Self {
    Self::new(
      Duration::from_millis(config.initial_delay_ms),
      Duration::from_millis(config.max_delay_ms),
    )
  }
}

// ============================================================================
// Bridge task
// ============================================================================

/// Handle to a running bridge. Dropping it stops the bridge as well.
pub struct BridgeHandle {
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
}

impl BridgeHandle {
  /// Stop reconnecting and wait for the bridge task to finish.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    let _ = self.task.await;
  }
}

pub struct NotificationBridge<T: NotificationTransport> {
  transport: T,
  server: String,
  backoff: Backoff,
  tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl<T: NotificationTransport> NotificationBridge<T> {
  pub fn new(
    transport: T,
    server: &str,
    backoff: Backoff,
    tx: mpsc::UnboundedSender<BridgeEvent>,
  ) -> Self {
    Self {
      transport,
      server: server.to_string(),
      backoff,
      tx,
    }
  }

  /// Run the bridge on its own task.
  pub fn spawn(self) -> BridgeHandle {
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(self.run(rx));
    BridgeHandle { shutdown, task }
  }

  /// Connect, forward, reconnect; until shut down or the consumer goes away.
  async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
    loop {
      let attempt = tokio::select! {
        _ = shutdown.changed() => break,
        result = self.transport.connect(&self.server) => result,
      };

      match attempt {
        Ok(mut connection) => {
          info!("Notification channel to {} open", self.server);
          self.backoff.reset();
          if self.tx.send(BridgeEvent::Connected).is_err() {
            break;
          }

          loop {
            let next = tokio::select! {
              _ = shutdown.changed() => return,
              next = connection.next_message() => next,
            };
            match next {
              Ok(Some(message)) => {
                if self.tx.send(BridgeEvent::Message(message)).is_err() {
                  return;
                }
              }
              Ok(None) => {
                info!("Notification channel to {} closed", self.server);
                break;
              }
              Err(e) => {
                warn!("Notification channel to {} failed: {}", self.server, e);
                break;
              }
            }
          }

          if self.tx.send(BridgeEvent::Disconnected).is_err() {
            break;
          }
        }
        Err(e) => warn!("Could not reach notification channel at {}: {}", self.server, e),
      }

      let delay = self.backoff.next_delay();
      debug!("Reconnecting to {} in {:?}", self.server, delay);
      tokio::select! {
        _ = shutdown.changed() => break,
        _ = tokio::time::sleep(delay) => {}
      }
    }
  }
}

// ============================================================================
// HTTP transport
// ============================================================================

/// Splits a byte stream into newline-delimited JSON messages.
///
/// Blank lines are keep-alives. Lines that fail to decode are skipped.
#[derive(Debug, Default)]
pub struct LineDecoder {
  buffer: Vec<u8>,
}

impl LineDecoder {
  pub fn push(&mut self, bytes: &[u8]) {
    self.buffer.extend_from_slice(bytes);
  }

  pub fn next_message(&mut self) -> Option<NotificationMessage> {
    while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
      let line: Vec<u8> = self.buffer.drain(..=end).collect();
      if let Some(message) = decode_line(&line) {
        return Some(message);
      }
    }
    None
  }

  /// Decode whatever is left once the stream ends.
  pub fn finish(&mut self) -> Option<NotificationMessage> {
    let rest = std::mem::take(&mut self.buffer);
    decode_line(&rest)
  }
}

fn decode_line(line: &[u8]) -> Option<NotificationMessage> {
  let text = String::from_utf8_lossy(line);
  let text = text.trim();
  if text.is_empty() {
    return None;
  }
  match serde_json::from_str(text) {
    Ok(message) => Some(message),
    Err(e) => {
      warn!("Skipping undecodable notification: {}", e);
      None
    }
  }
}

/// Push channel over a long-lived chunked HTTP response.
#[derive(Clone)]
pub struct HttpNotificationTransport {
  client: reqwest::Client,
  protocol: String,
}

impl HttpNotificationTransport {
  pub fn new(protocol: &str) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("trambar-sync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      protocol: protocol.to_string(),
    })
  }
}

pub struct HttpNotificationConnection {
  response: reqwest::Response,
  decoder: LineDecoder,
  finished: bool,
}

impl NotificationTransport for HttpNotificationTransport {
  type Connection = HttpNotificationConnection;

  async fn connect(&self, server: &str) -> Result<HttpNotificationConnection> {
    let url = url::Url::parse(&format!("{}://{}/srv/notification/", self.protocol, server))
      .map_err(|e| eyre!("Invalid server address {}: {}", server, e))?;

    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    Ok(HttpNotificationConnection {
      response,
      decoder: LineDecoder::default(),
      finished: false,
    })
  }
}

impl NotificationConnection for HttpNotificationConnection {
  async fn next_message(&mut self) -> Result<Option<NotificationMessage>> {
    loop {
      if let Some(message) = self.decoder.next_message() {
        return Ok(Some(message));
      }
      if self.finished {
        return Ok(None);
      }
      match self
        .response
        .chunk()
        .await
        .map_err(|e| eyre!("Failed to read notification stream: {}", e))?
      {
        Some(chunk) => self.decoder.push(&chunk),
        None => {
          self.finished = true;
          return Ok(self.decoder.finish());
        }
      }
    }
  }
}
