//! Event push client
//!
//! The daemon-side counterpart of the listener: a thin client holding one
//! open connection to the listener's push endpoint and streaming event
//! frames over it.

use std::net::SocketAddr;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::codec::encode_event;
use crate::error::{EventError, Result};

/// Pushes events to an [`EventListener`](crate::EventListener) endpoint.
///
/// The connection stays open for the forwarder's lifetime; frames are
/// self-delimiting, so no per-message handshake is needed.
#[derive(Debug)]
pub struct EventForwarder {
    stream: TcpStream,
}

impl EventForwarder {
    /// Connect to a listener address of the form `tcp://127.0.0.1:<port>`
    pub async fn connect(address: &str) -> Result<Self> {
        let addr = parse_address(address)?;
        let stream = TcpStream::connect(addr).await?;
        debug!(%addr, "event forwarder connected");
        Ok(Self { stream })
    }

    /// Forward one event.
    ///
    /// A `_stamp` payload key is added when the caller did not provide one,
    /// so receivers always see a stamped event.
    pub async fn forward(
        &mut self,
        daemon_id: &str,
        tag: &str,
        mut data: Map<String, Value>,
    ) -> Result<()> {
        if !data.contains_key("_stamp") {
            data.insert(
                "_stamp".into(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
            );
        }
        let frame = encode_event(daemon_id, tag, &data)?;
        self.stream.write_all(&frame).await?;
        debug!(daemon_id, tag, "event forwarded");
        Ok(())
    }
}

fn parse_address(address: &str) -> Result<SocketAddr> {
    address
        .strip_prefix("tcp://")
        .unwrap_or(address)
        .parse()
        .map_err(|_| EventError::Address(address.to_string()))
}
