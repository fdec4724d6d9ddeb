//! Broker wire protocol.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! object tagged by `type`. Message payloads are hex-encoded.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Client to broker: `subscribe`, `unsubscribe`, `publish`.
//! Broker to client: `subscribed`, `rejected`, `deliver`, `error`.

use crate::config::BrokerConfig;
use crate::error::{BridgeError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One broker protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BrokerFrame {
    /// Become the consumer of an address.
    Subscribe { address: String },
    Unsubscribe { address: String },
    /// Enqueue a message on an address.
    Publish {
        address: String,
        #[serde(with = "hex_payload")]
        payload: Bytes,
    },
    /// A message for an address this connection consumes.
    Deliver {
        address: String,
        #[serde(with = "hex_payload")]
        payload: Bytes,
    },
    /// Subscription accepted.
    Subscribed { address: String },
    /// Subscription refused, usually because the address has a consumer.
    Rejected { address: String, reason: String },
    Error { message: String },
}

mod hex_payload {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    check_size(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    check_size(payload.len())?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode one [`BrokerFrame`], rejecting it if it exceeds the frame limit.
pub fn encode_broker_frame(frame: &BrokerFrame) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(frame)?;
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Encode and write one [`BrokerFrame`].
///
/// An oversized frame fails before anything reaches the writer.
pub async fn write_broker_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &BrokerFrame,
) -> Result<()> {
    let bytes = encode_broker_frame(frame)?;
    write_frame(writer, &bytes).await
}

/// Decode a frame body read with [`read_frame`].
pub fn decode_broker_frame(bytes: &[u8]) -> Result<BrokerFrame> {
    serde_json::from_slice(bytes).map_err(|e| BridgeError::Json {
        message: format!("Failed to parse broker frame: {}", e),
        source: Some(e),
    })
}

fn check_size(len: usize) -> Result<()> {
    if len > BrokerConfig::MAX_FRAME_SIZE {
        return Err(BridgeError::Validation {
            field: "broker_frame".to_string(),
            message: format!(
                "Frame size {} exceeds maximum {}",
                len,
                BrokerConfig::MAX_FRAME_SIZE
            ),
        });
    }
    Ok(())
}
