//! Codec for encoding and decoding Huddle events.
//!
//! Events travel as JSON in text frames or as MessagePack (named fields) in
//! binary frames. The encoding is chosen per connection at handshake time.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

use crate::events::{ClientEvent, ServerEvent};

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the size limit.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Unsupported encoding name.
    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),
}

/// Wire encoding of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// JSON in text frames.
    #[default]
    Json,
    /// MessagePack in binary frames.
    MessagePack,
}

impl Encoding {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::MessagePack => "msgpack",
        }
    }
}

impl FromStr for Encoding {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "msgpack" | "messagepack" => Ok(Encoding::MessagePack),
            other => Err(ProtocolError::UnknownEncoding(other.to_string())),
        }
    }
}

/// An encoded frame ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WireFrame {
    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WireFrame::Text(text) => text.as_bytes(),
            WireFrame::Binary(data) => data,
        }
    }
}

/// Encode a value in the given encoding.
///
/// # Errors
///
/// Returns an error if serialization fails or the result exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(value: &T, encoding: Encoding) -> Result<WireFrame, ProtocolError> {
    let frame = match encoding {
        Encoding::Json => WireFrame::Text(serde_json::to_string(value)?),
        Encoding::MessagePack => WireFrame::Binary(rmp_serde::to_vec_named(value)?),
    };

    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(frame)
}

/// Decode a value from raw frame data.
///
/// # Errors
///
/// Returns an error if the data exceeds [`MAX_FRAME_SIZE`] or is malformed.
pub fn decode<T: DeserializeOwned>(data: &[u8], encoding: Encoding) -> Result<T, ProtocolError> {
    decode_limited(data, encoding, MAX_FRAME_SIZE)
}

fn decode_limited<T: DeserializeOwned>(
    data: &[u8],
    encoding: Encoding,
    max: usize,
) -> Result<T, ProtocolError> {
    if data.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max,
        });
    }

    match encoding {
        Encoding::Json => Ok(serde_json::from_slice(data)?),
        Encoding::MessagePack => Ok(rmp_serde::from_slice(data)?),
    }
}

/// Per-connection codec with its own frame limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec; the limit is capped at [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Decode an inbound event.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or not a known inbound event.
    pub fn decode_client(
        &self,
        data: &[u8],
        encoding: Encoding,
    ) -> Result<ClientEvent, ProtocolError> {
        decode_limited(data, encoding, self.max_frame_size)
    }

    /// Encode an outbound event.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_server(
        &self,
        event: &ServerEvent,
        encoding: Encoding,
    ) -> Result<WireFrame, ProtocolError> {
        encode(event, encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ErrorCode, MessageReceived};

    #[test]
    fn test_json_is_text_and_msgpack_is_binary() {
        let event = ServerEvent::joined("lobby");

        let json = encode(&event, Encoding::Json).unwrap();
        assert!(matches!(json, WireFrame::Text(_)));
        assert_eq!(decode::<ServerEvent>(json.as_bytes(), Encoding::Json).unwrap(), event);

        let packed = encode(&event, Encoding::MessagePack).unwrap();
        assert!(matches!(packed, WireFrame::Binary(_)));
        assert_eq!(
            decode::<ServerEvent>(packed.as_bytes(), Encoding::MessagePack).unwrap(),
            event
        );
    }

    #[test]
    fn test_msgpack_message_with_anonymous_sender() {
        let event = ServerEvent::MessageReceive(MessageReceived {
            message: "hi".into(),
            from: None,
            timestamp: 42,
        });
        let packed = encode(&event, Encoding::MessagePack).unwrap();
        let decoded: ServerEvent = decode(packed.as_bytes(), Encoding::MessagePack).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_client_rejects_oversized_frame() {
        let codec = FrameCodec::new(16);
        let frame = encode(&ClientEvent::send("lobby", "a long message body"), Encoding::Json)
            .unwrap();

        match codec.decode_client(frame.as_bytes(), Encoding::Json) {
            Err(ProtocolError::FrameTooLarge { max: 16, .. }) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_client_rejects_garbage() {
        let codec = FrameCodec::default();
        assert!(matches!(
            codec.decode_client(b"not json", Encoding::Json),
            Err(ProtocolError::Json(_))
        ));
        assert!(codec
            .decode_client(br#"{"event":"room:join","data":{}}"#, Encoding::Json)
            .is_err());
        assert!(codec
            .decode_client(br#"{"event":"room:dance","data":{"roomId":"x"}}"#, Encoding::Json)
            .is_err());
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("json".parse::<Encoding>().unwrap(), Encoding::Json);
        assert_eq!("MsgPack".parse::<Encoding>().unwrap(), Encoding::MessagePack);
        assert!("xml".parse::<Encoding>().is_err());
    }

    #[test]
    fn test_codec_limit_is_capped() {
        let codec = FrameCodec::new(usize::MAX);
        assert_eq!(codec.max_frame_size(), MAX_FRAME_SIZE);
        let frame = codec
            .encode_server(&ServerEvent::error(ErrorCode::InvalidPayload, "bad"), Encoding::Json)
            .unwrap();
        assert!(!frame.is_empty());
    }
}
