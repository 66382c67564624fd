//! Binary framing for gateway connections.
//!
//! Every frame is a 4-byte big-endian payload length, one format byte, then
//! the payload. Control frames are JSON; chunk frames use the compact binary
//! codec when the `bincode_chunks` feature is enabled.

use thiserror::Error;

use super::wire::Frame;

/// Upper bound on a single frame payload. Larger transfers are chunked.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Payload codec identifier carried in the format byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingFormat {
    Json = 1,
    Binary = 2,
}

impl EncodingFormat {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Self::Json),
            2 => Ok(Self::Binary),
            other => Err(FrameError::UnknownFormat(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds the frame limit")]
    TooLarge { len: usize },

    #[error("unknown frame format byte {0:#04x}")]
    UnknownFormat(u8),

    #[error("json codec failure: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "bincode_chunks")]
    #[error("binary encode failure: {0}")]
    BinaryEncode(#[from] bincode::error::EncodeError),

    #[cfg(feature = "bincode_chunks")]
    #[error("binary decode failure: {0}")]
    BinaryDecode(#[from] bincode::error::DecodeError),
}

/// Serialize a frame to its on-wire form: length prefix, format byte, payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let (format, payload) = match frame {
        #[cfg(feature = "bincode_chunks")]
        Frame::Chunk(chunk) => (
            EncodingFormat::Binary,
            bincode::encode_to_vec(chunk, bincode::config::standard())?,
        ),
        other => (EncodingFormat::Json, serde_json::to_vec(other)?),
    };
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge { len: payload.len() });
    }
    let mut framed = Vec::with_capacity(4 + 1 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.push(format.as_u8());
    framed.extend_from_slice(&payload);
    Ok(framed)
}

/// Deserialize a received payload according to its format byte.
pub fn decode_payload(format: EncodingFormat, payload: &[u8]) -> Result<Frame, FrameError> {
    match format {
        EncodingFormat::Json => Ok(serde_json::from_slice(payload)?),
        EncodingFormat::Binary => {
            #[cfg(feature = "bincode_chunks")]
            {
                let (chunk, _) = bincode::decode_from_slice(payload, bincode::config::standard())?;
                Ok(Frame::Chunk(chunk))
            }
            #[cfg(not(feature = "bincode_chunks"))]
            {
                Err(FrameError::UnknownFormat(EncodingFormat::Binary.as_u8()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::wire::ChunkFrame;
    use uuid::Uuid;

    #[test]
    fn heartbeat_round_trips_as_json() {
        let encoded = encode_frame(&Frame::Heartbeat).unwrap();
        let len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        assert_eq!(encoded[4], EncodingFormat::Json.as_u8());
        assert_eq!(encoded.len(), 4 + 1 + len);

        let format = EncodingFormat::from_u8(encoded[4]).unwrap();
        let decoded = decode_payload(format, &encoded[5..]).unwrap();
        assert!(matches!(decoded, Frame::Heartbeat));
    }

    #[cfg(feature = "bincode_chunks")]
    #[test]
    fn chunks_ride_the_binary_codec() {
        let chunk = ChunkFrame::new(Uuid::new_v4(), 0, 1, vec![1, 2, 3]);
        let encoded = encode_frame(&Frame::Chunk(chunk.clone())).unwrap();
        assert_eq!(encoded[4], EncodingFormat::Binary.as_u8());

        let decoded = decode_payload(EncodingFormat::Binary, &encoded[5..]).unwrap();
        match decoded {
            Frame::Chunk(back) => assert_eq!(back, chunk),
            other => panic!("expected chunk frame, got {}", other.kind()),
        }
    }

    #[test]
    fn unknown_format_byte_is_rejected() {
        assert!(matches!(
            EncodingFormat::from_u8(9),
            Err(FrameError::UnknownFormat(9))
        ));
    }
}
