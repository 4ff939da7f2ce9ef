//! Reliable channel framing: length-prefix (4 bytes LE) + bincode `Envelope`.

use crate::protocol::Envelope;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode an envelope into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(env: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(env).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding an envelope into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame of {0} bytes too large")]
    TooLarge(usize),
}

/// Decode one frame from the front of `bytes`. Returns the envelope and the number of bytes consumed.
/// Call with partial buffer; `NeedMore` means the caller should read more and try again.
/// Any other error means the stream is desynchronized.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let env: Envelope =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((env, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame length {0} exceeds limit")]
    TooLarge(u32),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CorrelationId, Value};

    fn sample_request() -> Envelope {
        Envelope::SyncedRequest {
            correlation_id: CorrelationId::generate(),
            type_tag: "ADD".into(),
            value: Some(Value::encode(&(2u32, 3u32)).unwrap()),
        }
    }

    #[test]
    fn request_survives_framing() {
        let env = sample_request();
        let frame = encode_frame(&env).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, env);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_request()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames_in_order() {
        let a = sample_request();
        let b = Envelope::Payload {
            type_tag: "STATE".into(),
            value: None,
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }

    #[test]
    fn oversized_length_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::TooLarge(_))
        ));
    }

    #[test]
    fn garbage_body_is_decode_error() {
        let mut bytes = 4u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::Decode(_))
        ));
    }
}
