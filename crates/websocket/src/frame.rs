//! WebSocket frame codec (RFC 6455 Section 5.2-5.3).
//!
//! Frames are the smallest unit of WebSocket communication. The codec is
//! purely functional over byte buffers and has no I/O awareness: the
//! connection feeds it whatever the transport produced and retries once more
//! bytes arrive.
//!
//! - [`encode`]: Serialize a frame, picking the minimal length form and masking
//! - [`decode`]: Streaming parser returning a frame, `Incomplete`, or a [`ProtocolError`]
//! - [`apply_mask`]: Symmetric XOR masking per RFC 6455 Section 5.3

use crate::error::ProtocolError;

/// Largest payload a control frame may carry (RFC 6455 Section 5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcodes per RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parse a 4-bit opcode value.
    ///
    /// Reserved opcodes (0x3-0x7, 0xB-0xF) are a protocol error.
    pub fn from_u8(byte: u8) -> Result<Opcode, ProtocolError> {
        match byte {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(ProtocolError::UnknownOpcode(byte)),
        }
    }

    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// One frame, with its payload always held unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// FIN bit -- `true` if this is the final fragment of a message.
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    /// Present iff the frame is (or was) masked on the wire.
    pub masking_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A final, unmasked frame with no reserved bits.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Frame {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masking_key: None,
            payload: payload.into(),
        }
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.masking_key = Some(key);
        self
    }

    pub fn is_masked(&self) -> bool {
        self.masking_key.is_some()
    }

    fn rsv_bits(&self) -> u8 {
        (u8::from(self.rsv1) << 6) | (u8::from(self.rsv2) << 5) | (u8::from(self.rsv3) << 4)
    }
}

/// Which endpoint produced the bytes being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    /// Server frames must never be masked.
    Server,
    /// Client frames must always be masked.
    Client,
}

/// Per-connection decoding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub sender: Sender,
    /// Largest payload accepted in a single frame.
    pub max_frame_size: u64,
    /// RSV bits pass through only when an extension was negotiated.
    pub allow_reserved_bits: bool,
}

impl DecodeLimits {
    /// Limits for a client reading what the server sends.
    pub fn from_server(max_frame_size: u64) -> Self {
        DecodeLimits {
            sender: Sender::Server,
            max_frame_size,
            allow_reserved_bits: false,
        }
    }
}

/// Outcome of a successful [`decode`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of bytes it occupied.
    Frame { frame: Frame, consumed: usize },
    /// At least `needed` more bytes are required before anything can be decided.
    Incomplete { needed: usize },
}

/// Apply or remove the 4-byte XOR mask on a payload.
///
/// The operation is symmetric: applying the mask twice returns the original.
/// Per RFC 6455 Section 5.3.
pub fn apply_mask(payload: &mut [u8], mask_key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Serialize a frame to wire bytes.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(14 + frame.payload.len());
    encode_into(frame, &mut out)?;
    Ok(out)
}

/// Serialize a frame, appending to `out`.
///
/// Uses the smallest of the three payload length encodings that fits. When
/// the frame carries a masking key the payload is XORed on the way out; the
/// frame itself is left untouched.
pub fn encode_into(frame: &Frame, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let len = frame.payload.len();
    if frame.opcode.is_control() {
        if len > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFrameTooLarge(len));
        }
        if !frame.fin {
            return Err(ProtocolError::FragmentedControlFrame);
        }
    }

    // Byte 0: FIN(1) RSV(3) Opcode(4)
    let fin = if frame.fin { 0x80 } else { 0x00 };
    out.push(fin | frame.rsv_bits() | frame.opcode as u8);

    // Byte 1: MASK(1) Payload-Length(7), then the extended length if any
    let mask_bit = if frame.is_masked() { 0x80 } else { 0x00 };
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= 0xFFFF {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match frame.masking_key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(&frame.payload);
            apply_mask(&mut out[start..], &key);
        }
        None => out.extend_from_slice(&frame.payload),
    }
    Ok(())
}

/// Parse one frame from the front of `buf`.
///
/// Never consumes anything on `Incomplete`; the caller keeps buffering and
/// calls again. Violations are reported as soon as the bytes that reveal
/// them are available, so an oversized or masked frame is rejected before
/// its payload arrives.
pub fn decode(buf: &[u8], limits: &DecodeLimits) -> Result<Decoded, ProtocolError> {
    if buf.len() < 2 {
        return Ok(Decoded::Incomplete {
            needed: 2 - buf.len(),
        });
    }

    let fin = buf[0] & 0x80 != 0;
    let rsv = buf[0] & 0x70;
    if rsv != 0 && !limits.allow_reserved_bits {
        return Err(ProtocolError::ReservedBitsSet);
    }
    let opcode = Opcode::from_u8(buf[0] & 0x0F)?;

    let masked = buf[1] & 0x80 != 0;
    match (limits.sender, masked) {
        (Sender::Server, true) => return Err(ProtocolError::MaskedServerFrame),
        (Sender::Client, false) => return Err(ProtocolError::UnmaskedClientFrame),
        _ => {}
    }
    if opcode.is_control() && !fin {
        return Err(ProtocolError::FragmentedControlFrame);
    }

    // Payload length: 3 encodings per RFC 6455 Section 5.2
    let length_byte = buf[1] & 0x7F;
    let (payload_len, mut offset) = match length_byte {
        126 => {
            if buf.len() < 4 {
                return Ok(Decoded::Incomplete {
                    needed: 4 - buf.len(),
                });
            }
            let len = u64::from(u16::from_be_bytes([buf[2], buf[3]]));
            if len <= 125 {
                return Err(ProtocolError::NonMinimalLength(len));
            }
            (len, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(Decoded::Incomplete {
                    needed: 10 - buf.len(),
                });
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(ProtocolError::LengthOverflow);
            }
            if len <= 0xFFFF {
                return Err(ProtocolError::NonMinimalLength(len));
            }
            (len, 10)
        }
        n => (u64::from(n), 2),
    };

    if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
        return Err(ProtocolError::ControlFrameTooLarge(payload_len as usize));
    }
    if payload_len > limits.max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            len: payload_len,
            max: limits.max_frame_size,
        });
    }

    let masking_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(Decoded::Incomplete {
                needed: offset + 4 - buf.len(),
            });
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[offset..offset + 4]);
        offset += 4;
        Some(key)
    } else {
        None
    };

    let payload_len = usize::try_from(payload_len).map_err(|_| ProtocolError::FrameTooLarge {
        len: payload_len,
        max: limits.max_frame_size,
    })?;
    let total = offset + payload_len;
    if buf.len() < total {
        return Ok(Decoded::Incomplete {
            needed: total - buf.len(),
        });
    }

    let mut payload = buf[offset..total].to_vec();
    if let Some(key) = masking_key {
        apply_mask(&mut payload, &key);
    }

    Ok(Decoded::Frame {
        frame: Frame {
            fin,
            rsv1: rsv & 0x40 != 0,
            rsv2: rsv & 0x20 != 0,
            rsv3: rsv & 0x10 != 0,
            opcode,
            masking_key,
            payload,
        },
        consumed: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = 1 << 20;

    fn server() -> DecodeLimits {
        DecodeLimits::from_server(LIMIT)
    }

    fn decode_frame(bytes: &[u8]) -> (Frame, usize) {
        match decode(bytes, &server()).unwrap() {
            Decoded::Frame { frame, consumed } => (frame, consumed),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_mask_roundtrip() {
        let original = b"Hello".to_vec();
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut masked = original.clone();
        apply_mask(&mut masked, &key);
        assert_ne!(masked, original, "masked should differ from original");
        apply_mask(&mut masked, &key);
        assert_eq!(masked, original, "unmasked should equal original");
    }

    #[test]
    fn test_opcode_classes() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(!Opcode::Continuation.is_control());
    }

    #[test]
    fn test_encode_rfc_masked_hello() {
        // RFC 6455 Section 5.7: single-frame masked text message "Hello"
        let frame = Frame::new(Opcode::Text, "Hello").with_mask([0x37, 0xfa, 0x21, 0x3d]);
        let bytes = encode(&frame).unwrap();
        assert_eq!(
            bytes,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
        // The frame keeps its plaintext payload.
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_decode_7bit_text_frame() {
        let (frame, consumed) = decode_frame(&[0x81, 0x02, b'H', b'i']);
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"Hi");
        assert_eq!(consumed, 4);
        assert!(!frame.is_masked());
    }

    #[test]
    fn test_decode_16bit_length() {
        let payload = vec![0xABu8; 200];
        let mut bytes = vec![0x82, 126];
        bytes.extend_from_slice(&200u16.to_be_bytes());
        bytes.extend_from_slice(&payload);

        let (frame, consumed) = decode_frame(&bytes);
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(frame.payload, payload);
        assert_eq!(consumed, 204);
    }

    #[test]
    fn test_decode_64bit_length() {
        let payload = vec![0xCDu8; 70_000];
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&70_000u64.to_be_bytes());
        bytes.extend_from_slice(&payload);

        let (frame, consumed) = decode_frame(&bytes);
        assert_eq!(frame.payload.len(), 70_000);
        assert_eq!(consumed, 70_010);
    }

    #[test]
    fn test_encode_length_forms() {
        let small = encode(&Frame::new(Opcode::Binary, vec![0u8; 125])).unwrap();
        assert_eq!(small[1], 125);
        assert_eq!(small.len(), 2 + 125);

        let medium = encode(&Frame::new(Opcode::Binary, vec![0u8; 126])).unwrap();
        assert_eq!(medium[1], 126);
        assert_eq!(&medium[2..4], &126u16.to_be_bytes());

        let large = encode(&Frame::new(Opcode::Binary, vec![0u8; 65_536])).unwrap();
        assert_eq!(large[1], 127);
        assert_eq!(&large[2..10], &65_536u64.to_be_bytes());
    }

    #[test]
    fn test_decode_incomplete_reports_needed_bytes() {
        assert_eq!(
            decode(&[0x81], &server()).unwrap(),
            Decoded::Incomplete { needed: 1 }
        );
        assert_eq!(
            decode(&[0x82, 126, 0x01], &server()).unwrap(),
            Decoded::Incomplete { needed: 1 }
        );
        assert_eq!(
            decode(&[0x81, 0x05, b'H', b'e'], &server()).unwrap(),
            Decoded::Incomplete { needed: 3 }
        );
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let bytes = [0x89, 0x00, 0x81, 0x01, b'x'];
        let (frame, consumed) = decode_frame(&bytes);
        assert_eq!(frame.opcode, Opcode::Ping);
        assert_eq!(consumed, 2);
        let (next, _) = decode_frame(&bytes[consumed..]);
        assert_eq!(next.payload, b"x");
    }

    #[test]
    fn test_unknown_opcode() {
        let err = decode(&[0x83, 0x00], &server()).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownOpcode(0x3));
    }

    #[test]
    fn test_nonzero_rsv_rejected() {
        let err = decode(&[0xC1, 0x00], &server()).unwrap_err();
        assert_eq!(err, ProtocolError::ReservedBitsSet);
    }

    #[test]
    fn test_rsv_passthrough_with_extension() {
        let limits = DecodeLimits {
            allow_reserved_bits: true,
            ..server()
        };
        match decode(&[0xC1, 0x01, b'z'], &limits).unwrap() {
            Decoded::Frame { frame, .. } => {
                assert!(frame.rsv1);
                assert!(!frame.rsv2);
                assert_eq!(frame.payload, b"z");
            }
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_masked_server_frame_rejected() {
        let bytes = encode(&Frame::new(Opcode::Text, "Hi").with_mask([1, 2, 3, 4])).unwrap();
        assert_eq!(
            decode(&bytes, &server()).unwrap_err(),
            ProtocolError::MaskedServerFrame
        );
        // Rejected from the header alone.
        assert_eq!(
            decode(&bytes[..2], &server()).unwrap_err(),
            ProtocolError::MaskedServerFrame
        );
    }

    #[test]
    fn test_client_sender_unmasks() {
        let limits = DecodeLimits {
            sender: Sender::Client,
            ..server()
        };
        let key = [9, 8, 7, 6];
        let bytes = encode(&Frame::new(Opcode::Text, "masked").with_mask(key)).unwrap();
        match decode(&bytes, &limits).unwrap() {
            Decoded::Frame { frame, .. } => {
                assert_eq!(frame.payload, b"masked");
                assert_eq!(frame.masking_key, Some(key));
            }
            other => panic!("expected a frame, got {:?}", other),
        }
        let unmasked = encode(&Frame::new(Opcode::Text, "plain")).unwrap();
        assert_eq!(
            decode(&unmasked, &limits).unwrap_err(),
            ProtocolError::UnmaskedClientFrame
        );
    }

    #[test]
    fn test_non_minimal_lengths_rejected() {
        let mut bytes = vec![0x82, 126];
        bytes.extend_from_slice(&5u16.to_be_bytes());
        assert_eq!(
            decode(&bytes, &server()).unwrap_err(),
            ProtocolError::NonMinimalLength(5)
        );

        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&300u64.to_be_bytes());
        assert_eq!(
            decode(&bytes, &server()).unwrap_err(),
            ProtocolError::NonMinimalLength(300)
        );
    }

    #[test]
    fn test_64bit_length_msb_rejected() {
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert_eq!(
            decode(&bytes, &server()).unwrap_err(),
            ProtocolError::LengthOverflow
        );
    }

    #[test]
    fn test_frame_over_limit_rejected_before_payload() {
        let limits = DecodeLimits::from_server(1000);
        let mut bytes = vec![0x82, 126];
        bytes.extend_from_slice(&1001u16.to_be_bytes());
        assert_eq!(
            decode(&bytes, &limits).unwrap_err(),
            ProtocolError::FrameTooLarge {
                len: 1001,
                max: 1000
            }
        );
    }

    #[test]
    fn test_control_frame_limits() {
        let err = encode(&Frame::new(Opcode::Ping, vec![0u8; 126])).unwrap_err();
        assert_eq!(err, ProtocolError::ControlFrameTooLarge(126));

        let err = encode(&Frame::new(Opcode::Pong, "x").with_fin(false)).unwrap_err();
        assert_eq!(err, ProtocolError::FragmentedControlFrame);

        let mut bytes = vec![0x89, 126];
        bytes.extend_from_slice(&200u16.to_be_bytes());
        assert_eq!(
            decode(&bytes, &server()).unwrap_err(),
            ProtocolError::ControlFrameTooLarge(200)
        );

        assert_eq!(
            decode(&[0x09, 0x00], &server()).unwrap_err(),
            ProtocolError::FragmentedControlFrame
        );
    }

    #[test]
    fn test_frame_roundtrip() {
        let original = Frame::new(Opcode::Text, "round-trip test payload").with_fin(false);
        let bytes = encode(&original).unwrap();
        let (frame, consumed) = decode_frame(&bytes);
        assert_eq!(frame, original);
        assert_eq!(consumed, bytes.len());
    }
}
