//! Frame encoding/decoding
//!
//! Wire layout (all multi-byte fields little-endian):
//! ```text
//! +-------------+-------------+-------------+-------------+--------+---------+
//! |  magic (4)  |   len (4)   |  crc32 (4)  |   uid (4)   | op (1) | payload |
//! +-------------+-------------+-------------+-------------+--------+---------+
//! ```
//!
//! `len` is the total frame length including the header. `crc32` is the zlib
//! CRC-32 of the whole frame computed with this field zeroed. `uid`
//! correlates a request with its response; 0 is reserved for unsolicited
//! responses.

use super::{DecodeError, Opcode, SetupFlags, HEADER_SIZE, MAGIC, MAX_FRAME_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use std::sync::OnceLock;
use std::time::Instant;

/// Payload size of a CHANNEL_SETUP frame: client_id + flags.
const SETUP_PAYLOAD_SIZE: usize = 8 + 4;

/// Payload size of a CHANNEL_SETUP_ACK frame: client_id.
const SETUP_ACK_PAYLOAD_SIZE: usize = 8;

/// Leading payload size of the SOCKS family of frames: socks_id.
const SOCKS_HEADER_PAYLOAD_SIZE: usize = 8;

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request/response correlation tag.
    pub uid: u32,
    /// Opcode-specific content.
    pub body: FrameBody,
}

/// Opcode-specific frame content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    ChannelSetup { client_id: u64, flags: SetupFlags },
    ChannelSetupAck { client_id: u64 },
    Status { status: u8 },
    Ping,
    Socks { socks_id: u64, payload: Bytes },
    SocksClose { socks_id: u64 },
    SocksDisconnected { socks_id: u64 },
    UninstallSelf,
    /// An opcode this side does not know. Decodes successfully so the worker
    /// can answer STATUS{unsupported} instead of dropping the channel.
    Unknown { opcode: u8 },
}

fn ticks_now() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Generate a frame uid: a ticks-based low word mixed with a random high
/// word. Never 0 and never all-ones.
pub fn generate_uid() -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let now = ticks_now() as u32;
        let shuffle: u32 = rng.gen();
        let uid = (now & 0x0000_F0FF) | (shuffle & 0xFFFF_0F00);
        if uid != 0 && uid != u32::MAX {
            return uid;
        }
    }
}

/// Generate a client identifier: uniform random non-zero 64-bit value.
pub fn generate_client_id() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u64 = rng.gen();
        if id != super::INVALID_CLIENT_ID {
            return id;
        }
    }
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

fn find_magic(stream: &[u8]) -> Option<usize> {
    if stream.len() < MAGIC.len() {
        return None;
    }
    stream.windows(MAGIC.len()).position(|w| w == MAGIC)
}

/// Length of the longest stream suffix that is a proper prefix of the magic.
fn magic_prefix_len(stream: &[u8]) -> usize {
    let max = (MAGIC.len() - 1).min(stream.len());
    for keep in (1..=max).rev() {
        if stream[stream.len() - keep..] == MAGIC[..keep] {
            return keep;
        }
    }
    0
}

/// CRC-32 of a serialized frame, with the crc field treated as zero.
fn frame_crc(frame: &[u8]) -> u32 {
    debug_assert!(frame.len() >= HEADER_SIZE);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame[..8]);
    hasher.update(&[0u8; 4]);
    hasher.update(&frame[12..]);
    hasher.finalize()
}

/// Extract the next frame from `stream`, consuming exactly the bytes the
/// outcome dictates:
///
/// * success — the frame (plus any garbage before its magic) is removed
/// * `Garbage` — no magic anywhere, the buffer is discarded except for a
///   trailing prefix of the magic (a frame may be split inside it)
/// * `Incomplete` — bytes before the magic are discarded, the rest retained
/// * `TooBig` — only the magic is skipped, so scanning can resynchronize
/// * `Malformed` / `CrcMismatch` — the declared `len` bytes are skipped
pub fn extract_next_packet(stream: &mut BytesMut) -> Result<Frame, DecodeError> {
    if stream.is_empty() {
        return Err(DecodeError::Incomplete);
    }

    let pos = match find_magic(stream) {
        Some(pos) => pos,
        None => {
            // a trailing prefix of the magic survives, so a frame split
            // inside its magic by a read boundary still decodes later
            let keep = magic_prefix_len(stream);
            if keep == stream.len() {
                return Err(DecodeError::Incomplete);
            }
            let _ = stream.split_to(stream.len() - keep);
            return Err(DecodeError::Garbage);
        }
    };

    let remaining = stream.len() - pos;
    if remaining < HEADER_SIZE {
        let _ = stream.split_to(pos);
        return Err(DecodeError::Incomplete);
    }

    let buf = &stream[pos..];
    let len = read_u32_le(&buf[4..8]) as usize;
    let crc = read_u32_le(&buf[8..12]);
    let uid = read_u32_le(&buf[12..16]);
    let opcode = buf[16];

    if len > MAX_FRAME_SIZE {
        let _ = stream.split_to(pos + MAGIC.len());
        return Err(DecodeError::TooBig);
    }
    if len < HEADER_SIZE {
        // cannot skip by a length shorter than the header; drop the magic
        // and resynchronize
        let _ = stream.split_to(pos + MAGIC.len());
        return Err(DecodeError::Malformed);
    }
    if len > remaining {
        let _ = stream.split_to(pos);
        return Err(DecodeError::Incomplete);
    }

    let buf = &stream[pos..pos + len];
    if frame_crc(buf) != crc {
        let _ = stream.split_to(pos + len);
        return Err(DecodeError::CrcMismatch);
    }

    let payload_len = len - HEADER_SIZE;
    let body = match decode_body(opcode, &buf[HEADER_SIZE..], payload_len) {
        Ok(body) => body,
        Err(e) => {
            let _ = stream.split_to(pos + len);
            return Err(e);
        }
    };

    let _ = stream.split_to(pos + len);
    Ok(Frame { uid, body })
}

fn decode_body(
    opcode: u8,
    payload: &[u8],
    payload_len: usize,
) -> Result<FrameBody, DecodeError> {
    match opcode {
        x if x == Opcode::ChannelSetup as u8 => {
            if payload_len != SETUP_PAYLOAD_SIZE {
                return Err(DecodeError::Malformed);
            }
            let client_id = read_u64_le(&payload[..8]);
            let flags = read_u32_le(&payload[8..12]);
            Ok(FrameBody::ChannelSetup {
                client_id,
                flags: SetupFlags::new(flags),
            })
        }
        x if x == Opcode::ChannelSetupAck as u8 => {
            if payload_len != SETUP_ACK_PAYLOAD_SIZE {
                return Err(DecodeError::Malformed);
            }
            let client_id = read_u64_le(&payload[..8]);
            Ok(FrameBody::ChannelSetupAck { client_id })
        }
        x if x == Opcode::Status as u8 => {
            if payload_len != 1 {
                return Err(DecodeError::Malformed);
            }
            Ok(FrameBody::Status { status: payload[0] })
        }
        x if x == Opcode::Ping as u8 => {
            if payload_len != 0 {
                return Err(DecodeError::Malformed);
            }
            Ok(FrameBody::Ping)
        }
        x if x == Opcode::Socks as u8 => {
            // at least one SOCKS byte after the session id
            if payload_len < SOCKS_HEADER_PAYLOAD_SIZE + 1 {
                return Err(DecodeError::Malformed);
            }
            let socks_id = read_u64_le(&payload[..8]);
            Ok(FrameBody::Socks {
                socks_id,
                payload: Bytes::copy_from_slice(&payload[8..]),
            })
        }
        x if x == Opcode::SocksClose as u8 || x == Opcode::SocksDisconnected as u8 => {
            if payload_len != SOCKS_HEADER_PAYLOAD_SIZE {
                return Err(DecodeError::Malformed);
            }
            let socks_id = read_u64_le(&payload[..8]);
            if x == Opcode::SocksClose as u8 {
                Ok(FrameBody::SocksClose { socks_id })
            } else {
                Ok(FrameBody::SocksDisconnected { socks_id })
            }
        }
        x if x == Opcode::UninstallSelf as u8 => {
            if payload_len != 0 {
                return Err(DecodeError::Malformed);
            }
            Ok(FrameBody::UninstallSelf)
        }
        other => Ok(FrameBody::Unknown { opcode: other }),
    }
}

/// Serialize a frame: header first with a zeroed crc, payload, then the crc
/// patched in last.
fn make_frame(uid: u32, opcode: u8, payload: &[u8]) -> Bytes {
    let total = HEADER_SIZE + payload.len();
    debug_assert!(total <= MAX_FRAME_SIZE);

    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&MAGIC);
    buf.put_u32_le(total as u32);
    buf.put_u32_le(0); // crc32, patched below
    buf.put_u32_le(uid);
    buf.put_u8(opcode);
    buf.put_slice(payload);

    let crc = frame_crc(&buf);
    buf[8..12].copy_from_slice(&crc.to_le_bytes());
    buf.freeze()
}

/// Build a CHANNEL_SETUP request (controller side; kept for tests and for
/// symmetry with the rest of the constructors).
pub fn make_channel_setup(client_id: u64, flags: SetupFlags) -> Bytes {
    let mut payload = [0u8; SETUP_PAYLOAD_SIZE];
    payload[..8].copy_from_slice(&client_id.to_le_bytes());
    payload[8..12].copy_from_slice(&flags.bits().to_le_bytes());
    make_frame(generate_uid(), Opcode::ChannelSetup as u8, &payload)
}

/// Build a CHANNEL_SETUP_ACK, echoing the request uid.
pub fn make_channel_setup_ack(uid: u32, client_id: u64) -> Bytes {
    make_frame(uid, Opcode::ChannelSetupAck as u8, &client_id.to_le_bytes())
}

/// Build a STATUS reply, echoing the request uid.
pub fn make_status(uid: u32, status: u8) -> Bytes {
    make_frame(uid, Opcode::Status as u8, &[status])
}

/// Build a PING request.
pub fn make_ping() -> Bytes {
    make_frame(generate_uid(), Opcode::Ping as u8, &[])
}

/// Build a SOCKS frame carrying session bytes.
///
/// The session id must be non-zero and the payload non-empty; both are
/// enforced upstream and only debug-asserted here.
pub fn make_socks(socks_id: u64, socks_payload: &[u8]) -> Bytes {
    debug_assert!(socks_id != super::INVALID_SOCKS_ID);
    debug_assert!(!socks_payload.is_empty());

    let mut payload = Vec::with_capacity(SOCKS_HEADER_PAYLOAD_SIZE + socks_payload.len());
    payload.extend_from_slice(&socks_id.to_le_bytes());
    payload.extend_from_slice(socks_payload);
    make_frame(generate_uid(), Opcode::Socks as u8, &payload)
}

/// Build a SOCKS_CLOSE frame.
pub fn make_socks_close(socks_id: u64) -> Bytes {
    debug_assert!(socks_id != super::INVALID_SOCKS_ID);
    make_frame(generate_uid(), Opcode::SocksClose as u8, &socks_id.to_le_bytes())
}

/// Build a SOCKS_DISCONNECTED frame.
pub fn make_socks_disconnected(socks_id: u64) -> Bytes {
    debug_assert!(socks_id != super::INVALID_SOCKS_ID);
    make_frame(
        generate_uid(),
        Opcode::SocksDisconnected as u8,
        &socks_id.to_le_bytes(),
    )
}

/// Build an UNINSTALL_SELF request.
pub fn make_uninstall_self() -> Bytes {
    make_frame(generate_uid(), Opcode::UninstallSelf as u8, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(encoded: &[u8]) -> Result<Frame, DecodeError> {
        let mut stream = BytesMut::from(encoded);
        let res = extract_next_packet(&mut stream);
        if res.is_ok() {
            assert!(stream.is_empty());
        }
        res
    }

    #[test]
    fn test_roundtrip_channel_setup() {
        let encoded = make_channel_setup(0, SetupFlags::duplex());
        let frame = decode_one(&encoded).unwrap();

        assert_ne!(frame.uid, 0);
        assert_eq!(
            frame.body,
            FrameBody::ChannelSetup {
                client_id: 0,
                flags: SetupFlags::duplex()
            }
        );
    }

    #[test]
    fn test_roundtrip_all_frame_kinds() {
        let cases: Vec<(Bytes, FrameBody)> = vec![
            (
                make_channel_setup_ack(7, 0xDEAD_BEEF),
                FrameBody::ChannelSetupAck { client_id: 0xDEAD_BEEF },
            ),
            (make_status(9, super::super::STATUS_OK), FrameBody::Status { status: 0 }),
            (make_ping(), FrameBody::Ping),
            (
                make_socks(42, b"\x05\x01\x00"),
                FrameBody::Socks {
                    socks_id: 42,
                    payload: Bytes::from_static(b"\x05\x01\x00"),
                },
            ),
            (make_socks_close(42), FrameBody::SocksClose { socks_id: 42 }),
            (
                make_socks_disconnected(42),
                FrameBody::SocksDisconnected { socks_id: 42 },
            ),
            (make_uninstall_self(), FrameBody::UninstallSelf),
        ];

        for (encoded, expected) in cases {
            let frame = decode_one(&encoded).unwrap();
            assert_eq!(frame.body, expected);
        }
    }

    #[test]
    fn test_decode_consumes_exactly_frame_len() {
        let first = make_ping();
        let second = make_socks_close(3);

        let mut stream = BytesMut::new();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);

        let before = stream.len();
        let frame = extract_next_packet(&mut stream).unwrap();
        assert_eq!(frame.body, FrameBody::Ping);
        assert_eq!(before - stream.len(), first.len());

        let frame = extract_next_packet(&mut stream).unwrap();
        assert_eq!(frame.body, FrameBody::SocksClose { socks_id: 3 });
        assert!(stream.is_empty());
    }

    #[test]
    fn test_single_bit_flips_never_decode() {
        let encoded = make_socks(1, b"payload");

        for byte_idx in 0..encoded.len() {
            for bit in 0..8 {
                let mut corrupted = encoded.to_vec();
                corrupted[byte_idx] ^= 1 << bit;

                // any flip must yield an error, never a silently-wrong frame
                let res = decode_one(&corrupted);
                assert!(
                    res.is_err(),
                    "flip at byte {} bit {} decoded as {:?}",
                    byte_idx,
                    bit,
                    res
                );
            }
        }
    }

    #[test]
    fn test_garbage_consumes_everything() {
        let mut stream = BytesMut::from(&b"this is definitely not a frame"[..]);
        assert_eq!(extract_next_packet(&mut stream), Err(DecodeError::Garbage));
        assert!(stream.is_empty());
    }

    #[test]
    fn test_resync_after_garbage_prefix() {
        let frame = make_ping();
        let mut stream = BytesMut::new();
        stream.extend_from_slice(b"leading junk without magic");
        stream.extend_from_slice(&frame);

        // prefix garbage is dropped together with the decoded frame
        let decoded = extract_next_packet(&mut stream).unwrap();
        assert_eq!(decoded.body, FrameBody::Ping);
        assert!(stream.is_empty());
    }

    #[test]
    fn test_incomplete_retains_from_magic() {
        let frame = make_socks(5, b"abcdef");
        let cut = frame.len() - 3;

        let mut stream = BytesMut::new();
        stream.extend_from_slice(b"junk");
        stream.extend_from_slice(&frame[..cut]);

        assert_eq!(extract_next_packet(&mut stream), Err(DecodeError::Incomplete));
        assert_eq!(stream.len(), cut); // junk dropped, partial frame kept

        stream.extend_from_slice(&frame[cut..]);
        let decoded = extract_next_packet(&mut stream).unwrap();
        assert_eq!(
            decoded.body,
            FrameBody::Socks {
                socks_id: 5,
                payload: Bytes::from_static(b"abcdef")
            }
        );
    }

    #[test]
    fn test_magic_split_across_reads_survives() {
        let frame = make_ping();
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&frame[..2]); // read boundary inside the magic

        assert_eq!(extract_next_packet(&mut stream), Err(DecodeError::Incomplete));
        assert_eq!(stream.len(), 2);

        stream.extend_from_slice(&frame[2..]);
        let decoded = extract_next_packet(&mut stream).unwrap();
        assert_eq!(decoded.body, FrameBody::Ping);
    }

    #[test]
    fn test_garbage_keeps_trailing_magic_prefix() {
        let frame = make_ping();
        let mut stream = BytesMut::new();
        stream.extend_from_slice(b"junk data");
        stream.extend_from_slice(&frame[..3]); // partial magic at the tail

        assert_eq!(extract_next_packet(&mut stream), Err(DecodeError::Garbage));
        assert_eq!(stream.len(), 3);

        stream.extend_from_slice(&frame[3..]);
        let decoded = extract_next_packet(&mut stream).unwrap();
        assert_eq!(decoded.body, FrameBody::Ping);
    }

    #[test]
    fn test_incomplete_header_retains_from_magic() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(b"xx");
        stream.extend_from_slice(&MAGIC);
        stream.extend_from_slice(&[0u8; 4]); // partial header

        assert_eq!(extract_next_packet(&mut stream), Err(DecodeError::Incomplete));
        assert_eq!(stream.len(), MAGIC.len() + 4);
    }

    #[test]
    fn test_len_at_cap_is_accepted() {
        // a SOCKS frame padded out to exactly the cap
        let payload = vec![0xAB; MAX_FRAME_SIZE - HEADER_SIZE - 8];
        let encoded = make_socks(1, &payload);
        assert_eq!(encoded.len(), MAX_FRAME_SIZE);

        let frame = decode_one(&encoded).unwrap();
        match frame.body {
            FrameBody::Socks { socks_id, payload } => {
                assert_eq!(socks_id, 1);
                assert_eq!(payload.len(), MAX_FRAME_SIZE - HEADER_SIZE - 8);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_len_over_cap_skips_magic_only() {
        let mut encoded = BytesMut::from(&make_ping()[..]);
        let over = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
        encoded[4..8].copy_from_slice(&over);

        let mut stream = BytesMut::from(&encoded[..]);
        let before = stream.len();
        assert_eq!(extract_next_packet(&mut stream), Err(DecodeError::TooBig));
        assert_eq!(before - stream.len(), MAGIC.len());
    }

    #[test]
    fn test_crc_mismatch_skips_declared_len() {
        let mut encoded = make_socks(1, b"abc").to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let tail = make_ping();
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&encoded);
        stream.extend_from_slice(&tail);

        assert_eq!(extract_next_packet(&mut stream), Err(DecodeError::CrcMismatch));
        assert_eq!(stream.len(), tail.len());

        // the stream resynchronizes on the next frame
        let frame = extract_next_packet(&mut stream).unwrap();
        assert_eq!(frame.body, FrameBody::Ping);
    }

    #[test]
    fn test_header_only_frames() {
        // header-only is legal exactly for PING and UNINSTALL_SELF
        assert_eq!(make_ping().len(), HEADER_SIZE);
        assert_eq!(make_uninstall_self().len(), HEADER_SIZE);

        // a STATUS truncated to header-only is malformed
        let mut truncated = BytesMut::new();
        truncated.put_slice(&MAGIC);
        truncated.put_u32_le(HEADER_SIZE as u32);
        truncated.put_u32_le(0);
        truncated.put_u32_le(1);
        truncated.put_u8(Opcode::Status as u8);
        let crc = frame_crc(&truncated);
        truncated[8..12].copy_from_slice(&crc.to_le_bytes());

        let mut stream = BytesMut::from(&truncated[..]);
        assert_eq!(extract_next_packet(&mut stream), Err(DecodeError::Malformed));
        assert!(stream.is_empty());
    }

    #[test]
    fn test_empty_socks_payload_is_malformed() {
        // SOCKS frame with a session id but zero SOCKS bytes
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le((HEADER_SIZE + 8) as u32);
        buf.put_u32_le(0);
        buf.put_u32_le(77);
        buf.put_u8(Opcode::Socks as u8);
        buf.put_u64_le(1); // socks_id, no payload after it
        let crc = frame_crc(&buf);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());

        let mut stream = BytesMut::from(&buf[..]);
        assert_eq!(extract_next_packet(&mut stream), Err(DecodeError::Malformed));
        assert!(stream.is_empty());
    }

    #[test]
    fn test_zero_uid_is_tolerated() {
        // a server-originated unsolicited response carries uid 0; the decoder
        // must not reject it on inbound frames either
        let encoded = make_status(0, 0);
        let frame = decode_one(&encoded).unwrap();
        assert_eq!(frame.uid, 0);
    }

    #[test]
    fn test_unknown_opcode_decodes() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(HEADER_SIZE as u32);
        buf.put_u32_le(0);
        buf.put_u32_le(123);
        buf.put_u8(99);
        let crc = frame_crc(&buf);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());

        let mut stream = BytesMut::from(&buf[..]);
        let frame = extract_next_packet(&mut stream).unwrap();
        assert_eq!(frame.uid, 123);
        assert_eq!(frame.body, FrameBody::Unknown { opcode: 99 });
    }

    #[test]
    fn test_reply_constructors_echo_uid() {
        let uid = 0x1122_3344;
        let ack = decode_one(&make_channel_setup_ack(uid, 1)).unwrap();
        assert_eq!(ack.uid, uid);

        let status = decode_one(&make_status(uid, 1)).unwrap();
        assert_eq!(status.uid, uid);
    }

    #[test]
    fn test_generated_ids_avoid_reserved_values() {
        for _ in 0..1000 {
            let uid = generate_uid();
            assert_ne!(uid, 0);
            assert_ne!(uid, u32::MAX);
            assert_ne!(generate_client_id(), 0);
        }
    }
}
