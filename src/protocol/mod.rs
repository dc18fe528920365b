//! Wire protocol definitions
//!
//! Frames ride a reliable duplex byte pipe with arbitrary write boundaries,
//! so the format is self-synchronizing: a fixed magic, a declared total
//! length and a CRC over the whole frame. All multi-byte fields are
//! little-endian on the wire.
//!
//! A controller is required to send a channel-setup frame before anything
//! else on a freshly connected pipe instance. The setup flags let a client
//! with limited asynchronous I/O support open two pipe instances and devote
//! one to reads and one to writes; a fully asynchronous client opens a
//! single duplex instance with both flags set.

mod frame;

pub use frame::{
    extract_next_packet, generate_client_id, generate_uid, make_channel_setup,
    make_channel_setup_ack, make_ping, make_socks, make_socks_close,
    make_socks_disconnected, make_status, make_uninstall_self, Frame, FrameBody,
};

use thiserror::Error;

/// Fixed frame signature.
pub const MAGIC: [u8; 4] = [0xE4, 0x85, 0xB4, 0xB2];

/// Frame header size in bytes: magic + len + crc32 + uid + opcode.
pub const HEADER_SIZE: usize = 17;

/// Maximum total frame length, header included.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reserved "invalid" client identifier.
pub const INVALID_CLIENT_ID: u64 = 0;

/// Reserved "invalid" SOCKS session identifier.
pub const INVALID_SOCKS_ID: u64 = 0;

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    ChannelSetup = 1,
    ChannelSetupAck = 2,
    Status = 5,
    Ping = 10,
    Socks = 150,
    SocksClose = 151,
    SocksDisconnected = 152,
    UninstallSelf = 240,
}

/// STATUS payload values
pub const STATUS_OK: u8 = 0;
pub const STATUS_UNSUPPORTED: u8 = 1;

/// Channel-setup flags as declared by the controller.
///
/// The flags describe the *controller's* intended use of the channel; the
/// server applies the inverse mapping (controller-read means server-write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupFlags(u32);

impl SetupFlags {
    pub const READ: u32 = 0x01;
    pub const WRITE: u32 = 0x02;

    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn duplex() -> Self {
        Self(Self::READ | Self::WRITE)
    }

    pub fn read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Frame decode outcomes other than success.
///
/// Every variant except `Incomplete` is fatal to the originating channel.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// No frame magic anywhere in the buffer; everything was discarded.
    #[error("no frame magic in buffer")]
    Garbage,

    /// Not enough bytes yet for a whole frame; retained from the magic on.
    #[error("frame incomplete")]
    Incomplete,

    /// Frame size does not match what the opcode requires.
    #[error("unexpected frame size for opcode")]
    Malformed,

    /// Declared length exceeds the frame size cap.
    #[error("declared frame length exceeds limit")]
    TooBig,

    /// CRC-32 verification failed.
    #[error("frame checksum mismatch")]
    CrcMismatch,
}
