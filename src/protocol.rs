//! Shared protocol constants for the BiNinja framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"BNJA";
pub const VERSION: u16 = 1;

// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header length: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub const FRAME_HEADER_LEN: usize = 11;

/// Port used when neither the command line nor the config names one
pub const DEFAULT_PORT: u16 = 10000;

// Frame type IDs (keep numeric stable, servers match on them)
pub mod frame {
    // Handshake
    pub const HELLO: u8 = 1;
    pub const HELLO_OK: u8 = 2;
    pub const REFUSED: u8 = 3;
    pub const SESSION_KEY: u8 = 4;

    // Channel multiplexing
    // Every channel frame starts with the channel id (u32 LE)
    pub const CHANNEL_OPEN: u8 = 10;
    pub const CHANNEL_ACCEPT: u8 = 11;
    pub const CHANNEL_DECLINE: u8 = 12;
    pub const CHANNEL_DATA: u8 = 13;
    pub const CHANNEL_CLOSE: u8 = 14;

    // Orderly shutdown of the whole connection
    pub const CLOSE: u8 = 20;

    pub fn is_channel_frame(t: u8) -> bool {
        (CHANNEL_OPEN..=CHANNEL_CLOSE).contains(&t)
    }
}

/// Role byte carried by HELLO
pub mod role {
    pub const CLIENT: u8 = 1;
}

/// Packet families a channel can be declared for
pub mod family {
    pub const DOWNLOAD: u8 = 1;
}

/// Download packet tags (first byte of a CHANNEL_DATA packet)
pub mod download_tag {
    pub const REQUEST: u8 = 1;
    pub const HEADER: u8 = 2;
    pub const READY: u8 = 3;
    pub const DATA: u8 = 4;
    pub const FINISH: u8 = 5;
    pub const CANCEL: u8 = 6;
}

// Centralized timeout defaults, overridable via ClientConfig
pub mod timeouts {
    // Connection establishment incl. handshake (ms)
    pub const CONNECT_MS: u64 = 8000;

    // Orderly connection close (ms)
    pub const CLOSE_MS: u64 = 8000;

    // Virtual channel establishment (ms)
    pub const CHANNEL_MS: u64 = 8000;

    // Download header request/response (ms)
    pub const HEADER_MS: u64 = 12000;
}

/// Writer slices payloads into pieces of this size and checks for
/// cancellation between them.
pub const WRITE_SLICE: usize = 64 * 1024;

/// Default handoff queue bound, in chunks
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
