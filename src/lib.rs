//! A packet delay variation (PDV) tester core for benchmarking stateful and
//! stateless NAT44 / NAT64 gateways per RFC 8219, with RFC 4814 variable
//! port numbers.
//!
//! The crate pairs rate-paced, cycle-counter driven senders with line-rate
//! receivers. Senders pre-build UDP test-frame templates, rewrite only the
//! per-frame counter / port / 4-tuple fields with incremental checksum
//! updates, and record a send timestamp per frame; receivers identify test
//! frames by a payload magic, record a receive timestamp indexed by the
//! in-frame counter, and (for stateful tests) learn 4-tuples into a shared
//! state table that the opposite-direction sender replays. The evaluator
//! turns the paired timestamp vectors into Dmin / Dmax / D99.9 / PDV.
//!
//! The NIC driver layer is not part of this crate: workers are written
//! against the [`nic::PacketTx`] / [`nic::PacketRx`] queue traits, and an
//! in-memory [`loopback`] link is provided for self tests.
//!
//! ```rust
//! use natperf::*;
//!
//! // Build an IPv4 test frame template with the canonical RFC 2544 ports
//! let mut pool = nic::Mempool::new(8);
//! let frame = frame::build_frame_v4(
//!     &mut pool,
//!     60, // frame length on the wire, Ethernet CRC excluded
//!     MacAddr::new([0x02, 0xAF, 0xFF, 0x1A, 0xE5, 0x3C]),
//!     MacAddr::new([0x02, 0xAF, 0xFF, 0x1A, 0xE5, 0x3D]),
//!     IpV4Addr::new([198, 18, 0, 2]),
//!     IpV4Addr::new([198, 19, 0, 2]),
//!     0xC020,
//!     0x0007,
//! )
//! .unwrap();
//!
//! // The payload opens with the 8-byte magic and the counter placeholder
//! assert_eq!(&frame[frame::V4_MAGIC_OFFSET..frame::V4_MAGIC_OFFSET + 8], b"IDENTIFY");
//! assert_eq!(&frame[frame::V4_COUNTER_OFFSET..frame::V4_COUNTER_OFFSET + 8], &[0u8; 8]);
//! ```

pub use byte_struct::{ByteStruct, ByteStructLen};

pub mod checksum;
pub mod config;
pub mod enet; // Link layer
pub mod eval;
pub mod frame;
pub mod ip; // Internet layer
pub mod loopback;
pub mod measure;
pub mod nic;
pub mod receiver;
pub mod sender;
pub mod state;
pub mod tsc;
pub mod udp; // Transport layer
pub mod variator;

use thiserror::Error;

/// Depth of the per-template rotation ring. A template buffer may only be
/// rewritten once its previous transmission has fully completed; rotating
/// through this many copies keeps the writer behind the NIC's transmit
/// window.
pub const N: usize = 8;

/// Receive burst size, in frames.
pub const MAX_PKT_BURST: usize = 32;

/// Transmit descriptor ring depth assumed when sizing packet pools.
pub const PORT_TX_QUEUE_SIZE: usize = 1024;

/// Default schedule-slip threshold: a sender whose total sending time
/// exceeds `duration * tolerance` invalidates the test.
pub const DEFAULT_TOLERANCE: f64 = 1.0001;

/// Standard 6-byte MAC address.
/// Split 24/24 format, Block ID | Device ID .
/// Locally-administered addresses are [0x02, ...], [0x06, ...], [0x0A, ...], [0x0E, ...]
pub type MacAddr = ByteArray<6>;

impl MacAddr {
    /// New from bytes
    pub fn new(v: [u8; 6]) -> Self {
        ByteArray(v)
    }

    /// Broadcast address (all ones)
    pub const BROADCAST: MacAddr = ByteArray([0xFF_u8; 6]);

    /// Any address (all zeroes)
    pub const ANY: MacAddr = ByteArray([0x0_u8; 6]);
}

/// IPV4 address as bytes
pub type IpV4Addr = ByteArray<4>;

impl IpV4Addr {
    /// New from bytes
    pub fn new(v: [u8; 4]) -> Self {
        ByteArray(v)
    }

    /// Any address (all zeroes); also the placeholder written into replay
    /// templates whose addresses are overwritten per frame.
    pub const ANY: IpV4Addr = ByteArray([0x0_u8; 4]);
}

/// IPV6 address as bytes
pub type IpV6Addr = ByteArray<16>;

impl IpV6Addr {
    /// New from bytes
    pub fn new(v: [u8; 16]) -> Self {
        ByteArray(v)
    }

    /// Any address (all zeroes)
    pub const ANY: IpV6Addr = ByteArray([0x0_u8; 16]);
}

/// Newtype for [u8; N] in order to be able to implement traits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ByteArray<const N: usize>(pub [u8; N]);

impl<const N: usize> ByteStructLen for ByteArray<N> {
    const BYTE_LEN: usize = N;
}

impl<const N: usize> ByteStruct for ByteArray<N> {
    fn read_bytes(bytes: &[u8]) -> Self {
        let mut out = [0_u8; N];
        out.copy_from_slice(&bytes[0..N]);
        ByteArray(out)
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[..N].copy_from_slice(&self.0);
    }
}

impl<const N: usize> ByteArray<N> {
    /// Convert to big-endian byte array
    pub fn to_be_bytes(&self) -> [u8; N] {
        self.0
    }
}

/// Everything that can invalidate or abort a measurement. Errors raised
/// inside the hot loops are fatal for the whole test; the coordinator
/// surfaces them and the process exits non-zero.
#[derive(Debug, Error)]
pub enum TestError {
    /// Rejected configuration, reported before any worker starts.
    #[error("Input Error: {0}")]
    Config(String),

    /// The packet memory pool ran dry while building frame templates.
    #[error("{side} sender can't allocate a packet buffer for the test frame")]
    PoolExhausted { side: &'static str },

    /// The sender could not keep up with its pacing target.
    #[error("{side} sending exceeded the {limit:.10} seconds limit, the test is invalid")]
    ScheduleMiss { side: &'static str, limit: f64 },

    /// A received test frame carried a counter at or beyond the number of
    /// frames sent. Indicates a stale or corrupt frame, not loss.
    #[error("{side} received a test frame with invalid counter {counter} (frames in test: {num_frames})")]
    InvalidCounter {
        side: &'static str,
        counter: u64,
        num_frames: u64,
    },

    /// The preliminary phase ended before the state table was full.
    #[error("failed to fill state table (valid entries: {valid}, state table size: {size})")]
    StateTableUnderfill { valid: u64, size: u64 },

    /// A worker thread could not be spawned.
    #[error("could not start {role}: {source}")]
    WorkerSpawn {
        role: &'static str,
        source: std::io::Error,
    },

    /// A worker thread died without reporting a result.
    #[error("{role} worker panicked")]
    WorkerPanicked { role: &'static str },
}
