//! Test-frame template factory.
//!
//! Templates are complete Ethernet + IP + UDP frames whose UDP payload
//! opens with the 8-byte magic `"IDENTIFY"`, followed by an 8-byte
//! little-endian counter placeholder and a deterministic filler. Checksums
//! are fully computed here, once; the send loops afterwards only patch the
//! counter, the varying port words and (for stateful replay) the 4-tuple,
//! updating the UDP checksum incrementally from the seed captured at build
//! time.
//!
//! Every template exists in [`N`](crate::N) rotating copies so that a
//! buffer is never rewritten while the NIC may still be transmitting it:
//! on iteration `i` only slot `i % N` is touched, which by then is past its
//! last transmission for any transmit window of depth `<= N`.

use crate::checksum::{calc_ip_checksum, incremental_seed, udp_checksum_v4, udp_checksum_v6};
use crate::enet::{EtherType, EthernetHeader};
use crate::ip::{IpV4Header, IpV6Header, Protocol, VersionAndHeaderLength, DSCP};
use crate::nic::{Mempool, PktBuf};
use crate::udp::UdpHeader;
use crate::variator::VarMode;
use crate::{ByteStruct, ByteStructLen, IpV4Addr, IpV6Addr, MacAddr, N};

use static_assertions::const_assert_eq;

/// Length of the Ethernet CRC, excluded from every buffer built here.
pub const ETHER_CRC_LEN: usize = 4;

/// Identification of the test frames: first eight payload bytes.
pub const MAGIC: [u8; 8] = *b"IDENTIFY";

/// Source port of RFC 2544 appendix C.2.6.4 Test Frames.
pub const RFC2544_SPORT: u16 = 0xC020;
/// Destination port of RFC 2544 appendix C.2.6.4 Test Frames.
pub const RFC2544_DPORT: u16 = 0x0007;

// Offsets from the start of the Ethernet frame. These are wire contract:
// the receive path reads them on frames produced by foreign testers too.
pub const ETHERTYPE_OFFSET: usize = 12;
pub const V4_PROTO_OFFSET: usize = 23;
pub const V6_NEXT_HEADER_OFFSET: usize = 20;
pub const V4_HEADER_OFFSET: usize = 14;
pub const V4_CHECKSUM_OFFSET: usize = 24;
pub const V4_SRC_OFFSET: usize = 26;
pub const V4_DST_OFFSET: usize = 30;
pub const V4_SPORT_OFFSET: usize = 34;
pub const V4_DPORT_OFFSET: usize = 36;
pub const V4_UDP_CHECKSUM_OFFSET: usize = 40;
pub const V4_MAGIC_OFFSET: usize = 42;
pub const V4_COUNTER_OFFSET: usize = 50;
pub const V6_SPORT_OFFSET: usize = 54;
pub const V6_DPORT_OFFSET: usize = 56;
pub const V6_UDP_CHECKSUM_OFFSET: usize = 60;
pub const V6_MAGIC_OFFSET: usize = 62;
pub const V6_COUNTER_OFFSET: usize = 70;

// The offsets above must stay consistent with the header definitions.
const_assert_eq!(
    V4_SPORT_OFFSET,
    EthernetHeader::BYTE_LEN + IpV4Header::BYTE_LEN
);
const_assert_eq!(
    V6_SPORT_OFFSET,
    EthernetHeader::BYTE_LEN + IpV6Header::BYTE_LEN
);
const_assert_eq!(V4_MAGIC_OFFSET, V4_SPORT_OFFSET + UdpHeader::BYTE_LEN);
const_assert_eq!(V6_MAGIC_OFFSET, V6_SPORT_OFFSET + UdpHeader::BYTE_LEN);
const_assert_eq!(V4_COUNTER_OFFSET, V4_MAGIC_OFFSET + MAGIC.len());
const_assert_eq!(V6_COUNTER_OFFSET, V6_MAGIC_OFFSET + MAGIC.len());

/// The smallest buffer (CRC already excluded) that still holds the magic
/// and the counter, per IP version.
pub const V4_MIN_LEN: usize = V4_COUNTER_OFFSET + 8;
pub const V6_MIN_LEN: usize = V6_COUNTER_OFFSET + 8;

/// Byte positions of the fields a send loop rewrites, resolved once per
/// template by IP version.
#[derive(Clone, Copy, Debug)]
pub struct FrameOffsets {
    pub sport: usize,
    pub dport: usize,
    pub udp_checksum: usize,
    pub counter: usize,
}

pub const V4_OFFSETS: FrameOffsets = FrameOffsets {
    sport: V4_SPORT_OFFSET,
    dport: V4_DPORT_OFFSET,
    udp_checksum: V4_UDP_CHECKSUM_OFFSET,
    counter: V4_COUNTER_OFFSET,
};

pub const V6_OFFSETS: FrameOffsets = FrameOffsets {
    sport: V6_SPORT_OFFSET,
    dport: V6_DPORT_OFFSET,
    udp_checksum: V6_UDP_CHECKSUM_OFFSET,
    counter: V6_COUNTER_OFFSET,
};

/// Fill a UDP payload: magic, zeroed counter placeholder, then
/// `data[i] = i mod 256`.
pub fn write_test_payload(data: &mut [u8]) {
    data[..8].copy_from_slice(&MAGIC);
    data[8..16].fill(0);
    for (i, b) in data[16..].iter_mut().enumerate() {
        *b = i as u8;
    }
}

/// Build one IPv4 test frame of exactly `length` bytes (CRC excluded) with
/// the given addresses and ports. Returns `None` when the pool is
/// exhausted, which callers treat as fatal.
#[allow(clippy::too_many_arguments)]
pub fn build_frame_v4(
    pool: &mut Mempool,
    length: usize,
    dst_mac: MacAddr,
    src_mac: MacAddr,
    src_ip: IpV4Addr,
    dst_ip: IpV4Addr,
    sport: u16,
    dport: u16,
) -> Option<PktBuf> {
    debug_assert!(length >= V4_MIN_LEN);
    let mut buf = pool.alloc(length)?;

    let eth = EthernetHeader {
        dst_macaddr: dst_mac,
        src_macaddr: src_mac,
        ethertype: EtherType::IPV4,
    };
    eth.write_bytes(&mut buf[..EthernetHeader::BYTE_LEN]);

    let ip_length = length - EthernetHeader::BYTE_LEN;
    let ip = IpV4Header {
        version_and_length: VersionAndHeaderLength::new()
            .with_version(4)
            .with_header_length((IpV4Header::BYTE_LEN / 4) as u8),
        dscp: DSCP::Standard,
        total_length: ip_length as u16,
        identification: 0,
        fragmentation: 0,
        time_to_live: 0x40,
        protocol: Protocol::Udp,
        checksum: 0,
        src_ipaddr: src_ip,
        dst_ipaddr: dst_ip,
    };
    ip.write_bytes(&mut buf[V4_HEADER_OFFSET..V4_SPORT_OFFSET]);

    let udp_length = ip_length - IpV4Header::BYTE_LEN; // no IP options are used
    let udp = UdpHeader {
        src_port: sport,
        dst_port: dport,
        length: udp_length as u16,
        checksum: 0,
    };
    udp.write_bytes(&mut buf[V4_SPORT_OFFSET..V4_MAGIC_OFFSET]);

    write_test_payload(&mut buf[V4_MAGIC_OFFSET..]);

    let udp_checksum = udp_checksum_v4(&src_ip.0, &dst_ip.0, &buf[V4_SPORT_OFFSET..]);
    buf[V4_UDP_CHECKSUM_OFFSET..V4_UDP_CHECKSUM_OFFSET + 2]
        .copy_from_slice(&udp_checksum.to_be_bytes());

    let header_checksum = calc_ip_checksum(&buf[V4_HEADER_OFFSET..V4_SPORT_OFFSET]);
    buf[V4_CHECKSUM_OFFSET..V4_CHECKSUM_OFFSET + 2]
        .copy_from_slice(&header_checksum.to_be_bytes());

    Some(buf)
}

/// Build one IPv6 test frame of exactly `length` bytes (CRC excluded).
/// IPv6 has no header checksum.
#[allow(clippy::too_many_arguments)]
pub fn build_frame_v6(
    pool: &mut Mempool,
    length: usize,
    dst_mac: MacAddr,
    src_mac: MacAddr,
    src_ip: IpV6Addr,
    dst_ip: IpV6Addr,
    sport: u16,
    dport: u16,
) -> Option<PktBuf> {
    debug_assert!(length >= V6_MIN_LEN);
    let mut buf = pool.alloc(length)?;

    let eth = EthernetHeader {
        dst_macaddr: dst_mac,
        src_macaddr: src_mac,
        ethertype: EtherType::IPV6,
    };
    eth.write_bytes(&mut buf[..EthernetHeader::BYTE_LEN]);

    let payload_length = length - EthernetHeader::BYTE_LEN - IpV6Header::BYTE_LEN;
    let ip = IpV6Header {
        version_class_flow: IpV6Header::VERSION_6,
        payload_length: payload_length as u16,
        next_header: Protocol::Udp,
        hop_limit: 0x40,
        src_ipaddr: src_ip,
        dst_ipaddr: dst_ip,
    };
    ip.write_bytes(&mut buf[EthernetHeader::BYTE_LEN..V6_SPORT_OFFSET]);

    let udp = UdpHeader {
        src_port: sport,
        dst_port: dport,
        length: payload_length as u16,
        checksum: 0,
    };
    udp.write_bytes(&mut buf[V6_SPORT_OFFSET..V6_MAGIC_OFFSET]);

    write_test_payload(&mut buf[V6_MAGIC_OFFSET..]);

    let udp_checksum = udp_checksum_v6(&src_ip.0, &dst_ip.0, &buf[V6_SPORT_OFFSET..]);
    buf[V6_UDP_CHECKSUM_OFFSET..V6_UDP_CHECKSUM_OFFSET + 2]
        .copy_from_slice(&udp_checksum.to_be_bytes());

    Some(buf)
}

/// Port value for a template whose port field may be rewritten later: zero
/// if the mode varies (so incremental checksum updates add against a zero
/// baseline), the canonical RFC 2544 value otherwise.
fn template_port(mode: VarMode, canonical: u16) -> u16 {
    if mode.is_varying() {
        0
    } else {
        canonical
    }
}

/// A ring of `N` identical template copies together with the incremental
/// checksum seed and field offsets shared by all of them.
pub struct TemplateSlots {
    bufs: Vec<PktBuf>,
    seed: u32,
    offsets: FrameOffsets,
}

impl TemplateSlots {
    fn from_first(pool: &mut Mempool, first: PktBuf, offsets: FrameOffsets) -> Option<Self> {
        let stored = u16::from_be_bytes([
            first[offsets.udp_checksum],
            first[offsets.udp_checksum + 1],
        ]);
        let mut bufs = Vec::with_capacity(N);
        for _ in 1..N {
            let mut copy = pool.alloc(first.len())?;
            copy.copy_from_slice(&first);
            bufs.push(copy);
        }
        bufs.push(first);
        Some(TemplateSlots {
            bufs,
            seed: incremental_seed(stored),
            offsets,
        })
    }

    /// IPv4 test-frame ring; ports follow the var-mode convention of
    /// [`template_port`].
    #[allow(clippy::too_many_arguments)]
    pub fn ipv4(
        pool: &mut Mempool,
        length: usize,
        dst_mac: MacAddr,
        src_mac: MacAddr,
        src_ip: IpV4Addr,
        dst_ip: IpV4Addr,
        var_sport: VarMode,
        var_dport: VarMode,
    ) -> Option<Self> {
        let first = build_frame_v4(
            pool,
            length,
            dst_mac,
            src_mac,
            src_ip,
            dst_ip,
            template_port(var_sport, RFC2544_SPORT),
            template_port(var_dport, RFC2544_DPORT),
        )?;
        Self::from_first(pool, first, V4_OFFSETS)
    }

    /// IPv4 ring with explicit addresses and ports, nothing reinterpreted:
    /// used by the replay sender when a single learned 4-tuple is baked
    /// into the template for the whole test.
    #[allow(clippy::too_many_arguments)]
    pub fn ipv4_final(
        pool: &mut Mempool,
        length: usize,
        dst_mac: MacAddr,
        src_mac: MacAddr,
        src_ip: IpV4Addr,
        dst_ip: IpV4Addr,
        sport: u16,
        dport: u16,
    ) -> Option<Self> {
        let first = build_frame_v4(
            pool, length, dst_mac, src_mac, src_ip, dst_ip, sport, dport,
        )?;
        Self::from_first(pool, first, V4_OFFSETS)
    }

    /// IPv4 ring with every replayed field zeroed: addresses and ports are
    /// rewritten per frame from the state table, so their checksum baseline
    /// must be zero.
    pub fn ipv4_replay(
        pool: &mut Mempool,
        length: usize,
        dst_mac: MacAddr,
        src_mac: MacAddr,
    ) -> Option<Self> {
        let first = build_frame_v4(
            pool,
            length,
            dst_mac,
            src_mac,
            IpV4Addr::ANY,
            IpV4Addr::ANY,
            0,
            0,
        )?;
        Self::from_first(pool, first, V4_OFFSETS)
    }

    /// IPv6 test-frame ring; ports follow the var-mode convention of
    /// [`template_port`].
    #[allow(clippy::too_many_arguments)]
    pub fn ipv6(
        pool: &mut Mempool,
        length: usize,
        dst_mac: MacAddr,
        src_mac: MacAddr,
        src_ip: IpV6Addr,
        dst_ip: IpV6Addr,
        var_sport: VarMode,
        var_dport: VarMode,
    ) -> Option<Self> {
        let first = build_frame_v6(
            pool,
            length,
            dst_mac,
            src_mac,
            src_ip,
            dst_ip,
            template_port(var_sport, RFC2544_SPORT),
            template_port(var_dport, RFC2544_DPORT),
        )?;
        Self::from_first(pool, first, V6_OFFSETS)
    }

    /// Uncomplemented checksum of the pristine template.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Field offsets for this template's IP version.
    pub fn offsets(&self) -> FrameOffsets {
        self.offsets
    }

    /// One rotation slot, ready to transmit.
    pub fn frame(&self, slot: usize) -> &[u8] {
        &self.bufs[slot]
    }

    /// Mutable access to one rotation slot.
    pub fn frame_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.bufs[slot]
    }
}
