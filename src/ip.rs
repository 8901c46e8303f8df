//! Internet layer: IPv4 and IPv6 message headers
//!
//! Only what a test-frame generator needs: fixed 20-byte IPv4 headers (no
//! options) and fixed 40-byte IPv6 headers (no extension headers).

use crate::{IpV4Addr, IpV6Addr};

use byte_struct::*;
use modular_bitfield::prelude::*;

/// First byte of the IPv4 header: version in the high nibble, header length
/// (in 32-bit words) in the low nibble.
#[bitfield]
#[derive(Clone, Copy, Debug)]
pub struct VersionAndHeaderLength {
    pub header_length: B4,
    pub version: B4,
}

impl ByteStructLen for VersionAndHeaderLength {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for VersionAndHeaderLength {
    fn read_bytes(bytes: &[u8]) -> Self {
        Self::from_bytes([bytes[0]])
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = (*self).into_bytes()[0];
    }
}

/// IPV4 header per IETF-RFC-791
///
/// https://en.wikipedia.org/wiki/IPv4
///
/// value [0] Version [4 bits], Header Length [4 bits]
///
/// value [1] Type-of-Service/DSCP
///
/// value [2:3] Total Length [u16] in bytes
///
/// value [4:5] Identification [u16]
///
/// value [6:7] Flags [3 bits], Fragmentation Offset [13 bits]
///
/// value [8] Time-to-Live
///
/// value [9] Protocol
///
/// value [10:11] Checksum [u16]
///
/// value [12:15] Source IP Address
///
/// value [16:19] Destination IP Address
#[derive(ByteStruct, Clone, Copy, Debug)]
#[byte_struct_be]
pub struct IpV4Header {
    pub version_and_length: VersionAndHeaderLength,
    pub dscp: DSCP,
    pub total_length: u16,
    pub identification: u16,
    /// Flags and fragment offset; test frames are never fragmented
    pub fragmentation: u16,
    pub time_to_live: u8,
    pub protocol: Protocol,
    pub checksum: u16,
    pub src_ipaddr: IpV4Addr,
    pub dst_ipaddr: IpV4Addr,
}

impl IpV4Header {
    /// Pack into big-endian (network) byte array
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut header_bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut header_bytes);

        header_bytes
    }
}

/// IPV6 header per IETF-RFC-8200
///
/// value [0:3] Version [4 bits], Traffic Class [8 bits], Flow Label [20 bits]
///
/// value [4:5] Payload Length [u16] in bytes, extension headers included
///
/// value [6] Next Header
///
/// value [7] Hop Limit
///
/// value [8:23] Source IP Address
///
/// value [24:39] Destination IP Address
#[derive(ByteStruct, Clone, Copy, Debug)]
#[byte_struct_be]
pub struct IpV6Header {
    /// Version, traffic class and flow label packed into one 32-bit word;
    /// test frames carry version 6 and zeros elsewhere
    pub version_class_flow: u32,
    pub payload_length: u16,
    pub next_header: Protocol,
    pub hop_limit: u8,
    pub src_ipaddr: IpV6Addr,
    pub dst_ipaddr: IpV6Addr,
}

impl IpV6Header {
    /// The version/class/flow word of a plain version-6 header
    pub const VERSION_6: u32 = 6 << 28;

    /// Pack into big-endian (network) byte array
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut header_bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut header_bytes);

        header_bytes
    }
}

/// Common choices of transport-layer protocols and their IP header values.
/// There are many more protocols not listed here.
/// See <https://en.wikipedia.org/wiki/List_of_IP_protocol_numbers>.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Protocol {
    /// Transmission Control Protocol
    Tcp = 0x06,
    /// User Datagram Protocol
    Udp = 0x11,
    /// Unimplemented
    Unimplemented,
}

impl ByteStructLen for Protocol {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for Protocol {
    fn read_bytes(bytes: &[u8]) -> Self {
        return match bytes[0] {
            x if x == (Protocol::Tcp as u8) => Protocol::Tcp,
            x if x == (Protocol::Udp as u8) => Protocol::Udp,
            _ => Protocol::Unimplemented,
        };
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = *self as u8;
    }
}

/// Type-of-Service for networks with differentiated services.
/// See <https://en.wikipedia.org/wiki/Differentiated_services>.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DSCP {
    /// Standard is almost always fine
    Standard = 0,
    /// Realtime is rarely used
    Realtime = 32 << 2,
    /// Catch-all for the many other kinds or invalid bit patterns
    Unimplemented,
}

impl ByteStructLen for DSCP {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for DSCP {
    fn read_bytes(bytes: &[u8]) -> Self {
        return match bytes[0] {
            x if x == (DSCP::Standard as u8) => DSCP::Standard,
            x if x == (DSCP::Realtime as u8) => DSCP::Realtime,
            _ => DSCP::Unimplemented,
        };
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = *self as u8;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::checksum::{calc_ip_checksum, ones_sum};

    #[test]
    fn test_v4_header_checksum_round_trip() {
        let mut header = IpV4Header {
            version_and_length: VersionAndHeaderLength::new()
                .with_version(4)
                .with_header_length((IpV4Header::BYTE_LEN / 4) as u8),
            dscp: DSCP::Standard,
            total_length: 46,
            identification: 0,
            fragmentation: 0,
            time_to_live: 10,
            protocol: Protocol::Udp,
            checksum: 0,
            src_ipaddr: IpV4Addr::new([10, 0, 0, 1]),
            dst_ipaddr: IpV4Addr::new([10, 0, 0, 2]),
        };
        let checksum_pre = calc_ip_checksum(&header.to_be_bytes());
        header.checksum = checksum_pre;

        // A header carrying its own checksum sums to the all-ones word
        assert_eq!(ones_sum(&header.to_be_bytes()) % 0xFFFF, 0);
        assert_eq!(header.to_be_bytes()[0], 0x45);
    }

    #[test]
    fn test_v6_header_layout() {
        let header = IpV6Header {
            version_class_flow: IpV6Header::VERSION_6,
            payload_length: 26,
            next_header: Protocol::Udp,
            hop_limit: 64,
            src_ipaddr: IpV6Addr::ANY,
            dst_ipaddr: IpV6Addr::ANY,
        };
        let bytes = header.to_be_bytes();
        assert_eq!(bytes.len(), 40);
        assert_eq!(bytes[0] >> 4, 6);
        assert_eq!(bytes[6], 0x11);
    }
}
