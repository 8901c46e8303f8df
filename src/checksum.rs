//! One's-complement checksum arithmetic for IPv4 headers and UDP datagrams,
//! per IETF-RFC-768 / IETF-RFC-1071.
//!
//! Checksums are fully computed once per frame template; the senders then
//! maintain them incrementally. A template stores the bitwise complement of
//! its own checksum field as the starting sum, and each transmission adds
//! only the words it rewrote (ports, counter, replayed 4-tuple) before
//! folding and complementing again. All arithmetic reads 16-bit words
//! big-endian from the buffer, so the independently computed checksum over
//! the final frame bytes always matches the stored one.

/// Sum `data` as big-endian 16-bit words, returning the unfolded
/// accumulator. An odd trailing byte is taken as the high half of a final
/// word, following IETF-RFC-1071 section 4.1.
pub fn ones_sum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;

    for (i, x) in data.iter().enumerate() {
        if i % 2 == 0 {
            sum += (*x as u32) << 8;
        } else {
            sum += *x as u32;
        };
    }

    sum
}

/// Fold the accumulator from a [u32] to a [u16] and take the one's
/// complement. The carries wrap around until the value fits in 16 bits;
/// two rounds suffice for any sum a frame-sized buffer can produce, but
/// the loop makes no such assumption.
pub fn finalize(mut sum: u32) -> u16 {
    loop {
        let carry = sum >> 16;
        if carry == 0 {
            return !(sum as u16);
        }
        sum = (sum & 0xffff) + carry;
    }
}

/// Fold and complement an accumulator into a UDP checksum. A transmitted
/// zero means "no checksum is used" (IETF-RFC-768), so a sum that
/// complements to zero is sent as 0xFFFF instead.
pub fn udp_finalize(sum: u32) -> u16 {
    let mut sum = sum;

    sum = ((sum & 0xffff_0000) >> 16) + (sum & 0xffff);
    sum = ((sum & 0xffff_0000) >> 16) + (sum & 0xffff);

    let chksum = !(sum as u16);
    if chksum == 0 {
        0xffff
    } else {
        chksum
    }
}

/// Calculate an IP-style checksum over `data`, e.g. a 20-byte IPv4 header
/// whose checksum field holds zero.
pub fn calc_ip_checksum(data: &[u8]) -> u16 {
    finalize(ones_sum(data))
}

/// Full UDP checksum for an IPv4 datagram. `udp` covers the UDP header
/// (checksum field zeroed) and payload.
pub fn udp_checksum_v4(src: &[u8; 4], dst: &[u8; 4], udp: &[u8]) -> u16 {
    let mut sum = ones_sum(src) + ones_sum(dst);
    sum += 0x0011; // zero byte + protocol number
    sum += udp.len() as u32;
    sum += ones_sum(udp);

    udp_finalize(sum)
}

/// Full UDP checksum for an IPv6 datagram. `udp` covers the UDP header
/// (checksum field zeroed) and payload.
pub fn udp_checksum_v6(src: &[u8; 16], dst: &[u8; 16], udp: &[u8]) -> u16 {
    let mut sum = ones_sum(src) + ones_sum(dst);
    sum += 0x0011; // next header, after three zero bytes
    sum += udp.len() as u32;
    sum += ones_sum(udp);

    udp_finalize(sum)
}

/// The incremental starting value taken from a finished template: the
/// uncomplemented sum of everything in the frame, i.e. the bitwise
/// complement of the checksum stored in it.
pub fn incremental_seed(stored_checksum: u16) -> u32 {
    (!stored_checksum) as u32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ones_sum_odd_length() {
        // Trailing byte is the high half of the last word
        assert_eq!(ones_sum(&[0x01, 0x02, 0x03]), 0x0102 + 0x0300);
    }

    #[test]
    fn test_finalize_folds_carries() {
        assert_eq!(finalize(0x0001_FFFE), !(0xFFFFu16));
    }

    #[test]
    fn test_udp_zero_becomes_all_ones() {
        // A sum folding to 0xFFFF complements to zero and must be replaced
        assert_eq!(udp_finalize(0xFFFF), 0xFFFF);
        assert_eq!(udp_finalize(0x0001_FFFE), 0xFFFF);
    }

    #[test]
    fn test_incremental_matches_full() {
        // A fabricated 26-byte UDP datagram: header + 18 bytes of payload
        let src = [198, 18, 0, 2];
        let dst = [198, 19, 0, 2];
        let mut udp = [0_u8; 26];
        udp[0..2].copy_from_slice(&0xC020_u16.to_be_bytes());
        udp[2..4].copy_from_slice(&0x0007_u16.to_be_bytes());
        udp[4..6].copy_from_slice(&26_u16.to_be_bytes());
        udp[8..16].copy_from_slice(b"IDENTIFY");
        // udp[16..24] stays zero: the counter placeholder
        udp[24] = 0;
        udp[25] = 1;

        let c0 = udp_checksum_v4(&src, &dst, &udp);

        // Rewrite the counter region the way the sender does per frame, and
        // update incrementally against the zero baseline
        let counter = 0x1122_3344_5566_7788_u64;
        udp[16..24].copy_from_slice(&counter.to_le_bytes());
        let incremental =
            udp_finalize(incremental_seed(c0) + ones_sum(&counter.to_le_bytes()));

        // Full recomputation over the rewritten datagram must agree
        let full = udp_checksum_v4(&src, &dst, &udp);
        assert_eq!(incremental, full);
    }
}
