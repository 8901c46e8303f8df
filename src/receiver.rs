//! The line-rate receive workers.
//!
//! A receiver spins on burst-receive until an absolute cycle-counter
//! deadline, set by the coordinator to the senders' expected completion
//! plus the global timeout. Frames are identified by EtherType, the UDP
//! next-protocol byte and the payload magic; everything else on the wire is
//! silently dropped. A matching frame gets a timestamp as early as
//! possible, stored at the index its in-frame counter names - counters are
//! unique, so every slot is written at most once, and a counter at or past
//! the frame count is fatal (a stale or corrupt frame, not loss).
//!
//! The learning variant additionally records the 4-tuple of every IPv4
//! foreground frame at a single-writer cursor that wraps over the state
//! table.

use crate::frame::{
    ETHERTYPE_OFFSET, MAGIC, V4_COUNTER_OFFSET, V4_MAGIC_OFFSET, V4_PROTO_OFFSET,
    V6_COUNTER_OFFSET, V6_MAGIC_OFFSET, V6_NEXT_HEADER_OFFSET,
};
use crate::nic::PacketRx;
use crate::state::{FourTuple, StateTable};
use crate::tsc::rdtsc;
use crate::{TestError, MAX_PKT_BURST};

/// EtherType for IPv4, as it sits on the wire.
const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];
/// EtherType for IPv6, as it sits on the wire.
const ETHERTYPE_IPV6: [u8; 2] = [0x86, 0xDD];

/// Per-direction receiver parameters.
#[derive(Clone, Copy, Debug)]
pub struct ReceiverParams {
    pub side: &'static str,
    /// Absolute cycle-counter deadline
    pub finish_receiving: u64,
    /// Number of frames the paired sender transmits; counter bound and
    /// timestamp-vector length
    pub num_frames: u64,
    /// Non-zero suppresses the received-count line (the count is reported
    /// by the evaluator against the timeout instead)
    pub frame_timeout: u16,
}

fn counter_at(pkt: &[u8], offset: usize) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&pkt[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn is_test_frame_v4(pkt: &[u8]) -> bool {
    pkt.len() >= V4_COUNTER_OFFSET + 8
        && pkt[V4_PROTO_OFFSET] == 0x11
        && pkt[V4_MAGIC_OFFSET..V4_MAGIC_OFFSET + 8] == MAGIC
}

fn is_test_frame_v6(pkt: &[u8]) -> bool {
    pkt.len() >= V6_COUNTER_OFFSET + 8
        && pkt[V6_NEXT_HEADER_OFFSET] == 0x11
        && pkt[V6_MAGIC_OFFSET..V6_MAGIC_OFFSET + 8] == MAGIC
}

/// Plain PDV receiver. Returns the receive-timestamp vector (zero entries
/// mean "never received") and the number of matching frames.
pub fn receive_pdv(
    rx: &mut dyn PacketRx,
    p: &ReceiverParams,
) -> Result<(Vec<u64>, u64), TestError> {
    let mut rec_ts = vec![0_u64; p.num_frames as usize];
    let mut received = 0_u64;
    let mut burst: Vec<Vec<u8>> = Vec::with_capacity(MAX_PKT_BURST);

    while rdtsc() < p.finish_receiving {
        rx.rx_burst(&mut burst);
        for pkt in burst.drain(..) {
            if pkt.len() < ETHERTYPE_OFFSET + 2 {
                continue;
            }
            if pkt[ETHERTYPE_OFFSET..ETHERTYPE_OFFSET + 2] == ETHERTYPE_IPV6 {
                if is_test_frame_v6(&pkt) {
                    let timestamp = rdtsc(); // get a timestamp ASAP
                    let counter = counter_at(&pkt, V6_COUNTER_OFFSET);
                    if counter >= p.num_frames {
                        return Err(TestError::InvalidCounter {
                            side: p.side,
                            counter,
                            num_frames: p.num_frames,
                        });
                    }
                    rec_ts[counter as usize] = timestamp;
                    received += 1;
                }
            } else if pkt[ETHERTYPE_OFFSET..ETHERTYPE_OFFSET + 2] == ETHERTYPE_IPV4
                && is_test_frame_v4(&pkt)
            {
                let timestamp = rdtsc(); // get a timestamp ASAP
                let counter = counter_at(&pkt, V4_COUNTER_OFFSET);
                if counter >= p.num_frames {
                    return Err(TestError::InvalidCounter {
                        side: p.side,
                        counter,
                        num_frames: p.num_frames,
                    });
                }
                rec_ts[counter as usize] = timestamp;
                received += 1;
            }
            // received buffers drop here, returning to their pool
        }
    }

    if p.frame_timeout == 0 {
        println!("{} frames received: {received}", p.side);
    }
    Ok((rec_ts, received))
}

/// Learning PDV receiver: the plain receiver plus 4-tuple capture from
/// IPv4 foreground frames. Keeps updating the state table even during the
/// test phase - the mappings it overwrites are still-valid NAT state.
pub fn learning_receive_pdv(
    rx: &mut dyn PacketRx,
    p: &ReceiverParams,
    table: &StateTable,
) -> Result<(Vec<u64>, u64), TestError> {
    let mut rec_ts = vec![0_u64; p.num_frames as usize];
    let mut fg_received = 0_u64;
    let mut bg_received = 0_u64;
    let mut cursor = 0_usize;
    let mut burst: Vec<Vec<u8>> = Vec::with_capacity(MAX_PKT_BURST);

    while rdtsc() < p.finish_receiving {
        rx.rx_burst(&mut burst);
        for pkt in burst.drain(..) {
            if pkt.len() < ETHERTYPE_OFFSET + 2 {
                continue;
            }
            if pkt[ETHERTYPE_OFFSET..ETHERTYPE_OFFSET + 2] == ETHERTYPE_IPV6 {
                if is_test_frame_v6(&pkt) {
                    let timestamp = rdtsc(); // get a timestamp ASAP
                    let counter = counter_at(&pkt, V6_COUNTER_OFFSET);
                    if counter >= p.num_frames {
                        return Err(TestError::InvalidCounter {
                            side: p.side,
                            counter,
                            num_frames: p.num_frames,
                        });
                    }
                    rec_ts[counter as usize] = timestamp;
                    bg_received += 1;
                }
            } else if pkt[ETHERTYPE_OFFSET..ETHERTYPE_OFFSET + 2] == ETHERTYPE_IPV4
                && is_test_frame_v4(&pkt)
            {
                let timestamp = rdtsc(); // get a timestamp ASAP
                let counter = counter_at(&pkt, V4_COUNTER_OFFSET);
                if counter >= p.num_frames {
                    return Err(TestError::InvalidCounter {
                        side: p.side,
                        counter,
                        num_frames: p.num_frames,
                    });
                }
                rec_ts[counter as usize] = timestamp;
                fg_received += 1;
                // foreground: learn its 4-tuple
                table.store(cursor, FourTuple::from_ipv4_frame(&pkt));
                cursor = (cursor + 1) % table.capacity();
            }
        }
    }

    if p.frame_timeout == 0 {
        println!("{} frames received: {}", p.side, fg_received + bg_received);
    }
    Ok((rec_ts, fg_received + bg_received))
}

/// Preliminary-phase learner: 4-tuple capture only, no timestamps and no
/// counter bound (nothing indexes by counter here). Returns the number of
/// foreground frames seen; the coordinator caps it at the table size to
/// obtain the valid-entry count.
pub fn learn_preliminary(rx: &mut dyn PacketRx, finish_receiving: u64, table: &StateTable) -> u64 {
    let mut fg_received = 0_u64;
    let mut cursor = 0_usize;
    let mut burst: Vec<Vec<u8>> = Vec::with_capacity(MAX_PKT_BURST);

    while rdtsc() < finish_receiving {
        rx.rx_burst(&mut burst);
        for pkt in burst.drain(..) {
            if pkt.len() >= ETHERTYPE_OFFSET + 2
                && pkt[ETHERTYPE_OFFSET..ETHERTYPE_OFFSET + 2] == ETHERTYPE_IPV4
                && is_test_frame_v4(&pkt)
            {
                table.store(cursor, FourTuple::from_ipv4_frame(&pkt));
                cursor = (cursor + 1) % table.capacity();
                fg_received += 1;
            }
        }
    }
    fg_received
}
