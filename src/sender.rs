//! The rate-paced transmit workers.
//!
//! A sender owns its templates and its transmit queue outright. Per frame
//! it patches only the counter, the varying port words and (when replaying
//! NAT state) the 4-tuple, maintains the UDP checksum incrementally, then
//! busy-waits on the cycle counter until the frame's pacing deadline and
//! pushes the frame into the NIC until it is accepted. The send timestamp
//! is taken immediately after acceptance. Pacing is an intentional spin:
//! the required precision sits below sleep granularity, so there are no
//! suspension points anywhere in the loop.
//!
//! Out of every `n` frames the first `m` are foreground traffic (the IP
//! version under test); the rest are IPv6 background. After the last frame
//! the sender audits its own schedule: exceeding `duration * tolerance`
//! invalidates the whole test.

use crate::checksum::{calc_ip_checksum, ones_sum, udp_finalize};
use crate::frame::{
    TemplateSlots, ETHER_CRC_LEN, V4_CHECKSUM_OFFSET, V4_DST_OFFSET, V4_HEADER_OFFSET,
    V4_SPORT_OFFSET, V4_SRC_OFFSET,
};
use crate::nic::{Mempool, PacketTx};
use crate::state::StateTable;
use crate::tsc::rdtsc;
use crate::variator::{IndexMode, IndexSequence, NetSampler, PortSequence, VarMode};
use crate::{IpV4Addr, IpV6Addr, MacAddr, TestError, N};

use std::sync::Arc;

/// Parameters shared by every sender of a measurement.
#[derive(Clone, Copy, Debug)]
pub struct SenderCommon {
    pub ipv6_frame_size: u16,
    pub ipv4_frame_size: u16,
    /// Frames per second, per active sender
    pub frame_rate: u32,
    /// Test duration in seconds
    pub duration: u16,
    /// Background/foreground split: out of every `n` frames, `m` lead as
    /// foreground
    pub n: u32,
    pub m: u32,
    /// Cycle-counter frequency
    pub hz: u64,
    /// Absolute cycle count of the first frame's deadline
    pub start_tsc: u64,
    /// Schedule-slip threshold, slightly above 1.0
    pub tolerance: f64,
}

impl SenderCommon {
    pub fn frames_to_send(&self) -> u64 {
        self.duration as u64 * self.frame_rate as u64
    }

    #[inline(always)]
    fn deadline(&self, k: u64) -> u64 {
        self.start_tsc + k * self.hz / self.frame_rate as u64
    }
}

/// Per-direction sender parameters.
#[derive(Clone, Copy, Debug)]
pub struct SenderParams {
    pub side: &'static str,
    /// 4 or 6; selects the foreground template family
    pub ip_version: u8,
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub src_ipv4: IpV4Addr,
    pub dst_ipv4: IpV4Addr,
    pub src_ipv6: IpV6Addr,
    pub dst_ipv6: IpV6Addr,
    /// Background traffic is always IPv6 with its own addresses
    pub src_bg: IpV6Addr,
    pub dst_bg: IpV6Addr,
    pub num_dest_nets: u16,
    pub var_sport: VarMode,
    pub var_dport: VarMode,
    pub sport_min: u16,
    pub sport_max: u16,
    pub dport_min: u16,
    pub dport_max: u16,
}

/// What turns a plain sender into a stateful replayer.
#[derive(Clone)]
pub struct ReplayParams {
    pub table: Arc<StateTable>,
    pub responder_ports: IndexMode,
}

/// Preliminary-phase inputs on top of [`SenderParams`].
#[derive(Clone, Copy, Debug)]
pub struct PreliminaryParams {
    pub pre_rate: u32,
    pub pre_frames: u64,
    /// Step deterministically through the sport x dport grid so every
    /// preliminary frame installs a distinct NAT mapping
    pub enumerate_ports: bool,
}

/// Wait for the pacing deadline, hand the frame to the NIC until it takes
/// it, and return the send timestamp.
#[inline(always)]
fn paced_transmit(tx: &mut dyn PacketTx, frame: &[u8], deadline: u64) -> u64 {
    while rdtsc() < deadline {
        std::hint::spin_loop();
    }
    while tx.tx_burst(&[frame]) == 0 {
        std::hint::spin_loop();
    }
    rdtsc()
}

/// Patch the varying ports and the counter into one template slot,
/// maintaining the UDP checksum from the template's seed.
fn patch_stateless(
    bank: &mut TemplateSlots,
    slot: usize,
    counter: u64,
    sport_seq: Option<&mut PortSequence>,
    dport_seq: Option<&mut PortSequence>,
) {
    let off = bank.offsets();
    let mut chksum = bank.seed();
    let frame = bank.frame_mut(slot);

    if let Some(seq) = sport_seq {
        let sp = seq.next_port();
        frame[off.sport..off.sport + 2].copy_from_slice(&sp.to_be_bytes());
        chksum += sp as u32;
    }
    if let Some(seq) = dport_seq {
        let dp = seq.next_port();
        frame[off.dport..off.dport + 2].copy_from_slice(&dp.to_be_bytes());
        chksum += dp as u32;
    }

    frame[off.counter..off.counter + 8].copy_from_slice(&counter.to_le_bytes());
    chksum += ones_sum(&counter.to_le_bytes());
    let chksum = udp_finalize(chksum);
    frame[off.udp_checksum..off.udp_checksum + 2].copy_from_slice(&chksum.to_be_bytes());
}

/// Schedule audit after the last frame. Printed unconditionally; exceeding
/// the tolerated duration is fatal.
fn check_schedule(
    side: &'static str,
    start_tsc: u64,
    hz: u64,
    duration_secs: f64,
    tolerance: f64,
    sent_frames: u64,
) -> Result<(), TestError> {
    let elapsed_seconds = (rdtsc() - start_tsc) as f64 / hz as f64;
    println!("Info: {side} sender's sending took {elapsed_seconds:.10} seconds.");
    let limit = duration_secs * tolerance;
    if elapsed_seconds > limit {
        return Err(TestError::ScheduleMiss { side, limit });
    }
    println!("{side} frames sent: {sent_frames}");
    Ok(())
}

/// Foreground and background template rings for one sender, indexed by
/// destination network.
struct Banks {
    fg: Vec<TemplateSlots>,
    bg: Vec<TemplateSlots>,
}

fn build_stateless_banks(
    pool: &mut Mempool,
    c: &SenderCommon,
    p: &SenderParams,
) -> Result<Banks, TestError> {
    let v4_len = p.ipv4_len(c);
    let v6_len = p.ipv6_len(c);
    let nets = p.num_dest_nets as usize;

    let mut fg = Vec::with_capacity(nets);
    let mut bg = Vec::with_capacity(nets);
    for net in 0..nets {
        let fg_slots = if p.ip_version == 4 {
            let mut dst = p.dst_ipv4;
            if nets > 1 {
                dst.0[2] = net as u8; // 198.18.x.2
            }
            TemplateSlots::ipv4(
                pool, v4_len, p.dst_mac, p.src_mac, p.src_ipv4, dst, p.var_sport, p.var_dport,
            )
        } else {
            let mut dst = p.dst_ipv6;
            if nets > 1 {
                dst.0[7] = net as u8; // 2001:2:0:00xx::1
            }
            TemplateSlots::ipv6(
                pool, v6_len, p.dst_mac, p.src_mac, p.src_ipv6, dst, p.var_sport, p.var_dport,
            )
        };
        fg.push(fg_slots.ok_or(TestError::PoolExhausted { side: p.side })?);

        let mut dst_bg = p.dst_bg;
        if nets > 1 {
            dst_bg.0[7] = net as u8;
        }
        let bg_slots = TemplateSlots::ipv6(
            pool, v6_len, p.dst_mac, p.src_mac, p.src_bg, dst_bg, p.var_sport, p.var_dport,
        );
        bg.push(bg_slots.ok_or(TestError::PoolExhausted { side: p.side })?);
    }
    Ok(Banks { fg, bg })
}

impl SenderParams {
    fn ipv4_len(&self, c: &SenderCommon) -> usize {
        c.ipv4_frame_size as usize - ETHER_CRC_LEN
    }

    fn ipv6_len(&self, c: &SenderCommon) -> usize {
        c.ipv6_frame_size as usize - ETHER_CRC_LEN
    }

    fn sport_seq(&self) -> Option<PortSequence> {
        self.var_sport
            .is_varying()
            .then(|| PortSequence::new(self.var_sport, self.sport_min, self.sport_max))
    }

    fn dport_seq(&self) -> Option<PortSequence> {
        self.var_dport
            .is_varying()
            .then(|| PortSequence::new(self.var_dport, self.dport_min, self.dport_max))
    }
}

/// Stateless PDV sender. Sends `duration * frame_rate` frames and returns
/// the send-timestamp vector, indexed by the in-frame counter.
pub fn send_pdv(
    tx: &mut dyn PacketTx,
    pool: &mut Mempool,
    c: &SenderCommon,
    p: &SenderParams,
) -> Result<Vec<u64>, TestError> {
    let frames_to_send = c.frames_to_send();
    let mut send_ts = vec![0_u64; frames_to_send as usize];

    let mut banks = build_stateless_banks(pool, c, p)?;
    let mut sport_seq = p.sport_seq();
    let mut dport_seq = p.dport_seq();
    let mut net_pick = (p.num_dest_nets > 1).then(|| NetSampler::new(p.num_dest_nets as usize));

    let mut slot = 0_usize;
    for sent_frames in 0..frames_to_send {
        let net = net_pick.as_mut().map_or(0, NetSampler::next_net);
        let bank = if sent_frames % (c.n as u64) < c.m as u64 {
            &mut banks.fg[net]
        } else {
            &mut banks.bg[net]
        };

        patch_stateless(
            bank,
            slot,
            sent_frames,
            sport_seq.as_mut(),
            dport_seq.as_mut(),
        );
        send_ts[sent_frames as usize] = paced_transmit(tx, bank.frame(slot), c.deadline(sent_frames));
        slot = (slot + 1) % N;
    }

    check_schedule(
        p.side,
        c.start_tsc,
        c.hz,
        c.duration as f64,
        c.tolerance,
        frames_to_send,
    )?;
    Ok(send_ts)
}

/// Stateful replay sender: foreground IPv4 frames carry 4-tuples drawn
/// from the state table (the responder side of the learned NAT mappings),
/// background frames and IPv6 foreground run the stateless path. IPv6
/// foreground replay is not supported by design.
pub fn replay_send_pdv(
    tx: &mut dyn PacketTx,
    pool: &mut Mempool,
    c: &SenderCommon,
    p: &SenderParams,
    r: &ReplayParams,
) -> Result<Vec<u64>, TestError> {
    let frames_to_send = c.frames_to_send();
    let mut send_ts = vec![0_u64; frames_to_send as usize];

    let v4_len = p.ipv4_len(c);
    let v6_len = p.ipv6_len(c);
    let nets = p.num_dest_nets as usize;
    let stateful_fg = p.ip_version == 4;
    let counter_only = r.responder_ports == IndexMode::First;

    // With a fixed responder tuple nothing varies but the counter, on
    // background frames included
    let (var_sport, var_dport) = if counter_only {
        (VarMode::Fixed, VarMode::Fixed)
    } else {
        (p.var_sport, p.var_dport)
    };

    // Single foreground ring: replayed tuples address the initiator
    // directly, destination networks only spread the background traffic
    let mut fg = if stateful_fg {
        if counter_only {
            let ft = r.table.load(0); // read only once
            TemplateSlots::ipv4_final(
                pool,
                v4_len,
                p.dst_mac,
                p.src_mac,
                IpV4Addr::new(ft.resp_addr_bytes()),
                IpV4Addr::new(ft.init_addr_bytes()),
                ft.resp_port_host(),
                ft.init_port_host(),
            )
        } else {
            TemplateSlots::ipv4_replay(pool, v4_len, p.dst_mac, p.src_mac)
        }
    } else {
        TemplateSlots::ipv6(
            pool, v6_len, p.dst_mac, p.src_mac, p.src_ipv6, p.dst_ipv6, var_sport, var_dport,
        )
    }
    .ok_or(TestError::PoolExhausted { side: p.side })?;

    let mut bg = Vec::with_capacity(nets);
    for net in 0..nets {
        let mut dst_bg = p.dst_bg;
        if nets > 1 {
            dst_bg.0[7] = net as u8;
        }
        let slots = TemplateSlots::ipv6(
            pool, v6_len, p.dst_mac, p.src_mac, p.src_bg, dst_bg, var_sport, var_dport,
        );
        bg.push(slots.ok_or(TestError::PoolExhausted { side: p.side })?);
    }

    let mut sport_seq = if counter_only { None } else { p.sport_seq() };
    let mut dport_seq = if counter_only { None } else { p.dport_seq() };
    let mut net_pick = (nets > 1).then(|| NetSampler::new(nets));
    let mut index_seq = (stateful_fg && !counter_only)
        .then(|| IndexSequence::new(r.responder_ports, r.table.capacity()));

    let mut slot = 0_usize;
    for sent_frames in 0..frames_to_send {
        let fg_frame = sent_frames % (c.n as u64) < c.m as u64;

        if fg_frame && stateful_fg {
            let off = fg.offsets();
            let mut chksum = fg.seed();
            let frame = fg.frame_mut(slot);

            if let Some(seq) = index_seq.as_mut() {
                // The learned tuple flows back mirrored: the responder
                // address/port pair becomes the source
                let ft = r.table.load(seq.next_index());
                frame[V4_SRC_OFFSET..V4_SRC_OFFSET + 4].copy_from_slice(&ft.resp_addr_bytes());
                frame[V4_DST_OFFSET..V4_DST_OFFSET + 4].copy_from_slice(&ft.init_addr_bytes());
                frame[off.sport..off.sport + 2].copy_from_slice(&ft.resp_port_bytes());
                frame[off.dport..off.dport + 2].copy_from_slice(&ft.init_port_bytes());
                chksum += ft.wire_sum();
            }

            frame[off.counter..off.counter + 8].copy_from_slice(&sent_frames.to_le_bytes());
            chksum += ones_sum(&sent_frames.to_le_bytes());
            let chksum = udp_finalize(chksum);
            frame[off.udp_checksum..off.udp_checksum + 2]
                .copy_from_slice(&chksum.to_be_bytes());

            if index_seq.is_some() {
                // Source and destination changed: the IPv4 header checksum
                // is recomputed in full
                frame[V4_CHECKSUM_OFFSET..V4_CHECKSUM_OFFSET + 2].copy_from_slice(&[0, 0]);
                let header_checksum =
                    calc_ip_checksum(&frame[V4_HEADER_OFFSET..V4_SPORT_OFFSET]);
                frame[V4_CHECKSUM_OFFSET..V4_CHECKSUM_OFFSET + 2]
                    .copy_from_slice(&header_checksum.to_be_bytes());
            }

            send_ts[sent_frames as usize] =
                paced_transmit(tx, fg.frame(slot), c.deadline(sent_frames));
        } else {
            let bank = if fg_frame {
                &mut fg // IPv6 foreground: handled statelessly
            } else {
                let net = net_pick.as_mut().map_or(0, NetSampler::next_net);
                &mut bg[net]
            };
            patch_stateless(
                bank,
                slot,
                sent_frames,
                sport_seq.as_mut(),
                dport_seq.as_mut(),
            );
            send_ts[sent_frames as usize] =
                paced_transmit(tx, bank.frame(slot), c.deadline(sent_frames));
        }

        slot = (slot + 1) % N;
    }

    check_schedule(
        p.side,
        c.start_tsc,
        c.hz,
        c.duration as f64,
        c.tolerance,
        frames_to_send,
    )?;
    Ok(send_ts)
}

/// Preliminary-phase initiator sender: paced foreground frames that push
/// NAT mappings into the gateway for the learner on the far side. No
/// timestamps are recorded.
pub fn preliminary_send(
    tx: &mut dyn PacketTx,
    pool: &mut Mempool,
    c: &SenderCommon,
    p: &SenderParams,
    pre: &PreliminaryParams,
) -> Result<u64, TestError> {
    let v4_len = p.ipv4_len(c);

    // Enumerated ports are rewritten every frame, so the template keeps
    // them zeroed just like any varying port
    let (var_sport, var_dport) = if pre.enumerate_ports {
        (VarMode::Increasing, VarMode::Increasing)
    } else {
        (p.var_sport, p.var_dport)
    };
    let mut fg = TemplateSlots::ipv4(
        pool,
        v4_len,
        p.dst_mac,
        p.src_mac,
        p.src_ipv4,
        p.dst_ipv4,
        var_sport,
        var_dport,
    )
    .ok_or(TestError::PoolExhausted { side: p.side })?;

    let mut sport_seq = p.sport_seq();
    let mut dport_seq = p.dport_seq();
    let mut grid = (pre.enumerate_ports).then_some((p.sport_min, p.dport_min));

    let mut slot = 0_usize;
    for sent_frames in 0..pre.pre_frames {
        if let Some((sport, dport)) = grid.as_mut() {
            let off = fg.offsets();
            let mut chksum = fg.seed();
            let frame = fg.frame_mut(slot);
            frame[off.sport..off.sport + 2].copy_from_slice(&sport.to_be_bytes());
            frame[off.dport..off.dport + 2].copy_from_slice(&dport.to_be_bytes());
            chksum += *sport as u32 + *dport as u32;
            frame[off.counter..off.counter + 8].copy_from_slice(&sent_frames.to_le_bytes());
            chksum += ones_sum(&sent_frames.to_le_bytes());
            let chksum = udp_finalize(chksum);
            frame[off.udp_checksum..off.udp_checksum + 2]
                .copy_from_slice(&chksum.to_be_bytes());

            // Source port runs fastest; the full grid yields
            // (sport_max - sport_min + 1) * (dport_max - dport_min + 1)
            // distinct mappings
            if *sport == p.sport_max {
                *sport = p.sport_min;
                *dport = if *dport == p.dport_max {
                    p.dport_min
                } else {
                    *dport + 1
                };
            } else {
                *sport += 1;
            }
        } else {
            patch_stateless(
                &mut fg,
                slot,
                sent_frames,
                sport_seq.as_mut(),
                dport_seq.as_mut(),
            );
        }

        let deadline = c.start_tsc + sent_frames * c.hz / pre.pre_rate as u64;
        paced_transmit(tx, fg.frame(slot), deadline);
        slot = (slot + 1) % N;
    }

    let pre_duration = pre.pre_frames as f64 / pre.pre_rate as f64;
    check_schedule(
        p.side,
        c.start_tsc,
        c.hz,
        pre_duration,
        c.tolerance,
        pre.pre_frames,
    )?;
    Ok(pre.pre_frames)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::checksum::ones_sum;
    use crate::frame::{
        RFC2544_DPORT, RFC2544_SPORT, V4_DPORT_OFFSET, V4_SPORT_OFFSET, V4_UDP_CHECKSUM_OFFSET,
        V4_COUNTER_OFFSET,
    };
    use crate::state::FourTuple;
    use crate::tsc::tsc_hz;

    /// Records every accepted frame instead of transmitting it.
    struct CaptureTx {
        frames: Vec<Vec<u8>>,
    }

    impl PacketTx for CaptureTx {
        fn tx_burst(&mut self, frames: &[&[u8]]) -> usize {
            for f in frames {
                self.frames.push(f.to_vec());
            }
            frames.len()
        }
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0x02, 0, 0, 0, 0, last])
    }

    /// A 1-second test whose deadlines are all in the past: the loop runs
    /// flat out, and a huge tolerance keeps the schedule audit quiet.
    fn common(frame_rate: u32) -> SenderCommon {
        let hz = tsc_hz();
        SenderCommon {
            ipv6_frame_size: 84,
            ipv4_frame_size: 64,
            frame_rate,
            duration: 1,
            n: 1,
            m: 1,
            hz,
            start_tsc: rdtsc().saturating_sub(2 * hz),
            tolerance: 1e9,
        }
    }

    fn params(ip_version: u8) -> SenderParams {
        SenderParams {
            side: "Forward",
            ip_version,
            dst_mac: mac(1),
            src_mac: mac(2),
            src_ipv4: IpV4Addr::new([198, 18, 0, 2]),
            dst_ipv4: IpV4Addr::new([198, 19, 0, 2]),
            src_ipv6: IpV6Addr::new([0x20, 1, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]),
            dst_ipv6: IpV6Addr::new([0x20, 1, 0, 2, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 2]),
            src_bg: IpV6Addr::new([0x20, 1, 0, 2, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 2]),
            dst_bg: IpV6Addr::new([0x20, 1, 0, 2, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 2]),
            num_dest_nets: 1,
            var_sport: VarMode::Fixed,
            var_dport: VarMode::Fixed,
            sport_min: 1000,
            sport_max: 1003,
            dport_min: 2000,
            dport_max: 2003,
        }
    }

    fn verify_udp_v4(frame: &[u8]) {
        let mut src = [0_u8; 4];
        let mut dst = [0_u8; 4];
        src.copy_from_slice(&frame[V4_SRC_OFFSET..V4_SRC_OFFSET + 4]);
        dst.copy_from_slice(&frame[V4_DST_OFFSET..V4_DST_OFFSET + 4]);
        let udp = &frame[V4_SPORT_OFFSET..];
        let sum = ones_sum(&src) + ones_sum(&dst) + 0x0011 + udp.len() as u32 + ones_sum(udp);
        assert_eq!(sum % 0xFFFF, 0, "UDP checksum does not verify");
        assert_ne!(
            &frame[V4_UDP_CHECKSUM_OFFSET..V4_UDP_CHECKSUM_OFFSET + 2],
            &[0, 0]
        );
    }

    #[test]
    fn test_counters_and_checksums_on_the_wire() {
        let mut tx = CaptureTx { frames: Vec::new() };
        let mut pool = Mempool::new(crate::nic::sender_pool_size(1));
        let c = common(500);
        let p = params(4);

        let send_ts = send_pdv(&mut tx, &mut pool, &c, &p).unwrap();
        assert_eq!(send_ts.len(), 500);
        assert_eq!(tx.frames.len(), 500);
        // Timestamps are written in counter order, exactly once
        assert!(send_ts.windows(2).all(|w| w[0] <= w[1]));

        for (k, frame) in tx.frames.iter().enumerate() {
            let counter =
                u64::from_le_bytes(frame[V4_COUNTER_OFFSET..V4_COUNTER_OFFSET + 8].try_into().unwrap());
            assert_eq!(counter, k as u64);
            // Fixed modes keep the canonical RFC 2544 ports
            assert_eq!(
                &frame[V4_SPORT_OFFSET..V4_SPORT_OFFSET + 2],
                &RFC2544_SPORT.to_be_bytes()
            );
            assert_eq!(
                &frame[V4_DPORT_OFFSET..V4_DPORT_OFFSET + 2],
                &RFC2544_DPORT.to_be_bytes()
            );
            verify_udp_v4(frame);
        }
    }

    #[test]
    fn test_increasing_sport_sequence_on_the_wire() {
        let mut tx = CaptureTx { frames: Vec::new() };
        let mut pool = Mempool::new(crate::nic::sender_pool_size(1));
        let c = common(8);
        let mut p = params(4);
        p.var_sport = VarMode::Increasing;

        send_pdv(&mut tx, &mut pool, &c, &p).unwrap();
        let sports: Vec<u16> = tx
            .frames
            .iter()
            .map(|f| u16::from_be_bytes([f[V4_SPORT_OFFSET], f[V4_SPORT_OFFSET + 1]]))
            .collect();
        // The boundary value 1003 is never transmitted
        assert_eq!(sports, [1000, 1001, 1002, 1000, 1001, 1002, 1000, 1001]);
        for frame in &tx.frames {
            verify_udp_v4(frame);
        }
    }

    #[test]
    fn test_replay_carries_learned_tuples_in_order() {
        let table = Arc::new(StateTable::new(5));
        for i in 0..5_u32 {
            table.store(
                i as usize,
                FourTuple {
                    init_addr: u32::from_ne_bytes([198, 18, 0, 10 + i as u8]),
                    resp_addr: u32::from_ne_bytes([198, 19, 0, 20 + i as u8]),
                    init_port: u16::from_ne_bytes(4000_u16.wrapping_add(i as u16).to_be_bytes()),
                    resp_port: u16::from_ne_bytes(5000_u16.wrapping_add(i as u16).to_be_bytes()),
                },
            );
        }

        let mut tx = CaptureTx { frames: Vec::new() };
        let mut pool = Mempool::new(crate::nic::sender_pool_size(1));
        let c = common(12);
        let p = params(4);
        let r = ReplayParams {
            table,
            responder_ports: IndexMode::Increasing,
        };

        replay_send_pdv(&mut tx, &mut pool, &c, &p, &r).unwrap();
        assert_eq!(tx.frames.len(), 12);

        for (k, frame) in tx.frames.iter().enumerate() {
            // Tuples come back mirrored, in the exact order they were learned
            let i = (k % 5) as u8;
            assert_eq!(&frame[V4_SRC_OFFSET..V4_SRC_OFFSET + 4], &[198, 19, 0, 20 + i]);
            assert_eq!(&frame[V4_DST_OFFSET..V4_DST_OFFSET + 4], &[198, 18, 0, 10 + i]);
            assert_eq!(
                &frame[V4_SPORT_OFFSET..V4_SPORT_OFFSET + 2],
                &(5000 + i as u16).to_be_bytes()
            );
            assert_eq!(
                &frame[V4_DPORT_OFFSET..V4_DPORT_OFFSET + 2],
                &(4000 + i as u16).to_be_bytes()
            );
            verify_udp_v4(frame);

            // The rewritten IPv4 header checksum verifies too
            assert_eq!(
                ones_sum(&frame[V4_HEADER_OFFSET..V4_SPORT_OFFSET]) % 0xFFFF,
                0
            );
        }
    }

    #[test]
    fn test_pacing_never_sends_early() {
        let mut tx = CaptureTx { frames: Vec::new() };
        let mut pool = Mempool::new(crate::nic::sender_pool_size(1));
        let mut c = common(200);
        // a real paced run: deadlines lie in the future
        c.start_tsc = rdtsc() + c.hz / 100;

        let send_ts = send_pdv(&mut tx, &mut pool, &c, &params(4)).unwrap();
        for (k, ts) in send_ts.iter().enumerate() {
            let deadline = c.start_tsc + k as u64 * c.hz / c.frame_rate as u64;
            assert!(*ts >= deadline, "frame {k} left {} ticks early", deadline - *ts);
        }
    }

    #[test]
    fn test_schedule_miss_is_fatal() {
        /// Rejects everything until the cycle counter passes `until`.
        struct StallingTx {
            until: u64,
        }
        impl PacketTx for StallingTx {
            fn tx_burst(&mut self, frames: &[&[u8]]) -> usize {
                if rdtsc() < self.until {
                    0
                } else {
                    frames.len()
                }
            }
        }

        let hz = tsc_hz();
        let mut c = common(100);
        c.start_tsc = rdtsc();
        c.tolerance = crate::DEFAULT_TOLERANCE;
        // The NIC stays wedged well past duration * tolerance
        let mut tx = StallingTx {
            until: c.start_tsc + hz + hz / 5,
        };
        let mut pool = Mempool::new(crate::nic::sender_pool_size(1));

        let err = send_pdv(&mut tx, &mut pool, &c, &params(4)).unwrap_err();
        assert!(matches!(err, TestError::ScheduleMiss { .. }));
    }

    #[test]
    fn test_enumerated_preliminary_ports_cover_the_grid() {
        let mut tx = CaptureTx { frames: Vec::new() };
        let mut pool = Mempool::new(crate::nic::sender_pool_size(1));
        let mut c = common(1000);
        c.start_tsc = rdtsc().saturating_sub(1000 * c.hz);
        let p = params(4);
        let pre = PreliminaryParams {
            pre_rate: 1000,
            pre_frames: 9,
            enumerate_ports: true,
        };

        preliminary_send(&mut tx, &mut pool, &c, &p, &pre).unwrap();
        let pairs: Vec<(u16, u16)> = tx
            .frames
            .iter()
            .map(|f| {
                (
                    u16::from_be_bytes([f[V4_SPORT_OFFSET], f[V4_SPORT_OFFSET + 1]]),
                    u16::from_be_bytes([f[V4_DPORT_OFFSET], f[V4_DPORT_OFFSET + 1]]),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            [
                (1000, 2000),
                (1001, 2000),
                (1002, 2000),
                (1003, 2000),
                (1000, 2001),
                (1001, 2001),
                (1002, 2001),
                (1003, 2001),
                (1000, 2002),
            ]
        );
        for frame in &tx.frames {
            verify_udp_v4(frame);
        }
    }
}
