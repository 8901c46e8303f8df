//! The shared state table of stateful tests: a fixed-capacity vector of
//! 4-tuples written by the learning receiver and read by the replaying
//! sender on the opposite side.
//!
//! Addresses and ports are stored exactly as they appear on the wire
//! (network byte order), never converted while learning or replaying: the
//! replay sender copies them back into frames byte for byte.
//!
//! Within a phase there is a single writer; concurrent reading only happens
//! during the stateful test phase, from the opposite direction's sender.
//! Stable Rust has no 12-byte lock-free atomic, so each slot carries a
//! sequence word: the writer makes it odd, stores the tuple, makes it even;
//! readers retry while it is odd or changed underneath them. A reader can
//! observe a stale tuple, never a torn one - stale tuples still name valid
//! NAT state.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::checksum::ones_sum;
use crate::frame::{V4_DPORT_OFFSET, V4_DST_OFFSET, V4_SPORT_OFFSET, V4_SRC_OFFSET};

/// One NAT mapping key, fields in network byte order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FourTuple {
    pub init_addr: u32,
    pub resp_addr: u32,
    pub init_port: u16,
    pub resp_port: u16,
}

impl FourTuple {
    /// Lift the 4-tuple out of a received IPv4 test frame, preserving
    /// network byte order.
    pub fn from_ipv4_frame(pkt: &[u8]) -> FourTuple {
        let mut addr = [0_u8; 4];
        let mut port = [0_u8; 2];
        addr.copy_from_slice(&pkt[V4_SRC_OFFSET..V4_SRC_OFFSET + 4]);
        let init_addr = u32::from_ne_bytes(addr);
        addr.copy_from_slice(&pkt[V4_DST_OFFSET..V4_DST_OFFSET + 4]);
        let resp_addr = u32::from_ne_bytes(addr);
        port.copy_from_slice(&pkt[V4_SPORT_OFFSET..V4_SPORT_OFFSET + 2]);
        let init_port = u16::from_ne_bytes(port);
        port.copy_from_slice(&pkt[V4_DPORT_OFFSET..V4_DPORT_OFFSET + 2]);
        let resp_port = u16::from_ne_bytes(port);
        FourTuple {
            init_addr,
            resp_addr,
            init_port,
            resp_port,
        }
    }

    /// Wire bytes of the initiator address.
    pub fn init_addr_bytes(&self) -> [u8; 4] {
        self.init_addr.to_ne_bytes()
    }

    /// Wire bytes of the responder address.
    pub fn resp_addr_bytes(&self) -> [u8; 4] {
        self.resp_addr.to_ne_bytes()
    }

    /// Wire bytes of the initiator port.
    pub fn init_port_bytes(&self) -> [u8; 2] {
        self.init_port.to_ne_bytes()
    }

    /// Wire bytes of the responder port.
    pub fn resp_port_bytes(&self) -> [u8; 2] {
        self.resp_port.to_ne_bytes()
    }

    /// Initiator port in host byte order.
    pub fn init_port_host(&self) -> u16 {
        u16::from_be_bytes(self.init_port_bytes())
    }

    /// Responder port in host byte order.
    pub fn resp_port_host(&self) -> u16 {
        u16::from_be_bytes(self.resp_port_bytes())
    }

    /// One's-complement sum of the twelve wire bytes, the checksum delta a
    /// replayed frame picks up when this tuple is written into it.
    pub fn wire_sum(&self) -> u32 {
        ones_sum(&self.resp_addr_bytes())
            + ones_sum(&self.init_addr_bytes())
            + ones_sum(&self.resp_port_bytes())
            + ones_sum(&self.init_port_bytes())
    }
}

struct Slot {
    seq: AtomicU32,
    tuple: UnsafeCell<FourTuple>,
}

// Guarded by the seqlock protocol: exclusive writer, retrying readers.
unsafe impl Sync for Slot {}

/// Fixed-capacity table of atomic 4-tuple slots.
pub struct StateTable {
    slots: Box<[Slot]>,
}

impl StateTable {
    pub fn new(capacity: usize) -> StateTable {
        assert!(capacity > 0, "state table capacity must be positive");
        let slots = (0..capacity)
            .map(|_| Slot {
                seq: AtomicU32::new(0),
                tuple: UnsafeCell::new(FourTuple::default()),
            })
            .collect();
        StateTable { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Publish a tuple. Must only be called from the single learning
    /// thread.
    pub fn store(&self, index: usize, tuple: FourTuple) {
        let slot = &self.slots[index];
        let seq = slot.seq.load(Ordering::Relaxed);
        slot.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(slot.tuple.get(), tuple) };
        fence(Ordering::Release);
        slot.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Read a tuple, retrying across concurrent writes.
    pub fn load(&self, index: usize) -> FourTuple {
        let slot = &self.slots[index];
        loop {
            let before = slot.seq.load(Ordering::Acquire);
            if before & 1 == 0 {
                let tuple = unsafe { ptr::read_volatile(slot.tuple.get()) };
                fence(Ordering::Acquire);
                if slot.seq.load(Ordering::Relaxed) == before {
                    return tuple;
                }
            }
            std::hint::spin_loop();
        }
    }
}
