//! RFC 4814 source/destination port variation and state-table index
//! selection.
//!
//! Pseudorandom values come from a fast 64-bit generator seeded from OS
//! entropy, one instance per varying quantity so sequences never interleave
//! across fields or threads. Increasing and decreasing sequences are
//! cheaper, non-standard alternatives.

use rand::distributions::{Distribution, Uniform};
use rand::rngs::SmallRng;
use rand::SeedableRng;

/// How a port number varies from frame to frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarMode {
    /// Hard-coded RFC 2544 port, single precomputed checksum
    Fixed,
    /// Start at min, step up
    Increasing,
    /// Start at max, step down
    Decreasing,
    /// Uniform over the inclusive range
    Random,
}

impl VarMode {
    pub fn from_u8(v: u8) -> Option<VarMode> {
        match v {
            0 => Some(VarMode::Fixed),
            1 => Some(VarMode::Increasing),
            2 => Some(VarMode::Decreasing),
            3 => Some(VarMode::Random),
            _ => None,
        }
    }

    pub fn is_varying(&self) -> bool {
        *self != VarMode::Fixed
    }
}

/// Port number generator for one UDP port field.
///
/// The wrap condition of the stepping modes is tested after the step,
/// against the extreme: an increasing sequence over `[min, max]` therefore
/// produces `min, min+1, .., max-1, min, ..` and never emits `max` itself
/// (the decreasing one never emits `min`). Long-deployed testers emit
/// exactly this sequence, and captured reference traces depend on it, so it
/// is kept bug-for-bug.
pub struct PortSequence {
    mode: VarMode,
    min: u16,
    max: u16,
    next: u16,
    dist: Uniform<u16>,
    rng: SmallRng,
}

impl PortSequence {
    pub fn new(mode: VarMode, min: u16, max: u16) -> PortSequence {
        PortSequence {
            mode,
            min,
            max,
            next: match mode {
                VarMode::Decreasing => max,
                _ => min,
            },
            dist: Uniform::new_inclusive(min, max),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Port number for the next frame, in host byte order.
    pub fn next_port(&mut self) -> u16 {
        match self.mode {
            VarMode::Fixed => self.min,
            VarMode::Increasing => {
                let p = self.next;
                self.next = self.next.wrapping_add(1);
                if self.next == self.max {
                    self.next = self.min;
                }
                p
            }
            VarMode::Decreasing => {
                let p = self.next;
                self.next = self.next.wrapping_sub(1);
                if self.next == self.min {
                    self.next = self.max;
                }
                p
            }
            VarMode::Random => self.dist.sample(&mut self.rng),
        }
    }
}

/// How the stateful replay sender walks the state table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexMode {
    /// Use the tuple learned first, for the whole test
    First,
    /// Walk up from slot 0, modulo the table size
    Increasing,
    /// Walk down from the last slot
    Decreasing,
    /// Uniform over all slots
    Random,
}

impl IndexMode {
    pub fn from_u8(v: u8) -> Option<IndexMode> {
        match v {
            0 => Some(IndexMode::First),
            1 => Some(IndexMode::Increasing),
            2 => Some(IndexMode::Decreasing),
            3 => Some(IndexMode::Random),
            _ => None,
        }
    }
}

/// State-table slot selector. Unlike [`PortSequence`], the stepping modes
/// here visit every slot: increasing wraps `size-1 -> 0`, decreasing wraps
/// `0 -> size-1`.
pub struct IndexSequence {
    mode: IndexMode,
    size: usize,
    next: usize,
    dist: Uniform<usize>,
    rng: SmallRng,
}

impl IndexSequence {
    pub fn new(mode: IndexMode, size: usize) -> IndexSequence {
        IndexSequence {
            mode,
            size,
            next: match mode {
                IndexMode::Decreasing => size - 1,
                _ => 0,
            },
            dist: Uniform::new(0, size),
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn next_index(&mut self) -> usize {
        match self.mode {
            IndexMode::First => 0,
            IndexMode::Increasing => {
                let i = self.next;
                self.next = (self.next + 1) % self.size;
                i
            }
            IndexMode::Decreasing => {
                let i = self.next;
                self.next = if self.next == 0 {
                    self.size - 1
                } else {
                    self.next - 1
                };
                i
            }
            IndexMode::Random => self.dist.sample(&mut self.rng),
        }
    }
}

/// Uniform destination-network sampler: when more than one destination
/// network is configured, the network index is drawn per frame rather than
/// iterated.
pub struct NetSampler {
    dist: Uniform<usize>,
    rng: SmallRng,
}

impl NetSampler {
    pub fn new(num_dest_nets: usize) -> NetSampler {
        NetSampler {
            dist: Uniform::new(0, num_dest_nets),
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn next_net(&mut self) -> usize {
        self.dist.sample(&mut self.rng)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_increasing_skips_max() {
        let mut seq = PortSequence::new(VarMode::Increasing, 1000, 1003);
        let produced: Vec<u16> = (0..8).map(|_| seq.next_port()).collect();
        assert_eq!(produced, [1000, 1001, 1002, 1000, 1001, 1002, 1000, 1001]);
    }

    #[test]
    fn test_decreasing_skips_min() {
        let mut seq = PortSequence::new(VarMode::Decreasing, 1000, 1003);
        let produced: Vec<u16> = (0..8).map(|_| seq.next_port()).collect();
        assert_eq!(produced, [1003, 1002, 1001, 1003, 1002, 1001, 1003, 1002]);
    }

    #[test]
    fn test_random_stays_in_range() {
        let mut seq = PortSequence::new(VarMode::Random, 4000, 4003);
        for _ in 0..1000 {
            let p = seq.next_port();
            assert!((4000..=4003).contains(&p));
        }
    }

    #[test]
    fn test_index_increasing_visits_every_slot() {
        let mut seq = IndexSequence::new(IndexMode::Increasing, 3);
        let produced: Vec<usize> = (0..7).map(|_| seq.next_index()).collect();
        assert_eq!(produced, [0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_index_decreasing_wraps_to_last() {
        let mut seq = IndexSequence::new(IndexMode::Decreasing, 3);
        let produced: Vec<usize> = (0..7).map(|_| seq.next_index()).collect();
        assert_eq!(produced, [2, 1, 0, 2, 1, 0, 2]);
    }

    #[test]
    fn test_index_first_is_constant() {
        let mut seq = IndexSequence::new(IndexMode::First, 5);
        assert_eq!(seq.next_index(), 0);
        assert_eq!(seq.next_index(), 0);
    }
}
