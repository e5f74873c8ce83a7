//! RTP/RTCP port pairs for multicast legs

use std::fmt;

/// Base RTP port when no multicast endpoint is configured
pub const DEFAULT_RTP_PORT: u16 = 20000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

impl PortPair {
    /// Pair starting at `rtp`; `None` if `rtp + 1` does not fit a port
    pub fn at(rtp: u16) -> Option<Self> {
        Some(Self {
            rtp,
            rtcp: rtp.checked_add(1)?,
        })
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.rtp, self.rtcp)
    }
}

/// Hands out successive, non-overlapping pairs: the first at the base port,
/// each next one two ports higher. A pair is never handed out twice.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    next: Option<PortPair>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            next: PortPair::at(base),
        }
    }

    /// Pair after `last_rtp`
    pub fn next_after(last_rtp: u16) -> Option<PortPair> {
        PortPair::at(last_rtp.checked_add(2)?)
    }

    /// Allocate the next pair; `None` once the port space is exhausted
    pub fn next_pair(&mut self) -> Option<PortPair> {
        let pair = self.next.take()?;
        self.next = Self::next_after(pair.rtp);
        Some(pair)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_RTP_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_form_an_arithmetic_sequence() {
        let mut allocator = PortAllocator::default();
        let pairs: Vec<PortPair> = (0..8).map(|_| allocator.next_pair().unwrap()).collect();

        assert_eq!(pairs[0], PortPair { rtp: 20000, rtcp: 20001 });
        for window in pairs.windows(2) {
            assert_eq!(window[1].rtp, window[0].rtp + 2);
        }
        for pair in &pairs {
            assert_eq!(pair.rtcp, pair.rtp + 1);
        }
    }

    #[test]
    fn custom_base() {
        let mut allocator = PortAllocator::new(5004);
        assert_eq!(allocator.next_pair().unwrap().rtp, 5004);
        assert_eq!(allocator.next_pair().unwrap().rtp, 5006);
        assert_eq!(PortAllocator::next_after(5006).unwrap().rtp, 5008);
    }

    #[test]
    fn exhausts_at_top_of_port_space() {
        let mut allocator = PortAllocator::new(65532);
        assert_eq!(allocator.next_pair(), Some(PortPair { rtp: 65532, rtcp: 65533 }));
        assert_eq!(allocator.next_pair(), Some(PortPair { rtp: 65534, rtcp: 65535 }));
        assert_eq!(allocator.next_pair(), None);
        assert_eq!(allocator.next_pair(), None);
    }
}
