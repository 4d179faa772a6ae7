//! Ring identifiers and modular arithmetic over the m-bit identifier circle.

use std::fmt::{self, Debug, Display, Formatter};

use rand::Rng;

/// The largest supported identifier bit length.
pub const MAX_RING_BITS: u8 = 64;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// A node id or lookup target on the identifier circle, a value in `[0, 2^m)`.
///
/// Construct through [RingSpace] so values are always reduced modulo `2^m`.
pub struct RingId(u64);

impl RingId {
    /// Returns the raw integer value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Circular containment test for the open interval `(a, b)`.
    ///
    /// Walking clockwise from `a`, is `self` reached strictly before `b`?
    /// When `a == b` the interval spans the whole circle except `a` itself.
    pub fn in_open_interval(&self, a: RingId, b: RingId) -> bool {
        if a == b {
            *self != a
        } else if a < b {
            a < *self && *self < b
        } else {
            *self > a || *self < b
        }
    }

    /// Circular containment test for the half-open interval `(a, b]`.
    ///
    /// When `a == b` the interval spans the whole circle.
    pub fn in_open_closed_interval(&self, a: RingId, b: RingId) -> bool {
        if a == b {
            true
        } else if a < b {
            a < *self && *self <= b
        } else {
            *self > a || *self <= b
        }
    }
}

impl Debug for RingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RingId({})", self.0)
    }
}

impl Display for RingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The m-bit circular identifier space all ids of one ring live in.
///
/// Every node of a ring must agree on the bit length; it is fixed for the
/// lifetime of the ring.
pub struct RingSpace {
    bits: u8,
}

impl RingSpace {
    /// Creates a space of size `2^bits`. `bits` must be in `1..=64`,
    /// validated by [crate::rpc::Config] before it reaches this type.
    pub(crate) fn new(bits: u8) -> RingSpace {
        debug_assert!(bits >= 1 && bits <= MAX_RING_BITS);
        RingSpace { bits }
    }

    /// The identifier bit length m.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    fn mask(&self) -> u64 {
        if self.bits == MAX_RING_BITS {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }

    /// Reduces a raw value into this space.
    pub fn id(&self, value: u64) -> RingId {
        RingId(value & self.mask())
    }

    /// Clockwise addition `(id + k) mod 2^m`.
    pub fn add(&self, id: RingId, k: u64) -> RingId {
        RingId(id.0.wrapping_add(k) & self.mask())
    }

    /// Clockwise distance from `a` to `b`.
    pub fn distance(&self, a: RingId, b: RingId) -> u64 {
        b.0.wrapping_sub(a.0) & self.mask()
    }

    /// The start of finger `index` (0-based) of node `id`:
    /// `(id + 2^index) mod 2^m`.
    pub fn finger_start(&self, id: RingId, index: u8) -> RingId {
        debug_assert!(index < self.bits);
        self.add(id, 1u64 << index)
    }

    /// Hashes arbitrary bytes onto the ring: SHA-1, truncated to the
    /// high-order m bits of the digest.
    pub fn hash_key(&self, key: &[u8]) -> RingId {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(key);
        let digest = hasher.digest().bytes();
        let value = u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);

        if self.bits == MAX_RING_BITS {
            RingId(value)
        } else {
            RingId(value >> (MAX_RING_BITS - self.bits))
        }
    }

    /// A uniformly random id in this space.
    pub fn random(&self) -> RingId {
        let value: u64 = rand::thread_rng().gen();
        self.id(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_wraps_around() {
        let space = RingSpace::new(3);

        assert_eq!(space.add(space.id(6), 1), space.id(7));
        assert_eq!(space.add(space.id(6), 2), space.id(0));
        assert_eq!(space.add(space.id(7), 4), space.id(3));
    }

    #[test]
    fn clockwise_distance() {
        let space = RingSpace::new(3);

        assert_eq!(space.distance(space.id(0), space.id(0)), 0);
        assert_eq!(space.distance(space.id(1), space.id(3)), 2);
        assert_eq!(space.distance(space.id(3), space.id(1)), 6);
        assert_eq!(space.distance(space.id(6), space.id(0)), 2);
    }

    #[test]
    fn full_width_space() {
        let space = RingSpace::new(64);

        assert_eq!(space.id(u64::MAX).value(), u64::MAX);
        assert_eq!(space.add(space.id(u64::MAX), 1), space.id(0));
        assert_eq!(space.distance(space.id(u64::MAX), space.id(1)), 2);
    }

    #[test]
    fn open_interval() {
        let space = RingSpace::new(3);
        let id = |v| space.id(v);

        assert!(id(2).in_open_interval(id(1), id(3)));
        assert!(!id(1).in_open_interval(id(1), id(3)));
        assert!(!id(3).in_open_interval(id(1), id(3)));

        // Wrapping past zero.
        assert!(id(0).in_open_interval(id(6), id(1)));
        assert!(id(7).in_open_interval(id(6), id(1)));
        assert!(!id(1).in_open_interval(id(6), id(1)));

        // Degenerate bounds cover the whole circle except the bound itself.
        assert!(id(5).in_open_interval(id(2), id(2)));
        assert!(!id(2).in_open_interval(id(2), id(2)));
    }

    #[test]
    fn open_closed_interval() {
        let space = RingSpace::new(3);
        let id = |v| space.id(v);

        assert!(id(3).in_open_closed_interval(id(1), id(3)));
        assert!(!id(1).in_open_closed_interval(id(1), id(3)));

        // Wrapping past zero.
        assert!(id(0).in_open_closed_interval(id(6), id(0)));
        assert!(id(7).in_open_closed_interval(id(6), id(0)));
        assert!(!id(6).in_open_closed_interval(id(6), id(0)));

        // Degenerate bounds cover the whole circle (single node ring).
        assert!(id(4).in_open_closed_interval(id(4), id(4)));
        assert!(id(0).in_open_closed_interval(id(4), id(4)));
    }

    #[test]
    fn finger_starts_match_the_paper_figure() {
        // Node 1 in a 3-bit ring has finger starts 2, 3 and 5.
        let space = RingSpace::new(3);
        let id = space.id(1);

        assert_eq!(space.finger_start(id, 0), space.id(2));
        assert_eq!(space.finger_start(id, 1), space.id(3));
        assert_eq!(space.finger_start(id, 2), space.id(5));
    }

    #[test]
    fn hash_is_deterministic_and_in_range() {
        let space = RingSpace::new(8);

        let a = space.hash_key(b"127.0.0.1:4242");
        let b = space.hash_key(b"127.0.0.1:4242");

        assert_eq!(a, b);
        assert!(a.value() < 256);
    }

    #[test]
    fn random_is_in_range() {
        let space = RingSpace::new(4);

        for _ in 0..64 {
            assert!(space.random().value() < 16);
        }
    }
}
