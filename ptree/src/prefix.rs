use ipnet::{Ipv4Net, Ipv6Net};
use num_traits::PrimInt;

/// What the trie needs from a key: a fixed-width network address, a prefix
/// length, and the bit-level operations branching is built from.
pub trait Prefix: Clone + PartialEq {
    type Repr: PrimInt;

    /// The masked network address as an unsigned integer.
    fn bits(&self) -> Self::Repr;

    fn prefix_len(&self) -> u8;

    fn from_parts(bits: Self::Repr, len: u8) -> Self;

    /// The address bit at `index`, counted from the most significant bit.
    fn bit_at(&self, index: u8) -> bool;

    /// True when `other` falls inside this prefix (equality included).
    fn covers(&self, other: &Self) -> bool;

    /// The longest prefix covering both `self` and `other`.
    fn meet(&self, other: &Self) -> Self {
        let diff = self.bits() ^ other.bits();
        let len = (diff.leading_zeros() as u8)
            .min(self.prefix_len())
            .min(other.prefix_len());
        Self::from_parts(self.bits() & net_mask::<Self::Repr>(len), len)
    }
}

/// The high `len` bits set.
pub(crate) fn net_mask<R: PrimInt>(len: u8) -> R {
    !host_mask::<R>(len)
}

/// The low `width - len` bits set.
pub(crate) fn host_mask<R: PrimInt>(len: u8) -> R {
    let width = R::zero().count_zeros();
    if len == 0 {
        !R::zero()
    } else if u32::from(len) >= width {
        R::zero()
    } else {
        (!R::zero()).unsigned_shr(u32::from(len))
    }
}

impl Prefix for Ipv4Net {
    type Repr = u32;

    fn bits(&self) -> u32 {
        self.network().into()
    }

    fn prefix_len(&self) -> u8 {
        Ipv4Net::prefix_len(self)
    }

    fn from_parts(bits: u32, len: u8) -> Self {
        Ipv4Net::new(bits.into(), len).expect("len bounded by meet()")
    }

    fn bit_at(&self, index: u8) -> bool {
        self.bits() & (1u32 << (31 - index)) != 0
    }

    fn covers(&self, other: &Self) -> bool {
        self.contains(other)
    }
}

impl Prefix for Ipv6Net {
    type Repr = u128;

    fn bits(&self) -> u128 {
        self.network().into()
    }

    fn prefix_len(&self) -> u8 {
        Ipv6Net::prefix_len(self)
    }

    fn from_parts(bits: u128, len: u8) -> Self {
        Ipv6Net::new(bits.into(), len).expect("len bounded by meet()")
    }

    fn bit_at(&self, index: u8) -> bool {
        self.bits() & (1u128 << (127 - index)) != 0
    }

    fn covers(&self, other: &Self) -> bool {
        self.contains(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn meet_finds_the_longest_shared_prefix() {
        let a = net("10.1.0.0/16");
        let b = net("10.2.0.0/16");
        assert_eq!(a.meet(&b), net("10.0.0.0/14"));
    }

    #[test]
    fn meet_of_nested_prefixes_is_the_wider_one() {
        let wide = net("10.0.0.0/8");
        let narrow = net("10.1.0.0/16");
        assert_eq!(wide.meet(&narrow), wide);
    }

    #[test]
    fn bit_at_counts_from_the_top() {
        let p = net("128.0.0.0/1");
        assert!(p.bit_at(0));
        assert!(!p.bit_at(1));
    }
}
