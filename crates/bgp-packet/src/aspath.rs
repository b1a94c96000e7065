use std::fmt;

use crate::error::{update_error, CorruptMessage};
use crate::wire::{read_u16, read_u32, read_u8};

/// Reserved 2-octet stand-in for a 4-octet ASN on a session that never
/// negotiated the four-octet capability (RFC 6793).
pub const AS_TRANS: u32 = 23456;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Set = 1,
    Sequence = 2,
    ConfedSequence = 3,
    ConfedSet = 4,
}

impl SegmentKind {
    fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Set),
            2 => Some(Self::Sequence),
            3 => Some(Self::ConfedSequence),
            4 => Some(Self::ConfedSet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AsSegment {
    pub kind: SegmentKind,
    pub asns: Vec<u32>,
}

/// An AS_PATH attribute value: a sequence of segments, every ASN held as a
/// 4-octet number internally regardless of how the wire carried it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AsPath {
    pub segments: Vec<AsSegment>,
}

fn malformed() -> CorruptMessage {
    CorruptMessage::update(update_error::MALFORMED_AS_PATH, Vec::new())
}

impl AsPath {
    pub fn from_sequence(asns: impl Into<Vec<u32>>) -> Self {
        Self { segments: vec![AsSegment { kind: SegmentKind::Sequence, asns: asns.into() }] }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Path length for the Decision process: each sequence member counts
    /// one, a whole set counts one (RFC 4271 §9.1.2.2).
    pub fn length(&self) -> usize {
        self.segments
            .iter()
            .map(|seg| match seg.kind {
                SegmentKind::Sequence => seg.asns.len(),
                SegmentKind::Set => 1,
                // Confederation segments are invisible to path length.
                SegmentKind::ConfedSequence | SegmentKind::ConfedSet => 0,
            })
            .sum()
    }

    pub fn contains(&self, asn: u32) -> bool {
        self.segments.iter().any(|seg| seg.asns.contains(&asn))
    }

    /// Leftmost ASN, the neighbour AS the path was received from.
    pub fn first_as(&self) -> Option<u32> {
        self.segments
            .iter()
            .find(|seg| seg.kind == SegmentKind::Sequence)
            .and_then(|seg| seg.asns.first())
            .copied()
    }

    pub fn prepend(&mut self, asn: u32) {
        match self.segments.first_mut() {
            Some(seg) if seg.kind == SegmentKind::Sequence => seg.asns.insert(0, asn),
            _ => self
                .segments
                .insert(0, AsSegment { kind: SegmentKind::Sequence, asns: vec![asn] }),
        }
    }

    /// Number of ASNs across all segments, the unit AS4_PATH reconciliation
    /// compares in (RFC 6793 §4.2.3).
    fn asn_count(&self) -> usize {
        self.segments.iter().map(|seg| seg.asns.len()).sum()
    }

    /// Parses an AS_PATH attribute body. `four_octet` selects the ASN width
    /// the session negotiated.
    pub fn decode(mut input: &[u8], four_octet: bool) -> Result<Self, CorruptMessage> {
        let mut segments = Vec::new();
        while !input.is_empty() {
            let (rest, kind) = read_u8(input, malformed)?;
            let kind = SegmentKind::from_wire(kind).ok_or_else(malformed)?;
            let (rest, count) = read_u8(rest, malformed)?;
            if count == 0 {
                return Err(malformed());
            }
            let mut asns = Vec::with_capacity(usize::from(count));
            let mut rest = rest;
            for _ in 0..count {
                let asn;
                (rest, asn) = if four_octet {
                    read_u32(rest, malformed)?
                } else {
                    let (r, v) = read_u16(rest, malformed)?;
                    (r, u32::from(v))
                };
                asns.push(asn);
            }
            segments.push(AsSegment { kind, asns });
            input = rest;
        }
        Ok(Self { segments })
    }

    /// Encodes with the negotiated ASN width. In 2-octet form, ASNs that
    /// don't fit are written as AS_TRANS; the caller is responsible for
    /// also emitting the AS4_PATH shadow attribute.
    pub fn encode(&self, four_octet: bool, out: &mut Vec<u8>) {
        for seg in &self.segments {
            out.push(seg.kind as u8);
            out.push(seg.asns.len() as u8);
            for &asn in &seg.asns {
                if four_octet {
                    out.extend_from_slice(&asn.to_be_bytes());
                } else {
                    let narrow = if asn > u32::from(u16::MAX) { AS_TRANS } else { asn };
                    out.extend_from_slice(&(narrow as u16).to_be_bytes());
                }
            }
        }
    }

    pub fn encoded_len(&self, four_octet: bool) -> usize {
        let asn_width = if four_octet { 4 } else { 2 };
        self.segments.iter().map(|seg| 2 + seg.asns.len() * asn_width).sum()
    }

    /// True when any ASN needs more than 16 bits, which forces AS_TRANS
    /// substitution plus an AS4_PATH shadow on a 2-octet session.
    pub fn has_wide_asn(&self) -> bool {
        self.segments.iter().any(|seg| seg.asns.iter().any(|&a| a > u32::from(u16::MAX)))
    }

    /// RFC 6793 §4.2.3 reconciliation of a 2-octet AS_PATH with its
    /// AS4_PATH shadow: when the shadow is no longer than the path, the
    /// path's trailing ASNs are replaced by the shadow's true values. A
    /// shadow longer than the path means an older speaker stripped part of
    /// it, so the shadow is discarded.
    pub fn reconcile_with(self, shadow: AsPath) -> AsPath {
        let own = self.asn_count();
        let wide = shadow.asn_count();
        if wide > own {
            return self;
        }
        let keep = own - wide;
        let mut merged = Vec::new();
        let mut remaining = keep;
        for seg in self.segments {
            if remaining == 0 {
                break;
            }
            if seg.asns.len() <= remaining {
                remaining -= seg.asns.len();
                merged.push(seg);
            } else {
                merged.push(AsSegment { kind: seg.kind, asns: seg.asns[..remaining].to_vec() });
                remaining = 0;
            }
        }
        merged.extend(shadow.segments);
        AsPath { segments: merged }
    }
}

impl fmt::Display for AsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in &self.segments {
            for asn in &seg.asns {
                if !first {
                    write!(f, " ")?;
                }
                first = false;
                write!(f, "{asn}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_and_four_octet_forms_round_trip() {
        let path = AsPath::from_sequence(vec![65001, 65002, 65003]);
        for four_octet in [false, true] {
            let mut wire = Vec::new();
            path.encode(four_octet, &mut wire);
            assert_eq!(wire.len(), path.encoded_len(four_octet));
            assert_eq!(AsPath::decode(&wire, four_octet).unwrap(), path);
        }
    }

    #[test]
    fn wide_asn_becomes_as_trans_in_two_octet_form() {
        let path = AsPath::from_sequence(vec![4_200_000_000, 65001]);
        assert!(path.has_wide_asn());
        let mut wire = Vec::new();
        path.encode(false, &mut wire);
        let narrow = AsPath::decode(&wire, false).unwrap();
        assert_eq!(narrow.segments[0].asns, vec![AS_TRANS, 65001]);
    }

    #[test]
    fn set_counts_one_toward_path_length() {
        let path = AsPath {
            segments: vec![
                AsSegment { kind: SegmentKind::Sequence, asns: vec![65001, 65002] },
                AsSegment { kind: SegmentKind::Set, asns: vec![65003, 65004, 65005] },
            ],
        };
        assert_eq!(path.length(), 3);
    }

    #[test]
    fn zero_member_segment_is_malformed() {
        let err = AsPath::decode(&[2, 0], false).unwrap_err();
        assert_eq!(err.subcode, update_error::MALFORMED_AS_PATH);
    }

    #[test]
    fn unknown_segment_kind_is_malformed() {
        assert!(AsPath::decode(&[9, 1, 0xfd, 0xe9], false).is_err());
    }

    #[test]
    fn reconcile_replaces_the_tail_with_true_asns() {
        let narrow = AsPath::from_sequence(vec![65009, AS_TRANS, 65001]);
        let shadow = AsPath::from_sequence(vec![4_200_000_000, 65001]);
        let merged = narrow.reconcile_with(shadow);
        assert_eq!(merged.segments.len(), 2);
        assert_eq!(merged.segments[0].asns, vec![65009]);
        assert_eq!(merged.segments[1].asns, vec![4_200_000_000, 65001]);
    }

    #[test]
    fn oversized_shadow_is_discarded() {
        let narrow = AsPath::from_sequence(vec![65001]);
        let shadow = AsPath::from_sequence(vec![1, 2, 3]);
        assert_eq!(narrow.clone().reconcile_with(shadow), narrow);
    }

    #[test]
    fn prepend_extends_the_leading_sequence() {
        let mut path = AsPath::from_sequence(vec![65002]);
        path.prepend(65001);
        assert_eq!(path.segments[0].asns, vec![65001, 65002]);
        assert_eq!(path.first_as(), Some(65001));
    }
}
