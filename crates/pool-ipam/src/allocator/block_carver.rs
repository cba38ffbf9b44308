//! Block carver for partitioning a pool's span
//!
//! Tracks which parts of a pool are owned by node assignments and carves new
//! non-overlapping blocks out of the remaining free space. Occupied ranges are
//! kept in a BTreeMap keyed by their first address for O(log n) gap lookup.

use crate::models::AddrRange;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Carves disjoint blocks out of a pool span
#[derive(Debug, Clone)]
pub struct BlockCarver {
    /// Address space being partitioned
    span: AddrRange,
    /// Occupied ranges keyed by numeric start
    occupied: BTreeMap<u128, AddrRange>,
}

impl BlockCarver {
    pub fn new(span: AddrRange) -> Self {
        Self {
            span,
            occupied: BTreeMap::new(),
        }
    }

    pub fn span(&self) -> AddrRange {
        self.span
    }

    /// Mark an existing range as owned
    pub fn occupy(&mut self, range: AddrRange) -> Result<()> {
        if !self.span.contains_range(&range) {
            return Err(Error::InvalidArgument(format!(
                "range {} is not within {}",
                range, self.span
            )));
        }
        if let Some(existing) = self.overlapping(&range) {
            return Err(Error::InvalidArgument(format!(
                "range {} overlaps {}",
                range, existing
            )));
        }
        self.occupied.insert(range.lo(), range);
        Ok(())
    }

    /// First occupied range overlapping the given one
    pub fn overlapping(&self, range: &AddrRange) -> Option<AddrRange> {
        // entries are disjoint: only the last one starting before `range.hi()` can reach it
        self.occupied
            .range(..=range.hi())
            .next_back()
            .map(|(_, r)| *r)
            .filter(|r| r.overlaps(range))
    }

    /// Free segments in ascending order
    pub fn free_segments(&self) -> Vec<AddrRange> {
        let family = self.span.family();
        let mut segments = Vec::new();
        let mut cursor = Some(self.span.lo());

        for range in self.occupied.values() {
            let Some(start) = cursor else { break };
            if start < range.lo() {
                segments.push(AddrRange::from_bounds(start, range.lo() - 1, family));
            }
            cursor = range.hi().checked_add(1).filter(|next| *next <= self.span.hi());
        }

        if let Some(start) = cursor {
            if start <= self.span.hi() {
                segments.push(AddrRange::from_bounds(start, self.span.hi(), family));
            }
        }
        segments
    }

    /// Total number of free addresses
    pub fn free_len(&self) -> u128 {
        self.free_segments()
            .iter()
            .fold(0u128, |acc, r| acc.saturating_add(r.len()))
    }

    /// Carve `size` addresses.
    ///
    /// Takes the start of the lowest free segment able to hold the whole block;
    /// when none can, assembles the block from the lowest free segments.
    /// Returns `None` without side effects when less than `size` is free.
    pub fn carve(&mut self, size: u128) -> Option<Vec<AddrRange>> {
        if size == 0 {
            return None;
        }
        let segments = self.free_segments();
        let family = self.span.family();

        let carved = if let Some(segment) = segments.iter().find(|s| s.len() >= size) {
            vec![AddrRange::from_bounds(
                segment.lo(),
                segment.lo() + (size - 1),
                family,
            )]
        } else {
            let mut remaining = size;
            let mut pieces = Vec::new();
            for segment in &segments {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(segment.len());
                pieces.push(AddrRange::from_bounds(
                    segment.lo(),
                    segment.lo() + (take - 1),
                    family,
                ));
                remaining -= take;
            }
            if remaining > 0 {
                return None;
            }
            pieces
        };

        for piece in &carved {
            self.occupied.insert(piece.lo(), *piece);
        }
        Some(carved)
    }

    /// Mark whatever part of a range is still free as owned.
    ///
    /// Addresses outside the span or already owned are skipped. Returns the
    /// number of addresses newly held.
    pub fn occupy_free(&mut self, range: &AddrRange) -> u128 {
        if range.family() != self.span.family() {
            return 0;
        }
        let family = self.span.family();
        let mut held = 0u128;
        for segment in self.free_segments() {
            if !segment.overlaps(range) {
                continue;
            }
            let piece = AddrRange::from_bounds(
                segment.lo().max(range.lo()),
                segment.hi().min(range.hi()),
                family,
            );
            held = held.saturating_add(piece.len());
            self.occupied.insert(piece.lo(), piece);
        }
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(s: &str) -> AddrRange {
        s.parse().unwrap()
    }

    #[test]
    fn test_carve_sequential() {
        let mut carver = BlockCarver::new(range("10.0.0.1-10.0.0.254"));
        assert_eq!(carver.carve(10).unwrap(), vec![range("10.0.0.1-10.0.0.10")]);
        assert_eq!(carver.carve(10).unwrap(), vec![range("10.0.0.11-10.0.0.20")]);
        assert_eq!(carver.free_len(), 234);
    }

    #[test]
    fn test_carve_fills_gap_first_fit() {
        let mut carver = BlockCarver::new(range("10.0.0.1-10.0.0.100"));
        carver.occupy(range("10.0.0.11-10.0.0.20")).unwrap();
        assert_eq!(carver.carve(10).unwrap(), vec![range("10.0.0.1-10.0.0.10")]);
        assert_eq!(carver.carve(5).unwrap(), vec![range("10.0.0.21-10.0.0.25")]);
    }

    #[test]
    fn test_carve_skips_small_gap() {
        let mut carver = BlockCarver::new(range("10.0.0.1-10.0.0.100"));
        carver.occupy(range("10.0.0.4-10.0.0.50")).unwrap();
        assert_eq!(carver.carve(5).unwrap(), vec![range("10.0.0.51-10.0.0.55")]);
    }

    #[test]
    fn test_carve_assembles_fragments() {
        let mut carver = BlockCarver::new(range("10.0.0.1-10.0.0.10"));
        carver.occupy(range("10.0.0.4-10.0.0.7")).unwrap();
        assert_eq!(
            carver.carve(5).unwrap(),
            vec![range("10.0.0.1-10.0.0.3"), range("10.0.0.8-10.0.0.9")]
        );
        assert_eq!(carver.free_segments(), vec![range("10.0.0.10")]);
    }

    #[test]
    fn test_carve_exhausted_has_no_side_effects() {
        let mut carver = BlockCarver::new(range("10.0.0.1-10.0.0.4"));
        carver.carve(3).unwrap();
        assert!(carver.carve(2).is_none());
        assert_eq!(carver.free_len(), 1);
    }

    #[test]
    fn test_occupy_rejects_overlap_and_outside() {
        let mut carver = BlockCarver::new(range("10.0.0.1-10.0.0.100"));
        carver.occupy(range("10.0.0.10-10.0.0.20")).unwrap();
        assert!(carver.occupy(range("10.0.0.20-10.0.0.30")).is_err());
        assert!(carver.occupy(range("10.0.0.5-10.0.0.50")).is_err());
        assert!(carver.occupy(range("10.0.0.90-10.0.0.110")).is_err());
        assert!(carver.occupy(range("10.0.0.21-10.0.0.30")).is_ok());
    }

    #[test]
    fn test_free_segments_with_full_tail() {
        let mut carver = BlockCarver::new(range("10.0.0.1-10.0.0.10"));
        carver.occupy(range("10.0.0.5-10.0.0.10")).unwrap();
        assert_eq!(carver.free_segments(), vec![range("10.0.0.1-10.0.0.4")]);
    }

    #[test]
    fn test_occupy_free_clips_to_span_and_owned() {
        let mut carver = BlockCarver::new(range("10.0.0.1-10.0.0.10"));
        carver.occupy(range("10.0.0.3-10.0.0.4")).unwrap();

        // straddles an owned block and the end of the span
        assert_eq!(carver.occupy_free(&range("10.0.0.2-10.0.0.12")), 7);
        assert_eq!(carver.free_segments(), vec![range("10.0.0.1")]);
        assert_eq!(carver.occupy_free(&range("10.0.0.20-10.0.0.30")), 0);
        assert_eq!(carver.carve(1).unwrap(), vec![range("10.0.0.1")]);
    }
}
