//! The journal's pool of chain segments waiting to be freed.
//!
//! Files that are unlinked while still open keep their clusters until the
//! last close. Their chains are moved into one pool chain: each segment's
//! last cluster links to the next segment's start and the final segment ends
//! in a tail. This list mirrors that chain in memory. Rewriting the FAT is
//! left to the caller, which gets a [`Splice`] telling it which link changes.

use alloc::vec::Vec;

use crate::types::{Cluster, Segment};

/// How the pool chain has to be rewritten when a segment leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Splice {
    /// The pool becomes empty.
    Only { segment: Segment },
    /// The pool head moves to the next segment's start.
    First { segment: Segment, new_head: Cluster },
    /// The previous segment's last cluster now links to the next start.
    Middle {
        segment: Segment,
        prev_last: Cluster,
        next_start: Cluster,
    },
    /// The previous segment's last cluster becomes the pool tail.
    Last { segment: Segment, prev_last: Cluster },
}

impl Splice {
    pub fn segment(&self) -> Segment {
        match *self {
            Splice::Only { segment }
            | Splice::First { segment, .. }
            | Splice::Middle { segment, .. }
            | Splice::Last { segment, .. } => segment,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SegmentList {
    segments: Vec<Segment>,
}

impl SegmentList {
    pub const fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// First cluster of the pool chain.
    pub fn head(&self) -> Option<Cluster> {
        self.segments.first().map(|s| s.start)
    }

    /// Last cluster of the pool chain.
    pub fn tail(&self) -> Option<Cluster> {
        self.segments.last().map(|s| s.last)
    }

    /// Appends a segment. Returns the previous pool tail, which the caller
    /// links to `start`; `None` means `start` is the new pool head.
    pub fn add(&mut self, start: Cluster, last: Cluster) -> Option<Cluster> {
        let prev_tail = self.tail();
        self.segments.push(Segment { start, last });
        prev_tail
    }

    pub fn lookup(&self, start: Cluster) -> Option<&Segment> {
        self.segments.iter().find(|s| s.start == start)
    }

    /// Works out the splice for removing the segment ending at `last`
    /// without changing the list.
    pub fn plan_splice(&self, last: Cluster) -> Option<Splice> {
        let at = self.segments.iter().position(|s| s.last == last)?;
        let segment = self.segments[at];
        let prev = at.checked_sub(1).map(|i| self.segments[i]);
        let next = self.segments.get(at + 1).copied();
        Some(match (prev, next) {
            (None, None) => Splice::Only { segment },
            (None, Some(next)) => Splice::First {
                segment,
                new_head: next.start,
            },
            (Some(prev), Some(next)) => Splice::Middle {
                segment,
                prev_last: prev.last,
                next_start: next.start,
            },
            (Some(prev), None) => Splice::Last {
                segment,
                prev_last: prev.last,
            },
        })
    }

    /// Removes the segment ending at `last` and returns how its neighbours
    /// must be relinked.
    pub fn splice_free(&mut self, last: Cluster) -> Option<Splice> {
        let splice = self.plan_splice(last)?;
        self.segments.retain(|s| s.last != last);
        Some(splice)
    }

    /// Drops every segment. Used once the whole pool chain has been freed.
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Segment> {
        self.segments.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> SegmentList {
        let mut list = SegmentList::new();
        assert_eq!(list.add(10, 12), None);
        assert_eq!(list.add(20, 22), Some(12));
        assert_eq!(list.add(30, 32), Some(22));
        list
    }

    #[test]
    fn head_and_tail_follow_segments() {
        let list = pool();
        assert_eq!(list.head(), Some(10));
        assert_eq!(list.tail(), Some(32));
        assert_eq!(list.lookup(20), Some(&Segment { start: 20, last: 22 }));
        assert_eq!(list.lookup(21), None);
    }

    #[test]
    fn removing_middle_links_neighbours() {
        let mut list = pool();
        let splice = list.splice_free(22).unwrap();
        assert_eq!(
            splice,
            Splice::Middle {
                segment: Segment { start: 20, last: 22 },
                prev_last: 12,
                next_start: 30
            }
        );
        assert_eq!(list.len(), 2);
        assert_eq!(list.head(), Some(10));
        assert_eq!(list.tail(), Some(32));
    }

    #[test]
    fn removing_first_moves_head() {
        let mut list = pool();
        assert_eq!(
            list.splice_free(12).unwrap(),
            Splice::First {
                segment: Segment { start: 10, last: 12 },
                new_head: 20
            }
        );
        assert_eq!(list.head(), Some(20));
    }

    #[test]
    fn removing_last_moves_tail() {
        let mut list = pool();
        assert_eq!(
            list.splice_free(32).unwrap(),
            Splice::Last {
                segment: Segment { start: 30, last: 32 },
                prev_last: 22
            }
        );
        assert_eq!(list.tail(), Some(22));
    }

    #[test]
    fn removing_only_segment_empties_pool() {
        let mut list = SegmentList::new();
        list.add(5, 9);
        assert_eq!(
            list.splice_free(9).unwrap(),
            Splice::Only {
                segment: Segment { start: 5, last: 9 }
            }
        );
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
    }

    #[test]
    fn unknown_segment_is_left_alone() {
        let mut list = pool();
        assert_eq!(list.splice_free(11), None);
        assert_eq!(list.len(), 3);
    }
}
