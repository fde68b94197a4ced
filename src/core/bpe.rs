//! Rank-based byte-pair merge.
//!
//! A piece is modelled as a list of boundaries (byte offsets) stored in a
//! flat-array doubly-linked list. Each live boundary carries the rank of the
//! byte span that would result from removing the boundary to its right, i.e.
//! `piece[start(i)..start(next(next(i)))]`. The lowest rank merges first and
//! ties go to the leftmost boundary.
//!
//! After each merge only the two ranks around the merge point are recomputed.
//! Short pieces then find the next minimum with a linear walk over the list,
//! which stays in cache. Long pieces use a `BinaryHeap` keyed on
//! `(rank, original offset)` with lazy invalidation of stale entries, which
//! keeps adversarial inputs (long runs with no whitespace) near-linear.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::vocab::Rank;

/// Pieces longer than this use the heap-based strategy.
const HEAP_THRESHOLD: usize = 32;

const NONE: u32 = u32::MAX;

/// A span that survived merging but is not in the vocabulary.
///
/// Only a vocabulary missing some single-byte entries can produce this.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("merged span {bytes:?} is not in the vocabulary (is every single byte registered?)")]
pub struct MergeError {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    start: u32,
    rank: Rank,
    prev: u32,
    next: u32,
}

struct Boundaries<'a> {
    piece: &'a [u8],
    ranks: &'a FxHashMap<Vec<u8>, Rank>,
    nodes: Vec<Node>,
    /// Boundaries still linked, sentinel included.
    live: usize,
    merges: usize,
}

impl<'a> Boundaries<'a> {
    /// One node per byte offset plus a trailing sentinel at `piece.len()`.
    fn new(piece: &'a [u8], ranks: &'a FxHashMap<Vec<u8>, Rank>) -> Self {
        let n = piece.len();
        let mut nodes = Vec::with_capacity(n + 1);
        for i in 0..=n {
            let rank = if i + 1 < n {
                lookup(ranks, &piece[i..i + 2])
            } else {
                Rank::MAX
            };
            nodes.push(Node {
                start: i as u32,
                rank,
                prev: if i > 0 { (i - 1) as u32 } else { NONE },
                next: if i < n { (i + 1) as u32 } else { NONE },
            });
        }
        Self {
            piece,
            ranks,
            live: nodes.len(),
            nodes,
            merges: 0,
        }
    }

    /// Rank of the span from boundary `i` to the boundary two steps right.
    #[inline]
    fn span_rank(&self, i: usize) -> Rank {
        let j = self.nodes[i].next;
        if j == NONE {
            return Rank::MAX;
        }
        let k = self.nodes[j as usize].next;
        if k == NONE {
            return Rank::MAX;
        }
        let start = self.nodes[i].start as usize;
        let end = self.nodes[k as usize].start as usize;
        lookup(self.ranks, &self.piece[start..end])
    }

    /// Remove the boundary right of `i` and refresh the ranks it touched.
    ///
    /// Returns the indices whose rank changed, predecessor last.
    fn merge(&mut self, i: usize) -> [Option<usize>; 2] {
        let j = self.nodes[i].next as usize;
        let after = self.nodes[j].next;
        self.nodes[i].next = after;
        if after != NONE {
            self.nodes[after as usize].prev = i as u32;
        }
        self.nodes[j].rank = Rank::MAX;
        self.nodes[j].next = NONE;
        self.nodes[j].prev = NONE;
        self.live -= 1;
        self.merges += 1;

        self.nodes[i].rank = self.span_rank(i);
        let pred = self.nodes[i].prev;
        if pred != NONE {
            self.nodes[pred as usize].rank = self.span_rank(pred as usize);
            [Some(i), Some(pred as usize)]
        } else {
            [Some(i), None]
        }
    }

    fn offsets(&self) -> Vec<usize> {
        debug_assert_eq!(self.live + self.merges, self.nodes.len());
        let mut out = Vec::with_capacity(self.live);
        let mut cur = 0u32;
        while cur != NONE {
            let node = &self.nodes[cur as usize];
            out.push(node.start as usize);
            cur = node.next;
        }
        out
    }
}

#[inline]
fn lookup(ranks: &FxHashMap<Vec<u8>, Rank>, span: &[u8]) -> Rank {
    ranks.get(span).copied().unwrap_or(Rank::MAX)
}

/// Merge `piece` down and return the final boundary offsets.
///
/// The result starts at `0`, ends at `piece.len()` and is strictly
/// increasing; consecutive offsets delimit the output tokens.
pub fn byte_pair_merge(piece: &[u8], ranks: &FxHashMap<Vec<u8>, Rank>) -> Vec<usize> {
    let mut list = Boundaries::new(piece, ranks);
    if piece.len() <= HEAP_THRESHOLD {
        merge_linear(&mut list);
    } else {
        merge_heap(&mut list);
    }
    list.offsets()
}

/// Full-walk minimum search after each merge.
fn merge_linear(list: &mut Boundaries<'_>) {
    loop {
        // Strict `<` keeps the leftmost of equal ranks.
        let mut min: (Rank, u32) = (Rank::MAX, NONE);
        let mut cur = 0u32;
        while cur != NONE {
            let node = &list.nodes[cur as usize];
            if node.rank < min.0 {
                min = (node.rank, cur);
            }
            cur = node.next;
        }
        if min.0 == Rank::MAX {
            break;
        }
        list.merge(min.1 as usize);
    }
}

/// Heap-driven minimum search with lazy invalidation.
///
/// Node indices equal original byte offsets and the list never reorders, so
/// ordering heap entries by `(rank, index)` reproduces the leftmost tie-break.
fn merge_heap(list: &mut Boundaries<'_>) {
    let mut heap: BinaryHeap<Reverse<(Rank, u32)>> = BinaryHeap::with_capacity(list.nodes.len());

    for (i, node) in list.nodes.iter().enumerate() {
        if node.rank != Rank::MAX {
            heap.push(Reverse((node.rank, i as u32)));
        }
    }

    while let Some(Reverse((rank, idx))) = heap.pop() {
        let i = idx as usize;
        // Stale: the node was removed or its span changed since the push.
        if list.nodes[i].rank != rank {
            continue;
        }
        for touched in list.merge(i).into_iter().flatten() {
            let new_rank = list.nodes[touched].rank;
            if new_rank != Rank::MAX {
                heap.push(Reverse((new_rank, touched as u32)));
            }
        }
    }
}

/// Encode one piece into ranks.
///
/// Single-byte pieces are looked up directly; everything else goes through
/// [`byte_pair_merge`].
pub fn byte_pair_encode(
    piece: &[u8],
    ranks: &FxHashMap<Vec<u8>, Rank>,
) -> Result<Vec<Rank>, MergeError> {
    if piece.len() == 1 {
        return ranks
            .get(piece)
            .map(|&rank| vec![rank])
            .ok_or_else(|| MergeError {
                bytes: piece.to_vec(),
            });
    }

    byte_pair_merge(piece, ranks)
        .windows(2)
        .map(|w| {
            let span = &piece[w[0]..w[1]];
            ranks.get(span).copied().ok_or_else(|| MergeError {
                bytes: span.to_vec(),
            })
        })
        .collect()
}

/// Split one piece into the byte spans it merges into.
pub fn byte_pair_split<'a>(piece: &'a [u8], ranks: &FxHashMap<Vec<u8>, Rank>) -> Vec<&'a [u8]> {
    if piece.len() <= 1 {
        return vec![piece];
    }
    byte_pair_merge(piece, ranks)
        .windows(2)
        .map(|w| &piece[w[0]..w[1]])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ranks(entries: &[(&[u8], Rank)]) -> FxHashMap<Vec<u8>, Rank> {
        entries.iter().map(|(b, r)| (b.to_vec(), *r)).collect()
    }

    fn run_linear(piece: &[u8], ranks: &FxHashMap<Vec<u8>, Rank>) -> (Vec<usize>, usize) {
        let mut list = Boundaries::new(piece, ranks);
        merge_linear(&mut list);
        let offsets = list.offsets();
        assert_eq!(list.live, offsets.len());
        (offsets, list.merges)
    }

    fn run_heap(piece: &[u8], ranks: &FxHashMap<Vec<u8>, Rank>) -> (Vec<usize>, usize) {
        let mut list = Boundaries::new(piece, ranks);
        merge_heap(&mut list);
        let offsets = list.offsets();
        assert_eq!(list.live, offsets.len());
        (offsets, list.merges)
    }

    /// One boundary disappears per merge, and a piece of n bytes merges at
    /// most n - 1 times.
    fn assert_merge_accounting(piece: &[u8], offsets: &[usize], merges: usize) {
        assert_eq!(merges, piece.len() + 1 - offsets.len());
        assert!(merges <= piece.len().saturating_sub(1));
    }

    /// Every single byte at rank = byte value, plus the given merges.
    fn byte_ranks(merges: &[(&[u8], Rank)]) -> FxHashMap<Vec<u8>, Rank> {
        let mut map: FxHashMap<Vec<u8>, Rank> = (0u8..=255).map(|b| (vec![b], b as Rank)).collect();
        for (bytes, rank) in merges {
            map.insert(bytes.to_vec(), *rank);
        }
        map
    }

    #[test]
    fn test_merge_pair_into_single_token() {
        let ranks = ranks(&[(b"a", 0), (b"b", 1), (b"ab", 2)]);
        assert_eq!(byte_pair_encode(b"ab", &ranks).unwrap(), vec![2]);
        assert_eq!(byte_pair_merge(b"ab", &ranks), vec![0, 2]);
    }

    #[test]
    fn test_leftmost_tie_break() {
        // Both "aa" pairs in "baaa" share rank 5. Merging the left one first
        // leaves "b|aa|a", which then merges into "baa|a". Merging the right
        // one first would strand "b|a|aa".
        let ranks = ranks(&[(b"a", 0), (b"b", 1), (b"aa", 5), (b"baa", 7)]);
        assert_eq!(byte_pair_encode(b"baaa", &ranks).unwrap(), vec![7, 0]);
    }

    #[test]
    fn test_disjoint_equal_pairs() {
        let ranks = ranks(&[(b"a", 0), (b"b", 1), (b"ab", 2)]);
        assert_eq!(byte_pair_encode(b"abab", &ranks).unwrap(), vec![2, 2]);
        assert_eq!(byte_pair_merge(b"abab", &ranks), vec![0, 2, 4]);
    }

    #[test]
    fn test_lower_rank_wins_over_position() {
        let ranks = ranks(&[(b"a", 0), (b"b", 1), (b"c", 2), (b"ab", 9), (b"bc", 3)]);
        assert_eq!(byte_pair_split(b"abc", &ranks), vec![b"a".as_slice(), b"bc"]);
    }

    #[test]
    fn test_no_mergeable_pairs_falls_back_to_bytes() {
        let ranks = byte_ranks(&[]);
        assert_eq!(
            byte_pair_encode(b"xyz", &ranks).unwrap(),
            vec![b'x' as Rank, b'y' as Rank, b'z' as Rank]
        );
    }

    #[test]
    fn test_missing_single_byte_is_an_error() {
        let ranks = ranks(&[(b"a", 0)]);
        assert_eq!(
            byte_pair_encode(b"az", &ranks),
            Err(MergeError { bytes: b"z".to_vec() })
        );
        assert_eq!(
            byte_pair_encode(b"z", &ranks),
            Err(MergeError { bytes: b"z".to_vec() })
        );
    }

    #[test]
    fn test_multi_level_merges() {
        let ranks = byte_ranks(&[(b"he", 256), (b"ll", 257), (b"hell", 258), (b"hello", 259)]);
        assert_eq!(byte_pair_encode(b"hello", &ranks).unwrap(), vec![259]);
        assert_eq!(
            byte_pair_encode(b"hellohe", &ranks).unwrap(),
            vec![259, 256]
        );
    }

    #[test]
    fn test_long_piece_uses_heap_and_matches_linear() {
        let ranks = byte_ranks(&[(b"ab", 256), (b"abab", 257), (b"ba", 258), (b"aab", 259)]);
        let piece: Vec<u8> = b"aababbabaabab".iter().cycle().take(200).copied().collect();
        assert!(piece.len() > HEAP_THRESHOLD);
        assert_eq!(run_heap(&piece, &ranks), run_linear(&piece, &ranks));
    }

    #[test]
    fn test_boundaries_shrink_by_one_per_merge() {
        let ranks = byte_ranks(&[(b"aa", 256), (b"aaaa", 257)]);
        let piece = vec![b'a'; 64];
        for (offsets, merges) in [run_linear(&piece, &ranks), run_heap(&piece, &ranks)] {
            // 32 "aa" merges, then 16 "aaaa" merges.
            assert_eq!(merges, 48);
            assert_eq!(offsets.len(), 17);
            assert!(offsets.windows(2).all(|w| w[1] - w[0] == 4));
            assert_merge_accounting(&piece, &offsets, merges);
        }
    }

    #[test]
    fn test_full_collapse_uses_len_minus_one_merges() {
        let ranks = byte_ranks(&[(b"he", 256), (b"ll", 257), (b"hell", 258), (b"hello", 259)]);
        let (offsets, merges) = run_linear(b"hello", &ranks);
        assert_eq!(offsets, vec![0, 5]);
        assert_eq!(merges, 4);
        assert_merge_accounting(b"hello", &offsets, merges);
    }

    #[test]
    fn test_no_mergeable_pairs_means_no_merges() {
        let ranks = byte_ranks(&[]);
        let short = b"xyz".to_vec();
        let long = vec![b'q'; HEAP_THRESHOLD * 2];
        for piece in [&short, &long] {
            for (offsets, merges) in [run_linear(piece, &ranks), run_heap(piece, &ranks)] {
                assert_eq!(merges, 0);
                assert_eq!(offsets, (0..=piece.len()).collect::<Vec<_>>());
                assert_merge_accounting(piece, &offsets, merges);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_linear_and_heap_agree(
            piece in proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'c')], 2..120)
        ) {
            let ranks = byte_ranks(&[
                (b"ab", 256), (b"bc", 257), (b"ca", 258), (b"aa", 259),
                (b"abc", 260), (b"aab", 261), (b"bca", 262), (b"abca", 263),
            ]);
            let (linear, linear_merges) = run_linear(&piece, &ranks);
            let (heap, heap_merges) = run_heap(&piece, &ranks);
            prop_assert_eq!(&linear, &heap);
            prop_assert_eq!(linear_merges, heap_merges);
            prop_assert_eq!(linear_merges, piece.len() + 1 - linear.len());
            prop_assert!(linear_merges <= piece.len() - 1);
        }

        #[test]
        fn prop_offsets_cover_piece(piece in proptest::collection::vec(any::<u8>(), 2..80)) {
            let ranks = byte_ranks(&[(b"\x00\x01", 256), (b"ab", 257), (b"  ", 258)]);
            let offsets = byte_pair_merge(&piece, &ranks);
            prop_assert_eq!(offsets.first().copied(), Some(0));
            prop_assert_eq!(offsets.last().copied(), Some(piece.len()));
            prop_assert!(offsets.windows(2).all(|w| w[0] < w[1]));
            let tokens = byte_pair_encode(&piece, &ranks).unwrap();
            prop_assert_eq!(tokens.len(), offsets.len() - 1);
        }
    }
}
