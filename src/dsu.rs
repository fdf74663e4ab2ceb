//! # Disjoint Set Union
//!
//! Union-find over the dense point indices of a universe, backing the
//! must-link equivalence classes. Path halving on the mutable find keeps
//! chains short; union by rank keeps trees shallow. A non-compressing find
//! lets read-only queries run against a shared reference.

use crate::model::PointIdx;

/// Union-find with union by rank and path halving.
#[derive(Debug, Clone)]
pub struct DisjointSets {
    parent: Vec<u32>,
    rank: Vec<u8>,
    set_count: usize,
}

impl DisjointSets {
    /// Create `n` singleton sets, one per dense index.
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n as u32).collect(),
            rank: vec![0; n],
            set_count: n,
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Number of disjoint sets currently alive.
    #[inline]
    pub fn set_count(&self) -> usize {
        self.set_count
    }

    /// Representative of `x` without mutating the forest.
    ///
    /// Queries go through this so that lookups work on `&self`; the chains
    /// it walks were already shortened by [`find_compress`] during unions.
    ///
    /// [`find_compress`]: DisjointSets::find_compress
    #[inline]
    pub fn find(&self, x: PointIdx) -> PointIdx {
        let mut i = x.0;
        while self.parent[i as usize] != i {
            i = self.parent[i as usize];
        }
        PointIdx(i)
    }

    /// Representative of `x`, halving the path on the way up.
    #[inline]
    pub fn find_compress(&mut self, x: PointIdx) -> PointIdx {
        let mut i = x.0;
        while self.parent[i as usize] != i {
            self.parent[i as usize] = self.parent[self.parent[i as usize] as usize];
            i = self.parent[i as usize];
        }
        PointIdx(i)
    }

    /// Whether `a` and `b` are in the same set.
    #[inline]
    pub fn same_set(&self, a: PointIdx, b: PointIdx) -> bool {
        self.find(a) == self.find(b)
    }

    /// Merge the sets containing `a` and `b`.
    ///
    /// Returns `Some((winner, loser))` with the surviving and absorbed
    /// representatives, or `None` if the two were already in one set.
    pub fn union(&mut self, a: PointIdx, b: PointIdx) -> Option<(PointIdx, PointIdx)> {
        let ra = self.find_compress(a);
        let rb = self.find_compress(b);
        if ra == rb {
            return None;
        }

        let (winner, loser) = match self.rank[ra.index()].cmp(&self.rank[rb.index()]) {
            std::cmp::Ordering::Less => (rb, ra),
            std::cmp::Ordering::Greater => (ra, rb),
            std::cmp::Ordering::Equal => {
                self.rank[ra.index()] += 1;
                (ra, rb)
            }
        };

        self.parent[loser.index()] = winner.0;
        self.set_count -= 1;
        Some((winner, loser))
    }

    /// Current representative of every index, in index order.
    pub fn representatives(&self) -> impl Iterator<Item = PointIdx> + '_ {
        (0..self.parent.len() as u32).map(|i| self.find(PointIdx(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons() {
        let dsu = DisjointSets::new(4);
        assert_eq!(dsu.set_count(), 4);
        for i in 0..4 {
            assert_eq!(dsu.find(PointIdx(i)), PointIdx(i));
        }
    }

    #[test]
    fn test_union_merges_and_counts() {
        let mut dsu = DisjointSets::new(5);
        assert!(dsu.union(PointIdx(0), PointIdx(1)).is_some());
        assert_eq!(dsu.set_count(), 4);
        assert!(dsu.same_set(PointIdx(0), PointIdx(1)));
        assert!(!dsu.same_set(PointIdx(0), PointIdx(2)));

        // Union within one set is a no-op.
        assert!(dsu.union(PointIdx(1), PointIdx(0)).is_none());
        assert_eq!(dsu.set_count(), 4);
    }

    #[test]
    fn test_union_reports_winner_and_loser() {
        let mut dsu = DisjointSets::new(4);
        let (winner, loser) = dsu.union(PointIdx(0), PointIdx(1)).unwrap();
        assert_ne!(winner, loser);
        assert_eq!(dsu.find(loser), winner);

        // Ranked root absorbs the singleton.
        let (winner2, loser2) = dsu.union(PointIdx(0), PointIdx(2)).unwrap();
        assert_eq!(winner2, winner);
        assert_eq!(loser2, PointIdx(2));
    }

    #[test]
    fn test_transitivity_through_chains() {
        let mut dsu = DisjointSets::new(8);
        for i in 0..7 {
            dsu.union(PointIdx(i), PointIdx(i + 1));
        }
        assert_eq!(dsu.set_count(), 1);
        assert!(dsu.same_set(PointIdx(0), PointIdx(7)));
        assert!(dsu.same_set(PointIdx(3), PointIdx(6)));
    }

    #[test]
    fn test_read_only_find_agrees_with_compressing_find() {
        let mut dsu = DisjointSets::new(16);
        for i in (0..16).step_by(2) {
            dsu.union(PointIdx(i), PointIdx(i + 1));
        }
        dsu.union(PointIdx(0), PointIdx(4));
        dsu.union(PointIdx(4), PointIdx(8));

        for i in 0..16 {
            let frozen = dsu.find(PointIdx(i));
            let compressed = dsu.find_compress(PointIdx(i));
            assert_eq!(frozen, compressed);
        }
    }
}
