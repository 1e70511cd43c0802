//! k-ary tree arithmetic over ranks `[0, size)`.
//!
//! Pure functions of `(k, size)`; no I/O. Rank 0 is the root; the i-th
//! child of rank r is `k*r + i + 1` when that value is below `size`.

use crate::error::OverlayError;

/// A broker's position in the k-ary tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    k: u32,
    size: u32,
    rank: u32,
}

impl Topology {
    /// Build a topology view for `rank` in a tree of `size` ranks with
    /// arity `k`.
    pub fn new(k: u32, size: u32, rank: u32) -> Result<Self, OverlayError> {
        if k == 0 {
            return Err(OverlayError::Geometry("arity must be at least 1"));
        }
        if size == 0 {
            return Err(OverlayError::Geometry("size must be at least 1"));
        }
        if rank >= size {
            return Err(OverlayError::Geometry("rank out of range"));
        }
        Ok(Self { k, size, rank })
    }

    /// Tree arity.
    #[must_use]
    pub fn arity(&self) -> u32 {
        self.k
    }

    /// Number of ranks in the tree.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// This broker's rank.
    #[must_use]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Parent of this rank, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<u32> {
        parent_of(self.k, self.rank)
    }

    /// The i-th child of this rank, if it exists in the tree.
    #[must_use]
    pub fn child(&self, i: u32) -> Option<u32> {
        child_of(self.k, self.size, self.rank, i)
    }

    /// Number of direct children of this rank.
    #[must_use]
    pub fn children_count(&self) -> u32 {
        (0..self.k).take_while(|&i| self.child(i).is_some()).count() as u32
    }

    /// Iterate the direct children of this rank.
    pub fn children(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.k).map_while(|i| self.child(i))
    }

    /// The child rank through which `dst` is reached, or `None` when
    /// `dst` is not in this rank's subtree (or is this rank itself).
    #[must_use]
    pub fn child_route(&self, dst: u32) -> Option<u32> {
        if dst >= self.size || dst == self.rank || dst < self.rank {
            return None;
        }
        let mut cur = dst;
        loop {
            let parent = parent_of(self.k, cur)?;
            if parent == self.rank {
                return Some(cur);
            }
            if parent < self.rank {
                return None;
            }
            cur = parent;
        }
    }

    /// Depth of this rank below the root (root is level 0).
    #[must_use]
    pub fn level(&self) -> u32 {
        level_of(self.k, self.rank)
    }

    /// Depth of the deepest rank in the tree.
    #[must_use]
    pub fn max_level(&self) -> u32 {
        level_of(self.k, self.size - 1)
    }

    /// Number of ranks in this rank's subtree, excluding itself.
    #[must_use]
    pub fn descendants(&self) -> u32 {
        self.children()
            .map(|c| {
                Topology { k: self.k, size: self.size, rank: c }.descendants() + 1
            })
            .sum()
    }

    /// The deterministic route identifier for a rank.
    #[must_use]
    pub fn uuid(rank: u32) -> String {
        rank.to_string()
    }

    /// Ranks with at least one child, ascending.
    pub fn internal_ranks(k: u32, size: u32) -> impl Iterator<Item = u32> {
        (0..size).filter(move |&r| (k as u64) * (r as u64) + 1 < size as u64)
    }
}

fn parent_of(k: u32, rank: u32) -> Option<u32> {
    if rank == 0 {
        None
    } else {
        Some((rank - 1) / k)
    }
}

fn child_of(k: u32, size: u32, rank: u32, i: u32) -> Option<u32> {
    if i >= k {
        return None;
    }
    // k*rank + i + 1, guarding overflow for large ranks
    let child = (k as u64) * (rank as u64) + (i as u64) + 1;
    if child < size as u64 {
        Some(child as u32)
    } else {
        None
    }
}

fn level_of(k: u32, rank: u32) -> u32 {
    if k == 1 {
        return rank;
    }
    let mut level = 0;
    let mut first_of_next = 1u64; // first rank at level + 1
    let mut width = k as u64;
    while (rank as u64) >= first_of_next {
        first_of_next += width;
        width *= k as u64;
        level += 1;
    }
    level
}
