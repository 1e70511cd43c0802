//! Compact sets of integer identifiers with `"2,4-7"` range syntax.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Idset parse failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid idset: {0:?}")]
pub struct IdSetError(pub String);

/// An ordered set of u32 identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    ids: BTreeSet<u32>,
}

impl IdSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an id; returns false if already present.
    pub fn insert(&mut self, id: u32) -> bool {
        self.ids.insert(id)
    }

    /// Remove an id; returns false if absent.
    pub fn remove(&mut self, id: u32) -> bool {
        self.ids.remove(&id)
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    /// Number of ids in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when the set holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterate ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids.iter().copied()
    }

    /// Smallest member.
    #[must_use]
    pub fn first(&self) -> Option<u32> {
        self.ids.iter().next().copied()
    }
}

impl FromIterator<u32> for IdSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self { ids: iter.into_iter().collect() }
    }
}

impl FromStr for IdSet {
    type Err = IdSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = IdSet::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(set);
        }
        for part in s.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo.trim().parse().map_err(|_| IdSetError(s.to_string()))?;
                    let hi: u32 = hi.trim().parse().map_err(|_| IdSetError(s.to_string()))?;
                    if lo > hi {
                        return Err(IdSetError(s.to_string()));
                    }
                    for id in lo..=hi {
                        set.insert(id);
                    }
                }
                None => {
                    let id: u32 = part.parse().map_err(|_| IdSetError(s.to_string()))?;
                    set.insert(id);
                }
            }
        }
        Ok(set)
    }
}

impl fmt::Display for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids = self.ids.iter().copied();
        let Some(mut start) = ids.next() else {
            return Ok(());
        };
        let mut end = start;
        let mut first = true;
        let flush = |f: &mut fmt::Formatter<'_>, start: u32, end: u32, first: &mut bool| {
            if !*first {
                write!(f, ",")?;
            }
            *first = false;
            if start == end {
                write!(f, "{start}")
            } else {
                write!(f, "{start}-{end}")
            }
        };
        for id in ids {
            if id == end + 1 {
                end = id;
            } else {
                flush(f, start, end, &mut first)?;
                start = id;
                end = id;
            }
        }
        flush(f, start, end, &mut first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_singletons_and_ranges() {
        let set: IdSet = "2,4-7,11".parse().unwrap();
        assert_eq!(set.len(), 6);
        assert!(set.contains(2));
        assert!(set.contains(4) && set.contains(7));
        assert!(!set.contains(3));
        assert!(set.contains(11));
    }

    #[test]
    fn display_recompacts() {
        let set: IdSet = "4,2,5,6,7,11".parse().unwrap();
        assert_eq!(set.to_string(), "2,4-7,11");
        let single: IdSet = "3".parse().unwrap();
        assert_eq!(single.to_string(), "3");
    }

    #[test]
    fn empty_set() {
        let set: IdSet = "".parse().unwrap();
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("x".parse::<IdSet>().is_err());
        assert!("5-2".parse::<IdSet>().is_err());
        assert!("1,,3".parse::<IdSet>().is_err());
    }

    #[test]
    fn round_trip() {
        for s in ["0", "0-5", "1,3,5", "0-2,9-10"] {
            let set: IdSet = s.parse().unwrap();
            assert_eq!(set.to_string(), s);
        }
    }
}
