//! Growable bit vector keyed by job id.
//!
//! Status sets, affinity reverse-index entries and timeline slots are all
//! dense id ranges, so a plain word vector is far cheaper than a hash set.

const WORD_BITS: u64 = 64;

/// Ordered set of `u64` ids stored as bits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
    count: usize,
}

impl BitSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn locate(id: u64) -> (usize, u64) {
        ((id / WORD_BITS) as usize, 1u64 << (id % WORD_BITS))
    }

    /// Insert `id`, returning `true` if it was not already present.
    pub fn insert(&mut self, id: u64) -> bool {
        let (word, mask) = Self::locate(id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.count += 1;
        true
    }

    /// Remove `id`, returning `true` if it was present.
    pub fn remove(&mut self, id: u64) -> bool {
        let (word, mask) = Self::locate(id);
        match self.words.get_mut(word) {
            Some(w) if *w & mask != 0 => {
                *w &= !mask;
                self.count -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        let (word, mask) = Self::locate(id);
        self.words.get(word).is_some_and(|w| w & mask != 0)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.count = 0;
    }

    /// Smallest id in the set.
    pub fn first(&self) -> Option<u64> {
        self.next_from(0)
    }

    /// Largest id in the set.
    pub fn last(&self) -> Option<u64> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i as u64 * WORD_BITS + (WORD_BITS - 1 - w.leading_zeros() as u64))
    }

    /// Smallest id `>= from`.
    pub fn next_from(&self, from: u64) -> Option<u64> {
        let (mut word, _) = Self::locate(from);
        if word >= self.words.len() {
            return None;
        }
        let shift = from % WORD_BITS;
        let mut bits = self.words[word] & (!0u64 << shift);
        loop {
            if bits != 0 {
                return Some(word as u64 * WORD_BITS + bits.trailing_zeros() as u64);
            }
            word += 1;
            if word >= self.words.len() {
                return None;
            }
            bits = self.words[word];
        }
    }

    /// Insert every id in `start..=end`.
    pub fn insert_range(&mut self, start: u64, end: u64) {
        for id in start..=end {
            self.insert(id);
        }
    }

    /// Drop every id below `bound`. Returns the number removed.
    pub fn remove_below(&mut self, bound: u64) -> usize {
        let ids: Vec<u64> = self.iter().take_while(|id| *id < bound).collect();
        for id in &ids {
            self.remove(*id);
        }
        ids.len()
    }

    /// Keep only ids also present in `other`.
    pub fn intersect_with(&mut self, other: &BitSet) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= other.words.get(i).copied().unwrap_or(0);
        }
        self.recount();
    }

    /// Remove every id present in `other`.
    pub fn difference_with(&mut self, other: &BitSet) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= !other.words.get(i).copied().unwrap_or(0);
        }
        self.recount();
    }

    /// Add every id present in `other`.
    pub fn union_with(&mut self, other: &BitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (i, w) in other.words.iter().enumerate() {
            self.words[i] |= *w;
        }
        self.recount();
    }

    /// First id present in both sets.
    pub fn first_common(&self, other: &BitSet) -> Option<u64> {
        self.words
            .iter()
            .zip(other.words.iter())
            .enumerate()
            .find(|(_, (a, b))| **a & **b != 0)
            .map(|(i, (a, b))| i as u64 * WORD_BITS + (a & b).trailing_zeros() as u64)
    }

    /// First id of `self` not present in `other`.
    pub fn first_not_in(&self, other: &BitSet) -> Option<u64> {
        self.words
            .iter()
            .enumerate()
            .map(|(i, w)| (i, w & !other.words.get(i).copied().unwrap_or(0)))
            .find(|(_, w)| *w != 0)
            .map(|(i, w)| i as u64 * WORD_BITS + w.trailing_zeros() as u64)
    }

    /// Release trailing empty words.
    pub fn shrink_to_fit(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
        self.words.shrink_to_fit();
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            set: self,
            next: 0,
        }
    }

    fn recount(&mut self) {
        self.count = self.words.iter().map(|w| w.count_ones() as usize).sum();
    }
}

/// Ascending iterator over a [`BitSet`].
pub struct Iter<'a> {
    set: &'a BitSet,
    next: u64,
}

impl Iterator for Iter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let id = self.set.next_from(self.next)?;
        self.next = id + 1;
        Some(id)
    }
}

impl<'a> IntoIterator for &'a BitSet {
    type Item = u64;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

impl FromIterator<u64> for BitSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut set = BitSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<u64> for BitSet {
    fn extend<I: IntoIterator<Item = u64>>(&mut self, iter: I) {
        for id in iter {
            self.insert(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_contains() {
        let mut set = BitSet::new();
        assert!(set.insert(5));
        assert!(!set.insert(5));
        assert!(set.insert(200));
        assert!(set.contains(5));
        assert!(set.contains(200));
        assert!(!set.contains(6));
        assert_eq!(set.len(), 2);
        assert!(set.remove(5));
        assert!(!set.remove(5));
        assert!(!set.remove(10_000));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_ordering_queries() {
        let set: BitSet = [3, 64, 65, 700].into_iter().collect();
        assert_eq!(set.first(), Some(3));
        assert_eq!(set.last(), Some(700));
        assert_eq!(set.next_from(4), Some(64));
        assert_eq!(set.next_from(66), Some(700));
        assert_eq!(set.next_from(701), None);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 64, 65, 700]);
    }

    #[test]
    fn test_set_algebra() {
        let a: BitSet = [1, 2, 3, 100].into_iter().collect();
        let b: BitSet = [2, 100, 300].into_iter().collect();

        let mut i = a.clone();
        i.intersect_with(&b);
        assert_eq!(i.iter().collect::<Vec<_>>(), vec![2, 100]);
        assert_eq!(i.len(), 2);

        let mut d = a.clone();
        d.difference_with(&b);
        assert_eq!(d.iter().collect::<Vec<_>>(), vec![1, 3]);

        let mut u = a.clone();
        u.union_with(&b);
        assert_eq!(u.len(), 5);

        assert_eq!(a.first_common(&b), Some(2));
        assert_eq!(b.first_not_in(&a), Some(300));
    }

    #[test]
    fn test_range_and_truncation() {
        let mut set = BitSet::new();
        set.insert_range(10, 19);
        assert_eq!(set.len(), 10);
        assert_eq!(set.remove_below(15), 5);
        assert_eq!(set.first(), Some(15));
        set.remove_below(1000);
        set.shrink_to_fit();
        assert!(set.is_empty());
        assert_eq!(set.last(), None);
    }
}
