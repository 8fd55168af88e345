//! Per-VNI sets of assigned addresses.
//!
//! Addresses are kept as a sorted list of inclusive `[start, end]` runs, so
//! membership and insertion are `O(log n + k)` in the number of runs and a
//! densely-allocated subnet collapses to a single run.

use std::collections::HashMap;
use std::sync::Mutex;

/// Sorted, disjoint, coalesced runs of u32 values.
#[derive(Debug, Default)]
pub struct RunSet {
    runs: Vec<(u32, u32)>,
}

impl RunSet {
    /// Ok(i): runs[i] contains n. Err(i): insertion position for n.
    fn find(&self, n: u32) -> Result<usize, usize> {
        self.runs.binary_search_by(|&(start, end)| {
            if end < n {
                std::cmp::Ordering::Less
            } else if start > n {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        })
    }

    pub fn contains(&self, n: u32) -> bool {
        self.find(n).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Inserts `n`; false if it was already present.
    pub fn add(&mut self, n: u32) -> bool {
        let i = match self.find(n) {
            Ok(_) => return false,
            Err(i) => i,
        };
        let joins_left = i > 0 && self.runs[i - 1].1 == n.wrapping_sub(1) && n > 0;
        let joins_right = i < self.runs.len() && self.runs[i].0 == n.wrapping_add(1) && n < u32::MAX;
        match (joins_left, joins_right) {
            (true, true) => {
                self.runs[i - 1].1 = self.runs[i].1;
                self.runs.remove(i);
            }
            (true, false) => self.runs[i - 1].1 = n,
            (false, true) => self.runs[i].0 = n,
            (false, false) => self.runs.insert(i, (n, n)),
        }
        true
    }

    /// Removes `n`; false if it was not present.
    pub fn remove(&mut self, n: u32) -> bool {
        let i = match self.find(n) {
            Ok(i) => i,
            Err(_) => return false,
        };
        let (start, end) = self.runs[i];
        if start == end {
            self.runs.remove(i);
        } else if n == start {
            self.runs[i].0 = n + 1;
        } else if n == end {
            self.runs[i].1 = n - 1;
        } else {
            self.runs[i].1 = n - 1;
            self.runs.insert(i + 1, (n + 1, end));
        }
        true
    }

    /// Chooses some value in `[min, max]` not yet in the set, inserts it and
    /// returns it. None if the range is saturated.
    pub fn add_one_in_range(&mut self, min: u32, max: u32) -> Option<u32> {
        if min > max {
            return None;
        }
        let mut candidate = min;
        let mut i = match self.find(min) {
            Ok(i) => i,
            Err(i) => i,
        };
        while i < self.runs.len() && self.runs[i].0 <= candidate {
            candidate = self.runs[i].1.checked_add(1)?;
            i += 1;
        }
        if candidate > max {
            return None;
        }
        self.add(candidate);
        Some(candidate)
    }
}

/// Process-wide mapping of VNI to the set of addresses assigned in it. One
/// mutex guards the outer map and every inner set; all operations hold it
/// for their full duration.
#[derive(Debug, Default)]
pub struct VniAddressCache {
    inner: Mutex<HashMap<u32, RunSet>>,
}

impl VniAddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the address as assigned; true if the cache changed.
    pub fn take(&self, vni: u32, addr: u32) -> bool {
        self.inner.lock().unwrap().entry(vni).or_default().add(addr)
    }

    /// Marks the address as free; true if the cache changed. Empty per-VNI
    /// sets are garbage-collected.
    pub fn release(&self, vni: u32, addr: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(set) = inner.get_mut(&vni) else {
            return false;
        };
        let changed = set.remove(addr);
        if set.is_empty() {
            inner.remove(&vni);
        }
        changed
    }

    /// Picks a free address in `[min, max]`, marks it assigned and returns
    /// it. None when the range is saturated.
    pub fn pick(&self, vni: u32, min: u32, max: u32) -> Option<u32> {
        self.inner
            .lock()
            .unwrap()
            .entry(vni)
            .or_default()
            .add_one_in_range(min, max)
    }

    pub fn contains(&self, vni: u32, addr: u32) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(&vni)
            .is_some_and(|s| s.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_coalesce() {
        let mut s = RunSet::default();
        assert!(s.add(5));
        assert!(!s.add(5));
        assert!(s.add(7));
        assert!(s.add(6));
        // 5..=7 coalesced into one run.
        assert_eq!(s.runs, vec![(5, 7)]);
        assert!(s.remove(6));
        assert_eq!(s.runs, vec![(5, 5), (7, 7)]);
        assert!(!s.remove(6));
        assert!(s.remove(5));
        assert!(s.remove(7));
        assert!(s.is_empty());
    }

    #[test]
    fn pick_fills_range_then_fails() {
        let mut s = RunSet::default();
        let mut got = Vec::new();
        while let Some(n) = s.add_one_in_range(10, 13) {
            got.push(n);
        }
        got.sort_unstable();
        assert_eq!(got, vec![10, 11, 12, 13]);
        assert_eq!(s.add_one_in_range(10, 13), None);
        // Freeing one spot makes picking succeed again.
        assert!(s.remove(12));
        assert_eq!(s.add_one_in_range(10, 13), Some(12));
    }

    #[test]
    fn pick_skips_existing_runs() {
        let mut s = RunSet::default();
        s.add(10);
        s.add(11);
        s.add(13);
        assert_eq!(s.add_one_in_range(10, 15), Some(12));
        assert_eq!(s.add_one_in_range(10, 15), Some(14));
    }

    #[test]
    fn pick_at_u32_extremes() {
        let mut s = RunSet::default();
        assert_eq!(s.add_one_in_range(u32::MAX, u32::MAX), Some(u32::MAX));
        assert_eq!(s.add_one_in_range(u32::MAX, u32::MAX), None);
        assert_eq!(s.add_one_in_range(0, 0), Some(0));
        assert_eq!(s.add_one_in_range(0, 0), None);
    }

    #[test]
    fn pick_release_round_trips() {
        let cache = VniAddressCache::new();
        let picked = cache.pick(7, 100, 200).unwrap();
        assert!(cache.contains(7, picked));
        assert!(cache.release(7, picked));
        assert!(!cache.contains(7, picked));
        // The per-VNI set was garbage-collected, so release is a no-op now.
        assert!(!cache.release(7, picked));
    }

    #[test]
    fn take_is_idempotent_per_vni() {
        let cache = VniAddressCache::new();
        assert!(cache.take(1, 42));
        assert!(!cache.take(1, 42));
        assert!(cache.take(2, 42));
    }
}
