// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Pending set: tokens drained from ingress and awaiting completion
//!
//! Owned by the poller alone, so it is a plain dense vector. Removal is a
//! swap-remove; scan order is therefore unspecified.

use crate::token::TokenId;

#[derive(Debug, Default)]
pub struct PendingSet {
    entries: Vec<TokenId>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn insert(&mut self, id: TokenId) {
        self.entries.push(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.entries.iter().copied()
    }

    /// Visit every token once, dropping those for which `keep` is false
    ///
    /// Returns the number of tokens removed.
    pub fn retain<F: FnMut(TokenId) -> bool>(&mut self, mut keep: F) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.entries.len() {
            if keep(self.entries[i]) {
                i += 1;
            } else {
                // The swapped-in entry lands at i and is visited next
                self.entries.swap_remove(i);
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use crate::token::{TokenArena, TokenBody};
    use crate::device::Device;

    fn ids(n: usize) -> Vec<TokenId> {
        let dev = SimDevice::new();
        let arena = TokenArena::<SimDevice>::new(n);
        (0..n)
            .map(|_| {
                let body = TokenBody {
                    marker: dev.create_marker().unwrap(),
                    stream: dev.default_stream(),
                    bound: None,
                };
                arena.allocate(body).ok().unwrap()
            })
            .collect()
    }

    #[test]
    fn test_retain_visits_each_once() {
        let ids = ids(6);
        let mut set = PendingSet::new();
        for &id in &ids {
            set.insert(id);
        }

        let mut visits = Vec::new();
        let removed = set.retain(|id| {
            visits.push(id);
            id.index() % 2 == 1
        });

        assert_eq!(removed, 3);
        assert_eq!(set.len(), 3);
        visits.sort();
        assert_eq!(visits, ids);
        assert!(set.iter().all(|id| id.index() % 2 == 1));
    }

    #[test]
    fn test_retain_all_and_none() {
        let ids = ids(4);
        let mut set = PendingSet::with_capacity(4);
        for &id in &ids {
            set.insert(id);
        }
        assert_eq!(set.retain(|_| true), 0);
        assert_eq!(set.len(), 4);
        assert_eq!(set.retain(|_| false), 4);
        assert!(set.is_empty());
    }
}
