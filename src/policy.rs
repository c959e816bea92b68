// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Upstream selection policies.
//!
//! A [`Policy`] only ever picks a *starting* index; `Forward` turns that
//! into a full rotation of the proxy list so every candidate still gets a
//! turn if earlier ones are down or fail.

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Selection strategy across a `Forward`'s proxy list.
pub enum Policy {
    /// Uniformly random starting index.
    Random,
    /// Monotonically advancing starting index, wrapping modulo the list
    /// length.
    RoundRobin(AtomicUsize),
}

impl Policy {
    /// Builds the round-robin variant with its counter at zero.
    pub fn round_robin() -> Self {
        Self::RoundRobin(AtomicUsize::new(0))
    }

    /// The directive name, as it would appear in a `policy` line.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::RoundRobin(_) => "round_robin",
        }
    }

    /// Picks a starting index in `0..len`. `len` must be non-zero.
    pub fn select(&self, len: usize) -> usize {
        debug_assert!(len > 0, "select called on an empty proxy list");
        match self {
            Self::Random => rand::thread_rng().gen_range(0..len),
            Self::RoundRobin(counter) => counter.fetch_add(1, Ordering::Relaxed) % len,
        }
    }

    /// Returns the full rotation order starting at the selected index: the
    /// permutation `Forward`'s dispatch loop walks until one proxy
    /// succeeds.
    pub fn order(&self, len: usize) -> Vec<usize> {
        if len == 0 {
            return Vec::new();
        }
        let start = self.select(len);
        (0..len).map(|i| (start + i) % len).collect()
    }
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Policy").field(&self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn round_robin_visits_every_proxy_within_one_cycle() {
        let policy = Policy::round_robin();
        let mut starts = HashSet::new();
        for _ in 0..5 {
            starts.insert(policy.select(5));
        }
        assert_eq!(starts, (0..5).collect::<HashSet<_>>());
    }

    #[test]
    fn round_robin_order_is_a_rotation() {
        let policy = Policy::round_robin();
        let order = policy.order(4);
        assert_eq!(order.len(), 4);
        assert_eq!(order.iter().copied().collect::<HashSet<_>>().len(), 4);
    }

    #[test]
    fn random_select_is_in_range() {
        let policy = Policy::Random;
        for _ in 0..100 {
            assert!(policy.select(7) < 7);
        }
    }

    #[test]
    fn order_of_empty_list_is_empty() {
        assert!(Policy::Random.order(0).is_empty());
    }
}
