//! Search results.
//!
//! A [`Matches`] holds one ranked result list together with the traversal
//! counters of the query that produced it. [`BatchMatches`] holds one list per
//! query of a batch.

use crate::types::Key;
use std::ops::Index;

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    /// Key of the matched entry.
    pub key: Key,
    /// Distance from the query.
    pub distance: f64,
}

impl Match {
    #[inline]
    pub fn new(key: Key, distance: f64) -> Self {
        Self { key, distance }
    }

    #[inline]
    pub fn to_tuple(self) -> (Key, f64) {
        (self.key, self.distance)
    }
}

impl From<Match> for (Key, f64) {
    fn from(m: Match) -> Self {
        m.to_tuple()
    }
}

/// Work done by one traversal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchCounters {
    /// Distinct nodes touched.
    pub visited_members: usize,
    /// Distance evaluations.
    pub computed_distances: usize,
}

impl SearchCounters {
    pub(crate) fn absorb(&mut self, other: SearchCounters) {
        self.visited_members += other.visited_members;
        self.computed_distances += other.computed_distances;
    }
}

/// Ranked results of one query, closest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matches {
    matches: Vec<Match>,
    /// Nodes visited while answering the query.
    pub visited_members: usize,
    /// Distances computed while answering the query.
    pub computed_distances: usize,
}

impl Matches {
    pub fn new(matches: Vec<Match>, counters: SearchCounters) -> Self {
        Self {
            matches,
            visited_members: counters.visited_members,
            computed_distances: counters.computed_distances,
        }
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Match> {
        self.matches.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Match> {
        self.matches.iter()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.matches.iter().map(|m| m.key).collect()
    }

    pub fn distances(&self) -> Vec<f64> {
        self.matches.iter().map(|m| m.distance).collect()
    }

    /// `(key, distance)` pairs, closest first.
    pub fn to_list(&self) -> Vec<(Key, f64)> {
        self.matches.iter().map(|m| m.to_tuple()).collect()
    }

    pub fn counters(&self) -> SearchCounters {
        SearchCounters {
            visited_members: self.visited_members,
            computed_distances: self.computed_distances,
        }
    }

    pub fn into_vec(self) -> Vec<Match> {
        self.matches
    }
}

impl Index<usize> for Matches {
    type Output = Match;

    fn index(&self, index: usize) -> &Match {
        &self.matches[index]
    }
}

impl<'a> IntoIterator for &'a Matches {
    type Item = &'a Match;
    type IntoIter = std::slice::Iter<'a, Match>;

    fn into_iter(self) -> Self::IntoIter {
        self.matches.iter()
    }
}

/// Results of a query batch, one [`Matches`] per query in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchMatches {
    results: Vec<Matches>,
}

impl BatchMatches {
    pub fn new(results: Vec<Matches>) -> Self {
        Self { results }
    }

    /// Number of queries.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, query: usize) -> Option<&Matches> {
        self.results.get(query)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Matches> {
        self.results.iter()
    }

    /// Number of hits per query.
    pub fn counts(&self) -> Vec<usize> {
        self.results.iter().map(Matches::len).collect()
    }

    pub fn to_list(&self) -> Vec<Vec<(Key, f64)>> {
        self.results.iter().map(Matches::to_list).collect()
    }

    /// Nodes visited across the batch.
    pub fn visited_members(&self) -> usize {
        self.results.iter().map(|m| m.visited_members).sum()
    }

    /// Distances computed across the batch.
    pub fn computed_distances(&self) -> usize {
        self.results.iter().map(|m| m.computed_distances).sum()
    }
}

impl Index<usize> for BatchMatches {
    type Output = Matches;

    fn index(&self, query: usize) -> &Matches {
        &self.results[query]
    }
}

impl<'a> IntoIterator for &'a BatchMatches {
    type Item = &'a Matches;
    type IntoIter = std::slice::Iter<'a, Matches>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}
