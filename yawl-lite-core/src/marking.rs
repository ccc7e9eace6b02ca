//! The marking of one case: a multiset of tokens, changed only through
//! atomic [`MarkingDelta`]s.

use crate::error::{EngineError, EngineResult};
use crate::types::{ElementId, InstanceId, Token};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Serialized form of one multiset entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCount {
    pub token: Token,
    pub count: usize,
}

// ─── Delta ────────────────────────────────────────────────────

/// Removals and additions applied as one unit. Removals are checked against
/// the current marking first; additions happen only if every removal holds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkingDelta {
    removals: BTreeMap<Token, usize>,
    additions: BTreeMap<Token, usize>,
}

impl MarkingDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&mut self, token: Token, count: usize) -> &mut Self {
        if count > 0 {
            *self.removals.entry(token).or_default() += count;
        }
        self
    }

    pub fn add(&mut self, token: Token, count: usize) -> &mut Self {
        if count > 0 {
            *self.additions.entry(token).or_default() += count;
        }
        self
    }

    pub fn removals(&self) -> impl Iterator<Item = (&Token, usize)> + '_ {
        self.removals.iter().map(|(t, n)| (t, *n))
    }

    pub fn additions(&self) -> impl Iterator<Item = (&Token, usize)> + '_ {
        self.additions.iter().map(|(t, n)| (t, *n))
    }

    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.additions.is_empty()
    }
}

// ─── Marking ──────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<TokenCount>", into = "Vec<TokenCount>")]
pub struct Marking {
    tokens: BTreeMap<Token, usize>,
}

impl Marking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total tokens on `place`, with or without instance.
    pub fn tokens_at(&self, place: &str) -> usize {
        self.entries_at(place).map(|(_, n)| n).sum()
    }

    pub fn count(&self, token: &Token) -> usize {
        self.tokens.get(token).copied().unwrap_or(0)
    }

    /// Instances holding a token on a task place.
    pub fn instances_at(&self, place: &str) -> Vec<InstanceId> {
        self.entries_at(place)
            .filter_map(|(t, _)| t.instance)
            .collect()
    }

    pub fn is_marked(&self, place: &str) -> bool {
        self.tokens_at(place) > 0
    }

    pub fn marked_places(&self) -> BTreeSet<ElementId> {
        self.tokens.keys().map(|t| t.place.clone()).collect()
    }

    pub fn total(&self) -> usize {
        self.tokens.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Apply a delta atomically. On `InsufficientTokens` the marking is left
    /// exactly as it was.
    pub fn apply_delta(&mut self, delta: &MarkingDelta) -> EngineResult<()> {
        for (token, needed) in delta.removals() {
            let present = self.count(token);
            if present < needed {
                return Err(EngineError::InsufficientTokens {
                    place: token.to_string(),
                    needed,
                    present,
                });
            }
        }
        for (token, n) in delta.removals() {
            if let Some(slot) = self.tokens.get_mut(token) {
                *slot -= n;
                if *slot == 0 {
                    self.tokens.remove(token);
                }
            }
        }
        for (token, n) in delta.additions() {
            *self.tokens.entry(token.clone()).or_default() += n;
        }
        Ok(())
    }

    pub fn export_tokens(&self) -> Vec<TokenCount> {
        self.tokens
            .iter()
            .map(|(token, count)| TokenCount {
                token: token.clone(),
                count: *count,
            })
            .collect()
    }

    pub fn import_tokens(tokens: impl IntoIterator<Item = TokenCount>) -> Self {
        let mut marking = Self::new();
        for TokenCount { token, count } in tokens {
            if count > 0 {
                *marking.tokens.entry(token).or_default() += count;
            }
        }
        marking
    }

    /// SHA-256 over the canonical token listing. Two markings with the same
    /// multiset always share a digest.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for (token, count) in &self.tokens {
            hasher.update(token.place.as_bytes());
            hasher.update(b"|");
            if let Some(instance) = &token.instance {
                hasher.update(instance.0.as_bytes());
            }
            hasher.update(b"|");
            hasher.update(count.to_le_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().into()
    }

    fn entries_at<'a>(&'a self, place: &str) -> impl Iterator<Item = (&'a Token, usize)> + 'a {
        let place = place.to_string();
        self.tokens
            .range(Token::condition(place.clone())..)
            .take_while(move |(t, _)| t.place == place)
            .map(|(t, n)| (t, *n))
    }
}

impl From<Vec<TokenCount>> for Marking {
    fn from(tokens: Vec<TokenCount>) -> Self {
        Marking::import_tokens(tokens)
    }
}

impl From<Marking> for Vec<TokenCount> {
    fn from(marking: Marking) -> Self {
        marking.export_tokens()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marked(places: &[&str]) -> Marking {
        let mut delta = MarkingDelta::new();
        for p in places {
            delta.add(Token::condition(*p), 1);
        }
        let mut m = Marking::new();
        m.apply_delta(&delta).unwrap();
        m
    }

    #[test]
    fn failed_delta_changes_nothing() {
        let mut m = marked(&["a", "b"]);
        let before = m.clone();

        let mut delta = MarkingDelta::new();
        delta
            .remove(Token::condition("a"), 1)
            .remove(Token::condition("c"), 1)
            .add(Token::condition("d"), 1);
        let err = m.apply_delta(&delta).unwrap_err();

        assert!(matches!(
            err,
            EngineError::InsufficientTokens { needed: 1, present: 0, .. }
        ));
        assert_eq!(m, before);
    }

    #[test]
    fn removals_happen_before_additions() {
        let mut m = marked(&["a"]);
        let mut delta = MarkingDelta::new();
        delta
            .remove(Token::condition("a"), 1)
            .add(Token::condition("a"), 1)
            .add(Token::condition("b"), 2);
        m.apply_delta(&delta).unwrap();
        assert_eq!(m.tokens_at("a"), 1);
        assert_eq!(m.tokens_at("b"), 2);
        assert_eq!(m.total(), 3);
    }

    #[test]
    fn instance_tokens_are_counted_per_place() {
        let (i1, i2) = (InstanceId::new(), InstanceId::new());
        let mut m = Marking::new();
        let mut delta = MarkingDelta::new();
        delta
            .add(Token::instance("T", i1), 1)
            .add(Token::instance("T", i2), 1)
            .add(Token::condition("T2"), 1);
        m.apply_delta(&delta).unwrap();

        assert_eq!(m.tokens_at("T"), 2);
        let mut at_t = m.instances_at("T");
        at_t.sort();
        let mut expected = vec![i1, i2];
        expected.sort();
        assert_eq!(at_t, expected);
        assert!(m.instances_at("T2").is_empty());
        assert!(!m.is_marked("T0"));
    }

    #[test]
    fn digest_ignores_construction_order() {
        let a = marked(&["x", "y", "z"]);
        let b = marked(&["z", "x", "y"]);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), marked(&["x", "y"]).digest());
    }

    #[test]
    fn serde_uses_token_list() {
        let m = marked(&["a", "a", "b"]);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 2);
        let back: Marking = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }
}
