//! OAuth2 scopes and scope sets

use std::collections::{btree_set, BTreeSet};
use std::fmt;

use aliri_braid::braid;
use serde::{Deserialize, Serialize};

/// An OAuth2 scope
#[braid(serde)]
pub struct Scope;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum ScopesDto {
    String(String),
    Array(Vec<Scope>),
}

impl From<Option<ScopesDto>> for Scopes {
    fn from(dto: Option<ScopesDto>) -> Self {
        match dto {
            Some(ScopesDto::String(s)) => s.split_whitespace().collect(),
            Some(ScopesDto::Array(arr)) => Self(arr.into_iter().collect()),
            None => Self::new(),
        }
    }
}

impl From<Scopes> for ScopesDto {
    fn from(s: Scopes) -> Self {
        ScopesDto::String(s.to_string())
    }
}

/// A set of scopes granted to, or required of, an access token
///
/// Serialized as a single space-delimited string. Deserializes from either
/// that form or an array of scope strings; a missing or `null` value is the
/// empty set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "Option<ScopesDto>", into = "ScopesDto")]
pub struct Scopes(BTreeSet<Scope>);

impl Scopes {
    /// Produces an empty scope set
    #[inline]
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Produces a scope set containing a single scope
    pub fn single(scope: impl Into<Scope>) -> Self {
        let mut scopes = Self::new();
        scopes.insert(scope.into());
        scopes
    }

    /// Adds a scope to the scope set
    #[inline]
    pub fn insert(&mut self, scope: Scope) {
        self.0.insert(scope);
    }

    /// Whether the set contains the given scope
    #[inline]
    pub fn contains(&self, scope: &Scope) -> bool {
        self.0.contains(scope)
    }

    /// The number of scopes in the set
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Produces an iterator of the scopes in this set, in sorted order
    #[inline]
    pub fn iter(&self) -> btree_set::Iter<'_, Scope> {
        self.0.iter()
    }

    /// Checks to see whether every scope in `self` is also in `granted`
    #[inline]
    pub fn is_subset(&self, granted: &Scopes) -> bool {
        self.0.is_subset(&granted.0)
    }

    /// The scopes in `self` that are missing from `granted`
    pub fn missing_from(&self, granted: &Scopes) -> Scopes {
        Self(self.0.difference(&granted.0).cloned().collect())
    }
}

impl fmt::Display for Scopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for scope in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(scope.as_str())?;
            first = false;
        }
        Ok(())
    }
}

impl<'a> FromIterator<&'a str> for Scopes {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(|s| Scope::new(s.to_owned())).collect())
    }
}

impl FromIterator<Scope> for Scopes {
    fn from_iter<I: IntoIterator<Item = Scope>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Scopes {
    type Item = Scope;
    type IntoIter = btree_set::IntoIter<Scope>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Scopes {
    type Item = &'a Scope;
    type IntoIter = btree_set::Iter<'a, Scope>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Extend<Scope> for Scopes {
    #[inline]
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = Scope>,
    {
        self.0.extend(iter)
    }
}
