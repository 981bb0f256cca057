//! Permission identifiers and sets
//!
//! A permission is the string `namespace.action`. Ids are compared as exact
//! strings; `fs.read` and `FS.read` are different permissions and nothing is
//! normalized across namespaces.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Separator between namespace and action
pub const NAMESPACE_SEPARATOR: char = '.';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("Malformed permission id '{0}': expected 'namespace.action'")]
    Malformed(String),
}

/// One authorizable operation, `namespace.action`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionId(String);

impl PermissionId {
    /// Wrap a raw id without validating it.
    ///
    /// Declared ids are opaque until something needs to split them; use
    /// [`PermissionId::parse`] where a malformed id must be refused.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Build and validate an id
    pub fn parse(raw: &str) -> Result<Self, PermissionError> {
        let id = Self::new(raw.trim());
        id.validate()?;
        Ok(id)
    }

    /// Build an id from its two halves
    pub fn from_parts(namespace: &str, action: &str) -> Self {
        Self(format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, action))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split at the first separator. `None` when the id is malformed.
    pub fn parts(&self) -> Option<(&str, &str)> {
        let (namespace, action) = self.0.split_once(NAMESPACE_SEPARATOR)?;
        if namespace.is_empty() || action.is_empty() {
            return None;
        }
        Some((namespace, action))
    }

    pub fn namespace(&self) -> Option<&str> {
        self.parts().map(|(ns, _)| ns)
    }

    pub fn action(&self) -> Option<&str> {
        self.parts().map(|(_, action)| action)
    }

    pub fn is_well_formed(&self) -> bool {
        self.parts().is_some()
    }

    pub fn validate(&self) -> Result<(), PermissionError> {
        if self.is_well_formed() {
            Ok(())
        } else {
            Err(PermissionError::Malformed(self.0.clone()))
        }
    }
}

impl fmt::Display for PermissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PermissionId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for PermissionId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl AsRef<str> for PermissionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Deduplicated, order-irrelevant set of permission ids.
///
/// Used for both the permissions a source unit declares and the grant an
/// operator supplies. Iteration is sorted, so rendered output is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet {
    ids: BTreeSet<PermissionId>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an operator list such as `fs.read, fs.write`.
    ///
    /// Every entry must be well formed; empty entries are skipped.
    pub fn parse_list(list: &str) -> Result<Self, PermissionError> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(PermissionId::parse)
            .collect()
    }

    pub fn insert(&mut self, id: PermissionId) -> bool {
        self.ids.insert(id)
    }

    pub fn contains(&self, id: &PermissionId) -> bool {
        self.ids.contains(id)
    }

    pub fn contains_str(&self, id: &str) -> bool {
        self.ids.iter().any(|held| held.as_str() == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionId> {
        self.ids.iter()
    }

    /// `self ∖ other`
    pub fn difference(&self, other: &PermissionSet) -> Vec<PermissionId> {
        self.ids.difference(&other.ids).cloned().collect()
    }

    /// `self ∪ other`
    pub fn union(&self, other: &PermissionSet) -> PermissionSet {
        self.ids.union(&other.ids).cloned().collect()
    }

    pub fn is_subset(&self, other: &PermissionSet) -> bool {
        self.ids.is_subset(&other.ids)
    }

    pub fn to_vec(&self) -> Vec<PermissionId> {
        self.ids.iter().cloned().collect()
    }

    /// Comma-joined, the format `parse_list` reads back
    pub fn to_list_string(&self) -> String {
        self.ids
            .iter()
            .map(PermissionId::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<PermissionId> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = PermissionId>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<&'a str> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        iter.into_iter().map(PermissionId::new).collect()
    }
}

impl Extend<PermissionId> for PermissionSet {
    fn extend<T: IntoIterator<Item = PermissionId>>(&mut self, iter: T) {
        self.ids.extend(iter);
    }
}

impl IntoIterator for PermissionSet {
    type Item = PermissionId;
    type IntoIter = std::collections::btree_set::IntoIter<PermissionId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.into_iter()
    }
}

impl<'a> IntoIterator for &'a PermissionSet {
    type Item = &'a PermissionId;
    type IntoIter = std::collections::btree_set::Iter<'a, PermissionId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_list_string())
    }
}
