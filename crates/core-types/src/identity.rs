use std::collections::BTreeSet;
use std::fmt;

use crate::GrantError;

/// Opaque acting identity.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order-independent set of principals. The empty set places no identity restriction
/// and is a subset of every other set.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct IdentitySet(BTreeSet<Principal>);

impl IdentitySet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new<I>(principals: I) -> Self
    where
        I: IntoIterator<Item = Principal>,
    {
        Self(principals.into_iter().collect())
    }

    pub fn of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(Principal::new))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, principal: &Principal) -> bool {
        self.0.contains(principal)
    }

    pub fn is_subset_of(&self, other: &IdentitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Principal> {
        self.0.iter()
    }

    /// A blank principal name stands in for a missing identity and is rejected.
    pub fn validate(&self) -> Result<(), GrantError> {
        if self.0.iter().any(|principal| principal.0.trim().is_empty()) {
            return Err(GrantError::InvalidArgument(
                "identity set contains a blank principal".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for IdentitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.0.iter().map(Principal::name).collect::<Vec<_>>();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// Code-origin grouping key used for per-origin grant scoping.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum OriginKey {
    /// Code with no identifiable origin. Never eligible for grants.
    System,
    Code(String),
}

impl OriginKey {
    pub fn code(origin: impl Into<String>) -> Self {
        OriginKey::Code(origin.into())
    }

    pub fn is_system(&self) -> bool {
        matches!(self, OriginKey::System)
    }

    pub fn as_code(&self) -> Option<&str> {
        match self {
            OriginKey::System => None,
            OriginKey::Code(origin) => Some(origin),
        }
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginKey::System => f.write_str("<system>"),
            OriginKey::Code(origin) => f.write_str(origin),
        }
    }
}
