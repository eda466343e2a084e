//! Capability tokens and implication-aware capability sets.

use std::collections::BTreeSet;
use std::fmt;

use crate::GrantError;

/// One grantable right.
///
/// Equality and hashing are structural over (kind, target, actions). Implication is
/// a separate, weaker relation: `file:/tmp/*[read,write]` implies `file:/tmp/a[read]`
/// without being equal to it.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-full", serde(rename_all = "snake_case"))]
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Implies every other token, grant authority included.
    All,
    Access {
        kind: String,
        target: String,
        actions: BTreeSet<String>,
    },
    /// Authority to grant the wrapped capability to someone else.
    GrantAuthority(Box<Capability>),
}

impl Capability {
    pub fn access<I, S>(kind: impl Into<String>, target: impl Into<String>, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Capability::Access {
            kind: kind.into().trim().to_ascii_lowercase(),
            target: target.into().trim().to_string(),
            actions: actions
                .into_iter()
                .map(|action| action.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn read_file(path: impl Into<String>) -> Self {
        Self::access("file", path, ["read"])
    }

    pub fn write_file(path: impl Into<String>) -> Self {
        Self::access("file", path, ["write"])
    }

    pub fn connect(endpoint: impl Into<String>) -> Self {
        Self::access("socket", endpoint, ["connect"])
    }

    pub fn grant_authority(inner: Capability) -> Self {
        Capability::GrantAuthority(Box::new(inner))
    }

    pub fn implies(&self, other: &Capability) -> bool {
        match (self, other) {
            (Capability::All, _) => true,
            (_, Capability::All) => false,
            (
                Capability::Access {
                    kind,
                    target,
                    actions,
                },
                Capability::Access {
                    kind: other_kind,
                    target: other_target,
                    actions: other_actions,
                },
            ) => {
                kind == other_kind
                    && pattern_matches(target, other_target)
                    && actions.is_superset(other_actions)
            }
            (Capability::GrantAuthority(inner), Capability::GrantAuthority(other_inner)) => {
                inner.implies(other_inner)
            }
            _ => false,
        }
    }

    /// Rejects tokens that cannot name a right: blank kind, blank target or a blank action.
    pub fn validate(&self) -> Result<(), GrantError> {
        match self {
            Capability::All => Ok(()),
            Capability::Access {
                kind,
                target,
                actions,
            } => {
                if kind.is_empty() {
                    return Err(GrantError::InvalidArgument(format!(
                        "capability without kind (target {target:?})"
                    )));
                }
                if target.is_empty() {
                    return Err(GrantError::InvalidArgument(format!(
                        "capability {kind} without target"
                    )));
                }
                if actions.iter().any(|action| action.is_empty()) {
                    return Err(GrantError::InvalidArgument(format!(
                        "capability {kind}:{target} carries a blank action"
                    )));
                }
                Ok(())
            }
            Capability::GrantAuthority(inner) => inner.validate(),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::All => write!(f, "*"),
            Capability::Access {
                kind,
                target,
                actions,
            } => {
                let actions = actions.iter().map(String::as_str).collect::<Vec<_>>();
                write!(f, "{kind}:{target}[{}]", actions.join(","))
            }
            Capability::GrantAuthority(inner) => write!(f, "grant({inner})"),
        }
    }
}

/// Matches `candidate` against `pattern`, where `*` alone matches anything and a
/// single `*` splits the pattern into a required prefix and suffix.
pub fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            let prefix = parts[0];
            let suffix = parts[1];
            return candidate.len() >= prefix.len() + suffix.len()
                && candidate.starts_with(prefix)
                && candidate.ends_with(suffix);
        }
    }
    candidate == pattern
}

/// De-duplicating collection of capability tokens.
///
/// Adding a token already implied by a member is a no-op, so the set only grows when it
/// gains a right it did not have. Equality is semantic: two sets are equal when each
/// implies every token of the other.
#[derive(Clone, Debug, Default)]
pub struct CapabilitySet {
    tokens: Vec<Capability>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the token was not already implied and has been added.
    pub fn add(&mut self, token: Capability) -> bool {
        if self.implies(&token) {
            return false;
        }
        self.tokens.push(token);
        true
    }

    /// Adds every token and returns the ones that were actually new.
    pub fn add_all<I>(&mut self, tokens: I) -> Vec<Capability>
    where
        I: IntoIterator<Item = Capability>,
    {
        let mut added = Vec::new();
        for token in tokens {
            if self.add(token.clone()) {
                added.push(token);
            }
        }
        added
    }

    pub fn implies(&self, token: &Capability) -> bool {
        self.tokens.iter().any(|held| held.implies(token))
    }

    pub fn implies_all(&self, other: &CapabilitySet) -> bool {
        other.tokens.iter().all(|token| self.implies(token))
    }

    pub fn union(&self, other: &CapabilitySet) -> CapabilitySet {
        let mut merged = self.clone();
        merged.add_all(other.tokens.iter().cloned());
        merged
    }

    pub fn contains(&self, token: &Capability) -> bool {
        self.tokens.contains(token)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Capability> {
        self.tokens.iter()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn validate(&self) -> Result<(), GrantError> {
        self.tokens.iter().try_for_each(Capability::validate)
    }

    pub fn to_vec(&self) -> Vec<Capability> {
        self.tokens.clone()
    }
}

impl PartialEq for CapabilitySet {
    fn eq(&self, other: &Self) -> bool {
        self.implies_all(other) && other.implies_all(self)
    }
}

impl Eq for CapabilitySet {}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::new();
        set.add_all(iter);
        set
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = &'a Capability;
    type IntoIter = std::slice::Iter<'a, Capability>;

    fn into_iter(self) -> Self::IntoIter {
        self.tokens.iter()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self.tokens.iter().map(ToString::to_string).collect::<Vec<_>>();
        write!(f, "{{{}}}", rendered.join(", "))
    }
}
