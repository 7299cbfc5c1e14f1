//! Property constraint matching for selecting remote objects.

use crate::Properties;

/// A single constraint on a property bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    Equals(String, String),
    NotEquals(String, String),
    /// Value starts with the given prefix (e.g. `Audio/`).
    Prefix(String, String),
    Present(String),
    Absent(String),
}

impl Constraint {
    fn matches(&self, props: &Properties) -> bool {
        match self {
            Self::Equals(k, v) => props.get(k) == Some(v.as_str()),
            Self::NotEquals(k, v) => props.get(k) != Some(v.as_str()),
            Self::Prefix(k, p) => props.get(k).is_some_and(|v| v.starts_with(p.as_str())),
            Self::Present(k) => props.contains_key(k),
            Self::Absent(k) => !props.contains_key(k),
        }
    }
}

/// Conjunction of constraints; an empty interest matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interest {
    constraints: Vec<Constraint>,
}

impl Interest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints
            .push(Constraint::Equals(key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn not_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints
            .push(Constraint::NotEquals(key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn prefix(mut self, key: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.constraints
            .push(Constraint::Prefix(key.into(), prefix.into()));
        self
    }

    #[must_use]
    pub fn present(mut self, key: impl Into<String>) -> Self {
        self.constraints.push(Constraint::Present(key.into()));
        self
    }

    #[must_use]
    pub fn absent(mut self, key: impl Into<String>) -> Self {
        self.constraints.push(Constraint::Absent(key.into()));
        self
    }

    /// Whether every constraint holds for `props`.
    #[must_use]
    pub fn matches(&self, props: &Properties) -> bool {
        self.constraints.iter().all(|c| c.matches(props))
    }
}
