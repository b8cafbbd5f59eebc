// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Ordered environment variables and user identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An ordered set of environment variables with last-writer-wins semantics.
///
/// Insertion order is preserved; re-setting an existing key updates its value
/// in place so the variable keeps its original position, matching how image
/// configs render their environment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    entries: Vec<(String, String)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut env = Self::new();
        for (key, value) in pairs {
            env.set(key, value);
        }
        env
    }

    /// Set a variable. Last writer wins.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Overlay `other` onto `self`; `other`'s values win on conflicts.
    pub fn merge(&mut self, other: &Environment) {
        for (key, value) in &other.entries {
            self.set(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render as `KEY=VALUE` lines in insertion order.
    pub fn to_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }
}

/// A user identity for command execution and image config, optionally with a
/// group (`user[:group]`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub group: Option<String>,
}

impl User {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            group: None,
        }
    }

    /// Parse `user` or `user:group`.
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((user, group)) => Self {
                user: user.to_string(),
                group: Some(group.to_string()),
            },
            None => Self::new(spec),
        }
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{}:{}", self.user, group),
            None => write!(f, "{}", self.user),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_writer_wins_keeps_position() {
        let mut env = Environment::new();
        env.set("A", "1");
        env.set("B", "2");
        env.set("A", "3");
        assert_eq!(env.get("A"), Some("3"));
        assert_eq!(env.to_lines(), vec!["A=3", "B=2"]);
    }

    #[test]
    fn test_merge_overlays() {
        let mut base = Environment::from_pairs([("PATH", "/bin"), ("HOME", "/root")]);
        let overlay = Environment::from_pairs([("HOME", "/home/build"), ("TERM", "xterm")]);
        base.merge(&overlay);
        assert_eq!(base.get("HOME"), Some("/home/build"));
        assert_eq!(base.get("TERM"), Some("xterm"));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn test_user_parse_and_display() {
        assert_eq!(User::parse("build").to_string(), "build");
        let with_group = User::parse("build:staff");
        assert_eq!(with_group.user, "build");
        assert_eq!(with_group.group.as_deref(), Some("staff"));
        assert_eq!(with_group.to_string(), "build:staff");
    }
}
