//! Hostlist expansion: `"node[0-3],login"` names hosts compactly.
//!
//! A bracket expression holds idset syntax (see [`crate::idset`]); each
//! member expands with the surrounding prefix/suffix. Used to derive
//! per-rank peer names for certificate authorization.

use std::str::FromStr;

use thiserror::Error;

use crate::idset::IdSet;

/// Hostlist parse failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid hostlist: {0:?}")]
pub struct HostlistError(pub String);

/// An expanded, ordered list of hostnames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hostlist {
    hosts: Vec<String>,
}

impl Hostlist {
    /// Number of hosts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// True when no hosts are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Host at `index`, in expansion order.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&str> {
        self.hosts.get(index).map(String::as_str)
    }

    /// Iterate hosts in expansion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }
}

impl FromStr for Hostlist {
    type Err = HostlistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hosts = Vec::new();
        for part in split_outside_brackets(s) {
            let part = part.trim();
            if part.is_empty() {
                return Err(HostlistError(s.to_string()));
            }
            match (part.find('['), part.find(']')) {
                (Some(open), Some(close)) if open < close => {
                    let prefix = &part[..open];
                    let suffix = &part[close + 1..];
                    if suffix.contains('[') {
                        return Err(HostlistError(s.to_string()));
                    }
                    let ids: IdSet = part[open + 1..close]
                        .parse()
                        .map_err(|_| HostlistError(s.to_string()))?;
                    if ids.is_empty() {
                        return Err(HostlistError(s.to_string()));
                    }
                    for id in ids.iter() {
                        hosts.push(format!("{prefix}{id}{suffix}"));
                    }
                }
                (None, None) => hosts.push(part.to_string()),
                _ => return Err(HostlistError(s.to_string())),
            }
        }
        Ok(Self { hosts })
    }
}

/// Split on commas that are not inside a bracket expression.
fn split_outside_brackets(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}
