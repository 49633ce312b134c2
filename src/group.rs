//! Selection and naming of groups from membership values.
//!
//! Membership values are distinguished names such as
//! `CN=alpha,OU=eng,DC=example,DC=com`. A value is kept when it contains the
//! configured substring, and the group name is the value of the first
//! component whose attribute type equals the configured marker.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

pub const DEFAULT_GROUP_FILTER: &str = "ou";
pub const DEFAULT_NAME_COMPONENT: &str = "ou";

/// Unique group names of a user.
pub type Groups = BTreeSet<String>;

/// Inclusion predicate and name extraction rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFilter {
    /// Lowercased inclusion substring.
    needle: String,
    component: String,
}

impl Default for GroupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP_FILTER, DEFAULT_NAME_COMPONENT)
    }
}

impl GroupFilter {
    /// Create a new [`GroupFilter`].
    pub fn new(substring: &str, component: &str) -> Self {
        Self {
            needle: substring.to_lowercase(),
            component: component.trim().to_owned(),
        }
    }

    /// Case-insensitive substring test on the whole raw value.
    pub fn matches(&self, raw: &str) -> bool {
        raw.to_lowercase().contains(&self.needle)
    }

    /// Extract the group name held by the marker component of `raw`.
    pub fn extract(&self, raw: &str) -> Result<String> {
        components(raw)
            .find_map(|(kind, value)| {
                kind.trim().eq_ignore_ascii_case(&self.component).then_some(value)
            })
            .map(|value| unescape(value.trim()))
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::MalformedAttributeValue(raw.to_owned()))
    }

    /// Apply the filter to every value, skipping malformed ones.
    pub fn group_names<'a, I>(&self, values: I) -> Groups
    where
        I: IntoIterator<Item = &'a String>,
    {
        values
            .into_iter()
            .filter(|raw| self.matches(raw))
            .filter_map(|raw| match self.extract(raw) {
                Ok(name) => Some(name),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping group value");
                    None
                },
            })
            .collect()
    }
}

/// Split a DN into `(type, value)` pairs.
///
/// Separators escaped with a backslash are part of the value. Components
/// without `=` are dropped.
fn components(dn: &str) -> impl Iterator<Item = (&str, &str)> {
    split_unescaped(dn, ',')
        .into_iter()
        .filter_map(|rdn| {
            let at = find_unescaped(rdn, '=')?;
            Some((&rdn[..at], &rdn[at + 1..]))
        })
}

fn split_unescaped(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;

    for (idx, c) in input.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            c if c == separator => {
                parts.push(&input[start..idx]);
                start = idx + c.len_utf8();
            },
            _ => {},
        }
    }
    parts.push(&input[start..]);
    parts
}

fn find_unescaped(input: &str, needle: char) -> Option<usize> {
    let mut escaped = false;
    for (idx, c) in input.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            c if c == needle => return Some(idx),
            _ => {},
        }
    }
    None
}

/// Resolve `\,` style and `\2C` style escapes (RFC 4514).
fn unescape(value: &str) -> String {
    if !value.contains('\\') {
        return value.to_owned();
    }

    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let hex = bytes
                .get(i + 1..i + 3)
                .filter(|pair| pair.iter().all(u8::is_ascii_hexdigit))
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok());
            match hex {
                Some(byte) => {
                    out.push(byte);
                    i += 3;
                },
                None => {
                    out.push(bytes[i + 1]);
                    i += 2;
                },
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
