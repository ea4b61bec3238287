//! Resource identifiers.
//!
//! Every resource an orchestrator creates is named by a [`ResourceUri`]:
//! `scheme://authority/path` for resources addressed through a provider API,
//! or scheme-less `//authority/path` for records kept by a service that is
//! not reached over a provider endpoint (e.g. private address leases).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors returned when parsing a [`ResourceUri`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UriError {
    #[error("empty resource identifier")]
    Empty,

    #[error("invalid scheme: {0:?}")]
    InvalidScheme(String),

    #[error("empty authority in {0:?}")]
    EmptyAuthority(String),
}

/// URI-like locator of an orchestrated resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceUri {
    scheme: Option<String>,
    authority: Option<String>,
    path: String,
}

impl ResourceUri {
    /// Build an identifier from its parts. `path` is normalized to start with
    /// `/` when an authority is present.
    pub fn new(scheme: Option<&str>, authority: Option<&str>, path: impl Into<String>) -> Self {
        let authority = authority.map(str::to_string);
        let mut path = path.into();
        if authority.is_some() && !path.is_empty() && !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            scheme: scheme.map(str::to_ascii_lowercase),
            authority,
            path,
        }
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The final non-empty path segment, which providers use as the local id
    /// of the resource.
    pub fn last_segment(&self) -> Option<&str> {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
    }

    /// A child identifier: same scheme and authority, `segment` appended to
    /// the path.
    pub fn join(&self, segment: &str) -> Self {
        let base = self.path.trim_end_matches('/');
        Self {
            scheme: self.scheme.clone(),
            authority: self.authority.clone(),
            path: format!("{base}/{}", segment.trim_start_matches('/')),
        }
    }
}

impl FromStr for ResourceUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(UriError::Empty);
        }

        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => {
                let valid = scheme
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic())
                    && scheme
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
                if !valid {
                    return Err(UriError::InvalidScheme(scheme.to_string()));
                }
                (Some(scheme.to_ascii_lowercase()), Some(rest))
            }
            None => (None, s.strip_prefix("//")),
        };

        let Some(rest) = rest else {
            // Relative form: path only.
            return Ok(Self {
                scheme,
                authority: None,
                path: s.to_string(),
            });
        };

        let (authority, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(UriError::EmptyAuthority(s.to_string()));
        }

        Ok(Self {
            scheme,
            authority: Some(authority.to_string()),
            path: path.to_string(),
        })
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{scheme}:")?;
        }
        if let Some(authority) = &self.authority {
            write!(f, "//{authority}")?;
        }
        f.write_str(&self.path)
    }
}

impl Serialize for ResourceUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
