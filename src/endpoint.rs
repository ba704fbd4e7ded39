//! Candidate servers
//!
//! An [`EndpointTable`] is an ordered, read-only set of named download URLs.
//! Its order is the tie-break order used by server selection.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::EndpointError;

/// Built-in candidates, in tie-break order
pub const DEFAULT_ENDPOINTS: &[(&str, &str)] = &[
    ("New York", "https://speedtest-ny.turnkeyinternet.net/100mb.bin"),
    ("California", "https://speedtest-ca.turnkeyinternet.net/100mb.bin"),
    ("Colorado", "https://speedtest-co.turnkeyinternet.net/100mb.bin"),
    ("Chicago", "https://speedtest-chi.turnkeyinternet.net/100mb.bin"),
    ("Miami", "https://speedtest-mia.turnkeyinternet.net/100mb.bin"),
    ("Amsterdam", "https://speedtest-ams.turnkeyinternet.net/100mb.bin"),
];

/// Nominal payload size of the built-in test files (100 MB)
pub const DEFAULT_EXPECTED_SIZE: u64 = 100 * 1024 * 1024;

/// One measurable server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
    url: Url,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, url: &str) -> Result<Self, EndpointError> {
        let parsed = Url::parse(url).map_err(|e| EndpointError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(EndpointError::UnsupportedScheme {
                    url: url.to_string(),
                    scheme: other.to_string(),
                });
            }
        }

        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(EndpointError::MissingHost(url.to_string()));
        }

        Ok(Self {
            name: name.into(),
            url: parsed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Host part of the URL (validated non-empty at construction)
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Explicit port, or the scheme default (80/443)
    pub fn port(&self) -> Option<u16> {
        self.url.port_or_known_default()
    }

    /// Last non-empty path segment, used to name a download sink
    pub fn file_name(&self) -> Option<&str> {
        self.url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.url)
    }
}

/// Serialized form of an endpoint, as written in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointEntry {
    pub name: String,
    pub url: String,
}

/// Ordered mapping of name to endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointTable {
    endpoints: Vec<Endpoint>,
}

impl EndpointTable {
    /// Build a table from `(name, url)` pairs, keeping their order.
    /// Names must be unique.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, EndpointError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut endpoints: Vec<Endpoint> = Vec::new();
        for (name, url) in pairs {
            if endpoints.iter().any(|e| e.name == name) {
                return Err(EndpointError::DuplicateName(name.to_string()));
            }
            endpoints.push(Endpoint::new(name, url)?);
        }
        Ok(Self { endpoints })
    }

    pub fn from_entries(entries: &[EndpointEntry]) -> Result<Self, EndpointError> {
        Self::from_pairs(entries.iter().map(|e| (e.name.as_str(), e.url.as_str())))
    }

    /// The built-in candidate set
    pub fn builtin() -> Self {
        Self {
            endpoints: DEFAULT_ENDPOINTS
                .iter()
                .filter_map(|(name, url)| Endpoint::new(*name, url).ok())
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.name.as_str()).collect()
    }
}

impl<'a> IntoIterator for &'a EndpointTable {
    type Item = &'a Endpoint;
    type IntoIter = std::slice::Iter<'a, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.endpoints.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_order() {
        let table = EndpointTable::builtin();
        assert_eq!(table.len(), 6);
        assert_eq!(
            table.names(),
            vec!["New York", "California", "Colorado", "Chicago", "Miami", "Amsterdam"]
        );
    }

    #[test]
    fn test_endpoint_parts() {
        let ep = Endpoint::new("Miami", "https://speedtest-mia.turnkeyinternet.net/100mb.bin")
            .unwrap();
        assert_eq!(ep.host(), "speedtest-mia.turnkeyinternet.net");
        assert_eq!(ep.port(), Some(443));
        assert_eq!(ep.file_name(), Some("100mb.bin"));

        let local = Endpoint::new("local", "http://127.0.0.1:8080/").unwrap();
        assert_eq!(local.port(), Some(8080));
        assert_eq!(local.file_name(), None);
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(matches!(
            Endpoint::new("x", "not a url"),
            Err(EndpointError::InvalidUrl { .. })
        ));
        assert!(matches!(
            Endpoint::new("x", "ftp://example.com/file"),
            Err(EndpointError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = EndpointTable::from_pairs([
            ("a", "http://a.example/1"),
            ("a", "http://b.example/1"),
        ]);
        assert_eq!(result, Err(EndpointError::DuplicateName("a".to_string())));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = EndpointTable::builtin();
        assert_eq!(table.get("chicago").map(|e| e.name()), Some("Chicago"));
        assert!(table.get("Tokyo").is_none());
    }
}
