//! Object URIs
//!
//! Four addressing schemes, all written `SCHEME:locator[@location]`:
//!
//! ```text
//! DIRECT:<object-id>@<host>:<port>      concrete object on a known daemon
//! NAME:<name>[@<ns-location>]            looked up in the name service
//! LOCATION:<local-name>@<host>:<port>   resolved by the daemon itself
//! METADATA:<tag>[,<tag>...][@<ns-loc>]   any registration carrying all tags
//! ```
//!
//! Parsing normalizes: the scheme is upper-cased, metadata tags are sorted
//! and de-duplicated, and name-service locations without a port get the
//! default name-service port. `Display` writes the normalized form back.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tether_codec::Value;
use tether_config::DEFAULT_NS_PORT;
use tether_network::Endpoint;

/// Addressing scheme of a [`Uri`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    Direct,
    Name,
    Location,
    Metadata,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Direct => "DIRECT",
            Scheme::Name => "NAME",
            Scheme::Location => "LOCATION",
            Scheme::Metadata => "METADATA",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        [Scheme::Direct, Scheme::Name, Scheme::Location, Scheme::Metadata]
            .into_iter()
            .find(|scheme| scheme.as_str().eq_ignore_ascii_case(text))
    }

    /// Whether the location part may be omitted
    fn location_optional(&self) -> bool {
        matches!(self, Scheme::Name | Scheme::Metadata)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed, normalized object address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    scheme: Scheme,
    /// Object id, name or local name; empty for METADATA
    object: String,
    /// Required tags; only used by METADATA
    tags: BTreeSet<String>,
    location: Option<Endpoint>,
}

impl Uri {
    pub fn direct(object_id: impl Into<String>, location: Endpoint) -> Self {
        Self {
            scheme: Scheme::Direct,
            object: object_id.into(),
            tags: BTreeSet::new(),
            location: Some(location),
        }
    }

    pub fn name(name: impl Into<String>, ns_location: Option<Endpoint>) -> Self {
        Self {
            scheme: Scheme::Name,
            object: name.into(),
            tags: BTreeSet::new(),
            location: ns_location,
        }
    }

    /// LOCATION URI naming an object by its daemon-local name
    pub fn local(local_name: impl Into<String>, location: Endpoint) -> Self {
        Self {
            scheme: Scheme::Location,
            object: local_name.into(),
            tags: BTreeSet::new(),
            location: Some(location),
        }
    }

    pub fn metadata<I, S>(tags: I, ns_location: Option<Endpoint>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scheme: Scheme::Metadata,
            object: String::new(),
            tags: tags.into_iter().map(Into::into).collect(),
            location: ns_location,
        }
    }

    /// Parse with the default name-service port
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with_ns_port(text, DEFAULT_NS_PORT)
    }

    /// Parse; NAME and METADATA locations without a port get `ns_port`
    pub fn parse_with_ns_port(text: &str, ns_port: u16) -> Result<Self> {
        let malformed = |reason: &str| Error::malformed_uri(text, reason);

        let (scheme_text, rest) = text
            .split_once(':')
            .ok_or_else(|| malformed("missing scheme"))?;
        let scheme = Scheme::parse(scheme_text.trim())
            .ok_or_else(|| malformed("unknown scheme"))?;

        let (locator, location_text) = match rest.split_once('@') {
            Some((locator, location)) => (locator, Some(location)),
            None => (rest, None),
        };
        if locator.is_empty() {
            return Err(malformed("empty object part"));
        }

        let location = match location_text {
            Some(location) => {
                let default_port = scheme.location_optional().then_some(ns_port);
                let endpoint = Endpoint::parse_with_default(location, default_port)
                    .map_err(|e| malformed(&e.to_string()))?;
                Some(endpoint)
            }
            None if scheme.location_optional() => None,
            None => return Err(malformed("location is required")),
        };

        let mut uri = Self {
            scheme,
            object: String::new(),
            tags: BTreeSet::new(),
            location,
        };
        if scheme == Scheme::Metadata {
            uri.tags = locator
                .split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect();
            if uri.tags.is_empty() {
                return Err(malformed("no metadata tags"));
            }
            if uri.tags.iter().any(|tag| tag.contains(char::is_whitespace)) {
                return Err(malformed("metadata tag contains whitespace"));
            }
        } else {
            if locator.chars().any(char::is_whitespace) {
                return Err(malformed("object part contains whitespace"));
            }
            uri.object = locator.to_string();
        }
        Ok(uri)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Object id, name or local name, depending on the scheme
    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn location(&self) -> Option<&Endpoint> {
        self.location.as_ref()
    }

    /// DIRECT URIs need no resolution
    pub fn is_direct(&self) -> bool {
        self.scheme == Scheme::Direct
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if self.scheme == Scheme::Metadata {
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            f.write_str(&tags.join(","))?;
        } else {
            f.write_str(&self.object)?;
        }
        if let Some(location) = &self.location {
            write!(f, "@{}", location)?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uri::parse(s)
    }
}

/// An object reference a method can return or pass along
impl From<Uri> for Value {
    fn from(uri: Uri) -> Self {
        Value::Proxy(uri.to_string())
    }
}
