/*!
Endpoint identifiers and the patterns that match them.

An [`EndpointId`] is a URI split at the first colon into a scheme and a
scheme-specific part. Comparison is structural. The null endpoint is
`dtn:none`.

An [`EidPattern`] matches one or more EIDs: the universal wildcard `*:*`, a
trailing-`*` glob on the scheme-specific part, or a literal EID.
*/

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EidError {
    /// The URI has no scheme separator.
    #[error("Endpoint id '{0}' has no scheme")]
    MissingScheme(String),

    /// The scheme or ssp is empty.
    #[error("Endpoint id '{0}' is malformed")]
    Malformed(String),
}

/// A bundle endpoint identifier.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId {
    scheme: String,
    ssp: String,
}

impl EndpointId {
    /// The null endpoint, `dtn:none`.
    pub fn null() -> Self {
        Self {
            scheme: "dtn".to_string(),
            ssp: "none".to_string(),
        }
    }

    pub fn new(scheme: &str, ssp: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            ssp: ssp.to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.scheme == "dtn" && self.ssp == "none"
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn ssp(&self) -> &str {
        &self.ssp
    }

    /// The full `scheme:ssp` URI.
    pub fn uri(&self) -> String {
        format!("{}:{}", self.scheme, self.ssp)
    }
}

impl core::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.scheme, self.ssp)
    }
}

impl core::str::FromStr for EndpointId {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, ssp) = s
            .split_once(':')
            .ok_or_else(|| EidError::MissingScheme(s.to_string()))?;
        if scheme.is_empty() || ssp.is_empty() {
            return Err(EidError::Malformed(s.to_string()));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            ssp: ssp.to_string(),
        })
    }
}

/// A pattern over endpoint identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EidPattern {
    /// Matches every endpoint (`*:*`).
    Any,
    /// Matches a single endpoint exactly.
    Exact(EndpointId),
    /// Matches any endpoint whose URI starts with the prefix
    /// (written `dtn://node/*`).
    Prefix(String),
}

impl EidPattern {
    /// The universal wildcard.
    pub fn any() -> Self {
        EidPattern::Any
    }

    /// A pattern matching every service at the node of `eid`: the URI with
    /// `/*` appended.
    pub fn node_wildcard(eid: &EndpointId) -> Self {
        let uri = eid.uri();
        let base = uri.strip_suffix('/').map(str::to_string).unwrap_or(uri);
        EidPattern::Prefix(format!("{base}/"))
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, EidPattern::Any)
    }

    pub fn matches(&self, eid: &EndpointId) -> bool {
        match self {
            EidPattern::Any => true,
            EidPattern::Exact(e) => e == eid,
            EidPattern::Prefix(prefix) => eid.uri().starts_with(prefix.as_str()),
        }
    }
}

impl core::fmt::Display for EidPattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EidPattern::Any => f.write_str("*:*"),
            EidPattern::Exact(e) => write!(f, "{e}"),
            EidPattern::Prefix(p) => write!(f, "{p}*"),
        }
    }
}

impl core::str::FromStr for EidPattern {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*:*" || s == "*" {
            return Ok(EidPattern::Any);
        }
        if let Some(prefix) = s.strip_suffix('*') {
            if prefix.is_empty() {
                return Ok(EidPattern::Any);
            }
            if !prefix.contains(':') {
                return Err(EidError::MissingScheme(s.to_string()));
            }
            return Ok(EidPattern::Prefix(prefix.to_string()));
        }
        Ok(EidPattern::Exact(s.parse()?))
    }
}

impl From<EndpointId> for EidPattern {
    fn from(eid: EndpointId) -> Self {
        EidPattern::Exact(eid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(s: &str) -> EndpointId {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display() {
        let e = eid("dtn://source.dtn/test");
        assert_eq!(e.scheme(), "dtn");
        assert_eq!(e.ssp(), "//source.dtn/test");
        assert_eq!(e.to_string(), "dtn://source.dtn/test");

        assert!(eid("dtn:none").is_null());
        assert!(!e.is_null());

        assert!("nocolon".parse::<EndpointId>().is_err());
        assert!(":empty".parse::<EndpointId>().is_err());
    }

    #[test]
    fn wildcard_pattern() {
        let p: EidPattern = "*:*".parse().unwrap();
        assert!(p.is_wildcard());
        assert!(p.matches(&eid("dtn://anything/at-all")));
        assert!(p.matches(&eid("ipn:1.2")));
    }

    #[test]
    fn exact_pattern() {
        let p: EidPattern = "dtn://dest.dtn/test".parse().unwrap();
        assert!(p.matches(&eid("dtn://dest.dtn/test")));
        assert!(!p.matches(&eid("dtn://dest.dtn/other")));
    }

    #[test]
    fn prefix_pattern() {
        let p: EidPattern = "dtn://dest.dtn/*".parse().unwrap();
        assert!(p.matches(&eid("dtn://dest.dtn/test")));
        assert!(p.matches(&eid("dtn://dest.dtn/a/b")));
        assert!(!p.matches(&eid("dtn://other.dtn/test")));
    }

    #[test]
    fn node_wildcard() {
        let p = EidPattern::node_wildcard(&eid("dtn://relay.dtn"));
        assert!(p.matches(&eid("dtn://relay.dtn/svc")));
        assert!(!p.matches(&eid("dtn://relay2.dtn/svc")));
    }
}
