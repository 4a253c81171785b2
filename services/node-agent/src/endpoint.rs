//! Runtime endpoint addresses.
//!
//! Endpoints are URL-like strings: `unix:///run/containerd/containerd.sock`
//! or `tcp://10.0.0.5:1234`. A bare path or host without a scheme is the old
//! kubelet form; it is rejected by [`parse_endpoint`] and only accepted
//! through [`parse_endpoint_with_fallback`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub const UNIX_SCHEME: &str = "unix";
pub const TCP_SCHEME: &str = "tcp";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("using {endpoint:?} as endpoint is deprecated, please use the full URL format")]
    Deprecated { endpoint: String },

    #[error("{scheme:?}: protocol not supported")]
    ProtocolNotSupported { scheme: String },

    #[error("invalid endpoint {endpoint:?}: {reason}")]
    Parse { endpoint: String, reason: String },
}

/// A parsed runtime endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Path of a Unix domain socket.
    Unix(PathBuf),
    /// `host:port`.
    Tcp(String),
}

impl Endpoint {
    pub fn scheme(&self) -> &'static str {
        match self {
            Endpoint::Unix(_) => UNIX_SCHEME,
            Endpoint::Tcp(_) => TCP_SCHEME,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Parse a `scheme://...` endpoint. Only `unix` and `tcp` are accepted.
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint, EndpointError> {
    let parse_err = |reason: &str| EndpointError::Parse {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    if endpoint.chars().any(|c| c.is_ascii_control()) {
        return Err(parse_err("invalid control character"));
    }

    let Some((scheme, rest)) = split_scheme(endpoint).map_err(parse_err)? else {
        return Err(EndpointError::Deprecated {
            endpoint: endpoint.to_string(),
        });
    };

    let scheme = scheme.to_ascii_lowercase();
    let (authority, path) = match rest.strip_prefix("//") {
        Some(hier) => {
            let end = hier.find(['/', '?', '#']).unwrap_or(hier.len());
            (&hier[..end], &hier[end..])
        }
        None => ("", rest),
    };
    if authority.chars().any(|c| !is_authority_char(c)) {
        return Err(parse_err("invalid character in host"));
    }
    let path = path.split(['?', '#']).next().unwrap_or_default();

    match scheme.as_str() {
        TCP_SCHEME => {
            if authority.is_empty() {
                return Err(parse_err("missing host"));
            }
            Ok(Endpoint::Tcp(authority.to_string()))
        }
        UNIX_SCHEME => {
            if path.is_empty() {
                return Err(parse_err("missing socket path"));
            }
            Ok(Endpoint::Unix(PathBuf::from(path)))
        }
        _ => Err(EndpointError::ProtocolNotSupported { scheme }),
    }
}

/// Like [`parse_endpoint`], but a scheme-less endpoint is retried as
/// `fallback://endpoint`.
pub fn parse_endpoint_with_fallback(
    endpoint: &str,
    fallback: &str,
) -> Result<Endpoint, EndpointError> {
    match parse_endpoint(endpoint) {
        Err(EndpointError::Deprecated { .. }) => {
            tracing::warn!(
                endpoint = %endpoint,
                fallback = %fallback,
                "endpoint has no scheme, assuming fallback protocol"
            );
            parse_endpoint(&format!("{fallback}://{endpoint}"))
        }
        other => other,
    }
}

/// Split off a URL scheme (RFC 3986: ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )).
///
/// `Ok(None)` means the string has no scheme at all.
fn split_scheme(s: &str) -> Result<Option<(&str, &str)>, &'static str> {
    for (i, c) in s.char_indices() {
        match c {
            'a'..='z' | 'A'..='Z' => {}
            '0'..='9' | '+' | '-' | '.' if i > 0 => {}
            ':' if i == 0 => return Err("missing protocol scheme"),
            ':' => return Ok(Some((&s[..i], &s[i + 1..]))),
            _ => return Ok(None),
        }
    }
    Ok(None)
}

fn is_authority_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._~!$&'()*+,;=:@[]%".contains(c)
}
