//! URL and request-target utilities

use http::Uri;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("Invalid URL '{url}': {reason}")]
    Invalid { url: String, reason: String },

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid authority '{0}': {1}")]
    InvalidAuthority(String, String),
}

/// Absolute target split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`
    pub path: String,
}

impl Target {
    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// `host:port`, omitting the port when it is the scheme default
    pub fn host_header(&self) -> String {
        if default_port(&self.scheme) == Some(self.port) {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.host_header())
    }
}

pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "socks5" => Some(1080),
        _ => None,
    }
}

/// Parse an absolute `http(s)://` URL
pub fn parse_absolute(url: &str) -> Result<Target, UrlError> {
    let invalid = |reason: &str| UrlError::Invalid {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
    let scheme = uri
        .scheme_str()
        .ok_or_else(|| invalid("missing scheme"))?
        .to_ascii_lowercase();
    let host = uri
        .host()
        .ok_or_else(|| invalid("missing host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = match uri.port_u16() {
        Some(port) => port,
        None => default_port(&scheme).ok_or_else(|| UrlError::UnsupportedScheme(scheme.clone()))?,
    };
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());

    Ok(Target {
        scheme,
        host,
        port,
        path,
    })
}

/// Split a `host:port` authority (CONNECT target)
pub fn parse_authority(authority: &str) -> Result<(String, u16), UrlError> {
    let err = |reason: &str| UrlError::InvalidAuthority(authority.to_string(), reason.to_string());

    // Split by last colon to handle IPv6 addresses like [::1]:443
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| err("must be in host:port format"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(err("host cannot be empty"));
    }

    let port: u16 = port
        .parse()
        .map_err(|_| err("port must be a number between 1 and 65535"))?;
    if port == 0 {
        return Err(err("port must be between 1 and 65535"));
    }

    Ok((host.to_string(), port))
}

/// Collapse runs of `/` into one, keeping a leading `scheme://` intact
pub fn normalize_slashes(value: &str) -> String {
    let (prefix, rest) = match value.find("://") {
        Some(idx) => value.split_at(idx + 3),
        None => ("", value),
    };

    let mut out = String::with_capacity(value.len());
    out.push_str(prefix);
    let mut last_slash = false;
    for ch in rest.chars() {
        if ch == '/' {
            if last_slash {
                continue;
            }
            last_slash = true;
        } else {
            last_slash = false;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_absolute_defaults() {
        let t = parse_absolute("http://example.com").unwrap();
        assert_eq!(t.port, 80);
        assert_eq!(t.path, "/");

        let t = parse_absolute("https://example.com:8443/a/b?c=d").unwrap();
        assert_eq!(t.host, "example.com");
        assert_eq!(t.port, 8443);
        assert_eq!(t.path, "/a/b?c=d");
        assert!(t.is_tls());
        assert_eq!(t.host_header(), "example.com:8443");
    }

    #[test]
    fn test_parse_absolute_rejects_relative() {
        assert!(parse_absolute("/just/a/path").is_err());
        assert!(matches!(
            parse_absolute("gopher://host/"),
            Err(UrlError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(parse_authority("[::1]:8443").unwrap(), ("::1".to_string(), 8443));
        assert!(parse_authority("example.com").is_err());
        assert!(parse_authority(":443").is_err());
        assert!(parse_authority("example.com:0").is_err());
    }

    #[test]
    fn test_normalize_slashes() {
        assert_eq!(normalize_slashes("//a///b/"), "/a/b/");
        assert_eq!(normalize_slashes("http://host//x"), "http://host/x");
        assert_eq!(normalize_slashes("/"), "/");
    }
}
