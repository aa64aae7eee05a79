//! Static routes and path patching

use uuid::Uuid;

use super::RoutingError;
use crate::message::url::{normalize_slashes, parse_absolute, Target};

/// Static rewrite from a host or path prefix to an upstream base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub id: String,
    pub from: String,
    pub to: String,
    from_match: FromMatch,
    to_target: Target,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FromMatch {
    /// `http(s)://host[:port][/prefix]`, matched against the request origin
    Host {
        host: String,
        port: Option<u16>,
        prefix: String,
    },
    /// `/prefix`, matched against requests addressed to the proxy itself
    Path(String),
}

impl Route {
    pub fn new(from: &str, to: &str) -> Result<Self, RoutingError> {
        let from = trim_trailing_slash(&normalize_slashes(from.trim()));
        let to = trim_trailing_slash(&normalize_slashes(to.trim()));

        let from_match = if from.starts_with('/') {
            FromMatch::Path(from.clone())
        } else {
            let target = parse_absolute(&from)
                .map_err(|e| RoutingError::InvalidRoute(format!("from '{}': {}", from, e)))?;
            FromMatch::Host {
                host: target.host.to_ascii_lowercase(),
                port: explicit_port(&from),
                prefix: target.path,
            }
        };
        let to_target = parse_absolute(&to)
            .map_err(|e| RoutingError::InvalidRoute(format!("to '{}': {}", to, e)))?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            from,
            to,
            from_match,
            to_target,
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Rewrite the request when this route applies
    ///
    /// `origin` is the absolute target the request was sent to, or `None`
    /// when the client addressed the proxy directly.
    pub fn rewrite(&self, path: &str, origin: Option<&Target>) -> Option<Target> {
        let prefix = match (&self.from_match, origin) {
            (FromMatch::Host { host, port, prefix }, Some(origin)) => {
                if !origin.host.eq_ignore_ascii_case(host) {
                    return None;
                }
                if port.is_some_and(|p| p != origin.port) {
                    return None;
                }
                prefix.as_str()
            }
            (FromMatch::Path(prefix), None) => prefix.as_str(),
            _ => return None,
        };

        if !has_path_prefix(path, prefix) {
            return None;
        }

        let to_suffix = match self.to_target.path.as_str() {
            "/" => None,
            suffix => Some(suffix),
        };
        Some(Target {
            path: patch_path(prefix, to_suffix, path),
            ..self.to_target.clone()
        })
    }
}

/// Combine the route's target suffix with the request path minus the `from` prefix
pub fn patch_path(from: &str, to_suffix: Option<&str>, request_path: &str) -> String {
    let suffix = to_suffix.unwrap_or("");
    let stripped = if from == "/" {
        request_path.trim_start_matches('/')
    } else {
        request_path.strip_prefix(from).unwrap_or(request_path)
    };

    let patched = if stripped.is_empty() {
        if suffix.is_empty() {
            "/".to_string()
        } else {
            suffix.to_string()
        }
    } else if stripped.starts_with('?') {
        format!("{}{}", nonempty_or_root(suffix.trim_end_matches('/')), stripped)
    } else {
        format!(
            "{}/{}",
            suffix.trim_end_matches('/'),
            stripped.trim_start_matches('/')
        )
    };
    normalize_slashes(&patched)
}

fn nonempty_or_root(value: &str) -> &str {
    if value.is_empty() {
        "/"
    } else {
        value
    }
}

fn has_path_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" || prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

fn trim_trailing_slash(value: &str) -> String {
    let trimmed = value.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.ends_with(':') {
        // keep "scheme://" intact
        value.to_string()
    } else {
        trimmed.to_string()
    }
}

fn explicit_port(url: &str) -> Option<u16> {
    let authority = url.split("://").nth(1)?.split('/').next()?;
    let (_, port) = authority.rsplit_once(':')?;
    if authority.ends_with(']') {
        return None;
    }
    port.parse().ok()
}
