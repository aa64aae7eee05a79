//! Ordered, case-insensitive, multi-valued header map

use std::fmt;

/// Headers that only describe a single connection leg (RFC 7230 6.1)
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Check if header is hop-by-hop
///
/// `Content-Length` counts as hop-by-hop on responses only, since the relay
/// re-frames response bodies.
pub fn is_hop_by_hop(name: &str, is_response: bool) -> bool {
    let name = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&name.as_str()) || (is_response && name == "content-length")
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a value, keeping existing ones
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values of `name`; the first occurrence keeps its position
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut idx = 0;
                self.entries.retain(|(n, _)| {
                    let keep = idx <= pos || !n.eq_ignore_ascii_case(&name);
                    idx += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Remove all values of `name`, returning how many were dropped
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy without hop-by-hop entries, including any listed in `Connection`
    pub fn without_hop_by_hop(&self, is_response: bool) -> Self {
        let listed: Vec<String> = self
            .get_all("connection")
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        let entries = self
            .entries
            .iter()
            .filter(|(n, _)| {
                !is_hop_by_hop(n, is_response) && !listed.contains(&n.to_ascii_lowercase())
            })
            .cloned()
            .collect();
        Self { entries }
    }

    /// Whether a comma-separated header contains `token` (case-insensitive)
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert!(headers.contains("CONTENT-TYPE"));
    }

    #[test]
    fn test_multi_values_keep_order() {
        let headers: Headers = [("Accept", "a"), ("X", "1"), ("accept", "b")]
            .into_iter()
            .collect();
        assert_eq!(headers.get_all("Accept").collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut headers: Headers = [("A", "1"), ("B", "2"), ("a", "3")].into_iter().collect();
        headers.set("a", "9");
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![("A", "9"), ("B", "2")]
        );
    }

    #[test]
    fn test_response_hop_by_hop_filtering() {
        let headers: Headers = [
            ("Server", "x"),
            ("Connection", "close"),
            ("Content-Type", "text/html"),
            ("Transfer-Encoding", "chunked"),
            ("Content-Length", "12"),
            ("X-Trace", "abc"),
        ]
        .into_iter()
        .collect();

        let filtered = headers.without_hop_by_hop(true);
        assert_eq!(
            filtered.iter().collect::<Vec<_>>(),
            vec![
                ("Server", "x"),
                ("Content-Type", "text/html"),
                ("X-Trace", "abc")
            ]
        );
    }

    #[test]
    fn test_request_keeps_content_length() {
        let headers: Headers = [
            ("Connection", "keep-alive"),
            ("Transfer-Encoding", "chunked"),
            ("Content-Length", "12"),
            ("Accept", "*/*"),
        ]
        .into_iter()
        .collect();

        let filtered = headers.without_hop_by_hop(false);
        assert_eq!(
            filtered.iter().collect::<Vec<_>>(),
            vec![("Content-Length", "12"), ("Accept", "*/*")]
        );
    }

    #[test]
    fn test_connection_listed_headers_are_dropped() {
        let headers: Headers = [("Connection", "X-Private"), ("X-Private", "1"), ("Y", "2")]
            .into_iter()
            .collect();
        let filtered = headers.without_hop_by_hop(false);
        assert_eq!(filtered.iter().collect::<Vec<_>>(), vec![("Y", "2")]);
    }
}
