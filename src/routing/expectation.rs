//! Expectations: request patterns paired with a canned response or a forward callback

use regex::Regex;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::RoutingError;
use crate::message::url::Target;
use crate::message::{HttpRequest, HttpResponse};

/// What a forward callback decided for a request
#[derive(Debug, Clone)]
pub enum ForwardDecision {
    /// Send the request to this target; the Host header is rewritten to match
    Forward(Target),
    Respond(HttpResponse),
}

pub type ForwardCallback = Arc<dyn Fn(&HttpRequest) -> ForwardDecision + Send + Sync>;

#[derive(Clone)]
pub enum Action {
    Respond(HttpResponse),
    Forward(ForwardCallback),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Respond(resp) => f.debug_tuple("Respond").field(&resp.status).finish(),
            Action::Forward(_) => f.write_str("Forward(<callback>)"),
        }
    }
}

/// Request predicate; every configured field must hold
#[derive(Debug, Clone, Default)]
pub struct RequestMatcher {
    method: Option<String>,
    path: Option<Regex>,
    headers: Vec<(String, Regex)>,
}

impl RequestMatcher {
    /// Matches every request
    pub fn any() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = Some(method.to_ascii_uppercase());
        self
    }

    /// Regex over the full path (anchored)
    pub fn path(mut self, pattern: &str) -> Result<Self, RoutingError> {
        self.path = Some(anchored(pattern)?);
        Ok(self)
    }

    /// Header `name` must have a value matching `pattern` (anchored)
    pub fn header(mut self, name: &str, pattern: &str) -> Result<Self, RoutingError> {
        self.headers.push((name.to_string(), anchored(pattern)?));
        Ok(self)
    }

    pub fn matches(&self, request: &HttpRequest) -> bool {
        if let Some(method) = &self.method {
            if !request.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            let full = request.path();
            let path_only = full.split('?').next().unwrap_or("");
            if !path.is_match(path_only) && !path.is_match(&full) {
                return false;
            }
        }
        self.headers.iter().all(|(name, pattern)| {
            request
                .headers
                .get_all(name)
                .any(|value| pattern.is_match(value))
        })
    }
}

/// Stored rule pairing a request pattern with an action
#[derive(Debug, Clone)]
pub struct Expectation {
    pub id: String,
    pub priority: i32,
    pub matcher: RequestMatcher,
    host_patterns: Vec<Regex>,
    pub action: Action,
}

impl Expectation {
    pub fn respond(matcher: RequestMatcher, response: HttpResponse) -> Self {
        Self::new(matcher, Action::Respond(response))
    }

    pub fn forward<F>(matcher: RequestMatcher, callback: F) -> Self
    where
        F: Fn(&HttpRequest) -> ForwardDecision + Send + Sync + 'static,
    {
        Self::new(matcher, Action::Forward(Arc::new(callback)))
    }

    fn new(matcher: RequestMatcher, action: Action) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            priority: 0,
            matcher,
            host_patterns: Vec::new(),
            action,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Restrict to requests whose host matches at least one pattern
    pub fn with_host_patterns<I, S>(mut self, patterns: I) -> Result<Self, RoutingError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.host_patterns.push(anchored(pattern.as_ref())?);
        }
        Ok(self)
    }

    pub fn matches(&self, request: &HttpRequest, host: Option<&str>) -> bool {
        if !self.host_patterns.is_empty() {
            let Some(host) = host else {
                return false;
            };
            if !self.host_patterns.iter().any(|p| p.is_match(host)) {
                return false;
            }
        }
        self.matcher.matches(request)
    }
}

fn anchored(pattern: &str) -> Result<Regex, RoutingError> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| RoutingError::InvalidPattern {
        pattern: pattern.to_string(),
        source: e,
    })
}
