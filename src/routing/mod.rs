//! Matcher & router: expectations, static routes and routing decisions

pub mod expectation;
pub mod route;
pub mod router;
pub mod store;

use thiserror::Error;

pub use expectation::{Action, Expectation, ForwardCallback, ForwardDecision, RequestMatcher};
pub use route::{patch_path, Route};
pub use router::{Decision, Router};
pub use store::{Cause, ChangeFeed, ChangeKind, ChangeSubscription, ConfigChange, ExpectationStore, RouteTable};

/// Routing configuration errors
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Malformed route: {0}")]
    InvalidRoute(String),

    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Parse `from=>to` pairs separated by `;`
pub fn parse_route_list(list: &str) -> Result<Vec<Route>, RoutingError> {
    list.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (from, to) = entry
                .split_once("=>")
                .ok_or_else(|| RoutingError::InvalidRoute(format!("expected from=>to, got '{}'", entry)))?;
            Route::new(from, to)
        })
        .collect()
}
