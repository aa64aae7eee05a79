//! Request routing: CORS preflight, expectations, static routes, passthrough

use std::sync::Arc;
use tracing::debug;

use super::expectation::{Action, ForwardDecision};
use super::store::{ExpectationStore, RouteTable};
use crate::message::url::Target;
use crate::message::{is_preflight, CorsPolicy, HttpRequest, HttpResponse};

/// Outcome of routing one request
#[derive(Debug, Clone)]
pub enum Decision {
    /// Answer locally without contacting any upstream
    Respond(HttpResponse),
    /// Send `request` (origin-form, hop-by-hop stripped) to `target`
    Forward { target: Target, request: HttpRequest },
    /// Addressed to the proxy itself and nothing matched
    NoRoute,
}

#[derive(Debug)]
pub struct Router {
    expectations: Arc<ExpectationStore>,
    routes: Arc<RouteTable>,
    cors: CorsPolicy,
}

impl Router {
    pub fn new(expectations: Arc<ExpectationStore>, routes: Arc<RouteTable>, cors: CorsPolicy) -> Self {
        Self {
            expectations,
            routes,
            cors,
        }
    }

    pub fn expectations(&self) -> &Arc<ExpectationStore> {
        &self.expectations
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn cors(&self) -> &CorsPolicy {
        &self.cors
    }

    /// Decide what to do with `request`
    ///
    /// `origin` is where the client meant to send the request: the absolute
    /// target for forward-proxy requests, or the CONNECT authority for
    /// requests decoded out of a terminated tunnel. `None` means the client
    /// talked to the proxy as if it were the server.
    pub fn decide(&self, request: &HttpRequest, origin: Option<&Target>) -> Decision {
        if is_preflight(request) {
            debug!(path = %request.target, "Answering CORS preflight");
            return Decision::Respond(self.cors.preflight_response(request));
        }

        let host = origin.map(|o| o.host.clone()).or_else(|| request.host());
        if let Some(expectation) = self.expectations.first_match(request, host.as_deref()) {
            debug!(expectation_id = %expectation.id, "Expectation matched");
            return match &expectation.action {
                Action::Respond(response) => Decision::Respond(response.clone()),
                Action::Forward(callback) => match callback(request) {
                    ForwardDecision::Respond(response) => Decision::Respond(response),
                    ForwardDecision::Forward(target) => Decision::Forward {
                        request: outbound_request(request, &target),
                        target,
                    },
                },
            };
        }

        let path = request.path();
        for route in self.routes.snapshot().iter() {
            if let Some(target) = route.rewrite(&path, origin) {
                debug!(route_id = %route.id, to = %target.origin(), path = %target.path, "Route matched");
                return Decision::Forward {
                    request: outbound_request(request, &target),
                    target,
                };
            }
        }

        match origin {
            Some(origin) => {
                let target = Target {
                    path: path.clone(),
                    ..origin.clone()
                };
                Decision::Forward {
                    request: outbound_request(request, &target),
                    target,
                }
            }
            None => Decision::NoRoute,
        }
    }
}

fn outbound_request(request: &HttpRequest, target: &Target) -> HttpRequest {
    let mut outbound = request.filtered();
    outbound.target = target.path.clone();
    outbound.headers.set("Host", target.host_header());
    outbound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::url::parse_absolute;
    use crate::routing::expectation::{Expectation, RequestMatcher};
    use crate::routing::route::Route;
    use crate::routing::store::Cause;

    fn router() -> Router {
        Router::new(
            Arc::new(ExpectationStore::default()),
            Arc::new(RouteTable::default()),
            CorsPolicy::default(),
        )
    }

    #[test]
    fn test_preflight_never_reaches_expectations() {
        let router = router();
        router.expectations().add(
            Expectation::respond(RequestMatcher::any(), HttpResponse::new(418)).with_priority(100),
            Cause::Api,
        );
        let request = HttpRequest::new("OPTIONS", "/x")
            .with_header("Origin", "http://x")
            .with_header("Access-Control-Request-Method", "GET");

        match router.decide(&request, None) {
            Decision::Respond(resp) => {
                assert_eq!(resp.status, 200);
                assert_eq!(resp.headers.get("access-control-allow-origin"), Some("http://x"));
                assert!(resp.headers.contains("access-control-allow-methods"));
                assert_eq!(resp.headers.get("access-control-allow-credentials"), Some("true"));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_forward_callback_rewrites_host() {
        let router = router();
        router.expectations().add(
            Expectation::forward(RequestMatcher::any().path("/svc/.*").unwrap(), |_req| {
                ForwardDecision::Forward(parse_absolute("http://mock:7000/other").unwrap())
            }),
            Cause::Api,
        );
        let request = HttpRequest::new("GET", "/svc/a")
            .with_header("Host", "proxy")
            .with_header("Proxy-Authorization", "Basic xyz");

        match router.decide(&request, None) {
            Decision::Forward { target, request } => {
                assert_eq!(target.host, "mock");
                assert_eq!(request.headers.get("host"), Some("mock:7000"));
                assert_eq!(request.target, "/other");
                assert!(!request.headers.contains("proxy-authorization"));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_route_applies_when_no_expectation_matches() {
        let router = router();
        router
            .routes()
            .add(Route::new("/api", "http://backend:9000/v1").unwrap(), Cause::Api);

        match router.decide(&HttpRequest::new("GET", "/api/users"), None) {
            Decision::Forward { target, request } => {
                assert_eq!(target.port, 9000);
                assert_eq!(request.target, "/v1/users");
                assert_eq!(request.headers.get("host"), Some("backend:9000"));
            }
            other => panic!("unexpected decision: {:?}", other),
        }

        assert!(matches!(
            router.decide(&HttpRequest::new("GET", "/elsewhere"), None),
            Decision::NoRoute
        ));
    }

    #[test]
    fn test_absolute_request_passes_through() {
        let router = router();
        let request = HttpRequest::new("GET", "http://site.example/page?q=1")
            .with_header("Connection", "keep-alive");
        let origin = request.absolute_target().unwrap();

        match router.decide(&request, Some(&origin)) {
            Decision::Forward { target, request } => {
                assert_eq!(target.host, "site.example");
                assert_eq!(request.target, "/page?q=1");
                assert!(!request.headers.contains("connection"));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }
}
