//! CORS preflight detection and header computation

use super::request::{HttpRequest, HttpResponse};

const DEFAULT_METHODS: &str = "CONNECT, DELETE, GET, HEAD, OPTIONS, POST, PUT, PATCH, TRACE";
const DEFAULT_HEADERS: &str = "Allow, Content-Encoding, Content-Length, Content-Type, ETag, \
Expires, Last-Modified, Location, Server, Vary, Authorization";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsPolicy {
    pub allow_credentials: bool,
    pub allowed_methods: String,
    pub allowed_headers: String,
    pub max_age_seconds: u32,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            allow_credentials: true,
            allowed_methods: DEFAULT_METHODS.to_string(),
            allowed_headers: DEFAULT_HEADERS.to_string(),
            max_age_seconds: 300,
        }
    }
}

/// `OPTIONS` carrying both `Origin` and `Access-Control-Request-Method`
pub fn is_preflight(request: &HttpRequest) -> bool {
    request.method.eq_ignore_ascii_case("OPTIONS")
        && request.headers.contains("origin")
        && request.headers.contains("access-control-request-method")
}

impl CorsPolicy {
    pub fn with_credentials(allow_credentials: bool) -> Self {
        Self {
            allow_credentials,
            ..Self::default()
        }
    }

    /// Answer a preflight directly, reflecting the request origin
    pub fn preflight_response(&self, request: &HttpRequest) -> HttpResponse {
        let mut response = HttpResponse::new(200);
        self.add_headers(request, &mut response);

        let mut allowed_headers = self.allowed_headers.clone();
        if let Some(requested) = request.headers.get("access-control-request-headers") {
            if !requested.trim().is_empty() {
                allowed_headers.push_str(", ");
                allowed_headers.push_str(requested.trim());
            }
        }

        response
            .with_header("Access-Control-Allow-Methods", self.allowed_methods.clone())
            .with_header("Access-Control-Allow-Headers", allowed_headers)
            .with_header("Access-Control-Max-Age", self.max_age_seconds.to_string())
    }

    /// Add origin and credential headers to a non-preflight response
    pub fn add_headers(&self, request: &HttpRequest, response: &mut HttpResponse) {
        let Some(origin) = request.headers.get("origin") else {
            return;
        };
        if response.headers.contains("access-control-allow-origin") {
            return;
        }
        response
            .headers
            .append("Access-Control-Allow-Origin", origin.to_string());
        if self.allow_credentials {
            response
                .headers
                .append("Access-Control-Allow-Credentials", "true");
        }
        response
            .headers
            .append("Access-Control-Expose-Headers", self.allowed_headers.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preflight() -> HttpRequest {
        HttpRequest::new("OPTIONS", "/resource")
            .with_header("Origin", "http://x")
            .with_header("Access-Control-Request-Method", "GET")
    }

    #[test]
    fn test_preflight_detection() {
        assert!(is_preflight(&preflight()));
        assert!(!is_preflight(
            &HttpRequest::new("OPTIONS", "/").with_header("Origin", "http://x")
        ));
        assert!(!is_preflight(
            &HttpRequest::new("GET", "/")
                .with_header("Origin", "http://x")
                .with_header("Access-Control-Request-Method", "GET")
        ));
    }

    #[test]
    fn test_preflight_response_headers() {
        let response = CorsPolicy::default().preflight_response(&preflight());
        assert_eq!(response.status, 200);
        assert_eq!(
            response.headers.get("access-control-allow-origin"),
            Some("http://x")
        );
        assert!(response.headers.contains("access-control-allow-methods"));
        assert_eq!(
            response.headers.get("access-control-allow-credentials"),
            Some("true")
        );
    }

    #[test]
    fn test_preflight_without_credentials() {
        let response = CorsPolicy::with_credentials(false).preflight_response(&preflight());
        assert!(!response.headers.contains("access-control-allow-credentials"));
    }

    #[test]
    fn test_requested_headers_are_allowed() {
        let request = preflight().with_header("Access-Control-Request-Headers", "X-Custom");
        let response = CorsPolicy::default().preflight_response(&request);
        assert!(response
            .headers
            .get("access-control-allow-headers")
            .unwrap()
            .ends_with("X-Custom"));
    }
}
