//! Header/protocol model: HTTP/1.1 messages, codec, CORS and URL helpers

pub mod codec;
pub mod cors;
pub mod headers;
pub mod request;
pub mod url;

pub use codec::{parse_request, parse_response, read_request, read_response, ParseError};
pub use cors::{is_preflight, CorsPolicy};
pub use headers::{is_hop_by_hop, Headers};
pub use request::{HttpRequest, HttpResponse};
pub use url::{normalize_slashes, parse_absolute, parse_authority, Target, UrlError};
