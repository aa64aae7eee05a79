//! Built-in decode plugins

mod content;
mod framed;
mod http;
mod mail;

pub use content::{JsonPlugin, X509Plugin};
pub use framed::{CetpPlugin, SicctPlugin, CETP_HEADER_LEN, SICCT_HEADER_LEN};
pub use http::HttpPlugin;
pub use mail::{Pop3Plugin, SmtpPlugin};

/// Position just past the first line terminator (LF or CRLF)
pub(crate) fn line_end(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n').map(|i| i + 1)
}

/// Line content without its terminator
pub(crate) fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Leading ASCII-letter token, uppercased
pub(crate) fn leading_keyword(buf: &[u8]) -> (String, usize) {
    let len = buf.iter().take_while(|b| b.is_ascii_alphabetic()).count();
    (String::from_utf8_lossy(&buf[..len]).to_ascii_uppercase(), len)
}

/// Whether `buf` could still grow into one of `keywords` followed by a separator
pub(crate) fn could_become_keyword(buf: &[u8], keywords: &[&str]) -> bool {
    let upper = buf.to_ascii_uppercase();
    keywords.iter().any(|k| k.as_bytes().starts_with(&upper))
}
