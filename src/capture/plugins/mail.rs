use bytes::Bytes;

use super::{could_become_keyword, leading_keyword, line_end, trim_eol};
use crate::capture::element::{Pop3Facet, SmtpFacet};
use crate::capture::pipeline::{Claim, DecodeContext, DecodePlugin, Phase};

const SMTP_VERBS: &[&str] = &[
    "HELO", "EHLO", "MAIL", "RCPT", "DATA", "BDAT", "RSET", "NOOP", "QUIT", "VRFY", "EXPN", "HELP", "AUTH",
    "STARTTLS",
];
const POP3_KEYWORDS: &[&str] = &[
    "USER", "PASS", "APOP", "STAT", "LIST", "RETR", "DELE", "NOOP", "RSET", "QUIT", "TOP", "UIDL", "CAPA",
    "STLS", "AUTH",
];
/// Verbs both protocols use; SMTP leaves them to POP3 on POP3 ports
const SHARED_VERBS: &[&str] = &["NOOP", "RSET", "QUIT", "AUTH"];
const POP3_PORTS: &[u16] = &[110, 995];

/// Outcome of matching one command line
enum CommandLine {
    Decline,
    NeedMore,
    Line { keyword: String, arguments: String, len: usize },
}

fn command_line(buf: &[u8], keywords: &[&str]) -> CommandLine {
    let (keyword, token_len) = leading_keyword(buf);
    if token_len == buf.len() {
        return if could_become_keyword(buf, keywords) {
            CommandLine::NeedMore
        } else {
            CommandLine::Decline
        };
    }
    if !matches!(buf[token_len], b' ' | b'\r' | b'\n') || !keywords.contains(&keyword.as_str()) {
        return CommandLine::Decline;
    }
    let Some(end) = line_end(buf) else {
        return CommandLine::NeedMore;
    };
    let arguments = String::from_utf8_lossy(&trim_eol(&buf[..end])[token_len..])
        .trim()
        .to_string();
    CommandLine::Line {
        keyword,
        arguments,
        len: end,
    }
}

/// SMTP commands and (multi-line) replies
#[derive(Debug, Default)]
pub struct SmtpPlugin;

impl DecodePlugin for SmtpPlugin {
    fn name(&self) -> &'static str {
        "smtp"
    }

    fn phase(&self) -> Phase {
        Phase::Framing
    }

    fn inspect(&self, buf: &Bytes, ctx: &DecodeContext<'_>) -> Claim {
        if buf.first().is_some_and(u8::is_ascii_digit) {
            return smtp_reply(buf);
        }

        match command_line(buf, SMTP_VERBS) {
            CommandLine::Decline => Claim::Decline,
            CommandLine::NeedMore => Claim::NeedMore,
            CommandLine::Line { keyword, .. }
                if SHARED_VERBS.contains(&keyword.as_str()) && ctx.involves_port(POP3_PORTS) =>
            {
                Claim::Decline
            }
            CommandLine::Line {
                keyword,
                arguments,
                len,
            } => Claim::claimed(
                len,
                SmtpFacet::Command {
                    verb: keyword,
                    argument: (!arguments.is_empty()).then_some(arguments),
                },
            ),
        }
    }
}

/// `DDD-text` continuation lines until a `DDD text` final line
fn smtp_reply(buf: &Bytes) -> Claim {
    let mut pos = 0;
    let mut code: Option<u16> = None;
    let mut lines = Vec::new();

    loop {
        let rest = &buf[pos..];
        let Some(end) = line_end(rest) else {
            return if looks_like_reply_prefix(rest) {
                Claim::NeedMore
            } else if pos == 0 {
                Claim::Decline
            } else {
                Claim::Malformed {
                    len: pos,
                    reason: "unterminated multi-line reply".into(),
                }
            };
        };

        let line = trim_eol(&rest[..end]);
        let Some(line_code) = reply_code(line) else {
            return if pos == 0 {
                Claim::Decline
            } else {
                Claim::Malformed {
                    len: pos,
                    reason: "unterminated multi-line reply".into(),
                }
            };
        };
        if code.is_some_and(|c| c != line_code) {
            return Claim::Malformed {
                len: pos + end,
                reason: format!("reply code changed mid-reply to {}", line_code),
            };
        }
        code = Some(line_code);
        lines.push(String::from_utf8_lossy(line.get(4..).unwrap_or_default()).to_string());
        pos += end;

        if line.len() == 3 || line[3] == b' ' {
            return Claim::claimed(pos, SmtpFacet::Response { code: line_code, lines });
        }
    }
}

fn reply_code(line: &[u8]) -> Option<u16> {
    if line.len() < 3 || !line[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    if line.len() > 3 && !matches!(line[3], b' ' | b'-') {
        return None;
    }
    std::str::from_utf8(&line[..3]).ok()?.parse().ok()
}

fn looks_like_reply_prefix(rest: &[u8]) -> bool {
    rest.iter().take(3).all(u8::is_ascii_digit) && (rest.len() <= 3 || matches!(rest[3], b' ' | b'-'))
}

/// POP3 commands and `+OK`/`-ERR` responses
///
/// A multi-line response is only recognized when its terminating `.` line is
/// already in the buffer; otherwise the status line is claimed alone.
#[derive(Debug, Default)]
pub struct Pop3Plugin;

impl DecodePlugin for Pop3Plugin {
    fn name(&self) -> &'static str {
        "pop3"
    }

    fn phase(&self) -> Phase {
        Phase::Framing
    }

    fn inspect(&self, buf: &Bytes, _ctx: &DecodeContext<'_>) -> Claim {
        if matches!(buf.first(), Some(b'+') | Some(b'-')) {
            return pop3_response(buf);
        }

        match command_line(buf, POP3_KEYWORDS) {
            CommandLine::Decline => Claim::Decline,
            CommandLine::NeedMore => Claim::NeedMore,
            CommandLine::Line {
                keyword,
                arguments,
                len,
            } => Claim::claimed(
                len,
                Pop3Facet::Command {
                    keyword,
                    arguments: arguments.split_whitespace().map(str::to_string).collect(),
                },
            ),
        }
    }
}

fn pop3_response(buf: &Bytes) -> Claim {
    let (marker, ok): (&[u8], bool) = if buf.starts_with(b"+OK") || b"+OK".starts_with(buf) {
        (b"+OK", true)
    } else {
        (b"-ERR", false)
    };
    if buf.len() < marker.len() {
        return if marker.starts_with(buf) { Claim::NeedMore } else { Claim::Decline };
    }
    if !buf.starts_with(marker) {
        return Claim::Decline;
    }
    if buf.len() > marker.len() && !matches!(buf[marker.len()], b' ' | b'\r' | b'\n') {
        return Claim::Decline;
    }
    let Some(end) = line_end(buf) else {
        return Claim::NeedMore;
    };
    let status = String::from_utf8_lossy(&trim_eol(&buf[..end])[marker.len()..])
        .trim()
        .to_string();

    let rest = &buf[end..];
    let starts_new_response = rest.starts_with(b"+OK") || rest.starts_with(b"-ERR");
    if ok && !rest.is_empty() && !starts_new_response {
        if let Some((body, body_len)) = multi_line_body(rest) {
            return Claim::claimed(
                end + body_len,
                Pop3Facet::Response {
                    ok,
                    status,
                    body: Some(body),
                },
            );
        }
    }

    Claim::claimed(end, Pop3Facet::Response { ok, status, body: None })
}

/// Lines up to a lone `.`, dot-unstuffed, and the bytes they span
fn multi_line_body(buf: &[u8]) -> Option<(Vec<String>, usize)> {
    let mut lines = Vec::new();
    let mut pos = 0;
    while let Some(end) = line_end(&buf[pos..]) {
        let line = trim_eol(&buf[pos..pos + end]);
        pos += end;
        if line == b"." {
            return Some((lines, pos));
        }
        let line = line.strip_prefix(b".").unwrap_or(line);
        lines.push(String::from_utf8_lossy(line).to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::element::Endpoints;
    use crate::capture::Facet;

    fn claim(plugin: &dyn DecodePlugin, raw: &'static [u8]) -> Claim {
        plugin.inspect(&Bytes::from_static(raw), &DecodeContext::default())
    }

    fn claimed_facet(claim: Claim) -> (usize, Facet) {
        match claim {
            Claim::Claimed { len, mut facets, .. } => (len, facets.remove(0)),
            other => panic!("expected claim, got {:?}", other),
        }
    }

    #[test]
    fn test_smtp_command() {
        let (len, facet) = claimed_facet(claim(&SmtpPlugin, b"MAIL FROM:<a@b.test>\r\nRCPT"));
        assert_eq!(len, 22);
        assert_eq!(
            facet,
            Facet::Smtp(SmtpFacet::Command {
                verb: "MAIL".into(),
                argument: Some("FROM:<a@b.test>".into()),
            })
        );

        let (_, facet) = claimed_facet(claim(&SmtpPlugin, b"quit\r\n"));
        assert_eq!(
            facet,
            Facet::Smtp(SmtpFacet::Command {
                verb: "QUIT".into(),
                argument: None,
            })
        );
    }

    #[test]
    fn test_smtp_multi_line_reply() {
        let (len, facet) = claimed_facet(claim(
            &SmtpPlugin,
            b"250-mail.test greets you\r\n250-SIZE 1000\r\n250 STARTTLS\r\n",
        ));
        assert_eq!(len, 55);
        assert_eq!(
            facet,
            Facet::Smtp(SmtpFacet::Response {
                code: 250,
                lines: vec!["mail.test greets you".into(), "SIZE 1000".into(), "STARTTLS".into()],
            })
        );
    }

    #[test]
    fn test_smtp_partial_reply_waits() {
        assert!(matches!(claim(&SmtpPlugin, b"250-first\r\n25"), Claim::NeedMore));
        assert!(matches!(claim(&SmtpPlugin, b"22"), Claim::NeedMore));
        assert!(matches!(claim(&SmtpPlugin, b"250-first\r\nxyz\r\n"), Claim::Malformed { len: 11, .. }));
    }

    #[test]
    fn test_shared_verbs_yield_to_pop3_on_pop3_ports() {
        let endpoints = Endpoints {
            sender: "10.0.0.1:50000".into(),
            receiver: "mail.test:110".into(),
        };
        let ctx = DecodeContext::new(&endpoints);
        let raw = Bytes::from_static(b"QUIT\r\n");
        assert!(matches!(SmtpPlugin.inspect(&raw, &ctx), Claim::Decline));
        assert!(matches!(Pop3Plugin.inspect(&raw, &ctx), Claim::Claimed { len: 6, .. }));
    }

    #[test]
    fn test_pop3_command_and_status() {
        let (_, facet) = claimed_facet(claim(&Pop3Plugin, b"RETR 1\r\n"));
        assert_eq!(
            facet,
            Facet::Pop3(Pop3Facet::Command {
                keyword: "RETR".into(),
                arguments: vec!["1".into()],
            })
        );

        let (len, facet) = claimed_facet(claim(&Pop3Plugin, b"-ERR no such message\r\n"));
        assert_eq!(len, 22);
        assert_eq!(
            facet,
            Facet::Pop3(Pop3Facet::Response {
                ok: false,
                status: "no such message".into(),
                body: None,
            })
        );
    }

    #[test]
    fn test_pop3_multi_line_response() {
        let raw: &'static [u8] = b"+OK 120 octets\r\nSubject: hi\r\n..dot\r\n.\r\n+OK";
        let (len, facet) = claimed_facet(claim(&Pop3Plugin, raw));
        assert_eq!(len, raw.len() - 3);
        assert_eq!(
            facet,
            Facet::Pop3(Pop3Facet::Response {
                ok: true,
                status: "120 octets".into(),
                body: Some(vec!["Subject: hi".into(), ".dot".into()]),
            })
        );
    }

    #[test]
    fn test_pop3_partial_marker() {
        assert!(matches!(claim(&Pop3Plugin, b"+O"), Claim::NeedMore));
        assert!(matches!(claim(&Pop3Plugin, b"-E"), Claim::NeedMore));
        assert!(matches!(claim(&Pop3Plugin, b"+ challenge\r\n"), Claim::Decline));
    }
}
