//! Bounded 503 page for kites that cannot be reached.
//!
//! Every interpolated field comes from the request or the tunnel table and
//! may be attacker-controlled. Fields are reduced to a safe character set
//! and cut to a fixed width before they touch the template, so the page can
//! never exceed [`REJECT_MAXSIZE`] bytes or break out of its markup.

use crate::handshake::VERSION;

pub const REJECT_MAXSIZE: usize = 1024;

/// Where the failure was detected, e.g. "FE" or "BE".
pub const MAX_WHERE_LENGTH: usize = 3;
pub const MAX_PROTO_LENGTH: usize = 8;
pub const MAX_DOMAIN_LENGTH: usize = 64;

/// Longest version string placed in the page.
const MAX_VERSION_LENGTH: usize = 16;

const REJECT_HEAD: &str = "HTTP/1.1 503 Unavailable\r\n\
                           Content-Type: text/html; charset=utf-8\r\n\
                           Pragma: no-cache\r\n\
                           Expires: 0\r\n\
                           Cache-Control: no-store\r\n\
                           Connection: close\r\n\
                           \r\n";

const OFFLINE_PAGE: &str = "https://pktunnel.net/offline/";

/// Renders the full HTTP response, headers included.
///
/// With `advertise`, the page is wrapped in a frameset pointing at the
/// hosted offline page, with the plain page as the `noframes` fallback.
pub fn format_reject(where_: &str, proto: &str, domain: &str, advertise: bool) -> String {
    let where_ = sanitize(where_, MAX_WHERE_LENGTH);
    let proto = sanitize(proto, MAX_PROTO_LENGTH);
    let domain = sanitize(domain, MAX_DOMAIN_LENGTH);
    let version = sanitize(VERSION, MAX_VERSION_LENGTH);

    let (pre, post) = if advertise {
        (
            format!(
                "<frameset cols='*'><frame target='_top' src='{}?&v={}&where={}&proto={}&domain={}'><noframes>",
                OFFLINE_PAGE, version, where_, proto, domain
            ),
            "</noframes></frameset>",
        )
    } else {
        (String::new(), "")
    };

    let page = format!(
        "{}<html>{}<h1>Sorry! ({}/{})</h1><p>The {} tunnel for <b>{}</b> is unavailable \
         at the moment.</p><p>Please try again later.</p>{}</html>",
        REJECT_HEAD, pre, where_, version, proto, domain, post
    );
    debug_assert!(page.len() <= REJECT_MAXSIZE);
    page
}

/// Keeps `[A-Za-z0-9.-_:]`, replaces anything else with `_`, and stops at
/// `max` characters. The output is ASCII, so characters equal bytes.
fn sanitize(value: &str, max: usize) -> String {
    value
        .chars()
        .take(max)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
