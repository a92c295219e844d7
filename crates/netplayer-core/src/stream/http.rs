//! Minimal HTTP/1.0 request building and response header inspection.
//!
//! The stream stage only sends an opaque request and reads the response header
//! verbatim; these helpers cover the few fields the player itself looks at.

use anyhow::{Result, anyhow, bail};

/// Largest response header accepted before the connection is dropped.
pub const MAX_HEADER_BYTES: usize = 4096;

/// `true` once the header terminator has been received.
pub fn header_complete(header: &[u8]) -> bool {
    header.ends_with(b"\r\n\r\n") || header.ends_with(b"\n\n")
}

/// Status code from the response line (`HTTP/1.1 200 OK`, `ICY 200 OK`).
pub fn status_code(header: &str) -> Option<u16> {
    let line = header.lines().next()?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Case-insensitive lookup of a header field.
pub fn header_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// Interval of inline ICY metadata, if the server announced one.
pub fn meta_interval(header: &str) -> Option<usize> {
    header_value(header, "icy-metaint")?
        .parse()
        .ok()
        .filter(|v| *v > 0)
}

/// Connect address and request bytes for a plain `http://` URL.
pub(crate) fn get_request(url: &str, icy_metadata: bool) -> Result<(String, Vec<u8>)> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| anyhow!("only http:// URLs are supported: {url}"))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        bail!("missing host in {url}");
    }
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let addr = if has_port(authority) {
        authority.to_string()
    } else {
        format!("{authority}:80")
    };

    let mut request = format!(
        "GET {path} HTTP/1.0\r\nHost: {authority}\r\nUser-Agent: netplayer/{}\r\nAccept: */*\r\nConnection: close\r\n",
        env!("CARGO_PKG_VERSION")
    );
    if icy_metadata {
        request.push_str("Icy-MetaData: 1\r\n");
    }
    request.push_str("\r\n");
    Ok((addr, request.into_bytes()))
}

fn has_port(authority: &str) -> bool {
    match authority.rfind(':') {
        Some(idx) => !authority[idx..].contains(']'),
        None => false,
    }
}
