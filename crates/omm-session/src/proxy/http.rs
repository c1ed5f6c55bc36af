// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal HTTP/1.1 pieces needed for a CONNECT tunnel.

/// End of an HTTP response header block.
const HEADER_END: &[u8] = b"\r\n\r\n";

const USER_AGENT: &str = concat!("omm-session/", env!("CARGO_PKG_VERSION"));

/// Build a CONNECT request for `target` (`host:port`).
///
/// `auth_header` is a complete header line without the trailing CRLF,
/// e.g. `Proxy-Authorization: Basic dXNlcjpwYXNz`.
pub fn connect_request(target: &str, auth_header: Option<&str>) -> String {
    let mut req = format!(
        "CONNECT {target} HTTP/1.1\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Proxy-Connection: Keep-Alive\r\n\
         Content-Length: 0\r\n\
         Host: {target}\r\n\
         Pragma: no-cache\r\n"
    );
    if let Some(header) = auth_header {
        req.push_str(header);
        req.push_str("\r\n");
    }
    req.push_str("\r\n");
    req
}

/// Offset just past the header block terminator, if present.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len())
        .position(|w| w == HEADER_END)
        .map(|pos| pos + HEADER_END.len())
}

/// Parsed status line and headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// `None` when the first line is not an `HTTP/1.x <code>` status line.
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn parse(text: &str) -> Self {
        let mut lines = text.split("\r\n");
        let status = lines.next().and_then(parse_status_line);

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Self { status, headers }
    }

    /// Values of every header named `name` (case-insensitive).
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The proxy announced it will close the connection.
    pub fn connection_close(&self) -> bool {
        ["Proxy-Connection", "Connection"].iter().any(|name| {
            self.header_values(name)
                .any(|v| v.eq_ignore_ascii_case("close"))
        })
    }
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    let code = parts.next()?;
    if code.len() != 3 {
        return None;
    }
    code.parse().ok()
}
