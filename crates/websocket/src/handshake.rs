//! WebSocket opening handshake, client side (RFC 6455 Section 4.1).
//!
//! Builds the HTTP Upgrade request, parses the server's response head and
//! validates it against the request. Runs once per connection before any
//! data frame is admitted.
//!
//! - [`Uri::parse`]: `ws://` / `wss://` URI parsing
//! - [`build_request`]: Upgrade request with a fresh `Sec-WebSocket-Key`
//! - [`parse_response`]: Incremental parse of the response head
//! - [`validate_response`]: Status, Upgrade/Connection, accept key and subprotocol checks
//! - [`compute_accept_key`]: SHA-1 + Base64 computation per RFC 6455 Section 4.2.2

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::entropy::Entropy;
use crate::error::HandshakeError;

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Headers the handshake sets itself; callers may not override them.
const RESERVED_HEADERS: [&str; 7] = [
    "Host",
    "Upgrade",
    "Connection",
    "Sec-WebSocket-Key",
    "Sec-WebSocket-Version",
    "Sec-WebSocket-Protocol",
    "Sec-WebSocket-Extensions",
];

// ---------------------------------------------------------------------------
// URI
// ---------------------------------------------------------------------------

/// A parsed `ws://` or `wss://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    /// `wss://`. TLS is the transport's business; this only picks the default port.
    pub secure: bool,
    /// Host name or address, without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub resource: String,
}

impl Uri {
    pub fn parse(text: &str) -> Result<Uri, HandshakeError> {
        let invalid = |reason| HandshakeError::InvalidUri {
            uri: text.to_string(),
            reason,
        };

        let (secure, rest) = match text.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("ws") => (false, rest),
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("wss") => (true, rest),
            _ => return Err(invalid("scheme must be ws or wss")),
        };
        if rest.contains('#') {
            return Err(invalid("fragment identifiers are not allowed"));
        }

        let split = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
        let (authority, resource) = rest.split_at(split);
        let resource = match resource.chars().next() {
            None => "/".to_string(),
            Some('?') => format!("/{}", resource),
            Some(_) => resource.to_string(),
        };
        if authority.contains('@') {
            return Err(invalid("userinfo is not supported"));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            match after {
                "" => (host, None),
                _ => match after.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(invalid("unexpected characters after IPv6 literal")),
                },
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None if secure => 443,
            None => 80,
        };

        Ok(Uri {
            secure,
            host: host.to_string(),
            port,
            resource,
        })
    }

    fn default_port(&self) -> u16 {
        if self.secure {
            443
        } else {
            80
        }
    }

    /// Value of the `Host` header: brackets IPv6 literals and omits the
    /// default port.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "wss" } else { "ws" };
        write!(f, "{}://{}{}", scheme, self.host_header(), self.resource)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Compute the `Sec-WebSocket-Accept` value per RFC 6455 Section 4.2.2.
///
/// Concatenates `client_key` + [`WS_GUID`], SHA-1 hashes, then Base64 encodes.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The client's HTTP Upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub resource: String,
    pub headers: Vec<(String, String)>,
    /// The base64 `Sec-WebSocket-Key` nonce.
    pub key: String,
    /// Subprotocols offered, in preference order.
    pub protocols: Vec<String>,
    /// Extensions offered (passed through verbatim, never activated).
    pub extensions: Vec<String>,
}

impl HttpRequest {
    /// First header with `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Offer extensions in `Sec-WebSocket-Extensions`.
    pub fn offer_extensions(&mut self, extensions: &[String]) {
        if extensions.is_empty() {
            return;
        }
        self.extensions = extensions.to_vec();
        self.headers.push((
            "Sec-WebSocket-Extensions".to_string(),
            extensions.join(", "),
        ));
    }

    /// Serialize the request head.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GET {} HTTP/1.1\r\n", self.resource)?;
        for (name, value) in &self.headers {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        write!(f, "\r\n")
    }
}

/// RFC 7230 `token`: the only shape a subprotocol name may take.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

/// Build the Upgrade request for `uri`.
///
/// Generates a random 16-byte nonce for `Sec-WebSocket-Key` and sets the
/// fixed Upgrade/Connection/Version headers, the offered subprotocols (if
/// any) and the caller's extra headers.
pub fn build_request(
    uri: &Uri,
    subprotocols: &[String],
    extra_headers: &[(String, String)],
    entropy: &mut dyn Entropy,
) -> Result<HttpRequest, HandshakeError> {
    for (i, proto) in subprotocols.iter().enumerate() {
        if !is_token(proto) || subprotocols[..i].contains(proto) {
            return Err(HandshakeError::InvalidSubprotocol(proto.clone()));
        }
    }
    for (name, _) in extra_headers {
        if RESERVED_HEADERS.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            return Err(HandshakeError::ReservedHeader(name.clone()));
        }
    }

    let key = BASE64.encode(entropy.nonce());
    let mut headers = vec![
        ("Host".to_string(), uri.host_header()),
        ("Upgrade".to_string(), "websocket".to_string()),
        ("Connection".to_string(), "Upgrade".to_string()),
        ("Sec-WebSocket-Key".to_string(), key.clone()),
        ("Sec-WebSocket-Version".to_string(), "13".to_string()),
    ];
    if !subprotocols.is_empty() {
        headers.push(("Sec-WebSocket-Protocol".to_string(), subprotocols.join(", ")));
    }
    headers.extend(extra_headers.iter().cloned());

    Ok(HttpRequest {
        resource: uri.resource.clone(),
        headers,
        key,
        protocols: subprotocols.to_vec(),
        extensions: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// The server's response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Comma-separated tokens across every header named `name`.
    fn tokens<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Parse the response head from the front of `buf`.
///
/// Returns `Ok(None)` until the blank line ending the head has arrived.
/// On success also returns the head's length; bytes past it already belong
/// to the WebSocket stream.
pub fn parse_response(
    buf: &[u8],
    max_len: usize,
) -> Result<Option<(HttpResponse, usize)>, HandshakeError> {
    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buf.len() > max_len {
            return Err(HandshakeError::ResponseTooLarge(max_len));
        }
        return Ok(None);
    };
    let head_len = end + 4;
    if head_len > max_len {
        return Err(HandshakeError::ResponseTooLarge(max_len));
    }

    let head = std::str::from_utf8(&buf[..end])
        .map_err(|_| HandshakeError::MalformedResponse("response head is not UTF-8".into()))?;
    let mut lines = head.split("\r\n");

    // Status line: "HTTP/1.1 101 Switching Protocols"
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(HandshakeError::MalformedResponse(format!(
            "bad status line: {}",
            status_line
        )));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            HandshakeError::MalformedResponse(format!("bad status line: {}", status_line))
        })?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            HandshakeError::MalformedResponse(format!("bad header line: {}", line))
        })?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some((
        HttpResponse {
            status,
            reason,
            headers,
        },
        head_len,
    )))
}

/// Parameters agreed on by a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub accept: String,
    pub protocol: Option<String>,
    /// Extensions the server accepted. Recorded, never activated.
    pub extensions: Vec<String>,
}

/// Validate the server's response against the request it answers.
///
/// Every check is fatal; in particular an accept mismatch is never tolerated.
pub fn validate_response(
    request: &HttpRequest,
    response: &HttpResponse,
) -> Result<HandshakeResult, HandshakeError> {
    if response.status != 101 {
        return Err(HandshakeError::UnexpectedStatus(response.status));
    }
    if !response
        .tokens("Upgrade")
        .any(|t| t.eq_ignore_ascii_case("websocket"))
    {
        return Err(HandshakeError::MissingUpgrade);
    }
    if !response
        .tokens("Connection")
        .any(|t| t.eq_ignore_ascii_case("upgrade"))
    {
        return Err(HandshakeError::MissingConnection);
    }

    let actual = response
        .header("Sec-WebSocket-Accept")
        .ok_or(HandshakeError::MissingAccept)?;
    let expected = compute_accept_key(&request.key);
    if actual != expected {
        return Err(HandshakeError::AcceptMismatch {
            expected,
            actual: actual.to_string(),
        });
    }

    let protocol = match response.header("Sec-WebSocket-Protocol") {
        None | Some("") => None,
        Some(p) if request.protocols.iter().any(|o| o == p) => Some(p.to_string()),
        Some(p) => return Err(HandshakeError::SubprotocolNotOffered(p.to_string())),
    };

    let offered: Vec<&str> = request.extensions.iter().map(|e| extension_name(e)).collect();
    let mut extensions = Vec::new();
    for ext in response.tokens("Sec-WebSocket-Extensions") {
        if !offered.contains(&extension_name(ext)) {
            return Err(HandshakeError::ExtensionNotOffered(ext.to_string()));
        }
        extensions.push(ext.to_string());
    }

    Ok(HandshakeResult {
        accept: actual.to_string(),
        protocol,
        extensions,
    })
}

fn extension_name(ext: &str) -> &str {
    ext.split(';').next().unwrap_or_default().trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::FixedEntropy;

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn request_with(protocols: &[&str]) -> HttpRequest {
        HttpRequest {
            resource: "/chat".to_string(),
            headers: Vec::new(),
            key: RFC_KEY.to_string(),
            protocols: protocols.iter().map(|p| p.to_string()).collect(),
            extensions: Vec::new(),
        }
    }

    fn response(status: u16, headers: &[(&str, &str)]) -> HttpResponse {
        HttpResponse {
            status,
            reason: String::new(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn upgrade_response(extra: &[(&str, &str)]) -> HttpResponse {
        let mut headers = vec![
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Accept", RFC_ACCEPT),
        ];
        headers.extend_from_slice(extra);
        response(101, &headers)
    }

    #[test]
    fn test_accept_key_rfc_example() {
        // RFC 6455 Section 4.2.2 test vector
        assert_eq!(compute_accept_key(RFC_KEY), RFC_ACCEPT);
    }

    #[test]
    fn test_uri_parse_variants() {
        let uri = Uri::parse("ws://example.com/chat?room=1").unwrap();
        assert!(!uri.secure);
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, 80);
        assert_eq!(uri.resource, "/chat?room=1");

        let uri = Uri::parse("WSS://example.com").unwrap();
        assert!(uri.secure);
        assert_eq!(uri.port, 443);
        assert_eq!(uri.resource, "/");

        let uri = Uri::parse("ws://[::1]:9000?x=y").unwrap();
        assert_eq!(uri.host, "::1");
        assert_eq!(uri.port, 9000);
        assert_eq!(uri.resource, "/?x=y");
        assert_eq!(uri.host_header(), "[::1]:9000");
        assert_eq!(uri.to_string(), "ws://[::1]:9000/?x=y");
    }

    #[test]
    fn test_uri_parse_rejects() {
        for bad in [
            "http://example.com/",
            "example.com",
            "ws://example.com/#frag",
            "ws:///path",
            "ws://host:99999/",
            "ws://user@host/",
            "ws://[::1/",
        ] {
            assert!(
                matches!(Uri::parse(bad), Err(HandshakeError::InvalidUri { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_build_request_headers() {
        let uri = Uri::parse("ws://example.com:9000/chat?room=1").unwrap();
        let mut entropy = FixedEntropy::new((0u8..16).collect::<Vec<_>>());
        let request = build_request(
            &uri,
            &["chat.v2".to_string(), "chat".to_string()],
            &[("Origin".to_string(), "https://example.com".to_string())],
            &mut entropy,
        )
        .unwrap();

        assert_eq!(request.key, "AAECAwQFBgcICQoLDA0ODw==");
        let rendered = request.to_string().replace("\r\n", "\n");
        insta::assert_snapshot!(rendered.trim_end(), @r###"
        GET /chat?room=1 HTTP/1.1
        Host: example.com:9000
        Upgrade: websocket
        Connection: Upgrade
        Sec-WebSocket-Key: AAECAwQFBgcICQoLDA0ODw==
        Sec-WebSocket-Version: 13
        Sec-WebSocket-Protocol: chat.v2, chat
        Origin: https://example.com
        "###);
        assert!(request.to_bytes().ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn test_build_request_fresh_nonce_per_call() {
        let uri = Uri::parse("ws://example.com/").unwrap();
        let mut entropy = crate::entropy::ThreadEntropy;
        let a = build_request(&uri, &[], &[], &mut entropy).unwrap();
        let b = build_request(&uri, &[], &[], &mut entropy).unwrap();
        assert_ne!(a.key, b.key);
        assert_eq!(BASE64.decode(&a.key).unwrap().len(), 16);
        assert_eq!(a.header("sec-websocket-protocol"), None);
    }

    #[test]
    fn test_build_request_rejects_bad_input() {
        let uri = Uri::parse("ws://example.com/").unwrap();
        let mut entropy = FixedEntropy::new(vec![7]);
        let err = build_request(&uri, &["bad proto".to_string()], &[], &mut entropy).unwrap_err();
        assert_eq!(err, HandshakeError::InvalidSubprotocol("bad proto".to_string()));

        let dup = ["a".to_string(), "a".to_string()];
        assert!(build_request(&uri, &dup, &[], &mut entropy).is_err());

        let headers = [("sec-websocket-key".to_string(), "x".to_string())];
        let err = build_request(&uri, &[], &headers, &mut entropy).unwrap_err();
        assert_eq!(err, HandshakeError::ReservedHeader("sec-websocket-key".to_string()));
    }

    #[test]
    fn test_parse_response_incremental() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n\x81\x00";
        assert_eq!(parse_response(&raw[..20], 1024).unwrap(), None);

        let (resp, len) = parse_response(raw, 1024).unwrap().unwrap();
        assert_eq!(resp.status, 101);
        assert_eq!(resp.reason, "Switching Protocols");
        assert_eq!(resp.header("upgrade"), Some("websocket"));
        assert_eq!(&raw[len..], b"\x81\x00");
    }

    #[test]
    fn test_parse_response_limits_and_garbage() {
        let long = vec![b'a'; 100];
        assert_eq!(
            parse_response(&long, 64).unwrap_err(),
            HandshakeError::ResponseTooLarge(64)
        );
        assert!(matches!(
            parse_response(b"SSH-2.0-OpenSSH\r\n\r\n", 1024),
            Err(HandshakeError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_response(b"HTTP/1.1 101 OK\r\nno-colon\r\n\r\n", 1024),
            Err(HandshakeError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_validate_valid_upgrade() {
        let result = validate_response(&request_with(&[]), &upgrade_response(&[])).unwrap();
        assert_eq!(result.accept, RFC_ACCEPT);
        assert_eq!(result.protocol, None);
        assert!(result.extensions.is_empty());
    }

    #[test]
    fn test_validate_wrong_status() {
        let resp = response(200, &[("Upgrade", "websocket"), ("Connection", "Upgrade")]);
        assert_eq!(
            validate_response(&request_with(&[]), &resp).unwrap_err(),
            HandshakeError::UnexpectedStatus(200)
        );
    }

    #[test]
    fn test_validate_header_tokens_case_insensitive() {
        let resp = response(
            101,
            &[
                ("upgrade", "WebSocket"),
                ("connection", "keep-alive, UPGRADE"),
                ("sec-websocket-accept", RFC_ACCEPT),
            ],
        );
        assert!(validate_response(&request_with(&[]), &resp).is_ok());
    }

    #[test]
    fn test_validate_missing_upgrade_and_connection() {
        let resp = response(
            101,
            &[("Connection", "Upgrade"), ("Sec-WebSocket-Accept", RFC_ACCEPT)],
        );
        assert_eq!(
            validate_response(&request_with(&[]), &resp).unwrap_err(),
            HandshakeError::MissingUpgrade
        );
        let resp = response(
            101,
            &[("Upgrade", "websocket"), ("Connection", "keep-alive")],
        );
        assert_eq!(
            validate_response(&request_with(&[]), &resp).unwrap_err(),
            HandshakeError::MissingConnection
        );
    }

    #[test]
    fn test_validate_accept_mismatch() {
        let resp = response(
            101,
            &[
                ("Upgrade", "websocket"),
                ("Connection", "Upgrade"),
                ("Sec-WebSocket-Accept", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo"),
            ],
        );
        assert_eq!(
            validate_response(&request_with(&[]), &resp).unwrap_err(),
            HandshakeError::AcceptMismatch {
                expected: RFC_ACCEPT.to_string(),
                actual: "s3pPLMBiTxaQ9kYGzzhZRbK+xOo".to_string(),
            }
        );

        let resp = response(101, &[("Upgrade", "websocket"), ("Connection", "Upgrade")]);
        assert_eq!(
            validate_response(&request_with(&[]), &resp).unwrap_err(),
            HandshakeError::MissingAccept
        );
    }

    #[test]
    fn test_validate_subprotocol() {
        let resp = upgrade_response(&[("Sec-WebSocket-Protocol", "chat")]);
        let result = validate_response(&request_with(&["chat.v2", "chat"]), &resp).unwrap();
        assert_eq!(result.protocol.as_deref(), Some("chat"));

        assert_eq!(
            validate_response(&request_with(&["chat.v2"]), &resp).unwrap_err(),
            HandshakeError::SubprotocolNotOffered("chat".to_string())
        );
        assert_eq!(
            validate_response(&request_with(&[]), &resp).unwrap_err(),
            HandshakeError::SubprotocolNotOffered("chat".to_string())
        );
    }

    #[test]
    fn test_validate_extensions() {
        let resp = upgrade_response(&[(
            "Sec-WebSocket-Extensions",
            "permessage-deflate; client_max_window_bits=10",
        )]);
        assert_eq!(
            validate_response(&request_with(&[]), &resp).unwrap_err(),
            HandshakeError::ExtensionNotOffered(
                "permessage-deflate; client_max_window_bits=10".to_string()
            )
        );

        let mut request = request_with(&[]);
        request.offer_extensions(&["permessage-deflate; client_max_window_bits".to_string()]);
        assert_eq!(
            request.header("Sec-WebSocket-Extensions"),
            Some("permessage-deflate; client_max_window_bits")
        );
        let result = validate_response(&request, &resp).unwrap();
        assert_eq!(result.extensions.len(), 1);
    }
}
