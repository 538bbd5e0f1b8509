//! HTTP/1.1 message builders.
//!
//! Headers keep insertion order and the case of their first writing;
//! lookups compare names case-insensitively. Serialization is
//! byte-stable: identical inputs produce identical bytes.

/// Returns true when a comma-separated header value contains `token`
/// (case-insensitive).
pub(crate) fn header_has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Keep-alive default for the given HTTP minor version and optional
/// `Connection` header value.
pub(crate) fn keep_alive_for(version_minor: u8, connection: Option<&str>) -> bool {
    match connection {
        Some(value) if header_has_token(value, "close") => false,
        Some(value) if header_has_token(value, "keep-alive") => true,
        _ => version_minor >= 1,
    }
}

macro_rules! common_message_impl {
    () => {
        /// HTTP minor version (1 for HTTP/1.1).
        pub fn version_minor(&self) -> u8 {
            self.version_minor
        }

        /// Appends a header field. Duplicates are kept and emitted in
        /// insertion order.
        pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
            self.headers.push((name.to_owned(), value.to_owned()));
            self
        }

        /// First header value matching `name` (case-insensitive).
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        /// All header fields in insertion order.
        pub fn headers(&self) -> &[(String, String)] {
            &self.headers
        }

        /// Replaces the body and sets `Content-Length` accordingly.
        pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
            self.body = body.into();
            self.set_header("Content-Length", &self.body.len().to_string());
            self
        }

        /// Announces a body length without storing a body (streamed
        /// separately by the caller).
        pub fn set_body_length(&mut self, length: usize) -> &mut Self {
            self.set_header("Content-Length", &length.to_string());
            self
        }

        /// Message body.
        pub fn body(&self) -> &[u8] {
            &self.body
        }

        pub(crate) fn body_mut(&mut self) -> &mut Vec<u8> {
            &mut self.body
        }

        /// Whether the connection should stay open after this message.
        pub fn keep_alive(&self) -> bool {
            crate::message::keep_alive_for(self.version_minor, self.header("Connection"))
        }

        fn serialize_headers_into(&self, out: &mut Vec<u8>) {
            for (name, value) in &self.headers {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&self.body);
        }
    };
}

/// An HTTP request: request line, ordered headers, optional body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpRequest {
    method: String,
    target: String,
    version_minor: u8,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    /// Creates an empty HTTP/1.1 request.
    pub fn new() -> Self {
        Self { version_minor: 1, ..Default::default() }
    }

    /// Creates a GET request for `target`.
    pub fn make_get_request(target: &str) -> Self {
        let mut request = Self::new();
        request.set_begin("GET", target);
        request
    }

    /// Creates a HEAD request for `target`.
    pub fn make_head_request(target: &str) -> Self {
        let mut request = Self::new();
        request.set_begin("HEAD", target);
        request
    }

    /// Creates a POST request for `target` carrying `body`.
    pub fn make_post_request(target: &str, body: impl Into<Vec<u8>>) -> Self {
        let mut request = Self::new();
        request.set_begin("POST", target);
        request.set_body(body);
        request
    }

    /// Sets the request line.
    pub fn set_begin(&mut self, method: &str, target: &str) -> &mut Self {
        self.method = method.to_owned();
        self.target = target.to_owned();
        self.version_minor = 1;
        self
    }

    pub(crate) fn set_head(&mut self, method: &str, target: &str, version_minor: u8) {
        self.method = method.to_owned();
        self.target = target.to_owned();
        self.version_minor = version_minor;
    }

    /// Request method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request target.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Byte-stable serialization of the whole message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(b" HTTP/1.");
        out.extend_from_slice(self.version_minor.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        self.serialize_headers_into(&mut out);
        out
    }

    common_message_impl!();
}

/// An HTTP response: status line, ordered headers, optional body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    reason: String,
    version_minor: u8,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    /// Creates an empty HTTP/1.1 response.
    pub fn new() -> Self {
        Self { version_minor: 1, ..Default::default() }
    }

    /// Creates a `200 OK` response.
    pub fn make_ok_response() -> Self {
        let mut response = Self::new();
        response.set_begin(200, None);
        response
    }

    /// Creates an error response carrying a plain-text body.
    pub fn make_error_response(status: u16, content: &str) -> Self {
        let mut response = Self::new();
        response.set_begin(status, None);
        response.set_header("Content-Type", "text/plain; charset=UTF-8");
        response.set_body(content.as_bytes().to_vec());
        response
    }

    /// Sets the status line; `None` picks the standard reason phrase.
    pub fn set_begin(&mut self, status: u16, reason: Option<&str>) -> &mut Self {
        self.status = status;
        self.reason = reason.map(str::to_owned).unwrap_or_else(|| standard_reason(status).to_owned());
        self.version_minor = 1;
        self
    }

    pub(crate) fn set_head(&mut self, status: u16, reason: &str, version_minor: u8) {
        self.status = status;
        self.reason = reason.to_owned();
        self.version_minor = version_minor;
    }

    /// Status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Reason phrase.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Byte-stable serialization of the whole message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(b"HTTP/1.");
        out.extend_from_slice(self.version_minor.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.serialize_headers_into(&mut out);
        out
    }

    common_message_impl!();
}

fn standard_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization_is_byte_stable() {
        let mut request = HttpRequest::make_get_request("/index.html");
        request.set_header("Host", "localhost");
        request.set_header("X-Custom", "a");
        request.set_header("X-Custom", "b");
        let expected = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nX-Custom: a\r\nX-Custom: b\r\n\r\n";
        assert_eq!(request.to_bytes(), expected.to_vec());
        assert_eq!(request.to_bytes(), request.to_bytes());
    }

    #[test]
    fn post_sets_content_length() {
        let request = HttpRequest::make_post_request("/submit", b"hello".to_vec());
        assert_eq!(request.header("content-length"), Some("5"));
        assert_eq!(request.body(), b"hello");
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_case_preserving() {
        let mut response = HttpResponse::make_ok_response();
        response.set_header("X-MiXeD", "1");
        assert_eq!(response.header("x-mixed"), Some("1"));
        let text = String::from_utf8(response.to_bytes()).unwrap();
        assert!(text.contains("X-MiXeD: 1"));
    }

    #[test]
    fn response_status_line() {
        let response = HttpResponse::make_error_response(404, "missing");
        let text = String::from_utf8(response.to_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with("missing"));
    }

    #[test]
    fn keep_alive_defaults() {
        let mut request = HttpRequest::make_get_request("/");
        assert!(request.keep_alive());
        request.set_header("Connection", "close");
        assert!(!request.keep_alive());

        let mut response = HttpResponse::new();
        response.set_head(200, "OK", 0);
        assert!(!response.keep_alive());
        response.set_header("Connection", "Keep-Alive");
        assert!(response.keep_alive());
    }
}
