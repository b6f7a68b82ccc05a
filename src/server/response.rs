use http::StatusCode;
use serde_json::{json, Value};

/// Content types a [`Response`] can carry.
///
/// `may_minihttp` only accepts `'static` header lines, so the set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    Json,
    Text,
    Html,
    Binary,
}

impl ContentType {
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Text => "text/plain; charset=utf-8",
            ContentType::Html => "text/html; charset=utf-8",
            ContentType::Binary => "application/octet-stream",
        }
    }

    fn header_line(&self) -> &'static str {
        match self {
            ContentType::Json => "Content-Type: application/json",
            ContentType::Text => "Content-Type: text/plain; charset=utf-8",
            ContentType::Html => "Content-Type: text/html; charset=utf-8",
            ContentType::Binary => "Content-Type: application/octet-stream",
        }
    }
}

/// Canonical reason phrase for a status code.
pub fn status_reason(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// Response sink handed to the router.
///
/// Owned by exactly one worker while the job runs, then moved back to the
/// connection that serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    content_type: ContentType,
    body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200)
    }
}

impl Response {
    /// Empty response with the given status
    pub fn new(status: u16) -> Self {
        Self {
            status,
            content_type: ContentType::Text,
            body: Vec::new(),
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        let mut res = Self::new(status);
        res.set_json(body);
        res
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut res = Self::new(status);
        res.set_text(body);
        res
    }

    /// JSON error body of the form `{"error": ..., "status": ...}`
    pub fn error(status: u16, message: &str) -> Self {
        Self::json(status, &json!({ "error": message, "status": status }))
    }

    pub fn internal_error() -> Self {
        Self::error(500, "Internal Server Error")
    }

    pub fn service_unavailable() -> Self {
        Self::error(503, "Service Unavailable")
    }

    pub fn gateway_timeout() -> Self {
        Self::error(504, "Gateway Timeout")
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    pub fn set_content_type(&mut self, content_type: ContentType) -> &mut Self {
        self.content_type = content_type;
        self
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        self
    }

    pub fn set_text(&mut self, body: impl Into<String>) -> &mut Self {
        self.content_type = ContentType::Text;
        self.body = body.into().into_bytes();
        self
    }

    pub fn set_json(&mut self, body: &Value) -> &mut Self {
        self.content_type = ContentType::Json;
        self.body = body.to_string().into_bytes();
        self
    }

    /// Write into a `may_minihttp` response.
    pub fn write_http(self, res: &mut may_minihttp::Response) {
        res.status_code(self.status as usize, status_reason(self.status));
        res.header(self.content_type.header_line());
        res.body_vec(self.body);
    }

    /// Render as CGI output: a `Status:` header block followed by the body.
    pub fn to_cgi(&self) -> Vec<u8> {
        let head = format!(
            "Status: {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            self.status,
            status_reason(self.status),
            self.content_type.mime(),
            self.body.len()
        );
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}
