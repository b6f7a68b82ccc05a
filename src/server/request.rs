use crate::ids::RequestId;
use http::Method;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{self, Read};
use tracing::debug;

/// Transport-neutral description of one inbound request.
///
/// Owned so it can travel from the connection coroutine to whichever worker
/// executes the job.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_id: RequestId,
    pub method: Method,
    /// Path without the query string
    pub path: String,
    /// Decoded query string parameters
    pub query_params: HashMap<String, String>,
    /// Header map with lowercase keys
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Client address as reported by the transport or a proxy header, `-` if unknown
    pub remote_addr: String,
}

impl Request {
    /// Build a request from a method and a path that may carry a query string.
    pub fn new(method: Method, uri: &str) -> Self {
        let path = uri.split('?').next().filter(|p| !p.is_empty()).unwrap_or("/");
        Self {
            request_id: RequestId::new(),
            method,
            path: path.to_string(),
            query_params: parse_query_params(uri),
            headers: HashMap::new(),
            body: Vec::new(),
            remote_addr: "-".to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = addr.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Parse the body as JSON, `None` when empty or malformed.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Copy a `may_minihttp` request into an owned [`Request`].
    ///
    /// `may_minihttp` does not expose the peer address, so the remote address
    /// comes from `X-Forwarded-For` / `X-Real-IP` when a proxy sets them.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a method token that is not valid HTTP, or the I/O
    /// error raised while reading the body.
    pub fn from_http(req: may_minihttp::Request) -> io::Result<Self> {
        let method = Method::from_bytes(req.method().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut request = Request::new(method, req.path());
        request.headers = req
            .headers()
            .iter()
            .map(|h| {
                (
                    h.name.to_ascii_lowercase(),
                    String::from_utf8_lossy(h.value).to_string(),
                )
            })
            .collect();
        request.request_id = RequestId::from_header_or_new(request.header("x-request-id"));
        request.remote_addr = remote_from_headers(&request.headers);

        let mut body = Vec::new();
        req.body().read_to_end(&mut body)?;
        request.body = body;

        debug!(
            request_id = %request.request_id,
            method = %request.method,
            path = %request.path,
            header_count = request.headers.len(),
            body_bytes = request.body.len(),
            "HTTP request parsed"
        );
        Ok(request)
    }

    /// Build a request from CGI/FastCGI parameters and the collected stdin.
    ///
    /// Unknown or missing `REQUEST_METHOD` falls back to `GET`.
    pub fn from_cgi(params: &HashMap<String, String>, body: Vec<u8>) -> Self {
        let method = params
            .get("REQUEST_METHOD")
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .unwrap_or(Method::GET);

        let uri = match params.get("REQUEST_URI").filter(|u| !u.is_empty()) {
            Some(uri) => uri.clone(),
            None => {
                let script = params.get("SCRIPT_NAME").map(String::as_str).unwrap_or("");
                let info = params.get("PATH_INFO").map(String::as_str).unwrap_or("");
                let mut uri = format!("{script}{info}");
                if let Some(q) = params.get("QUERY_STRING").filter(|q| !q.is_empty()) {
                    uri.push('?');
                    uri.push_str(q);
                }
                uri
            }
        };

        let mut request = Request::new(method, &uri);
        for (key, value) in params {
            let name = match key.as_str() {
                "CONTENT_TYPE" => "content-type".to_string(),
                "CONTENT_LENGTH" => "content-length".to_string(),
                k => match k.strip_prefix("HTTP_") {
                    Some(h) => h.to_ascii_lowercase().replace('_', "-"),
                    None => continue,
                },
            };
            request.headers.insert(name, value.clone());
        }
        request.request_id = RequestId::from_header_or_new(request.header("x-request-id"));
        request.remote_addr = params
            .get("REMOTE_ADDR")
            .filter(|a| !a.is_empty())
            .cloned()
            .unwrap_or_else(|| remote_from_headers(&request.headers));
        request.body = body;
        request
    }
}

/// Parse query string parameters from a URL path
///
/// Everything after the first `?` is form-url-decoded.
pub fn parse_query_params(path: &str) -> HashMap<String, String> {
    match path.split_once('?') {
        Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        None => HashMap::new(),
    }
}

fn remote_from_headers(headers: &HashMap<String, String>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| headers.get("x-real-ip").map(|v| v.trim()))
        .filter(|v| !v.is_empty())
        .unwrap_or("-")
        .to_string()
}
