use crate::server::{Request, Response, Router};
use serde_json::json;
use std::time::{Duration, Instant};

/// Upper bound for `/sleep`, so a demo request cannot pin a worker for long
pub const MAX_SLEEP_MS: u64 = 10_000;

/// Demo router served by `webqueue-server`.
///
/// - `GET /health` → `{"status":"ok","uptime_s":...}`
/// - `* /echo` → method, path, query, headers and body echoed back as JSON
/// - `GET /sleep?ms=N` → holds the worker for N ms (capped), useful to watch
///   queueing and backpressure from the outside
pub struct EchoRouter {
    started: Instant,
}

impl Default for EchoRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoRouter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Router for EchoRouter {
    fn handle(&self, req: &Request, res: &mut Response) -> anyhow::Result<()> {
        match req.path.as_str() {
            "/health" => {
                res.set_json(&json!({
                    "status": "ok",
                    "uptime_s": self.started.elapsed().as_secs_f64(),
                }));
            }
            "/echo" => {
                let body = match req.json_body() {
                    Some(value) => value,
                    None => json!(req.body_text()),
                };
                res.set_json(&json!({
                    "request_id": req.request_id,
                    "method": req.method.as_str(),
                    "path": req.path,
                    "query": req.query_params,
                    "headers": req.headers,
                    "remote_addr": req.remote_addr,
                    "body": body,
                }));
            }
            "/sleep" => {
                let ms = req
                    .query_param("ms")
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(100)
                    .min(MAX_SLEEP_MS);
                may::coroutine::sleep(Duration::from_millis(ms));
                res.set_json(&json!({ "slept_ms": ms }));
            }
            _ => {
                *res = Response::error(404, "Not Found");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use serde_json::Value;

    fn call(req: Request) -> Response {
        let mut res = Response::default();
        EchoRouter::new().handle(&req, &mut res).unwrap();
        res
    }

    #[test]
    fn test_health() {
        let res = call(Request::new(Method::GET, "/health"));
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn test_echo_reflects_request() {
        let res = call(
            Request::new(Method::POST, "/echo?x=1")
                .with_header("X-Test", "yes")
                .with_body(r#"{"hello":"world"}"#),
        );
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["method"], "POST");
        assert_eq!(body["query"]["x"], "1");
        assert_eq!(body["headers"]["x-test"], "yes");
        assert_eq!(body["body"]["hello"], "world");
    }

    #[test]
    fn test_unknown_path_is_404() {
        assert_eq!(call(Request::new(Method::GET, "/nope")).status(), 404);
    }
}
