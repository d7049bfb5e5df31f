//! HTTP surface of the router
//!
//! Plain HTTP/1.1 over tokio. One request per connection; the response
//! always carries a JSON body.

use crate::execution::router::ExecutionRouter;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Room for headers and JSON framing on top of the SQL size limit.
const REQUEST_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct QueryRequest {
    sql: String,
    #[serde(default)]
    force_engine: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn to_http(&self) -> String {
        let body = if self.body.is_null() {
            String::new()
        } else {
            self.body.to_string()
        };
        create_response(self.status, status_text(self.status), &body)
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, router: Arc<ExecutionRouter>) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("New connection from: {}", addr);
        tokio::spawn(handle_connection(router.clone(), stream));
    }
}

pub async fn handle_connection(router: Arc<ExecutionRouter>, mut stream: TcpStream) {
    let limit = router.classifier().max_sql_bytes() + REQUEST_OVERHEAD_BYTES;
    let response = match read_request(&mut stream, limit).await {
        Ok(None) => return,
        Ok(Some(request)) => handle_request(&router, &request).await,
        Err(response) => response,
    };

    if let Err(e) = stream.write_all(response.to_http().as_bytes()).await {
        warn!("Failed to write response: {}", e);
    }
}

/// Read headers and `Content-Length` bytes of body. `Ok(None)` means the
/// peer sent nothing worth answering.
async fn read_request(
    stream: &mut TcpStream,
    limit: usize,
) -> Result<Option<String>, HttpResponse> {
    let mut buffer = Vec::new();
    let mut chunk = [0; 8192];

    let read = timeout(READ_TIMEOUT, async {
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);

            if let Some(headers_end) = header_end(&buffer) {
                let head = String::from_utf8_lossy(&buffer[..headers_end]);
                match extract_content_length(&head) {
                    Some(length) if buffer.len() >= headers_end + length => break,
                    Some(_) => {}
                    None => break,
                }
            }
            if buffer.len() > limit {
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    })
    .await;

    match read {
        Err(_) => {
            warn!("Request read timeout");
            return Ok(None);
        }
        Ok(Err(e)) => {
            warn!("Failed to read from stream: {}", e);
            return Ok(None);
        }
        Ok(Ok(())) => {}
    }

    if buffer.is_empty() {
        return Ok(None);
    }
    if buffer.len() > limit {
        return Err(HttpResponse::error(
            413,
            format!("request larger than {} bytes", limit),
        ));
    }
    String::from_utf8(buffer)
        .map(Some)
        .map_err(|_| HttpResponse::error(400, "request is not valid UTF-8"))
}

fn header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

pub fn extract_content_length(request: &str) -> Option<usize> {
    request
        .lines()
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
}

/// Route one raw HTTP request.
pub async fn handle_request(router: &ExecutionRouter, request: &str) -> HttpResponse {
    let Some(request_line) = request.lines().next() else {
        return HttpResponse::error(400, "empty request");
    };
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return HttpResponse::error(400, "malformed request line");
    };

    let path = target.split('?').next().unwrap_or(target).trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    let body = request
        .find("\r\n\r\n")
        .map(|start| request[start + 4..].trim())
        .unwrap_or("");

    match (method, path) {
        ("POST", "/query") => {
            let span = info_span!("query", id = %Uuid::new_v4());
            handle_query(router, body).instrument(span).await
        }
        ("GET", "/health") => HttpResponse::ok(json!({ "status": "alive" })),
        ("GET", "/engines") => {
            let engines: Vec<Value> = router
                .health()
                .await
                .into_iter()
                .map(|(engine, healthy)| json!({ "engine": engine, "healthy": healthy }))
                .collect();
            HttpResponse::ok(json!({ "engines": engines }))
        }
        // CORS preflight
        ("OPTIONS", _) => HttpResponse::ok(Value::Null),
        _ => {
            debug!("404: {} {} not found", method, path);
            HttpResponse::error(404, format!("Endpoint not found: {} {}", method, path))
        }
    }
}

async fn handle_query(router: &ExecutionRouter, body: &str) -> HttpResponse {
    let request: QueryRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(e) => return HttpResponse::error(400, format!("Invalid request body: {}", e)),
    };

    match router
        .execute(&request.sql, request.force_engine.as_deref())
        .await
    {
        Ok(result) => HttpResponse::ok(result.to_response()),
        Err(e) => {
            info!("Rejected request: {}", e);
            HttpResponse {
                status: 400,
                body: json!({
                    "error": e.to_string(),
                    "engine": request.force_engine,
                    "duration": 0.0,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_content_length() {
        let request = "POST /query HTTP/1.1\r\nHost: router\r\ncontent-length: 42\r\n\r\n{}";
        assert_eq!(extract_content_length(request), Some(42));
        assert_eq!(extract_content_length("GET /health HTTP/1.1\r\n\r\n"), None);
    }

    #[test]
    fn test_header_end() {
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_to_http() {
        let raw = HttpResponse::ok(json!({ "status": "alive" })).to_http();
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains("Content-Length: 18\r\n"));
        assert!(raw.ends_with("\r\n\r\n{\"status\":\"alive\"}"));

        let preflight = HttpResponse::ok(Value::Null).to_http();
        assert!(preflight.contains("Content-Length: 0\r\n"));
    }
}
