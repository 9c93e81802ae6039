//! Mock HTTP collection server.
//!
//! Listens on a random local port, records every request (method, path,
//! headers, body), and answers each one with the next scripted response —
//! or `202 Accepted` when the script is empty.  One request per
//! connection; every response carries `Connection: close`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// A scripted response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    /// Optional `Date` header value (RFC 1123).
    pub date: Option<String>,
}

// ---------------------------------------------------------------------------
// MockEventsServer
// ---------------------------------------------------------------------------

/// Handle to a running mock collection server.
pub struct MockEventsServer {
    local_addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
}

impl MockEventsServer {
    /// Bind to a random local port and start accepting.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let responses: Arc<Mutex<VecDeque<MockResponse>>> = Arc::new(Mutex::new(VecDeque::new()));

        let requests_for_loop = Arc::clone(&requests);
        let responses_for_loop = Arc::clone(&responses);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let requests = Arc::clone(&requests_for_loop);
                        let responses = Arc::clone(&responses_for_loop);
                        tokio::spawn(async move {
                            handle_connection(stream, requests, responses).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockEventsServer {
            local_addr,
            requests,
            responses,
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URI for pointing a sender at this server.
    pub fn uri(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Script the next response (responses are consumed in FIFO order).
    pub async fn enqueue_response(&self, status: u16) {
        self.responses
            .lock()
            .await
            .push_back(MockResponse { status, date: None });
    }

    /// Script the next response with a `Date` header.
    pub async fn enqueue_response_with_date(&self, status: u16, date: &str) {
        self.responses.lock().await.push_back(MockResponse {
            status,
            date: Some(date.to_owned()),
        });
    }

    /// Everything recorded so far.
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }

    /// Poll until at least `count` requests have been recorded, or panic
    /// after `timeout`.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> Vec<RecordedRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let recorded = self.requests().await;
            if recorded.len() >= count {
                return recorded;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "expected {} requests within {:?}, got {}",
                    count,
                    timeout,
                    recorded.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    requests.lock().await.push(request);

    let response = responses
        .lock()
        .await
        .pop_front()
        .unwrap_or(MockResponse {
            status: 202,
            date: None,
        });
    send_response(&mut stream, &response).await;
}

/// Read one HTTP/1.1 request: head up to the blank line, then
/// `Content-Length` bytes of body.
async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    // Read until the end of the header block.
    let head_end = loop {
        if let Some(pos) = find_blank_line(&buf) {
            break pos;
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_owned();
    let path = parts.next()?.to_owned();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_owned());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    // Read the remainder of the body, if any.
    let body_start = head_end + 4;
    while buf.len() < body_start + content_length {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let body = String::from_utf8_lossy(&buf[body_start..body_start + content_length]).into_owned();

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn send_response(stream: &mut TcpStream, response: &MockResponse) {
    let status_text = match response.status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    };
    let date_header = response
        .date
        .as_ref()
        .map(|d| format!("Date: {d}\r\n"))
        .unwrap_or_default();
    let raw = format!(
        "HTTP/1.1 {status} {status_text}\r\n\
         {date_header}\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n",
        status = response.status,
        status_text = status_text,
        date_header = date_header,
    );
    let _ = stream.write_all(raw.as_bytes()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn raw_post(addr: SocketAddr, path: &str, body: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST {path} HTTP/1.1\r\n\
             Host: test\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {len}\r\n\
             \r\n\
             {body}",
            path = path,
            len = body.len(),
            body = body,
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn records_method_path_headers_and_body() {
        let server = MockEventsServer::start().await.unwrap();
        let response = raw_post(server.local_addr(), "/bulk", "[{\"kind\":\"identify\"}]").await;
        assert!(response.starts_with("HTTP/1.1 202"), "got: {response}");

        let requests = server
            .wait_for_requests(1, Duration::from_secs(1))
            .await;
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/bulk");
        assert_eq!(requests[0].header("content-type"), Some("application/json"));
        assert_eq!(requests[0].body, "[{\"kind\":\"identify\"}]");
    }

    #[tokio::test]
    async fn scripted_responses_are_served_in_order() {
        let server = MockEventsServer::start().await.unwrap();
        server.enqueue_response(429).await;
        server
            .enqueue_response_with_date(202, "Wed, 01 Jan 2020 00:00:00 GMT")
            .await;

        let first = raw_post(server.local_addr(), "/bulk", "[]").await;
        assert!(first.starts_with("HTTP/1.1 429"), "got: {first}");

        let second = raw_post(server.local_addr(), "/bulk", "[]").await;
        assert!(second.starts_with("HTTP/1.1 202"), "got: {second}");
        assert!(
            second.contains("Date: Wed, 01 Jan 2020 00:00:00 GMT"),
            "got: {second}"
        );

        let third = raw_post(server.local_addr(), "/bulk", "[]").await;
        assert!(third.starts_with("HTTP/1.1 202"), "got: {third}");
    }
}
