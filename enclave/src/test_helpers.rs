//! Shared test utilities for the enclave crate.
//!
//! Provides a queue-based mock HTTP server for testing the vault clients
//! without real endpoints.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// One canned HTTP response: status, body, and extra headers.
#[derive(Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl MockResponse {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// A queue-based mock HTTP server for testing.
///
/// Responses are consumed in FIFO order: each incoming HTTP request
/// receives the next queued response. More responses can be queued after
/// startup with [`MockHttpServer::push`], which is needed when a response
/// has to mention the server's own address (e.g. an auth challenge).
pub struct MockHttpServer {
    pub base_url: String,
    queue: Arc<Mutex<VecDeque<MockResponse>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockHttpServer {
    pub async fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let queue = Arc::new(Mutex::new(VecDeque::from(responses)));
        let served = queue.clone();

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, _)) => {
                        let served = served.clone();
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; 16384];
                            let _ = stream.read(&mut buf).await;

                            let response =
                                served.lock().unwrap().pop_front().unwrap_or_else(|| {
                                    MockResponse::new(500, r#"{"error":"queue empty"}"#)
                                });

                            let status_text = match response.status {
                                200 => "OK",
                                400 => "Bad Request",
                                401 => "Unauthorized",
                                403 => "Forbidden",
                                404 => "Not Found",
                                500 => "Internal Server Error",
                                _ => "Error",
                            };

                            let mut head = format!(
                                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
                                response.status,
                                status_text,
                                response.body.len()
                            );
                            for (name, value) in &response.headers {
                                head.push_str(&format!("{}: {}\r\n", name, value));
                            }
                            head.push_str("\r\n");
                            head.push_str(&response.body);

                            let _ = stream.write_all(head.as_bytes()).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url,
            queue,
            _handle: handle,
        }
    }

    /// Append a response to the queue.
    pub fn push(&self, response: MockResponse) {
        self.queue.lock().unwrap().push_back(response);
    }
}
