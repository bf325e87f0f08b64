//! Shared utilities for integration tests: mock origins, a mock chain
//! proxy, and helpers to run the proxy on an ephemeral loopback port.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use forward_proxy::config::{BindMode, ProxyConfig};
use forward_proxy::ProxyServer;

/// Request heads seen by a mock server, in arrival order.
pub type Recorded = Arc<Mutex<Vec<String>>>;

/// A mock origin returning a fixed response for every request.
pub struct MockOrigin {
    pub addr: SocketAddr,
    requests: Recorded,
}

impl MockOrigin {
    pub async fn start(status: u16, body: impl Into<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Recorded = Arc::default();
        let body: Arc<Vec<u8>> = Arc::new(body.into());

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                let body = Arc::clone(&body);
                tokio::spawn(respond_once(socket, status, body, recorded));
            }
        });

        Self { addr, requests }
    }

    /// Same as [`MockOrigin::start`], behind TLS.
    pub async fn start_tls(acceptor: TlsAcceptor, body: impl Into<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Recorded = Arc::default();
        let body: Arc<Vec<u8>> = Arc::new(body.into());

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let recorded = Arc::clone(&recorded);
                let body = Arc::clone(&body);
                tokio::spawn(async move {
                    if let Ok(stream) = acceptor.accept(socket).await {
                        respond_once(stream, 200, body, recorded).await;
                    }
                });
            }
        });

        Self { addr, requests }
    }

    /// An origin that reads the request head and then drops the connection
    /// without answering.
    pub async fn start_hangup() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Recorded = Arc::default();

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                if let Some(head) = read_head(&mut socket).await {
                    recorded.lock().unwrap().push(head);
                }
                drop(socket);
            }
        });

        Self { addr, requests }
    }

    /// Filter registry key for this origin.
    pub fn key(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn respond_once<S>(mut socket: S, status: u16, body: Arc<Vec<u8>>, recorded: Recorded)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(head) = read_head(&mut socket).await else {
        return;
    };
    let head_request = head.starts_with("HEAD ");
    recorded.lock().unwrap().push(head);

    let reason = match status {
        200 => "OK",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Unknown",
    };
    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        body.len()
    )
    .into_bytes();
    if !head_request {
        response.extend_from_slice(&body);
    }
    let _ = socket.write_all(&response).await;
    let _ = socket.shutdown().await;
}

/// Read a request or response head up to the blank line, one byte at a time
/// so nothing past the head is consumed.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}

/// A TCP server echoing back whatever it receives.
pub async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A mock upstream proxy. Plain requests get a fixed body; CONNECT is
/// either tunnelled to the requested target or refused with 403.
pub struct MockChain {
    pub addr: SocketAddr,
    requests: Recorded,
}

impl MockChain {
    pub async fn start(body: &'static str, refuse_connect: bool) -> Self {
        Self::spawn(body, refuse_connect, None).await
    }

    /// A chain that tunnels every CONNECT to `target`, whatever host was
    /// asked for.
    pub async fn start_pinned(target: SocketAddr) -> Self {
        Self::spawn("", false, Some(target)).await
    }

    async fn spawn(body: &'static str, refuse_connect: bool, pinned: Option<SocketAddr>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Recorded = Arc::default();

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let Some(head) = read_head(&mut socket).await else {
                        return;
                    };
                    recorded.lock().unwrap().push(head.clone());

                    if !head.starts_with("CONNECT ") {
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        return;
                    }

                    if refuse_connect {
                        let _ = socket
                            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                            .await;
                        return;
                    }

                    let target = match pinned {
                        Some(addr) => addr.to_string(),
                        None => head.split_whitespace().nth(1).unwrap_or_default().to_string(),
                    };
                    let Ok(mut upstream) = TcpStream::connect(target).await else {
                        let _ = socket.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                        return;
                    };
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                        .await;
                    let _ = tokio::io::copy_bidirectional(&mut socket, &mut upstream).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Proxy configuration suitable for tests: ephemeral port, short timeouts.
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.port = 0;
    config.timeouts.connect_secs = 2;
    config.timeouts.shutdown_grace_secs = 2;
    config
}

/// Start `server` on loopback and return it with its address.
pub async fn start_proxy(server: ProxyServer) -> (Arc<ProxyServer>, SocketAddr) {
    let server = Arc::new(server);
    let addr = server.start(BindMode::LoopbackOnly).await.unwrap();
    (server, addr)
}

/// reqwest client sending everything through the proxy.
pub fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{}", proxy)).unwrap())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Send a raw request and read until the proxy closes the connection.
pub async fn raw_exchange(proxy: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Read one response (head plus `Content-Length` body) from a connection
/// that stays open.
pub async fn read_response(stream: &mut TcpStream) -> String {
    tokio::time::timeout(Duration::from_secs(10), async {
        let head = read_head(stream).await.expect("connection closed before response");
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await.unwrap();
        format!("{}{}", head, String::from_utf8_lossy(&body))
    })
    .await
    .expect("no response")
}

/// Issue a CONNECT and return the stream with the proxy's response head.
pub async fn connect_tunnel(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = tokio::time::timeout(Duration::from_secs(10), read_head(&mut stream))
        .await
        .expect("no CONNECT response")
        .expect("connection closed before CONNECT response");
    (stream, head)
}

/// A port nothing is listening on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
