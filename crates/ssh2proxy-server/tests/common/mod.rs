//! Shared fixtures: loopback-backed proxies and tiny local targets

#![allow(dead_code)]

use ssh2proxy_server::{ProxyConfig, ProxyMode, ProxyServer};
use ssh2proxy_transport::loopback::LoopbackConnector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn test_config(mode: ProxyMode) -> ProxyConfig {
    let mut config = ProxyConfig::with_password("loopback", "tester", "secret");
    config.bind_host = "127.0.0.1".to_string();
    config.local_port = 0;
    config.proxy_mode = mode;
    config.log_addr = None;
    config.timeouts.shutdown_grace = Duration::from_millis(200);
    config.timeouts.pool_tick = Duration::from_millis(100);
    config
}

pub async fn start_proxy(config: ProxyConfig) -> (ProxyServer, LoopbackConnector) {
    let connector = LoopbackConnector::new();
    let server = ProxyServer::with_connector(config, Arc::new(connector.clone()))
        .expect("valid config");
    server.start().await.expect("proxy should start");
    (server, connector)
}

/// Echoes everything back until the client hangs up
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Writes `greeting` to each connection and closes it
pub async fn greeting_server(greeting: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(greeting).await;
            let _ = stream.shutdown().await;
        }
    });
    addr
}

/// An address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Greeting plus an IPv4 CONNECT; returns the stream and the reply code
pub async fn socks5_connect(proxy: SocketAddr, target: SocketAddr) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let SocketAddr::V4(v4) = target else {
        panic!("IPv4 target expected");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    (stream, reply[1])
}

/// Read until `needle` shows up (or the peer closes); returns everything read
pub async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if buf.windows(needle.len()).any(|w| w == needle) {
            return buf;
        }
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("read timed out")
            .unwrap();
        if n == 0 {
            return buf;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Poll `check` until it holds or a second passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
