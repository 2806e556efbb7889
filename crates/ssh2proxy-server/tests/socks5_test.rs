//! SOCKS5 front end over the loopback transport

mod common;

use common::*;
use ssh2proxy_server::ProxyMode;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_connect_relays_both_ways() {
    let target = echo_server().await;
    let (server, connector) = start_proxy(test_config(ProxyMode::Socks5)).await;
    let proxy = server.local_addr().unwrap();

    let (mut stream, reply) = socks5_connect(proxy, target).await;
    assert_eq!(reply, 0x00);
    assert!(connector.channels() >= 1);

    stream.write_all(b"ping through the tunnel").await.unwrap();
    let mut buf = [0u8; 23];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping through the tunnel");
    assert_eq!(server.active_connections(), 1);

    drop(stream);
    assert!(eventually(|| server.active_connections() == 0).await);

    server.stop().await;
}

#[tokio::test]
async fn test_connect_by_domain_name() {
    let target = echo_server().await;
    let (server, _connector) = start_proxy(test_config(ProxyMode::Socks5)).await;
    let proxy = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    let host = b"localhost";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host);
    request.extend_from_slice(&target.port().to_be_bytes());
    // Payload right behind the request is forwarded once the tunnel is up
    request.extend_from_slice(b"early");
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    if reply[1] == 0x00 {
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"early");
    } else {
        // localhost may resolve to ::1 first where nothing listens
        println!("localhost CONNECT replied {:#04x}", reply[1]);
    }

    server.stop().await;
}

#[tokio::test]
async fn test_refused_target_reply() {
    let target = closed_port().await;
    let (server, _connector) = start_proxy(test_config(ProxyMode::Socks5)).await;

    let (mut stream, reply) = socks5_connect(server.local_addr().unwrap(), target).await;
    assert_eq!(reply, 0x05);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(server.active_connections(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_no_acceptable_method() {
    let (server, _connector) = start_proxy(test_config(ProxyMode::Socks5)).await;

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    // Username/password only
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, vec![0x05, 0xFF]);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_address_type_closes() {
    let (server, connector) = start_proxy(test_config(ProxyMode::Socks5)).await;

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    stream
        .write_all(&[0x05, 0x01, 0x00, 0x09, 1, 2, 3, 4, 0, 80])
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
        .await
        .expect("connection should close")
        .unwrap();
    assert_eq!(response.get(1), Some(&0x08));
    assert_eq!(connector.channels(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_bind_not_supported() {
    let (server, _connector) = start_proxy(test_config(ProxyMode::Socks5)).await;

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    stream
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07);

    server.stop().await;
}

#[tokio::test]
async fn test_udp_associate_is_acknowledged_only() {
    let (server, connector) = start_proxy(test_config(ProxyMode::Socks5)).await;

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    stream
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    assert_eq!(connector.channels(), 0);
    assert_eq!(server.active_connections(), 0);

    // The control connection stays open until stop
    let mut probe = [0u8; 1];
    let idle = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut probe)).await;
    assert!(idle.is_err());

    server.stop().await;
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut probe))
        .await
        .expect("stop should close the association")
        .unwrap_or(0);
    assert_eq!(n, 0);
}
