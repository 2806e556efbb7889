//! SOCKS5 front end
//!
//! No-auth SOCKS5 (RFC 1928). CONNECT is relayed through the tunnel, BIND
//! is refused, and UDP ASSOCIATE is acknowledged without relaying any
//! datagrams.

use crate::error::DispatchError;
use crate::relay::FrontendContext;
use bytes::{Buf, BytesMut};
use ssh2proxy_proto::socks5::{
    decode_greeting, decode_request, encode_method, encode_reply, Command, Decoded, Reply,
    Socks5Error, TargetAddr, METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH,
};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
enum SessionError {
    #[error("SOCKS5 protocol error: {0}")]
    Protocol(#[from] Socks5Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake timed out")]
    HandshakeTimeout,
}

/// Accepts SOCKS5 clients on one listener
pub struct Socks5Server {
    ctx: FrontendContext,
}

impl Socks5Server {
    pub fn new(ctx: FrontendContext) -> Self {
        Self { ctx }
    }

    /// Accept until the shutdown token fires. The listener is dropped on
    /// return, so new connections are refused from then on.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("SOCKS5 proxy listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("New SOCKS5 connection from {}", peer_addr);
                        let ctx = self.ctx.clone();
                        self.ctx.tasks.spawn(async move {
                            if let Err(e) = handle_connection(&ctx, stream, peer_addr).await {
                                ctx.log.failure(&format!("SOCKS5 session from {} failed", peer_addr), &e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept SOCKS5 connection: {}", e);
                    }
                },
            }
        }

        debug!("SOCKS5 listener stopped");
    }
}

/// Read until `decode` yields a full message; `None` if the client hung up
async fn read_message<T>(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    decode: fn(&[u8]) -> Result<Decoded<T>, Socks5Error>,
) -> Result<Option<T>, SessionError> {
    loop {
        if let Decoded::Complete(message, consumed) = decode(&buf[..])? {
            buf.advance(consumed);
            return Ok(Some(message));
        }
        if stream.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

/// Greeting and request; `None` when the session ended during negotiation
async fn negotiate(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<Option<ssh2proxy_proto::Request>, SessionError> {
    let Some(greeting) = read_message(stream, buf, decode_greeting).await? else {
        return Ok(None);
    };

    if !greeting.offers(METHOD_NO_AUTH) {
        stream.write_all(&encode_method(METHOD_NO_ACCEPTABLE)).await?;
        debug!("SOCKS5 client offered no acceptable auth method");
        return Ok(None);
    }
    stream.write_all(&encode_method(METHOD_NO_AUTH)).await?;

    match read_message(stream, buf, decode_request).await {
        Ok(request) => Ok(request),
        Err(SessionError::Protocol(e)) => {
            if let Some(reply) = e.reply() {
                let _ = stream
                    .write_all(&encode_reply(reply, &TargetAddr::unspecified()))
                    .await;
            }
            Err(SessionError::Protocol(e))
        }
        Err(e) => Err(e),
    }
}

async fn handle_connection(
    ctx: &FrontendContext,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), SessionError> {
    let mut buf = BytesMut::with_capacity(512);

    let negotiated = tokio::select! {
        _ = ctx.shutdown.cancelled() => return Ok(()),
        result = tokio::time::timeout(ctx.handshake_timeout, negotiate(&mut stream, &mut buf)) => {
            result.map_err(|_| SessionError::HandshakeTimeout)?
        }
    };

    let request = match negotiated {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(SessionError::Protocol(e)) => {
            debug!("Dropping SOCKS5 client {}: {}", peer_addr, e);
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    match request.command {
        Command::Connect => connect(ctx, stream, buf, request.target).await,
        Command::Bind => {
            debug!("SOCKS5 BIND from {} refused", peer_addr);
            stream
                .write_all(&encode_reply(Reply::CommandNotSupported, &TargetAddr::unspecified()))
                .await?;
            Ok(())
        }
        Command::UdpAssociate => udp_associate(ctx, stream, peer_addr).await,
    }
}

async fn connect(
    ctx: &FrontendContext,
    mut stream: TcpStream,
    pending: BytesMut,
    target: TargetAddr,
) -> Result<(), SessionError> {
    let address = target.to_string();

    let mut upstream = match ctx.opener.open("tcp", &address).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let reply = reply_for(&e);
            let _ = stream
                .write_all(&encode_reply(reply, &TargetAddr::unspecified()))
                .await;
            debug!("SOCKS5 CONNECT to {} failed ({:?}): {}", address, reply, e);
            return Ok(());
        }
    };

    stream
        .write_all(&encode_reply(Reply::Succeeded, &TargetAddr::unspecified()))
        .await?;

    // Bytes the client sent right behind its request
    if !pending.is_empty() {
        upstream.write_all(&pending).await?;
    }

    ctx.log.debug(format!("SOCKS5 tunnel established to {}", address));
    let (up, down) = ctx.splice(stream, upstream, &address).wait().await;
    debug!("SOCKS5 relay to {} done ({} bytes up, {} bytes down)", address, up, down);
    Ok(())
}

/// Acknowledge, then hold the control connection open until the client
/// closes it. No datagrams are relayed.
async fn udp_associate(
    ctx: &FrontendContext,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), SessionError> {
    stream
        .write_all(&encode_reply(Reply::Succeeded, &TargetAddr::unspecified()))
        .await?;
    debug!("SOCKS5 UDP ASSOCIATE from {} acknowledged (no relay)", peer_addr);

    let mut sink = [0u8; 512];
    loop {
        tokio::select! {
            _ = ctx.force_close.cancelled() => break,
            _ = ctx.shutdown.cancelled() => break,
            read = stream.read(&mut sink) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    Ok(())
}

/// Reply code sent when opening the target fails
pub fn reply_for(err: &DispatchError) -> Reply {
    match err {
        DispatchError::Capacity { .. } => Reply::GeneralFailure,
        DispatchError::Shutdown => Reply::GeneralFailure,
        DispatchError::Protocol(_) => Reply::AddressTypeNotSupported,
        e if e.is_refused() => Reply::ConnectionRefused,
        e if e.is_network_unreachable() => Reply::NetworkUnreachable,
        _ => Reply::HostUnreachable,
    }
}
