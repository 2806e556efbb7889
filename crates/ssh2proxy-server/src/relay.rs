//! Bidirectional splicing between a client and a target stream

use crate::dispatcher::StreamOpener;
use crate::logsink::DiagnosticLog;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

const RELAY_BUFFER: usize = 16 * 1024;

/// What a front end needs to serve its clients
#[derive(Clone)]
pub struct FrontendContext {
    pub opener: Arc<dyn StreamOpener>,
    pub tasks: TaskTracker,
    /// Stop accepting and finish handshakes
    pub shutdown: CancellationToken,
    /// Abort relays that outlive the grace period
    pub force_close: CancellationToken,
    pub log: DiagnosticLog,
    /// Bound on reading a SOCKS5 handshake or HTTP request head
    pub handshake_timeout: Duration,
}

impl FrontendContext {
    pub fn splice<C, T>(&self, client: C, target: T, label: &str) -> RelayHandle
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        splice(client, target, &self.tasks, &self.force_close, &self.log, label)
    }
}

/// Both copy directions of one relay
#[derive(Debug)]
pub struct RelayHandle {
    upstream: JoinHandle<u64>,
    downstream: JoinHandle<u64>,
}

impl RelayHandle {
    /// Wait for both directions; returns (client->target, target->client)
    /// byte counts
    pub async fn wait(self) -> (u64, u64) {
        let up = self.upstream.await.unwrap_or(0);
        let down = self.downstream.await.unwrap_or(0);
        (up, down)
    }
}

/// Copy bytes both ways until either side finishes, errors, or
/// `force_close` fires. Ending one direction stops the other, and both
/// streams are dropped (closed) when the relay ends.
pub fn splice<C, T>(
    client: C,
    target: T,
    tasks: &TaskTracker,
    force_close: &CancellationToken,
    log: &DiagnosticLog,
    label: &str,
) -> RelayHandle
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let relay = force_close.child_token();
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);

    let upstream = tasks.spawn(pipe(
        client_read,
        target_write,
        relay.clone(),
        log.clone(),
        format!("{} client->target", label),
    ));
    let downstream = tasks.spawn(pipe(
        target_read,
        client_write,
        relay,
        log.clone(),
        format!("{} target->client", label),
    ));

    RelayHandle {
        upstream,
        downstream,
    }
}

async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    relay: CancellationToken,
    log: DiagnosticLog,
    direction: String,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut copied: u64 = 0;

    let outcome: io::Result<bool> = loop {
        let n = tokio::select! {
            _ = relay.cancelled() => break Ok(false),
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(true),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };
        tokio::select! {
            _ = relay.cancelled() => break Ok(false),
            written = writer.write_all(&buf[..n]) => {
                if let Err(e) = written {
                    break Err(e);
                }
            }
        }
        copied += n as u64;
    };

    match outcome {
        Ok(true) => {
            let _ = writer.shutdown().await;
            log.debug(format!("{} finished, copied {} bytes", direction, copied));
        }
        Ok(false) => {
            debug!("{} stopped after {} bytes", direction, copied);
        }
        Err(e) => {
            log.failure(&format!("Error in {} after {} bytes", direction, copied), &e);
        }
    }

    // Stop the other direction too
    relay.cancel();
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_splice_copies_both_ways_and_closes() {
        let tasks = TaskTracker::new();
        let force_close = CancellationToken::new();
        let (log, _pump) = DiagnosticLog::new(64);

        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (target, mut target_peer) = tokio::io::duplex(1024);
        let handle = splice(client, target, &tasks, &force_close, &log, "test");

        client_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        target_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        target_peer.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        // Target hangs up: the client side must see EOF too
        drop(target_peer);
        let (up, down) = tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("relay should end");
        assert_eq!((up, down), (5, 6));

        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_force_close_stops_idle_relay() {
        let tasks = TaskTracker::new();
        let force_close = CancellationToken::new();
        let (log, _pump) = DiagnosticLog::new(64);

        let (client, _client_peer) = tokio::io::duplex(1024);
        let (target, _target_peer) = tokio::io::duplex(1024);
        let handle = splice(client, target, &tasks, &force_close, &log, "idle");

        force_close.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("force close should end the relay");

        tasks.close();
        tasks.wait().await;
    }
}
