//! WebSocket to TCP relay
//!
//! Binary and text frames from the client are written to the target as raw
//! bytes, everything read from the target goes back as binary frames.

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::capture::{Capture, Direction};

const BUF_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CloseReason {
    ClientClosed,
    TargetClosed,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    /// bytes client -> target
    pub tx: u64,
    /// bytes target -> client
    pub rx: u64,
    pub reason: CloseReason,
}

/// Mirrors a chunk, giving up on the capture after the first failure
fn mirror(capture: &mut Option<Capture>, direction: Direction, data: &[u8]) {
    if let Some(c) = capture {
        if !c.record(direction, data) {
            warn!("capture writer gone, continuing without capture");
            *capture = None;
        }
    }
}

/// Connects to an instance, giving up after `limit`
pub async fn dial(target: SocketAddr, limit: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(limit, TcpStream::connect(target)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}

/// Pumps bytes both ways until either side closes or `limit` runs out.
pub async fn relay<R, W, T>(
    mut ws_rx: R,
    mut ws_tx: W,
    target: T,
    capture: Option<Capture>,
    limit: Duration,
) -> RelayStats
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    W: Sink<Message> + Unpin,
    W::Error: Debug,
    T: AsyncRead + AsyncWrite,
{
    let (mut tcp_rx, mut tcp_tx) = tokio::io::split(target);
    let mut tx = 0u64;
    let mut rx = 0u64;

    let send = {
        let mut capture = capture.clone();
        let tx = &mut tx;
        async move {
            while let Some(msg) = ws_rx.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Close(_)) => return CloseReason::ClientClosed,
                    // pings are answered by the websocket layer
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("websocket read failed: {:?}", e);
                        return CloseReason::Error;
                    }
                };

                if let Err(e) = tcp_tx.write_all(&data).await {
                    debug!(kind = ?e.kind(), "target write failed");
                    return CloseReason::Error;
                }
                *tx += data.len() as u64;
                mirror(&mut capture, Direction::Upstream, &data);
            }
            CloseReason::ClientClosed
        }
    };

    let recv = {
        let mut capture = capture;
        let rx = &mut rx;
        let ws_tx = &mut ws_tx;
        async move {
            let mut buf = vec![0u8; BUF_SIZE];
            loop {
                let n = match tcp_rx.read(&mut buf).await {
                    Ok(0) => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return CloseReason::TargetClosed;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(kind = ?e.kind(), "target read failed");
                        return CloseReason::Error;
                    }
                };

                *rx += n as u64;
                mirror(&mut capture, Direction::Downstream, &buf[..n]);
                if let Err(e) = ws_tx.send(Message::Binary(buf[..n].to_vec())).await {
                    debug!("websocket write failed: {:?}", e);
                    return CloseReason::Error;
                }
            }
        }
    };

    let reason = tokio::select! {
        reason = send => reason,
        reason = recv => reason,
        _ = tokio::time::sleep(limit) => CloseReason::Timeout,
    };

    if reason == CloseReason::Timeout {
        let _ = ws_tx.send(Message::Close(None)).await;
    }

    RelayStats { tx, rx, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use tokio::io::duplex;

    type Client = (
        mpsc::UnboundedSender<Result<Message, axum::Error>>,
        mpsc::UnboundedReceiver<Message>,
    );
    type Relay = (
        mpsc::UnboundedReceiver<Result<Message, axum::Error>>,
        mpsc::UnboundedSender<Message>,
    );

    fn websocket() -> (Client, Relay) {
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, out_rx) = mpsc::unbounded();
        ((in_tx, out_rx), (in_rx, out_tx))
    }

    async fn echo(mut stream: tokio::io::DuplexStream) {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn round_trip() {
        let ((client_tx, mut client_rx), (ws_rx, ws_tx)) = websocket();
        let (ours, theirs) = duplex(4096);
        tokio::spawn(echo(theirs));

        let relay = tokio::spawn(relay(ws_rx, ws_tx, ours, None, Duration::from_secs(60)));

        client_tx
            .unbounded_send(Ok(Message::Binary(b"hello".to_vec())))
            .unwrap();
        assert_eq!(
            client_rx.next().await,
            Some(Message::Binary(b"hello".to_vec()))
        );

        client_tx
            .unbounded_send(Ok(Message::Text("abc".to_string())))
            .unwrap();
        assert_eq!(client_rx.next().await, Some(Message::Binary(b"abc".to_vec())));

        drop(client_tx);
        let stats = relay.await.unwrap();
        assert_eq!(stats.reason, CloseReason::ClientClosed);
        assert_eq!(stats.tx, 8);
        assert_eq!(stats.rx, 8);
    }

    #[tokio::test]
    async fn target_close_closes_websocket() {
        let ((_client_tx, mut client_rx), (ws_rx, ws_tx)) = websocket();
        let (ours, mut theirs) = duplex(4096);

        tokio::spawn(async move {
            theirs.write_all(b"bye").await.unwrap();
        });

        let stats = relay(ws_rx, ws_tx, ours, None, Duration::from_secs(60)).await;
        assert_eq!(stats.reason, CloseReason::TargetClosed);
        assert_eq!(stats.rx, 3);
        assert_eq!(client_rx.next().await, Some(Message::Binary(b"bye".to_vec())));
        assert_eq!(client_rx.next().await, Some(Message::Close(None)));
    }

    #[tokio::test]
    async fn dial_gives_up() {
        // unroutable, either times out or fails right away
        let target: SocketAddr = "10.255.255.1:9".parse().unwrap();
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            dial(target, Duration::from_millis(100)),
        )
        .await
        .expect("dial ignored its limit");
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn dial_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        assert!(dial(target, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let ((_client_tx, mut client_rx), (ws_rx, ws_tx)) = websocket();
        let (ours, _theirs) = duplex(4096);

        let stats = relay(ws_rx, ws_tx, ours, None, Duration::from_secs(30 * 60)).await;
        assert_eq!(stats.reason, CloseReason::Timeout);
        assert_eq!(client_rx.next().await, Some(Message::Close(None)));
    }

    #[tokio::test]
    async fn captures_both_directions() {
        use crate::capture::{parse, CaptureMeta};

        let dir = tempfile::tempdir().unwrap();
        let meta = CaptureMeta {
            challenge: 1,
            team: Some(2),
            participation: Some(3),
            instance: uuid::Uuid::new_v4(),
            container: None,
            flag: None,
            client: "127.0.0.1:1".to_string(),
            target: "127.0.0.1:2".to_string(),
            started_at: chrono::Utc::now(),
        };
        let (capture, task) = Capture::open(dir.path(), &meta).await.unwrap();

        let ((client_tx, mut client_rx), (ws_rx, ws_tx)) = websocket();
        let (ours, theirs) = duplex(4096);
        tokio::spawn(echo(theirs));
        let relay = tokio::spawn(relay(
            ws_rx,
            ws_tx,
            ours,
            Some(capture),
            Duration::from_secs(60),
        ));

        client_tx
            .unbounded_send(Ok(Message::Binary(b"ping".to_vec())))
            .unwrap();
        assert!(client_rx.next().await.is_some());
        drop(client_tx);
        relay.await.unwrap();

        let path = task.path().to_path_buf();
        assert_eq!(task.finish().await, Some(2));
        let (_, records) = parse(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(records[0].direction, Direction::Upstream);
        assert_eq!(records[1].direction, Direction::Downstream);
        assert!(records.iter().all(|r| r.data == b"ping"));
    }
}
