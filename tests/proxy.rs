use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use skansen::capture;
use skansen::db::Store;
use skansen::runtime::DummyRuntime;
use skansen::server::router;
use skansen::types::{ChallengeKind, Instance};
use std::net::{SocketAddr, TcpListener as StdListener};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tower::ServiceExt;
use uuid::Uuid;

mod common;
use common::*;

/// Echoes every connection back, returns its port
async fn echo_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
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
            });
        }
    });

    port
}

async fn serve(p: &Platform) -> SocketAddr {
    let listener = StdListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let app = router(p.state.clone());
    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    addr
}

async fn create(p: &Platform, challenge: i64) -> Instance {
    let challenge = p.store.challenge(challenge).await.unwrap().unwrap();
    p.state
        .instances
        .create(&p.game, &p.participation, &challenge)
        .await
        .unwrap()
}

async fn wait_idle(p: &Platform, id: Uuid) {
    for _ in 0..200 {
        if p.state.admission.connections(id) == Some(0) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("admission slot for {id} never released");
}

fn http_status(err: WsError) -> u16 {
    match err {
        WsError::Http(res) => res.status().as_u16(),
        other => panic!("expected http error, got {other:?}"),
    }
}

#[tokio::test]
async fn relays_and_captures() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.proxy.capture_dir = dir.path().to_path_buf();

    let port = echo_target().await;
    let p = platform(config, DummyRuntime::new("127.0.0.1".parse().unwrap(), Some(port)));
    let mut chall = challenge(1, ChallengeKind::StaticContainer);
    chall.enable_traffic_capture = true;
    p.store.put_challenge(chall);

    let addr = serve(&p).await;
    let instance = create(&p, 1).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/proxy/{}", instance.id))
        .await
        .unwrap();
    assert_eq!(p.state.admission.connections(instance.id), Some(1));

    ws.send(Message::Binary(b"hello".to_vec())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::Binary(b"hello".to_vec()));

    ws.close(None).await.unwrap();
    wait_idle(&p, instance.id).await;

    let team_dir = dir.path().join("1").join(p.participation.id.to_string());
    let file = std::fs::read_dir(&team_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let (meta, records) = capture::parse(&std::fs::read(file).unwrap()).unwrap();
    assert_eq!(meta.instance, instance.id);
    assert_eq!(meta.team, Some(100));
    let tx: usize = records
        .iter()
        .filter(|r| r.direction == capture::Direction::Upstream)
        .map(|r| r.data.len())
        .sum();
    let rx: usize = records
        .iter()
        .filter(|r| r.direction == capture::Direction::Downstream)
        .map(|r| r.data.len())
        .sum();
    assert_eq!((tx, rx), (5, 5));
}

#[tokio::test]
async fn refused_target_is_a_teapot() {
    // grab a port nobody listens on
    let closed = {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let p = platform(test_config(), DummyRuntime::new("127.0.0.1".parse().unwrap(), Some(closed)));
    let addr = serve(&p).await;
    let instance = create(&p, 1).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/proxy/{}", instance.id))
        .await
        .unwrap_err();
    assert_eq!(http_status(err), 418);

    // the slot taken for the attempt went back
    assert_eq!(p.state.admission.connections(instance.id), Some(0));
}

#[tokio::test]
async fn unknown_and_mismatched_routes() {
    let port = echo_target().await;
    let p = platform(test_config(), DummyRuntime::new("127.0.0.1".parse().unwrap(), Some(port)));
    let addr = serve(&p).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/proxy/{}", Uuid::new_v4()))
        .await
        .unwrap_err();
    assert_eq!(http_status(err), 404);

    // team instances are not reachable through the test route and vice versa
    let instance = create(&p, 1).await;
    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/proxy/noinst/{}", instance.id))
        .await
        .unwrap_err();
    assert_eq!(http_status(err), 404);

    let chall = p.store.challenge(2).await.unwrap().unwrap();
    let test = p.state.instances.create_test(&chall).await.unwrap();
    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/proxy/{}", test.id))
        .await
        .unwrap_err();
    assert_eq!(http_status(err), 404);

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/proxy/noinst/{}", test.id))
        .await
        .unwrap();
    ws.send(Message::Text("hi".to_string())).await.unwrap();
    assert_eq!(
        ws.next().await.unwrap().unwrap(),
        Message::Binary(b"hi".to_vec())
    );
}

#[tokio::test]
async fn failed_upgrade_leaves_no_capture() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.proxy.capture_dir = dir.path().to_path_buf();

    let port = echo_target().await;
    let p = platform(config, DummyRuntime::new("127.0.0.1".parse().unwrap(), Some(port)));
    let mut chall = challenge(1, ChallengeKind::StaticContainer);
    chall.enable_traffic_capture = true;
    p.store.put_challenge(chall);
    let instance = create(&p, 1).await;

    // a handshake whose connection never gets upgraded
    let mut req = Request::get(format!("/proxy/{}", instance.id))
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Body::empty())
        .unwrap();
    let on_upgrade = hyper::upgrade::on(&mut req);
    req.extensions_mut().insert(on_upgrade);

    let res = router(p.state.clone()).oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::SWITCHING_PROTOCOLS);

    wait_idle(&p, instance.id).await;
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
