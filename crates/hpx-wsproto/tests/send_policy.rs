mod common;

use std::time::Duration;

use common::RawPeer;
use hpx_wsproto::{Config, Handshake, Message, Role, SendPolicy, WebSocketError};
use tokio::io::DuplexStream;

/// A server whose transport buffer is far smaller than one message, so a send
/// stays in flight until the peer reads.
fn stalled_server(policy: SendPolicy) -> (hpx_wsproto::Connection<DuplexStream>, RawPeer) {
    let (a, b) = tokio::io::duplex(64);
    let config = Config::builder().send_policy(policy).build().unwrap();
    (
        Handshake::server(config).open(a),
        RawPeer::new(b, Role::Client, false),
    )
}

async fn in_flight(sender: &hpx_wsproto::Sender<DuplexStream>) -> tokio::task::JoinHandle<()> {
    let sender = sender.clone();
    let handle = tokio::spawn(async move {
        sender.send_binary(vec![1u8; 4096]).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle
}

#[tokio::test]
async fn test_fail_fast_rejects_concurrent_send() {
    let (server, mut peer) = stalled_server(SendPolicy::FailFast);
    let (sender, _receiver) = server.split();

    let first = in_flight(&sender).await;
    assert!(matches!(
        sender.send_text("second").await,
        Err(WebSocketError::SendQueueFull)
    ));

    assert_eq!(peer.recv().await.unwrap().payload().len(), 4096);
    first.await.unwrap();
    sender.send_text("third").await.unwrap();
    assert_eq!(peer.recv().await.unwrap().payload(), "third");
}

#[tokio::test]
async fn test_bounded_queue_signals_backpressure() {
    let (server, mut peer) = stalled_server(SendPolicy::Bounded(2));
    let (sender, _receiver) = server.split();

    let first = in_flight(&sender).await;
    let second = in_flight(&sender).await;
    assert!(matches!(
        sender.send_text("third").await,
        Err(WebSocketError::SendQueueFull)
    ));

    for _ in 0..2 {
        assert_eq!(peer.recv().await.unwrap().payload().len(), 4096);
    }
    first.await.unwrap();
    second.await.unwrap();
    sender.send_text("fourth").await.unwrap();
    assert_eq!(peer.recv().await.unwrap().payload(), "fourth");
}

#[tokio::test]
async fn test_unbounded_queue_waits() {
    let (server, mut peer) = stalled_server(SendPolicy::Unbounded);
    let (sender, _receiver) = server.split();

    let first = in_flight(&sender).await;
    let waiting = {
        let sender = sender.clone();
        tokio::spawn(async move { sender.send_message(Message::text("queued")).await })
    };

    assert_eq!(peer.recv().await.unwrap().payload().len(), 4096);
    assert_eq!(peer.recv().await.unwrap().payload(), "queued");
    first.await.unwrap();
    waiting.await.unwrap().unwrap();
}
