mod common;

use common::{compressed_config, deflate, server_with_raw_client};
use hpx_wsproto::{
    Config, ConnectionOverrides, DeflateConfig, ExtensionParams, Handshake, Message,
    NegotiationMode, WebSocketError,
};

fn min_nine(mode: NegotiationMode) -> Config {
    Config::builder()
        .permessage_deflate(DeflateConfig {
            min_window_bits: 9,
            negotiation_mode: mode,
            ..deflate(0)
        })
        .build()
        .unwrap()
}

const OFFER_EIGHT: &str = "permessage-deflate; client_max_window_bits=8";

#[test]
fn test_strict_mode_rejects_small_window() {
    let mut server = Handshake::server(min_nine(NegotiationMode::Strict));
    let err = server.accept_offer(Some(OFFER_EIGHT)).unwrap_err();
    assert!(matches!(err, WebSocketError::NegotiationMismatch(_)));
    assert!(server.negotiated().is_none());
}

#[tokio::test]
async fn test_permissive_mode_runs_uncompressed() {
    let (mut server, mut peer) = server_with_raw_client(
        Handshake::server(min_nine(NegotiationMode::Permissive)),
        Some(OFFER_EIGHT),
    );
    assert!(server.negotiated().is_none());

    let text = "compressible ".repeat(200);
    server.send_text(text.clone()).await.unwrap();
    let frame = peer.recv().await.unwrap();
    assert!(!frame.is_compressed());
    assert_eq!(frame.payload(), text.as_bytes());

    peer.send(hpx_wsproto::Frame::text("plain")).await;
    assert_eq!(server.receive().await.unwrap(), Some(Message::text("plain")));
}

#[test]
fn test_first_acceptable_offer_wins() {
    let mut server = Handshake::server(min_nine(NegotiationMode::Strict));
    let response = server
        .accept_offer(Some(
            "permessage-deflate; client_max_window_bits=8, permessage-deflate; client_max_window_bits=10",
        ))
        .unwrap()
        .unwrap();
    assert_eq!(
        response,
        "permessage-deflate; client_max_window_bits=10"
    );
    assert_eq!(server.negotiated().unwrap().client_max_window_bits, 10);
}

#[test]
fn test_override_makes_one_connection_permissive() {
    let shared = min_nine(NegotiationMode::Strict);
    let overrides = ConnectionOverrides {
        negotiation_mode: Some(NegotiationMode::Permissive),
        ..Default::default()
    };

    let mut strict = Handshake::server(shared.clone());
    assert!(strict.accept_offer(Some(OFFER_EIGHT)).is_err());

    let mut relaxed = Handshake::server(shared).with_overrides(&overrides);
    assert_eq!(relaxed.accept_offer(Some(OFFER_EIGHT)).unwrap(), None);
}

#[test]
fn test_client_and_server_agree() {
    let client_config = Config::builder()
        .permessage_deflate(DeflateConfig {
            client_no_context_takeover: true,
            server_max_window_bits: 12,
            ..Default::default()
        })
        .build()
        .unwrap();
    let mut client = Handshake::client(client_config);
    let mut server = Handshake::server(compressed_config(0));

    let offer = client.offer().unwrap();
    let response = server.accept_offer(Some(&offer)).unwrap().unwrap();
    client.accept_response(Some(&response)).unwrap();

    let expected = ExtensionParams {
        client_max_window_bits: 15,
        server_max_window_bits: 12,
        client_no_context_takeover: true,
        server_no_context_takeover: false,
    };
    assert_eq!(server.negotiated(), Some(expected));
    assert_eq!(client.negotiated(), Some(expected));
}

#[test]
fn test_client_rejects_unrequested_parameters() {
    let mut client = Handshake::client(compressed_config(0));
    assert!(matches!(
        client.accept_response(Some("permessage-deflate; server_max_window_bits=7")),
        Err(WebSocketError::NegotiationMismatch(_))
    ));
    assert!(matches!(
        client.accept_response(Some("permessage-deflate; unknown_param")),
        Err(WebSocketError::NegotiationMismatch(_))
    ));
}
