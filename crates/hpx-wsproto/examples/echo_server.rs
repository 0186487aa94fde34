//! A WebSocket echo server on `localhost:8080` using hpx-wsproto and hyper.
//!
//! hyper performs the HTTP/1.1 upgrade; the engine negotiates
//! `permessage-deflate` and echoes every text or binary message back.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example echo_server
//! ```

use std::sync::Arc;

use http_body_util::Empty;
use hpx_wsproto::{
    Config, Connection, ConnectionRegistry, DeflateConfig, Handshake, WebSocketError, accept_key,
};
use hyper::{
    Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header,
    server::conn::http1,
    service::service_fn,
    upgrade::Upgraded,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

type Io = TokioIo<Upgraded>;

async fn handle_client(
    mut conn: Connection<Io>,
    registry: Arc<ConnectionRegistry<Io>>,
) -> hpx_wsproto::Result<()> {
    let id = conn.id();
    tracing::info!(%id, negotiated = ?conn.negotiated(), "client connected");

    let sender = conn.sender();
    let result = async {
        while let Some(message) = conn.receive().await? {
            sender.send_message(message).await?;
        }
        Ok::<_, WebSocketError>(())
    }
    .await;

    registry.remove(id);
    tracing::info!(%id, close = ?conn.peer_close(), live = registry.len(), "client gone");
    result
}

async fn server_upgrade(
    mut req: Request<Incoming>,
    config: Config,
    registry: Arc<ConnectionRegistry<Io>>,
) -> hpx_wsproto::Result<Response<Empty<Bytes>>> {
    let headers = req.headers();
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(WebSocketError::InvalidHandshake("missing Sec-WebSocket-Key"))?;
    if headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|v| v.as_bytes())
        != Some(b"13")
    {
        return Err(WebSocketError::InvalidHandshake(
            "unsupported Sec-WebSocket-Version",
        ));
    }
    let accept = accept_key(key.as_bytes());
    let offer = headers
        .get(header::SEC_WEBSOCKET_EXTENSIONS)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned);

    let mut handshake = Handshake::server(config);
    let extensions = handshake.accept_offer(offer.as_deref())?;

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(extensions) = extensions {
        response = response.header(header::SEC_WEBSOCKET_EXTENSIONS, extensions);
    }
    let response = response
        .body(Empty::new())
        .map_err(|_| WebSocketError::InvalidHandshake("invalid response header"))?;

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let conn = handshake.open(TokioIo::new(upgraded));
                registry.insert(conn.sender());
                if let Err(e) = handle_client(conn, registry).await {
                    tracing::error!("Error in websocket connection: {e}");
                }
            }
            Err(e) => tracing::error!("Upgrade failed: {e}"),
        }
    });

    Ok(response)
}

#[tokio::main]
async fn main() -> hpx_wsproto::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::builder()
        .permessage_deflate(DeflateConfig::low_latency())
        .build()?;
    let registry = Arc::new(ConnectionRegistry::new());

    let listener = TcpListener::bind("127.0.0.1:8080").await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, _) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let config = config.clone();
        let registry = Arc::clone(&registry);

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                server_upgrade(req, config.clone(), Arc::clone(&registry))
            });
            let conn_fut = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades();
            if let Err(e) = conn_fut.await {
                tracing::error!("An error occurred: {e:?}");
            }
        });
    }
}
