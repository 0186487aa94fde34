//! Connects to the echo server on `localhost:8080`, sends `hello`, prints the
//! echo and closes.
//!
//! ```sh
//! cargo run --example echo_client
//! ```

use http_body_util::Empty;
use hpx_wsproto::{CloseCode, Config, DeflateConfig, Handshake, accept_key, generate_key};
use hyper::{Request, StatusCode, body::Bytes, client::conn::http1, header};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::init();

    let config = Config::builder()
        .permessage_deflate(DeflateConfig::default())
        .build()?;
    let mut handshake = Handshake::client(config);

    let stream = TcpStream::connect("127.0.0.1:8080").await?;
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::error!("Connection failed: {e:?}");
        }
    });

    let key = generate_key();
    let mut request = Request::builder()
        .uri("/")
        .header(header::HOST, "localhost:8080")
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, &key);
    if let Some(offer) = handshake.offer() {
        request = request.header(header::SEC_WEBSOCKET_EXTENSIONS, offer);
    }
    let mut response = sender.send_request(request.body(Empty::<Bytes>::new())?).await?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(format!("server refused the upgrade: {}", response.status()).into());
    }
    let accept = response
        .headers()
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .map(|v| v.as_bytes());
    if accept != Some(accept_key(key.as_bytes()).as_bytes()) {
        return Err("bad Sec-WebSocket-Accept".into());
    }
    let extensions = response
        .headers()
        .get(header::SEC_WEBSOCKET_EXTENSIONS)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned);
    handshake.accept_response(extensions.as_deref())?;

    let upgraded = hyper::upgrade::on(&mut response).await?;
    let mut ws = handshake.open(TokioIo::new(upgraded));
    tracing::info!(negotiated = ?ws.negotiated(), "connected");

    ws.send_text("hello").await?;
    if let Some(message) = ws.receive().await? {
        println!("{}", message.as_text().unwrap_or("<binary>"));
    }
    ws.close(CloseCode::Normal, "bye").await?;
    Ok(())
}
