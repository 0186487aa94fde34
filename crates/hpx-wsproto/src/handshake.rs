//! The extension side of the opening handshake.
//!
//! The HTTP exchange itself belongs to the caller. A [`Handshake`] only decides what
//! goes into `Sec-WebSocket-Extensions`, remembers what was agreed, and turns the
//! upgraded transport into an OPEN [`Connection`].

use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    Result, WebSocketError,
    codec::Role,
    config::{Config, ConnectionOverrides},
    connection::{self, Connection, State},
    extensions::{ExtensionNegotiator, ExtensionParams},
};

const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A connection in the CONNECTING state.
#[derive(Debug, Clone)]
pub struct Handshake {
    role: Role,
    config: Config,
    negotiator: ExtensionNegotiator,
    params: Option<ExtensionParams>,
}

impl Handshake {
    pub fn server(config: Config) -> Self {
        Self::new(Role::Server, config)
    }

    pub fn client(config: Config) -> Self {
        Self::new(Role::Client, config)
    }

    fn new(role: Role, config: Config) -> Self {
        let negotiator = ExtensionNegotiator::new(config.permessage_deflate().cloned());
        Self {
            role,
            config,
            negotiator,
            params: None,
        }
    }

    /// Applies per-connection overrides on top of the shared configuration.
    #[must_use]
    pub fn with_overrides(self, overrides: &ConnectionOverrides) -> Self {
        Self::new(self.role, self.config.with_overrides(overrides))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        State::Connecting
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Parameters agreed so far, `None` while uncompressed.
    pub fn negotiated(&self) -> Option<ExtensionParams> {
        self.params
    }

    /// Server role: negotiates against the client's `Sec-WebSocket-Extensions`
    /// header and returns the value for the response header, if any.
    pub fn accept_offer(&mut self, header: Option<&str>) -> Result<Option<String>> {
        if self.role != Role::Server {
            return Err(WebSocketError::InvalidHandshake(
                "only a server accepts extension offers",
            ));
        }
        let accepted = self.negotiator.accept_offer(header)?;
        self.params = accepted.as_ref().map(|accepted| accepted.params);
        Ok(accepted.map(|accepted| accepted.response))
    }

    /// Client role: the `Sec-WebSocket-Extensions` header to send, `None` when
    /// compression is disabled.
    pub fn offer(&self) -> Option<String> {
        match self.role {
            Role::Client => self.negotiator.offer(),
            Role::Server => None,
        }
    }

    /// Client role: validates the server's `Sec-WebSocket-Extensions` response.
    pub fn accept_response(&mut self, header: Option<&str>) -> Result<()> {
        if self.role != Role::Client {
            return Err(WebSocketError::InvalidHandshake(
                "only a client validates extension responses",
            ));
        }
        self.params = self.negotiator.accept_response(header)?;
        Ok(())
    }

    /// Finishes the handshake over an upgraded transport.
    pub fn open<S>(self, stream: S) -> Connection<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.open_with_buffer(stream, &[])
    }

    /// Like [`open`](Self::open), for when frame bytes were already read past the
    /// end of the HTTP upgrade.
    pub fn open_with_buffer<S>(self, stream: S, buffered: &[u8]) -> Connection<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        connection::open(stream, buffered, self.role, self.config, self.params)
    }
}

/// The `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
pub fn accept_key(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(ACCEPT_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// A fresh random `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    use base64::prelude::*;
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeflateConfig, NegotiationMode};

    fn deflate_config(deflate: DeflateConfig) -> Config {
        Config::builder().permessage_deflate(deflate).build().unwrap()
    }

    #[test]
    fn test_accept_key_rfc_sample() {
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_key() {
        use base64::prelude::*;
        let key = generate_key();
        assert_eq!(BASE64_STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_server_accepts_offer() {
        let mut handshake = Handshake::server(deflate_config(DeflateConfig::default()));
        assert_eq!(handshake.state(), State::Connecting);
        let response = handshake
            .accept_offer(Some("permessage-deflate; client_max_window_bits"))
            .unwrap();
        assert!(response.unwrap().starts_with("permessage-deflate"));
        assert_eq!(handshake.negotiated(), Some(ExtensionParams::default()));
    }

    #[test]
    fn test_server_without_compression_ignores_offer() {
        let mut handshake = Handshake::server(Config::default());
        assert_eq!(
            handshake.accept_offer(Some("permessage-deflate")).unwrap(),
            None
        );
        assert_eq!(handshake.negotiated(), None);
    }

    #[test]
    fn test_overrides_switch_mode() {
        let offer = Some("permessage-deflate; client_max_window_bits=8");
        let deflate = DeflateConfig {
            min_window_bits: 9,
            ..Default::default()
        };

        let mut strict = Handshake::server(deflate_config(deflate.clone()));
        assert!(matches!(
            strict.accept_offer(offer),
            Err(WebSocketError::NegotiationMismatch(_))
        ));

        let overrides = ConnectionOverrides {
            negotiation_mode: Some(NegotiationMode::Permissive),
            ..Default::default()
        };
        let mut permissive = Handshake::server(deflate_config(deflate)).with_overrides(&overrides);
        assert_eq!(permissive.accept_offer(offer).unwrap(), None);
        assert_eq!(permissive.negotiated(), None);
    }

    #[test]
    fn test_role_checks() {
        let mut client = Handshake::client(deflate_config(DeflateConfig::default()));
        assert!(matches!(
            client.accept_offer(Some("permessage-deflate")),
            Err(WebSocketError::InvalidHandshake(_))
        ));
        assert!(client.offer().is_some());

        let mut server = Handshake::server(deflate_config(DeflateConfig::default()));
        assert!(server.offer().is_none());
        assert!(matches!(
            server.accept_response(None),
            Err(WebSocketError::InvalidHandshake(_))
        ));
    }

    #[test]
    fn test_client_accepts_response() {
        let mut client = Handshake::client(deflate_config(DeflateConfig::default()));
        client
            .accept_response(Some("permessage-deflate; server_no_context_takeover"))
            .unwrap();
        let params = client.negotiated().unwrap();
        assert!(params.server_no_context_takeover);
        assert!(!params.client_no_context_takeover);

        let mut declined = Handshake::client(deflate_config(DeflateConfig::default()));
        declined.accept_response(None).unwrap();
        assert_eq!(declined.negotiated(), None);
    }
}
