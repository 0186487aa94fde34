//! `permessage-deflate` negotiation (RFC 7692, Section 5 and 7.1).
//!
//! The negotiation runs once per connection, before it opens. The server picks the
//! first acceptable offer from the client's `Sec-WebSocket-Extensions` header and
//! answers with the parameters it settled on. The client sends an offer built from
//! its configuration and checks the server's answer. Window size and context
//! takeover are agreed separately for each direction.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, space0},
    combinator::{all_consuming, opt},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, terminated},
};

use crate::{
    Result, WebSocketError,
    compression::MIN_BACKEND_WINDOW_BITS,
    config::{DeflateConfig, NegotiationMode},
};

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Parameters in effect after negotiation.
///
/// `client_*` values govern what the client compresses and the server inflates;
/// `server_*` values the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionParams {
    pub client_max_window_bits: u8,
    pub server_max_window_bits: u8,
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
}

impl Default for ExtensionParams {
    fn default() -> Self {
        Self {
            client_max_window_bits: 15,
            server_max_window_bits: 15,
            client_no_context_takeover: false,
            server_no_context_takeover: false,
        }
    }
}

/// One `permessage-deflate` element of an extension header, as written on the wire.
///
/// The window bit fields distinguish an absent parameter (`None`) from one given
/// without a value (`Some(None)`), which is legal for `client_max_window_bits` in
/// an offer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermessageDeflate {
    pub server_max_window_bits: Option<Option<u8>>,
    pub client_max_window_bits: Option<Option<u8>>,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
}

impl std::fmt::Display for PermessageDeflate {
    /// Formats the element as it appears in a `Sec-WebSocket-Extensions` header.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{PERMESSAGE_DEFLATE}")?;

        for (name, bits) in [
            ("client_max_window_bits", self.client_max_window_bits),
            ("server_max_window_bits", self.server_max_window_bits),
        ] {
            match bits {
                Some(Some(bits)) => write!(f, "; {name}={bits}")?,
                Some(None) => write!(f, "; {name}")?,
                None => {}
            }
        }

        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }

        Ok(())
    }
}

impl std::str::FromStr for PermessageDeflate {
    type Err = String;

    /// Parses a single `permessage-deflate` element.
    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let mut extensions = parse_header(input)?;
        match (extensions.pop(), extensions.is_empty()) {
            (Some(ext), true) if ext.name == PERMESSAGE_DEFLATE => Self::from_params(&ext.params),
            _ => Err(format!("expected a single {PERMESSAGE_DEFLATE} element")),
        }
    }
}

impl PermessageDeflate {
    /// Interprets the parameters of one element.
    ///
    /// Unknown and repeated parameters, values on flag parameters and window sizes
    /// outside 8..=15 are rejected.
    fn from_params(params: &[(&str, Option<&str>)]) -> std::result::Result<Self, String> {
        let mut this = Self::default();
        let mut seen: Vec<&str> = Vec::with_capacity(params.len());

        for &(key, value) in params {
            if seen.contains(&key) {
                return Err(format!("duplicate parameter {key}"));
            }
            seen.push(key);

            match key {
                "client_no_context_takeover" | "server_no_context_takeover" => {
                    if value.is_some() {
                        return Err(format!("{key} does not take a value"));
                    }
                    if key == "client_no_context_takeover" {
                        this.client_no_context_takeover = true;
                    } else {
                        this.server_no_context_takeover = true;
                    }
                }
                "client_max_window_bits" => {
                    this.client_max_window_bits = Some(value.map(|v| window_bits(key, v)).transpose()?);
                }
                "server_max_window_bits" => {
                    this.server_max_window_bits = Some(value.map(|v| window_bits(key, v)).transpose()?);
                }
                _ => return Err(format!("unsupported parameter {key}")),
            }
        }

        Ok(this)
    }

    /// Builds the client's offer from local configuration.
    fn offer(config: &DeflateConfig) -> Self {
        let client_bits = outbound_bits(config.client_max_window_bits);
        Self {
            // Always advertised so the server may narrow our window.
            client_max_window_bits: Some((client_bits < 15).then_some(client_bits)),
            server_max_window_bits: (config.server_max_window_bits < 15)
                .then_some(Some(config.server_max_window_bits)),
            client_no_context_takeover: config.client_no_context_takeover,
            server_no_context_takeover: config.server_no_context_takeover,
        }
    }
}

fn window_bits(key: &str, value: &str) -> std::result::Result<u8, String> {
    match value.parse::<u8>() {
        Ok(bits) if (8..=15).contains(&bits) && !value.starts_with('0') => Ok(bits),
        _ => Err(format!("{key}={value} is not a window size in 8..=15")),
    }
}

/// Window bits this endpoint actually compresses with for a configured value.
fn outbound_bits(configured: u8) -> u8 {
    configured.max(MIN_BACKEND_WINDOW_BITS)
}

/// Result of a successful server-side negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Parameters both sides now apply.
    pub params: ExtensionParams,
    /// Value for the `Sec-WebSocket-Extensions` response header.
    pub response: String,
}

/// Negotiates `permessage-deflate` for one connection.
#[derive(Debug, Clone)]
pub struct ExtensionNegotiator {
    config: Option<DeflateConfig>,
    mode: NegotiationMode,
}

impl ExtensionNegotiator {
    /// Creates a negotiator; `None` disables the extension entirely.
    pub fn new(config: Option<DeflateConfig>) -> Self {
        let mode = config
            .as_ref()
            .map(|c| c.negotiation_mode)
            .unwrap_or_default();
        Self { config, mode }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: NegotiationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> NegotiationMode {
        self.mode
    }

    /// Client role: the header value to send, or `None` when compression is disabled.
    pub fn offer(&self) -> Option<String> {
        self.config
            .as_ref()
            .map(|config| PermessageDeflate::offer(config).to_string())
    }

    /// Server role: answers the client's offer header.
    ///
    /// Offers are tried in order and the first acceptable one wins. When offers were
    /// made but none is acceptable, strict mode fails with
    /// [`WebSocketError::NegotiationMismatch`] and permissive mode declines the
    /// extension. `Ok(None)` means the connection runs uncompressed.
    pub fn accept_offer(&self, header: Option<&str>) -> Result<Option<Accepted>> {
        let (Some(config), Some(header)) = (self.config.as_ref(), header) else {
            return Ok(None);
        };
        if header.trim().is_empty() {
            return Ok(None);
        }

        let extensions = match parse_header(header) {
            Ok(extensions) => extensions,
            Err(reason) => return self.mismatch(reason),
        };

        let mut rejection = None;
        for ext in extensions.iter().filter(|e| e.name == PERMESSAGE_DEFLATE) {
            let outcome = PermessageDeflate::from_params(&ext.params)
                .and_then(|offer| accept_one(&offer, config));
            match outcome {
                Ok(accepted) => {
                    tracing::debug!(params = ?accepted.params, "permessage-deflate accepted");
                    return Ok(Some(accepted));
                }
                Err(reason) => {
                    tracing::debug!(%reason, "permessage-deflate offer rejected");
                    rejection.get_or_insert(reason);
                }
            }
        }

        match rejection {
            Some(reason) => self.mismatch(reason),
            None => Ok(None),
        }
    }

    /// Client role: validates and applies the server's response header.
    ///
    /// A missing header means the server declined and the connection runs
    /// uncompressed. Any response the client cannot honour fails regardless of the
    /// negotiation mode: the server has already started compressing.
    pub fn accept_response(&self, header: Option<&str>) -> Result<Option<ExtensionParams>> {
        let header = header.map(str::trim).filter(|h| !h.is_empty());
        let Some(header) = header else {
            return Ok(None);
        };
        let Some(config) = self.config.as_ref() else {
            return Err(WebSocketError::NegotiationMismatch(
                "server accepted an extension that was not offered".into(),
            ));
        };

        let mut extensions = parse_header(header).map_err(WebSocketError::NegotiationMismatch)?;
        let ext = match (extensions.pop(), extensions.is_empty()) {
            (Some(ext), true) if ext.name == PERMESSAGE_DEFLATE => ext,
            _ => {
                return Err(WebSocketError::NegotiationMismatch(format!(
                    "unexpected extension response {header:?}"
                )));
            }
        };

        let params = PermessageDeflate::from_params(&ext.params)
            .and_then(|response| apply_response(&response, config))
            .map_err(WebSocketError::NegotiationMismatch)?;
        tracing::debug!(?params, "permessage-deflate negotiated");
        Ok(Some(params))
    }

    fn mismatch<T>(&self, reason: String) -> Result<Option<T>> {
        match self.mode {
            NegotiationMode::Strict => Err(WebSocketError::NegotiationMismatch(reason)),
            NegotiationMode::Permissive => {
                tracing::warn!(%reason, "permessage-deflate disabled");
                Ok(None)
            }
        }
    }
}

/// Server side: narrows one offer to what the local configuration supports.
fn accept_one(
    offer: &PermessageDeflate,
    config: &DeflateConfig,
) -> std::result::Result<Accepted, String> {
    let outbound_floor = outbound_bits(config.min_window_bits);
    let local_server = outbound_bits(config.server_max_window_bits);
    let mut response = PermessageDeflate::default();

    let server_bits = match offer.server_max_window_bits {
        Some(Some(bits)) if bits < outbound_floor => {
            return Err(format!(
                "server_max_window_bits={bits} is below the supported minimum {outbound_floor}"
            ));
        }
        Some(Some(bits)) => {
            let bits = bits.min(local_server);
            response.server_max_window_bits = Some(Some(bits));
            bits
        }
        Some(None) => return Err("server_max_window_bits requires a value".into()),
        None => {
            response.server_max_window_bits = (local_server < 15).then_some(Some(local_server));
            local_server
        }
    };

    let client_bits = match offer.client_max_window_bits {
        Some(Some(bits)) if bits < config.min_window_bits => {
            return Err(format!(
                "client_max_window_bits={bits} is below the supported minimum {}",
                config.min_window_bits
            ));
        }
        Some(Some(bits)) => {
            let bits = bits.min(config.client_max_window_bits);
            response.client_max_window_bits = Some(Some(bits));
            bits
        }
        Some(None) => {
            let bits = config.client_max_window_bits;
            response.client_max_window_bits = (bits < 15).then_some(Some(bits));
            bits
        }
        None if config.client_max_window_bits < 15 => {
            return Err(format!(
                "client cannot limit its window to {} bits",
                config.client_max_window_bits
            ));
        }
        None => 15,
    };

    response.client_no_context_takeover =
        offer.client_no_context_takeover || config.client_no_context_takeover;
    response.server_no_context_takeover =
        offer.server_no_context_takeover || config.server_no_context_takeover;

    Ok(Accepted {
        params: ExtensionParams {
            client_max_window_bits: client_bits,
            server_max_window_bits: server_bits,
            client_no_context_takeover: response.client_no_context_takeover,
            server_no_context_takeover: response.server_no_context_takeover,
        },
        response: response.to_string(),
    })
}

/// Client side: checks the server's response against what was offered.
fn apply_response(
    response: &PermessageDeflate,
    config: &DeflateConfig,
) -> std::result::Result<ExtensionParams, String> {
    let requested_server = config.server_max_window_bits;
    let server_bits = match response.server_max_window_bits {
        Some(Some(bits)) if bits < config.min_window_bits => {
            return Err(format!(
                "server_max_window_bits={bits} is below the supported minimum {}",
                config.min_window_bits
            ));
        }
        Some(Some(bits)) if bits > requested_server => {
            return Err(format!(
                "server_max_window_bits={bits} exceeds the requested {requested_server}"
            ));
        }
        Some(Some(bits)) => bits,
        Some(None) => return Err("server_max_window_bits requires a value".into()),
        None if requested_server < 15 => {
            return Err("server ignored the requested server_max_window_bits".into());
        }
        None => 15,
    };

    let outbound_floor = outbound_bits(config.min_window_bits);
    let local_client = outbound_bits(config.client_max_window_bits);
    let client_bits = match response.client_max_window_bits {
        Some(Some(bits)) if bits < outbound_floor => {
            return Err(format!(
                "client_max_window_bits={bits} is below the supported minimum {outbound_floor}"
            ));
        }
        Some(Some(bits)) => bits.min(local_client),
        Some(None) => return Err("client_max_window_bits requires a value".into()),
        None => local_client,
    };

    if config.server_no_context_takeover && !response.server_no_context_takeover {
        return Err("server ignored the requested server_no_context_takeover".into());
    }

    Ok(ExtensionParams {
        client_max_window_bits: client_bits,
        server_max_window_bits: server_bits,
        client_no_context_takeover: response.client_no_context_takeover
            || config.client_no_context_takeover,
        server_no_context_takeover: response.server_no_context_takeover,
    })
}

/// One element of an extension header: a name and its parameters.
#[derive(Debug, PartialEq, Eq)]
struct RawExtension<'a> {
    name: &'a str,
    params: Vec<(&'a str, Option<&'a str>)>,
}

/// Parses a full `Sec-WebSocket-Extensions` value into its elements.
fn parse_header(input: &str) -> std::result::Result<Vec<RawExtension<'_>>, String> {
    all_consuming(terminated(
        separated_list1(preceded(space0, char(',')), extension),
        space0,
    ))
    .parse(input)
    .map(|(_, extensions)| extensions)
    .map_err(|err| format!("malformed extension header: {err}"))
}

/// `name *( ";" param )`
fn extension(input: &str) -> IResult<&str, RawExtension<'_>> {
    pair(preceded(space0, token), many0(param))
        .map(|(name, params)| RawExtension { name, params })
        .parse(input)
}

/// `; key [= value]`, tolerating spaces around both separators.
fn param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        (space0, char(';'), space0),
        pair(
            token,
            opt(preceded(
                (space0, char('='), space0),
                alt((quoted_string, token)),
            )),
        ),
    )
    .parse(input)
}

/// A quoted value; RFC 7692 allows `client_max_window_bits="10"`.
fn quoted_string(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c: char| c != '"'), char('"')).parse(input)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c))
        .parse(input)
}
