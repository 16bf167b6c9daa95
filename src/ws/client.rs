//! Websocket client: endpoint selection, handshake, and the connection
//! adapter the session controllers drive.
//!
//! A [`Connection`] wraps any message channel that speaks tungstenite
//! [`Message`]s. Controllers accept it already opened, so the same protocol
//! code runs over a real socket from [`AsrClient::connect`] or over any other
//! [`MessageChannel`].

use std::sync::Once;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::AsrError;
use crate::ws::proto::{ClientMessage, ServerMessage};

/// Hosted pre-recorded transcription endpoint.
pub const HOSTED_PRE_RECORDED_ENDPOINT: &str =
    "wss://app.banafo.ai/api/v1/transcripts/pre-recorded";
/// Hosted streaming transcription endpoint.
pub const HOSTED_STREAMING_ENDPOINT: &str = "wss://app.banafo.ai/api/v1/transcripts/streaming";
/// Default on-premise server address.
pub const LOCAL_ADDR: &str = "localhost";
/// Default on-premise server port.
pub const LOCAL_PORT: u16 = 6006;
/// Transcript language used unless overridden.
pub const DEFAULT_LANGUAGE: &str = "en-US";
/// Websocket handshake bound.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Normal closure status code.
pub const NORMAL_CLOSURE: CloseCode = CloseCode::Normal;

/// Socket type produced by [`AsrClient::connect`].
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bidirectional message channel a [`Connection`] can wrap.
pub trait MessageChannel:
    Sink<Message, Error = WsError> + Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static
{
}

impl<T> MessageChannel for T where
    T: Sink<Message, Error = WsError>
        + Stream<Item = Result<Message, WsError>>
        + Unpin
        + Send
        + 'static
{
}

/// Which protocol a connection is opened for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionMode {
    /// Whole files, one result per file.
    PreRecorded,
    /// Paced chunks with asynchronous results.
    Streaming,
}

/// Entry point for opening recognition connections.
#[derive(Clone)]
pub struct AsrClient {
    api_key: Option<SecretString>,
    language: String,
    on_premise: Option<String>,
    endpoint_override: Option<String>,
    connect_timeout: Duration,
}

impl AsrClient {
    /// Creates a client for the hosted API.
    pub fn hosted(api_key: SecretString) -> Self {
        Self {
            api_key: Some(api_key),
            language: DEFAULT_LANGUAGE.to_string(),
            on_premise: None,
            endpoint_override: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Creates a client for an on-premise server at `ws://{addr}:{port}`.
    pub fn on_premise(addr: impl AsRef<str>, port: u16) -> Self {
        Self {
            api_key: None,
            language: DEFAULT_LANGUAGE.to_string(),
            on_premise: Some(format!("ws://{}:{port}", addr.as_ref())),
            endpoint_override: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// On-premise client for `localhost:6006`.
    pub fn local() -> Self {
        Self::on_premise(LOCAL_ADDR, LOCAL_PORT)
    }

    /// Sets the transcript language code sent to the hosted API.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Sets an explicit endpoint override.
    ///
    /// The override takes precedence over the hosted and on-premise
    /// endpoints. Credential query parameters are still appended.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    /// Sets the websocket handshake bound.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Transcript language code.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Opens a connection for `mode`.
    ///
    /// Resolves only once the websocket handshake succeeded. A refused or
    /// rejected handshake yields [`AsrError::Connection`] with whatever reason
    /// the server gave.
    pub async fn connect(
        &self,
        mode: SessionMode,
        endpointing: Option<bool>,
    ) -> Result<Connection<WsStream>, AsrError> {
        let url = self.request_url(mode, endpointing)?;
        if url.scheme() == "wss" {
            install_crypto_provider();
        }
        let endpoint = redacted(&url);
        let request = url
            .as_str()
            .into_client_request()
            .map_err(|err| AsrError::Configuration(format!("invalid endpoint request: {err}")))?;

        debug!(event = "connecting", endpoint = %endpoint, ?mode);

        let socket = match tokio::time::timeout(self.connect_timeout, connect_async(request)).await
        {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(err)) => {
                return Err(AsrError::Connection {
                    reason: handshake_failure_reason(err),
                })
            }
            Err(_) => {
                return Err(AsrError::Connection {
                    reason: format!(
                        "handshake timed out after {} ms",
                        self.connect_timeout.as_millis()
                    ),
                })
            }
        };

        info!(event = "connected", endpoint = %endpoint, ?mode);
        Ok(Connection::from_channel(socket))
    }

    /// Builds the request URL, credentials included.
    pub(crate) fn request_url(
        &self,
        mode: SessionMode,
        endpointing: Option<bool>,
    ) -> Result<Url, AsrError> {
        let base = if let Some(endpoint) = self.endpoint_override.as_deref() {
            endpoint
        } else if let Some(endpoint) = self.on_premise.as_deref() {
            endpoint
        } else {
            match mode {
                SessionMode::PreRecorded => HOSTED_PRE_RECORDED_ENDPOINT,
                SessionMode::Streaming => HOSTED_STREAMING_ENDPOINT,
            }
        };

        let mut url = Url::parse(base)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(AsrError::Configuration(format!(
                "endpoint scheme must be ws or wss, got {}",
                url.scheme()
            )));
        }

        if let Some(api_key) = self.api_key.as_ref() {
            let mut query = url.query_pairs_mut();
            query.append_pair("apiKey", api_key.expose_secret());
            query.append_pair("languageCode", &self.language);
            if let (SessionMode::Streaming, Some(endpointing)) = (mode, endpointing) {
                query.append_pair("endpoints", if endpointing { "true" } else { "false" });
            }
        }

        Ok(url)
    }
}

/// Installs the ring provider for TLS handshakes, once per process.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // Fails only when the application installed its own provider first.
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!(event = "crypto_provider_already_installed");
        }
    });
}

/// Endpoint without query string, safe to log.
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

fn handshake_failure_reason(err: WsError) -> String {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            if body.trim().is_empty() {
                format!("http status {status}")
            } else {
                format!("http status {status}: {}", body.trim())
            }
        }
        other => other.to_string(),
    }
}

/// An open duplex connection.
///
/// Sends are FIFO and resolve once the transport accepted the message.
/// [`Connection::close`] is idempotent.
pub struct Connection<S = WsStream> {
    sender: ConnectionSender<S>,
    receiver: ConnectionReceiver<S>,
}

impl<S: MessageChannel> Connection<S> {
    /// Wraps an already-opened channel.
    pub fn from_channel(channel: S) -> Self {
        let (sink, stream) = channel.split();
        Self {
            sender: ConnectionSender {
                sink,
                closed: false,
            },
            receiver: ConnectionReceiver { stream },
        }
    }

    /// Sends one message; resolves once the transport accepted it.
    pub async fn send(&mut self, message: ClientMessage) -> Result<(), AsrError> {
        self.sender.send(message).await
    }

    /// Waits for the next data message.
    pub async fn recv_next(&mut self) -> Result<ServerMessage, AsrError> {
        self.receiver.recv_next().await
    }

    /// Sends a close frame with `code`. Later calls do nothing.
    pub async fn close(&mut self, code: CloseCode) -> Result<(), AsrError> {
        self.sender.close(code).await
    }

    /// Whether a close frame was already sent.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Splits into independently owned send and receive halves.
    pub fn split(self) -> (ConnectionSender<S>, ConnectionReceiver<S>) {
        (self.sender, self.receiver)
    }
}

/// Outbound half of a [`Connection`].
pub struct ConnectionSender<S = WsStream> {
    sink: SplitSink<S, Message>,
    closed: bool,
}

impl<S: MessageChannel> ConnectionSender<S> {
    /// Sends one message. Fails once the half has been closed.
    pub async fn send(&mut self, message: ClientMessage) -> Result<(), AsrError> {
        if self.closed {
            return Err(AsrError::Send {
                reason: "connection already closed".to_string(),
            });
        }
        self.sink
            .send(message.into_ws())
            .await
            .map_err(|err| AsrError::Send {
                reason: err.to_string(),
            })
    }

    /// Sends a close frame with `code`. Later calls do nothing.
    pub async fn close(&mut self, code: CloseCode) -> Result<(), AsrError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let frame = CloseFrame {
            code,
            reason: "".into(),
        };
        match self.sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(AsrError::Connection {
                reason: format!("close failed: {err}"),
            }),
        }
    }

    /// Whether a close frame was already sent.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Inbound half of a [`Connection`].
pub struct ConnectionReceiver<S = WsStream> {
    stream: SplitStream<S>,
}

impl<S: MessageChannel> ConnectionReceiver<S> {
    /// Waits for the next text or binary message.
    ///
    /// Control frames are skipped. A close frame, end of stream or transport
    /// error is reported as [`AsrError::Receive`].
    pub async fn recv_next(&mut self) -> Result<ServerMessage, AsrError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(ServerMessage::from_text(text)),
                Some(Ok(Message::Binary(bytes))) => return Ok(ServerMessage::Binary(bytes)),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    return Err(AsrError::Receive {
                        reason: describe_close(frame.as_ref()),
                    })
                }
                Some(Err(err)) => {
                    return Err(AsrError::Receive {
                        reason: err.to_string(),
                    })
                }
                None => {
                    return Err(AsrError::Receive {
                        reason: "connection ended".to_string(),
                    })
                }
            }
        }
    }
}

fn describe_close(frame: Option<&CloseFrame<'_>>) -> String {
    match frame {
        Some(frame) if frame.reason.is_empty() => {
            format!("server closed connection (code {})", u16::from(frame.code))
        }
        Some(frame) => format!(
            "server closed connection (code {}): {}",
            u16::from(frame.code),
            frame.reason
        ),
        None => "server closed connection".to_string(),
    }
}
