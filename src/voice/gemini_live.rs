//! Gemini Live WebSocket client.
//!
//! Implements [`LiveConnector`] over the BidiGenerateContent streaming
//! protocol.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open the WebSocket with `?key=` and send the `setup` frame
//! 2. **Handshake**: wait (bounded) for `setupComplete`
//! 3. **Stream**: captured frames go up as `realtimeInput`, replies come back
//!    as `serverContent`
//! 4. **Close**: send a close frame and stop the reader
//!
//! ## Binary frames
//!
//! The service sends JSON control and content messages as Binary frames as
//! well as Text frames. Anything starting with `{` is parsed as a server
//! message; other binary payloads are logged and skipped.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::error::{VoiceError, VoiceResult};
use super::events::{BridgeEvent, EventSender};
use super::protocol::{
    build_setup_message, parse_server_message, RealtimeInput, SessionSetup, GEMINI_LIVE_WS_URL,
};
use super::session::{LiveConnector, LiveSession, SessionError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Default bound on connect + `setupComplete`.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Frames queued for the writer before sends fail.
const OUTBOUND_QUEUE: usize = 256;

/// How long `close` waits for the writer to flush the close frame.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment variables consulted, in order, when no key is configured.
pub const API_KEY_ENV_VARS: &[&str] = &["GEMINI_API_KEY", "API_KEY"];

/// Pick the configured key, else the first non-empty env var.
pub fn resolve_api_key(
    configured: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> VoiceResult<String> {
    if let Some(key) = configured.map(str::trim).filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }
    API_KEY_ENV_VARS
        .iter()
        .filter_map(|var| lookup(var))
        .map(|k| k.trim().to_string())
        .find(|k| !k.is_empty())
        .ok_or_else(|| {
            VoiceError::Config(format!(
                "no Gemini API key: set live.api_key or one of {}",
                API_KEY_ENV_VARS.join(", ")
            ))
        })
}

/// Text of a frame that may carry a JSON server message.
fn frame_text(msg: &WsMessage) -> Option<&str> {
    match msg {
        WsMessage::Text(text) => Some(text.as_str()),
        WsMessage::Binary(data) if data.first() == Some(&b'{') => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

// ── Connector ──────────────────────────────────────────────────────

/// Opens a Gemini Live session per call.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    endpoint: String,
    api_key: Option<String>,
    setup_timeout: Duration,
}

impl Default for GeminiLiveConnector {
    fn default() -> Self {
        Self {
            endpoint: GEMINI_LIVE_WS_URL.to_string(),
            api_key: None,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }
}

impl GeminiLiveConnector {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, setup_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            setup_timeout,
        }
    }

    /// Resolved per call so a key exported after startup is picked up.
    fn api_key(&self) -> VoiceResult<String> {
        resolve_api_key(self.api_key.as_deref(), |var| std::env::var(var).ok())
    }

    async fn handshake(&self, call_id: &str, url: &str, setup_json: String) -> VoiceResult<WsStream> {
        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;

        tracing::debug!(call_id = %call_id, setup = %setup_json, "Sending Gemini Live setup");
        ws_stream
            .send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| VoiceError::Connect(format!("failed to send setup message: {e}")))?;

        while let Some(msg_result) = ws_stream.next().await {
            match msg_result {
                Ok(WsMessage::Close(frame)) => {
                    return Err(VoiceError::Connect(format!(
                        "connection closed before setupComplete: {frame:?}"
                    )));
                }
                Ok(msg) => match frame_text(&msg).map(parse_server_message) {
                    Some(Ok(server)) if server.is_setup_complete() => return Ok(ws_stream),
                    Some(Ok(server)) => {
                        if let Some(error) = server.error_message() {
                            return Err(VoiceError::Connect(format!("setup rejected: {error}")));
                        }
                        tracing::debug!(call_id = %call_id, "Ignoring message before setupComplete");
                    }
                    Some(Err(e)) => {
                        tracing::debug!(call_id = %call_id, error = %e, "Unparseable setup-phase frame");
                    }
                    None => {
                        tracing::debug!(call_id = %call_id, msg = ?msg, "Setup phase: non-JSON frame");
                    }
                },
                Err(e) => {
                    return Err(VoiceError::Connect(format!(
                        "WebSocket error before setupComplete: {e}"
                    )));
                }
            }
        }
        Err(VoiceError::Connect("stream ended before setupComplete".to_string()))
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(
        &self,
        call_id: &str,
        setup: &SessionSetup,
        events: EventSender,
    ) -> VoiceResult<Box<dyn LiveSession>> {
        let api_key = self.api_key()?;
        let url = format!("{}?key={api_key}", self.endpoint);
        let setup_json = serde_json::to_string(&build_setup_message(setup))?;

        tracing::info!(
            call_id = %call_id,
            model = %setup.model,
            voice = %setup.voice_name,
            "Connecting to Gemini Live"
        );

        let ws_stream = tokio::time::timeout(
            self.setup_timeout,
            self.handshake(call_id, &url, setup_json),
        )
        .await
        .map_err(|_| {
            VoiceError::Connect(format!(
                "setupComplete timeout ({}s)",
                self.setup_timeout.as_secs_f32()
            ))
        })??;

        tracing::info!(call_id = %call_id, "Gemini Live setup complete, ready to stream");
        let _ = events.send(BridgeEvent::SessionOpened);

        let (sink, source) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(outbound_loop(
            outbound_rx,
            sink,
            events.clone(),
            call_id.to_string(),
        ));
        tokio::spawn(inbound_loop(
            source,
            events,
            cancel.clone(),
            call_id.to_string(),
        ));

        Ok(Box::new(GeminiLiveSession {
            call_id: call_id.to_string(),
            outbound: outbound_tx,
            cancel,
            writer: Some(writer),
            closed: false,
        }))
    }
}

// ── Session ────────────────────────────────────────────────────────

#[derive(Debug)]
enum Outbound {
    /// Serialized `realtimeInput` message.
    Frame(String),
    Close,
}

/// An open Gemini Live session.
pub struct GeminiLiveSession {
    call_id: String,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    writer: Option<JoinHandle<()>>,
    closed: bool,
}

#[async_trait]
impl LiveSession for GeminiLiveSession {
    async fn send_realtime_input(&mut self, input: RealtimeInput) -> VoiceResult<()> {
        if self.closed {
            return Err(VoiceError::Send("session already closed".to_string()));
        }
        let json = serde_json::to_string(&input.into_wire())?;
        // A full queue means the socket stopped draining; never park the caller.
        self.outbound
            .try_send(Outbound::Frame(json))
            .map_err(|e| match e {
                TrySendError::Full(_) => VoiceError::Send(format!(
                    "outbound queue full ({OUTBOUND_QUEUE} frames), socket stalled"
                )),
                TrySendError::Closed(_) => VoiceError::Send("outbound channel closed".to_string()),
            })
    }

    async fn close(&mut self) -> VoiceResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.outbound.try_send(Outbound::Close).is_err() {
            tracing::debug!(call_id = %self.call_id, "Writer queue unavailable, skipping close frame");
        }
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, &mut writer).await.is_err() {
                tracing::debug!(call_id = %self.call_id, "Writer did not finish closing in time");
                writer.abort();
            }
        }
        self.cancel.cancel();
        tracing::info!(call_id = %self.call_id, "Gemini Live session closed");
        Ok(())
    }
}

impl Drop for GeminiLiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Internal loops ─────────────────────────────────────────────────

async fn outbound_loop(
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: WsSink,
    events: EventSender,
    call_id: String,
) {
    let mut chunk_count: u64 = 0;
    let mut total_bytes: u64 = 0;

    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Frame(json) => {
                chunk_count += 1;
                total_bytes += json.len() as u64;
                // Log first chunk and every 50th chunk
                if chunk_count == 1 || chunk_count.is_multiple_of(50) {
                    tracing::debug!(
                        call_id = %call_id,
                        chunk = chunk_count,
                        json_len = json.len(),
                        total_bytes,
                        "Sending audio chunk to Gemini"
                    );
                }
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    tracing::warn!(call_id = %call_id, error = %e, "WebSocket send failed, closing outbound loop");
                    let _ = events.send(BridgeEvent::SessionError(SessionError::network(
                        e.to_string(),
                    )));
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    tracing::debug!(call_id = %call_id, chunks = chunk_count, "Outbound loop terminated");
}

async fn inbound_loop(
    mut source: WsSource,
    events: EventSender,
    cancel: CancellationToken,
    call_id: String,
) {
    let start_time = std::time::Instant::now();
    let mut audio_count: u64 = 0;

    let reason = loop {
        let msg_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = source.next() => match next {
                Some(msg_result) => msg_result,
                None => break Some("stream ended".to_string()),
            },
        };

        let msg = match msg_result {
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(call_id = %call_id, close_frame = ?frame, "Gemini Live connection closed");
                break frame.map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()));
            }
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Gemini Live receive error");
                let _ = events.send(BridgeEvent::SessionError(SessionError::network(e.to_string())));
                break Some(e.to_string());
            }
        };

        let Some(text) = frame_text(&msg) else {
            if let WsMessage::Binary(data) = &msg {
                tracing::warn!(
                    call_id = %call_id,
                    len = data.len(),
                    "Unexpected non-JSON binary frame from Gemini Live, skipping"
                );
            }
            continue;
        };

        let event = match parse_server_message(text) {
            Ok(server) if server.is_setup_complete() && server.server_content.is_none() => continue,
            Ok(server) => {
                if server.audio_data().is_some() {
                    audio_count += 1;
                    if audio_count == 1 || audio_count.is_multiple_of(50) {
                        tracing::debug!(
                            call_id = %call_id,
                            t = format!("{:.1}s", start_time.elapsed().as_secs_f32()),
                            audio_n = audio_count,
                            "Gemini audio response"
                        );
                    }
                }
                BridgeEvent::Server(server)
            }
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Unparseable server message");
                BridgeEvent::SessionError(SessionError::protocol(e.to_string()))
            }
        };
        if events.send(event).is_err() {
            tracing::debug!(call_id = %call_id, "Event queue dropped, closing inbound loop");
            return;
        }
    };

    let _ = events.send(BridgeEvent::SessionClosed { reason });
    tracing::debug!(call_id = %call_id, audio_responses = audio_count, "Inbound loop terminated");
}
