//! The realtime voice bridge.
//!
//! ## Architecture
//!
//! ```text
//! mic ─▸ CaptureDevice ──FrameCaptured──┐
//!                                        │
//! LiveSession ──SessionOpened / Server / ├─▸ event queue ─▸ CallDriver ─▸ LiveSession (frames)
//!               SessionError / Closed ───┤                     │
//!                                        │                     └─▸ PlaybackDevice (fragments)
//! PlaybackDevice ──FragmentEnded─────────┘
//! ```
//!
//! One [`CallDriver`] task owns every per-call resource and is the only
//! consumer of the queue, so the playback schedule needs no lock.
//! [`VoiceBridge::start`] and [`VoiceBridge::stop`] are serialized by an
//! async mutex; `stop` cancels any in-flight `start` first.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::device::{
    AudioBackend, AudioBuffer, CaptureConfig, CaptureDevice, PlaybackConfig, PlaybackDevice,
};
use super::error::VoiceError;
use super::events::{event_channel, BridgeEvent, CapturedFrame, EventReceiver, EventSender};
use super::language::{build_system_instruction, VoiceLanguage, DEFAULT_PERSONA};
use super::pcm;
use super::protocol::{
    LiveServerMessage, RealtimeInput, SessionSetup, DEFAULT_MODEL, DEFAULT_VOICE, FRAME_SIZE,
    INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE,
};
use super::schedule::PlaybackSchedule;
use super::session::{ErrorPolicy, LiveConnector, LiveSession, SessionError};
use super::status::ConnectionStatus;

/// Bound on a session's own close during teardown.
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

// ── Callbacks ─────────────────────────────────────────────────────

pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;
pub type VolumeCallback = Arc<dyn Fn(f32) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Push-based notifications for the UI layer.
#[derive(Clone, Default)]
pub struct BridgeCallbacks {
    pub on_status_change: Option<StatusCallback>,
    pub on_volume_update: Option<VolumeCallback>,
    pub on_close: Option<CloseCallback>,
}

impl BridgeCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_status_change(mut self, f: impl Fn(ConnectionStatus) + Send + Sync + 'static) -> Self {
        self.on_status_change = Some(Arc::new(f));
        self
    }

    pub fn on_volume_update(mut self, f: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.on_volume_update = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    fn status(&self, status: ConnectionStatus) {
        if let Some(cb) = &self.on_status_change {
            cb(status);
        }
    }

    fn volume(&self, level: f32) {
        if let Some(cb) = &self.on_volume_update {
            cb(level);
        }
    }

    fn closed(&self) {
        if let Some(cb) = &self.on_close {
            cb();
        }
    }
}

impl std::fmt::Debug for BridgeCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeCallbacks")
            .field("on_status_change", &self.on_status_change.is_some())
            .field("on_volume_update", &self.on_volume_update.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

// ── Configuration and stats ───────────────────────────────────────

/// Everything a call needs besides its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub model: String,
    pub voice_name: String,
    /// Base tutor persona; the language and voice-mode directives are appended.
    pub persona: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub output_gain: f32,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub error_policy: ErrorPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            persona: DEFAULT_PERSONA.to_string(),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            output_gain: 1.0,
            input_device: None,
            output_device: None,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl BridgeConfig {
    fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.input_sample_rate,
            frame_size: self.frame_size,
            device_name: self.input_device.clone(),
        }
    }

    fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: self.output_sample_rate,
            gain: self.output_gain,
            device_name: self.output_device.clone(),
        }
    }

    fn session_setup(&self, language: VoiceLanguage) -> SessionSetup {
        SessionSetup {
            model: self.model.clone(),
            voice_name: self.voice_name.clone(),
            system_instruction: build_system_instruction(&self.persona, language),
        }
    }
}

/// Per-call counters. Reset on every `start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub fragments_scheduled: u64,
    pub fragments_skipped: u64,
    pub interruptions: u64,
    pub turns_completed: u64,
}

// ── Shared state and status reporting ─────────────────────────────

#[derive(Default)]
struct Shared {
    status: Mutex<ConnectionStatus>,
    stats: Mutex<BridgeStats>,
    muted: AtomicBool,
}

#[derive(Clone)]
struct Reporter {
    callbacks: BridgeCallbacks,
    shared: Arc<Shared>,
}

impl Reporter {
    fn current(&self) -> ConnectionStatus {
        *self.shared.status.lock()
    }

    /// Move to `next` if the state machine allows it, then notify.
    fn transition(&self, call_id: &str, next: ConnectionStatus) -> bool {
        let previous = {
            let mut status = self.shared.status.lock();
            if !status.can_transition_to(next) {
                tracing::debug!(
                    call_id = %call_id,
                    from = %*status,
                    to = %next,
                    "Ignoring invalid status transition"
                );
                return false;
            }
            std::mem::replace(&mut *status, next)
        };
        tracing::info!(call_id = %call_id, from = %previous, to = %next, "Voice call status");
        self.callbacks.status(next);
        true
    }

    /// Mark a call torn down by `stop` as over without notifying.
    /// `on_close` is the notification for that path.
    fn settle(&self, call_id: &str) {
        let mut status = self.shared.status.lock();
        if *status != ConnectionStatus::Uninitialized && !status.is_terminal() {
            tracing::debug!(call_id = %call_id, from = %*status, "Call stopped, marking disconnected");
            *status = ConnectionStatus::Disconnected;
        }
    }

    /// Surface a status without changing state (non-fatal errors).
    fn report(&self, status: ConnectionStatus) {
        self.callbacks.status(status);
    }

    fn stats(&self, f: impl FnOnce(&mut BridgeStats)) {
        f(&mut self.shared.stats.lock());
    }
}

// ── Per-call resources ────────────────────────────────────────────

#[derive(Default)]
struct CallResources {
    session: Option<Box<dyn LiveSession>>,
    capture: Option<Box<dyn CaptureDevice>>,
    playback: Option<Box<dyn PlaybackDevice>>,
}

impl CallResources {
    /// Release everything that exists. Never fails; errors are logged.
    async fn release(&mut self, call_id: &str, schedule: &mut PlaybackSchedule) {
        if let Some(mut session) = self.session.take() {
            match tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(call_id = %call_id, error = %e, "Ignoring session close error");
                }
                Err(_) => {
                    tracing::warn!(call_id = %call_id, "Session close timed out, dropping it");
                }
            }
        }
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.close() {
                tracing::debug!(call_id = %call_id, error = %e, "Ignoring capture close error");
            }
        }
        let pending = schedule.drain();
        if let Some(mut playback) = self.playback.take() {
            for id in pending {
                let _ = playback.stop(id);
            }
            if let Err(e) = playback.close() {
                tracing::debug!(call_id = %call_id, error = %e, "Ignoring playback close error");
            }
        }
        tracing::debug!(call_id = %call_id, "Call resources released");
    }
}

// ── Call driver ───────────────────────────────────────────────────

/// Why a driver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverExit {
    /// `stop` or a replacing `start` cancelled the call.
    Cancelled,
    /// The call reached a terminal status on its own.
    Terminal(ConnectionStatus),
}

/// Owns one call's resources and applies its events in order.
pub(crate) struct CallDriver {
    call_id: String,
    config: BridgeConfig,
    reporter: Reporter,
    resources: CallResources,
    schedule: PlaybackSchedule,
    events_tx: EventSender,
}

impl CallDriver {
    async fn run(mut self, mut events: EventReceiver, cancel: CancellationToken) -> DriverExit {
        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break DriverExit::Cancelled,
                event = events.recv() => {
                    // The driver holds a sender, so the queue only closes on cancellation.
                    let Some(event) = event else { break DriverExit::Cancelled };
                    // A handler may be parked on a stalled send.
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break DriverExit::Cancelled,
                        exit = self.handle(event) => {
                            if let Some(exit) = exit {
                                break exit;
                            }
                        }
                    }
                }
            }
        };

        self.resources.release(&self.call_id, &mut self.schedule).await;
        if let DriverExit::Terminal(status) = exit {
            tracing::info!(call_id = %self.call_id, status = %status, "Voice call ended");
            self.reporter.callbacks.closed();
        }
        exit
    }

    /// Apply one event. Returns the exit once the call reaches a terminal status.
    pub(crate) async fn handle(&mut self, event: BridgeEvent) -> Option<DriverExit> {
        match event {
            BridgeEvent::SessionOpened => self.on_opened(),
            BridgeEvent::FrameCaptured(frame) => self.on_frame(frame).await,
            BridgeEvent::Server(message) => self.on_server_message(message),
            BridgeEvent::SessionError(error) => self.on_session_error(error),
            BridgeEvent::SessionClosed { reason } => self.on_closed(reason),
            BridgeEvent::FragmentEnded(id) => {
                if self.schedule.finish(id) {
                    tracing::trace!(call_id = %self.call_id, fragment = id, "Fragment finished");
                }
            }
        }
        let status = self.reporter.current();
        status.is_terminal().then_some(DriverExit::Terminal(status))
    }

    fn on_opened(&mut self) {
        if !self
            .reporter
            .transition(&self.call_id, ConnectionStatus::Connected)
        {
            return;
        }
        // The frame processor is wired only once the session is open.
        let Some(capture) = self.resources.capture.as_mut() else {
            return;
        };
        if let Err(e) = capture.start(self.events_tx.clone()) {
            tracing::error!(call_id = %self.call_id, error = %e, "Failed to start capture");
            self.reporter
                .transition(&self.call_id, ConnectionStatus::Error);
        }
    }

    async fn on_frame(&mut self, frame: CapturedFrame) {
        self.reporter.stats(|s| s.frames_captured += 1);
        if !self.reporter.current().is_streaming() {
            tracing::trace!(call_id = %self.call_id, seq = frame.seq, "Dropping frame before open");
            return;
        }

        self.reporter.callbacks.volume(pcm::rms(&frame.samples));
        if self.reporter.shared.muted.load(Ordering::Relaxed) {
            return;
        }

        let Some(session) = self.resources.session.as_mut() else {
            return;
        };
        let input = RealtimeInput::pcm(
            pcm::encode_frame(&frame.samples),
            self.config.input_sample_rate,
        );
        match session.send_realtime_input(input).await {
            Ok(()) => {
                let mut sent = 0;
                self.reporter.stats(|s| {
                    s.frames_sent += 1;
                    sent = s.frames_sent;
                });
                // Log first frame and every 50th
                if sent == 1 || sent.is_multiple_of(50) {
                    tracing::debug!(
                        call_id = %self.call_id,
                        frames_sent = sent,
                        samples = frame.samples.len(),
                        "Streaming microphone audio"
                    );
                }
            }
            Err(e) => self.on_session_error(SessionError::network(e.to_string())),
        }
    }

    fn on_server_message(&mut self, message: LiveServerMessage) {
        if let Some(data) = message.audio_data() {
            self.play_fragment(data);
        }
        if let Some(text) = message.text() {
            tracing::debug!(call_id = %self.call_id, text = %text, "Model text (not voiced)");
        }
        if message.is_interrupted() {
            self.interrupt();
        }
        if message.is_turn_complete() {
            self.reporter.stats(|s| s.turns_completed += 1);
            tracing::debug!(call_id = %self.call_id, "Model turn complete");
        }
        if let Some(go_away) = &message.go_away {
            tracing::warn!(
                call_id = %self.call_id,
                time_left = go_away.time_left.as_deref().unwrap_or("unknown"),
                "Service is about to close the session"
            );
        }
        if let Some(error) = message.error_message() {
            self.on_session_error(SessionError::server(error));
        }
    }

    fn play_fragment(&mut self, data: &str) {
        let Some(playback) = self.resources.playback.as_mut() else {
            return;
        };

        let samples = match pcm::decode_fragment(data) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(call_id = %self.call_id, error = %e, "Skipping undecodable audio fragment");
                self.reporter.stats(|s| s.fragments_skipped += 1);
                return;
            }
        };

        let buffer = AudioBuffer::new(samples, self.config.output_sample_rate);
        let now = playback.current_time();
        let fragment = self.schedule.schedule(now, buffer.duration());
        if let Err(e) = playback.play(fragment.id, buffer, fragment.start) {
            tracing::warn!(call_id = %self.call_id, error = %e, "Failed to schedule fragment");
            self.schedule.finish(fragment.id);
            self.reporter.stats(|s| s.fragments_skipped += 1);
            return;
        }
        self.reporter.stats(|s| s.fragments_scheduled += 1);
        tracing::trace!(
            call_id = %self.call_id,
            fragment = fragment.id,
            start = fragment.start,
            duration = fragment.duration,
            "Fragment scheduled"
        );
    }

    fn interrupt(&mut self) {
        let Some(playback) = self.resources.playback.as_mut() else {
            return;
        };
        let now = playback.current_time();
        let stopped = self.schedule.interrupt(now);
        for id in &stopped {
            // Best-effort: the fragment may have just ended.
            if let Err(e) = playback.stop(*id) {
                tracing::trace!(call_id = %self.call_id, fragment = id, error = %e, "Stop failed");
            }
        }
        self.reporter.stats(|s| s.interruptions += 1);
        tracing::info!(
            call_id = %self.call_id,
            stopped = stopped.len(),
            at = now,
            "Playback interrupted"
        );
    }

    fn on_session_error(&mut self, error: SessionError) {
        if self.config.error_policy.is_fatal(error.kind) {
            tracing::error!(
                call_id = %self.call_id,
                kind = error.kind.as_str(),
                error = %error.message,
                "Fatal session error, ending call"
            );
            self.reporter
                .transition(&self.call_id, ConnectionStatus::Error);
            return;
        }
        tracing::warn!(
            call_id = %self.call_id,
            kind = error.kind.as_str(),
            error = %error.message,
            "Session error, continuing"
        );
        self.reporter.report(ConnectionStatus::Error);
    }

    fn on_closed(&mut self, reason: Option<String>) {
        let status = if self.reporter.current() == ConnectionStatus::Connected {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::FailedToConnect
        };
        tracing::info!(
            call_id = %self.call_id,
            reason = reason.as_deref().unwrap_or("none"),
            "Remote session closed"
        );
        self.reporter.transition(&self.call_id, status);
    }

    #[cfg(test)]
    pub(crate) fn schedule(&self) -> &PlaybackSchedule {
        &self.schedule
    }
}

// ── Bridge ────────────────────────────────────────────────────────

struct ActiveCall {
    call_id: String,
    cancel: CancellationToken,
    driver: JoinHandle<DriverExit>,
}

enum OpenFailure {
    Cancelled,
    Failed(ConnectionStatus),
}

/// Duplex voice conversation with the remote tutor.
pub struct VoiceBridge {
    config: BridgeConfig,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn LiveConnector>,
    reporter: Reporter,
    attempt: Mutex<Option<CancellationToken>>,
    active: tokio::sync::Mutex<Option<ActiveCall>>,
    call_seq: AtomicU64,
}

impl VoiceBridge {
    pub fn new(
        config: BridgeConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn LiveConnector>,
        callbacks: BridgeCallbacks,
    ) -> Self {
        Self {
            config,
            backend,
            connector,
            reporter: Reporter {
                callbacks,
                shared: Arc::new(Shared::default()),
            },
            attempt: Mutex::new(None),
            active: tokio::sync::Mutex::new(None),
            call_seq: AtomicU64::new(0),
        }
    }

    /// Current call status. `Disconnected` once `stop` has torn a call down.
    pub fn status(&self) -> ConnectionStatus {
        self.reporter.current()
    }

    pub fn stats(&self) -> BridgeStats {
        *self.reporter.shared.stats.lock()
    }

    /// While muted, frames are still captured and metered but not sent.
    pub fn set_muted(&self, muted: bool) {
        self.reporter.shared.muted.store(muted, Ordering::Relaxed);
        tracing::info!(muted, "Microphone mute toggled");
    }

    /// Start a call in `language`, replacing any call already running.
    ///
    /// Failures are reported through the status callback, never returned.
    pub async fn start(&self, language: VoiceLanguage) {
        let token = CancellationToken::new();
        if let Some(previous) = self.attempt.lock().replace(token.clone()) {
            previous.cancel();
        }

        let mut active = self.active.lock().await;
        if let Some(call) = active.take() {
            tracing::info!(call_id = %call.call_id, "Replacing running voice call");
            let call_id = call.call_id.clone();
            if Self::shutdown(call).await {
                self.reporter.callbacks.closed();
            }
            self.reporter.settle(&call_id);
        }
        if token.is_cancelled() {
            return;
        }

        *self.reporter.shared.stats.lock() = BridgeStats::default();
        let call_id = format!("call-{}", self.call_seq.fetch_add(1, Ordering::Relaxed) + 1);
        tracing::info!(
            call_id = %call_id,
            language = language.display_name(),
            model = %self.config.model,
            "Starting voice call"
        );

        match self.open(&call_id, language, &token).await {
            Ok(call) => *active = Some(call),
            Err(OpenFailure::Cancelled) => {
                tracing::debug!(call_id = %call_id, "Voice call start cancelled");
            }
            Err(OpenFailure::Failed(status)) => {
                tracing::warn!(call_id = %call_id, status = %status, "Voice call failed to start");
                self.reporter.callbacks.closed();
            }
        }
    }

    /// Release every resource. Idempotent; always reports closure.
    pub async fn stop(&self) {
        if let Some(token) = self.attempt.lock().take() {
            token.cancel();
        }
        let mut active = self.active.lock().await;
        if let Some(call) = active.take() {
            tracing::info!(call_id = %call.call_id, "Stopping voice call");
            let call_id = call.call_id.clone();
            Self::shutdown(call).await;
            self.reporter.settle(&call_id);
        } else {
            // A start cancelled mid-acquire leaves its progress status behind.
            self.reporter.settle("none");
        }
        self.reporter.callbacks.closed();
    }

    /// Cancel and join a call. Returns `true` if closure still needs reporting.
    async fn shutdown(call: ActiveCall) -> bool {
        call.cancel.cancel();
        match call.driver.await {
            Ok(DriverExit::Cancelled) => true,
            Ok(DriverExit::Terminal(_)) => false,
            Err(e) => {
                tracing::warn!(call_id = %call.call_id, error = %e, "Voice call driver panicked");
                true
            }
        }
    }

    async fn open(
        &self,
        call_id: &str,
        language: VoiceLanguage,
        token: &CancellationToken,
    ) -> Result<ActiveCall, OpenFailure> {
        let reporter = self.reporter.clone();
        reporter.transition(call_id, ConnectionStatus::Initializing);

        let (events_tx, events_rx) = event_channel();
        let mut resources = CallResources::default();
        let mut schedule = PlaybackSchedule::new();

        let outcome = self
            .acquire(call_id, language, token, &events_tx, &mut resources)
            .await;
        if let Err(failure) = outcome {
            if let OpenFailure::Failed(status) = &failure {
                reporter.transition(call_id, *status);
            }
            resources.release(call_id, &mut schedule).await;
            return Err(failure);
        }

        let driver = CallDriver {
            call_id: call_id.to_string(),
            config: self.config.clone(),
            reporter,
            resources,
            schedule,
            events_tx,
        };
        let cancel = token.clone();
        let handle = tokio::spawn(driver.run(events_rx, cancel.clone()));

        Ok(ActiveCall {
            call_id: call_id.to_string(),
            cancel,
            driver: handle,
        })
    }

    /// Output device, then microphone, then the remote session.
    async fn acquire(
        &self,
        call_id: &str,
        language: VoiceLanguage,
        token: &CancellationToken,
        events_tx: &EventSender,
        resources: &mut CallResources,
    ) -> Result<(), OpenFailure> {
        let playback_config = self.config.playback_config();
        let playback = cancellable(
            token,
            self.backend.open_playback(&playback_config, events_tx.clone()),
        )
        .await?
        .map_err(|e| device_failure(call_id, "output", &e))?;
        resources.playback = Some(playback);

        let capture_config = self.config.capture_config();
        let capture = cancellable(token, self.backend.open_capture(&capture_config))
            .await?
            .map_err(|e| device_failure(call_id, "microphone", &e))?;
        resources.capture = Some(capture);

        self.reporter
            .transition(call_id, ConnectionStatus::Connecting);

        let setup = self.config.session_setup(language);
        let session = cancellable(
            token,
            self.connector.connect(call_id, &setup, events_tx.clone()),
        )
        .await?
        .map_err(|e| {
            tracing::error!(call_id = %call_id, error = %e, "Failed to open live session");
            OpenFailure::Failed(ConnectionStatus::FailedToConnect)
        })?;
        resources.session = Some(session);
        Ok(())
    }
}

impl Drop for VoiceBridge {
    fn drop(&mut self) {
        // The driver tears its own resources down once cancelled.
        if let Some(token) = self.attempt.lock().take() {
            token.cancel();
        }
    }
}

fn device_failure(call_id: &str, which: &str, error: &VoiceError) -> OpenFailure {
    tracing::error!(call_id = %call_id, device = which, error = %error, "Audio device unavailable");
    OpenFailure::Failed(ConnectionStatus::Error)
}

async fn cancellable<F: std::future::Future>(
    token: &CancellationToken,
    fut: F,
) -> Result<F::Output, OpenFailure> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(OpenFailure::Cancelled),
        out = fut => Ok(out),
    }
}
