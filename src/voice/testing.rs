//! In-memory doubles for the device and session seams.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::bridge::BridgeCallbacks;
use super::device::{
    AudioBackend, AudioBuffer, CaptureConfig, CaptureDevice, PlaybackConfig, PlaybackDevice,
};
use super::error::{VoiceError, VoiceResult};
use super::events::{BridgeEvent, CapturedFrame, EventSender, FragmentId};
use super::pcm;
use super::protocol::{RealtimeInput, SessionSetup};
use super::session::{LiveConnector, LiveSession};
use super::status::ConnectionStatus;

/// Base64 PCM16LE of `seconds` of a constant tone at `rate`.
pub fn audio_of_duration(seconds: f64, rate: u32) -> String {
    let len = (seconds * f64::from(rate)).round() as usize;
    pcm::encode_frame(&vec![0.1; len])
}

/// Poll `cond` until it holds; panics after two seconds.
pub async fn wait_for(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Callbacks ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct CallbackLog {
    statuses: Arc<Mutex<Vec<ConnectionStatus>>>,
    volumes: Arc<Mutex<Vec<f32>>>,
    closes: Arc<AtomicUsize>,
}

impl CallbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> BridgeCallbacks {
        let statuses = Arc::clone(&self.statuses);
        let volumes = Arc::clone(&self.volumes);
        let closes = Arc::clone(&self.closes);
        BridgeCallbacks::new()
            .on_status_change(move |s| statuses.lock().push(s))
            .on_volume_update(move |v| volumes.lock().push(v))
            .on_close(move || {
                closes.fetch_add(1, Ordering::SeqCst);
            })
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().clone()
    }

    pub fn volumes(&self) -> Vec<f32> {
        self.volumes.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

// ── Playback ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Played {
    pub id: FragmentId,
    pub start: f64,
    pub duration: f64,
}

#[derive(Default)]
struct PlaybackState {
    now: f64,
    played: Vec<Played>,
    stopped: Vec<FragmentId>,
    closed: bool,
}

/// Test-side view of the output device; the clock only moves on `set_time`.
#[derive(Clone, Default)]
pub struct PlaybackProbe(Arc<Mutex<PlaybackState>>);

impl PlaybackProbe {
    pub fn set_time(&self, now: f64) {
        self.0.lock().now = now;
    }

    pub fn played(&self) -> Vec<Played> {
        self.0.lock().played.clone()
    }

    pub fn stopped(&self) -> Vec<FragmentId> {
        self.0.lock().stopped.clone()
    }

    pub fn closed(&self) -> bool {
        self.0.lock().closed
    }
}

struct ManualPlayback(PlaybackProbe);

impl PlaybackDevice for ManualPlayback {
    fn current_time(&self) -> f64 {
        self.0 .0.lock().now
    }

    fn play(&mut self, id: FragmentId, buffer: AudioBuffer, start_at: f64) -> VoiceResult<()> {
        self.0 .0.lock().played.push(Played {
            id,
            start: start_at,
            duration: buffer.duration(),
        });
        Ok(())
    }

    fn stop(&mut self, id: FragmentId) -> VoiceResult<()> {
        self.0 .0.lock().stopped.push(id);
        Ok(())
    }

    fn close(&mut self) -> VoiceResult<()> {
        self.0 .0.lock().closed = true;
        Ok(())
    }
}

// ── Capture ───────────────────────────────────────────────────────

#[derive(Default)]
struct CaptureState {
    events: Option<EventSender>,
    started: bool,
    closed: bool,
    seq: u64,
}

#[derive(Clone, Default)]
pub struct CaptureProbe(Arc<Mutex<CaptureState>>);

impl CaptureProbe {
    pub fn started(&self) -> bool {
        self.0.lock().started
    }

    pub fn closed(&self) -> bool {
        self.0.lock().closed
    }

    /// Deliver a frame as the processor would. `false` if not started.
    pub fn push_frame(&self, samples: Vec<f32>) -> bool {
        let mut state = self.0.lock();
        if !state.started || state.closed {
            return false;
        }
        let seq = state.seq;
        state.seq += 1;
        state
            .events
            .as_ref()
            .is_some_and(|tx| tx.send(BridgeEvent::FrameCaptured(CapturedFrame { seq, samples })).is_ok())
    }
}

struct FakeCapture(CaptureProbe);

impl CaptureDevice for FakeCapture {
    fn start(&mut self, events: EventSender) -> VoiceResult<()> {
        let mut state = self.0 .0.lock();
        state.events = Some(events);
        state.started = true;
        Ok(())
    }

    fn close(&mut self) -> VoiceResult<()> {
        let mut state = self.0 .0.lock();
        state.events = None;
        state.closed = true;
        Ok(())
    }
}

// ── Backend ───────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct FakeBackend {
    playback: PlaybackProbe,
    capture: CaptureProbe,
    deny_microphone: Arc<Mutex<Option<String>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn playback(&self) -> PlaybackProbe {
        self.playback.clone()
    }

    pub fn capture(&self) -> CaptureProbe {
        self.capture.clone()
    }

    pub fn deny_microphone(&self, reason: &str) {
        *self.deny_microphone.lock() = Some(reason.to_string());
    }
}

#[async_trait]
impl AudioBackend for FakeBackend {
    async fn open_capture(&self, _config: &CaptureConfig) -> VoiceResult<Box<dyn CaptureDevice>> {
        if let Some(reason) = self.deny_microphone.lock().clone() {
            return Err(VoiceError::AudioDevice(reason));
        }
        *self.capture.0.lock() = CaptureState::default();
        Ok(Box::new(FakeCapture(self.capture.clone())))
    }

    async fn open_playback(
        &self,
        _config: &PlaybackConfig,
        _events: EventSender,
    ) -> VoiceResult<Box<dyn PlaybackDevice>> {
        self.playback.0.lock().closed = false;
        Ok(Box::new(ManualPlayback(self.playback.clone())))
    }
}

// ── Sessions ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SessionProbe {
    events: EventSender,
    sent: Arc<Mutex<Vec<RealtimeInput>>>,
    closed: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
    stall_sends: Arc<AtomicBool>,
    stalled: Arc<AtomicUsize>,
}

impl SessionProbe {
    pub fn sent(&self) -> Vec<RealtimeInput> {
        self.sent.lock().clone()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Make every later send park forever, like a socket that stopped draining.
    pub fn stall_sends(&self) {
        self.stall_sends.store(true, Ordering::SeqCst);
    }

    /// Sends currently parked by `stall_sends`.
    pub fn stalled(&self) -> usize {
        self.stalled.load(Ordering::SeqCst)
    }

    /// Inject an event as if the remote side produced it.
    pub fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }
}

struct FakeSession {
    call_id: String,
    probe: SessionProbe,
    journal: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl LiveSession for FakeSession {
    async fn send_realtime_input(&mut self, input: RealtimeInput) -> VoiceResult<()> {
        if self.probe.fail_sends.load(Ordering::SeqCst) {
            return Err(VoiceError::Send("socket closed".to_string()));
        }
        if self.probe.stall_sends.load(Ordering::SeqCst) {
            self.probe.stalled.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        self.probe.sent.lock().push(input);
        Ok(())
    }

    async fn close(&mut self) -> VoiceResult<()> {
        if !self.probe.closed.swap(true, Ordering::SeqCst) {
            self.journal.lock().push(format!("close:{}", self.call_id));
        }
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorState {
    sessions: Vec<SessionProbe>,
    setups: Vec<SessionSetup>,
    fail_next: Option<String>,
    hold: bool,
}

/// Opens fake sessions that report `SessionOpened` straight away.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, reason: &str) {
        self.state.lock().fail_next = Some(reason.to_string());
    }

    /// Make every connect hang until cancelled.
    pub fn hold_connects(&self) {
        self.state.lock().hold = true;
    }

    /// Ordered `connect:` / `open:` / `close:` entries.
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn setups(&self) -> Vec<SessionSetup> {
        self.state.lock().setups.clone()
    }

    pub fn last_session(&self) -> SessionProbe {
        match self.state.lock().sessions.last() {
            Some(probe) => probe.clone(),
            None => panic!("no session was opened"),
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.state
            .lock()
            .sessions
            .iter()
            .filter(|s| !s.closed())
            .count()
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(
        &self,
        call_id: &str,
        setup: &SessionSetup,
        events: EventSender,
    ) -> VoiceResult<Box<dyn LiveSession>> {
        self.journal.lock().push(format!("connect:{call_id}"));
        let (hold, failure) = {
            let mut state = self.state.lock();
            state.setups.push(setup.clone());
            (state.hold, state.fail_next.take())
        };
        if hold {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = failure {
            return Err(VoiceError::Connect(reason));
        }

        let probe = SessionProbe {
            events: events.clone(),
            sent: Arc::default(),
            closed: Arc::default(),
            fail_sends: Arc::default(),
            stall_sends: Arc::default(),
            stalled: Arc::default(),
        };
        self.state.lock().sessions.push(probe.clone());
        let _ = events.send(BridgeEvent::SessionOpened);
        self.journal.lock().push(format!("open:{call_id}"));

        Ok(Box::new(FakeSession {
            call_id: call_id.to_string(),
            probe,
            journal: Arc::clone(&self.journal),
        }))
    }
}
