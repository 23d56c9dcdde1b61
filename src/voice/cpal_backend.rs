//! Sound-card backend built on cpal.
//!
//! A `cpal::Stream` is not `Send`, so each stream lives on its own device
//! thread for the lifetime of a call. The thread builds and starts the
//! stream, reports the outcome once, then parks until it is told to stop.
//!
//! Capture downmixes to mono, resamples to the requested rate and cuts
//! fixed-size frames. Playback mixes every scheduled fragment against a
//! frame counter, which is the device clock the scheduler reads.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use parking_lot::Mutex;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::device::{
    AudioBackend, AudioBuffer, CaptureConfig, CaptureDevice, PlaybackConfig, PlaybackDevice,
};
use super::error::{VoiceError, VoiceResult};
use super::events::{BridgeEvent, CapturedFrame, EventSender, FragmentId};
use super::pcm::{downmix, LinearResampler};

/// Names of the available devices, for the `devices` command.
#[derive(Debug, Clone, Default)]
pub struct DeviceListing {
    pub default_input: Option<String>,
    pub default_output: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Default host audio backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn list_devices() -> VoiceResult<DeviceListing> {
        let host = cpal::default_host();
        Ok(DeviceListing {
            default_input: host.default_input_device().and_then(|d| d.name().ok()),
            default_output: host.default_output_device().and_then(|d| d.name().ok()),
            inputs: device_names(host.input_devices()?),
            outputs: device_names(host.output_devices()?),
        })
    }
}

fn device_names(devices: impl Iterator<Item = cpal::Device>) -> Vec<String> {
    devices.filter_map(|d| d.name().ok()).collect()
}

fn find_device(wanted: Option<&str>, input: bool) -> VoiceResult<cpal::Device> {
    let host = cpal::default_host();
    let kind = if input { "input" } else { "output" };

    let Some(wanted) = wanted.map(str::to_lowercase) else {
        let device = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return device.ok_or_else(|| VoiceError::AudioDevice(format!("no default {kind} device")));
    };

    let devices: Vec<cpal::Device> = if input {
        host.input_devices()?.collect()
    } else {
        host.output_devices()?.collect()
    };
    devices
        .into_iter()
        .find(|d| {
            d.name()
                .map(|n| n.to_lowercase().contains(&wanted))
                .unwrap_or(false)
        })
        .ok_or_else(|| VoiceError::AudioDevice(format!("no {kind} device matching '{wanted}'")))
}

#[async_trait]
impl AudioBackend for CpalBackend {
    async fn open_capture(&self, config: &CaptureConfig) -> VoiceResult<Box<dyn CaptureDevice>> {
        let sink = Arc::new(Mutex::new(CaptureSink::new(config.sample_rate, config.frame_size)));
        let device_name = config.device_name.clone();
        let thread_sink = Arc::clone(&sink);

        let thread = spawn_device_thread("learnbro-capture", move || {
            let device = find_device(device_name.as_deref(), true)?;
            let supported = device.default_input_config()?;
            let stream_config: StreamConfig = supported.clone().into();
            thread_sink
                .lock()
                .configure(stream_config.sample_rate.0, stream_config.channels);

            tracing::info!(
                device = %device.name().unwrap_or_default(),
                rate = stream_config.sample_rate.0,
                channels = stream_config.channels,
                format = ?supported.sample_format(),
                "Microphone opened"
            );

            match supported.sample_format() {
                SampleFormat::F32 => build_input::<f32>(&device, &stream_config, thread_sink),
                SampleFormat::I16 => build_input::<i16>(&device, &stream_config, thread_sink),
                SampleFormat::U16 => build_input::<u16>(&device, &stream_config, thread_sink),
                other => Err(VoiceError::AudioDevice(format!(
                    "unsupported input sample format {other:?}"
                ))),
            }
        })
        .await?;

        Ok(Box::new(CpalCapture {
            sink,
            thread: Some(thread),
        }))
    }

    async fn open_playback(
        &self,
        config: &PlaybackConfig,
        events: EventSender,
    ) -> VoiceResult<Box<dyn PlaybackDevice>> {
        let mixer = Arc::new(Mutex::new(Mixer::new(config.gain, events)));
        let device_name = config.device_name.clone();
        let thread_mixer = Arc::clone(&mixer);

        let thread = spawn_device_thread("learnbro-playback", move || {
            let device = find_device(device_name.as_deref(), false)?;
            let supported = device.default_output_config()?;
            let stream_config: StreamConfig = supported.clone().into();
            thread_mixer
                .lock()
                .configure(stream_config.sample_rate.0, stream_config.channels);

            tracing::info!(
                device = %device.name().unwrap_or_default(),
                rate = stream_config.sample_rate.0,
                channels = stream_config.channels,
                format = ?supported.sample_format(),
                "Speaker opened"
            );

            match supported.sample_format() {
                SampleFormat::F32 => build_output::<f32>(&device, &stream_config, thread_mixer),
                SampleFormat::I16 => build_output::<i16>(&device, &stream_config, thread_mixer),
                SampleFormat::U16 => build_output::<u16>(&device, &stream_config, thread_mixer),
                other => Err(VoiceError::AudioDevice(format!(
                    "unsupported output sample format {other:?}"
                ))),
            }
        })
        .await?;

        Ok(Box::new(CpalPlayback {
            mixer,
            thread: Some(thread),
        }))
    }
}

// ── Device thread ─────────────────────────────────────────────────

struct DeviceThread {
    stop: Option<std_mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceThread {
    /// Wake the parked thread so it drops its stream.
    ///
    /// On a tokio runtime the join moves to the blocking pool; device
    /// teardown can take a while and must not stall a worker.
    fn stop(&mut self) {
        // Dropping the sender wakes the parked thread.
        self.stop.take();
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || join_device_thread(handle));
            }
            Err(_) => join_device_thread(handle),
        }
    }
}

fn join_device_thread(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        tracing::warn!("Audio device thread panicked");
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn spawn_device_thread<F>(name: &'static str, build: F) -> VoiceResult<DeviceThread>
where
    F: FnOnce() -> VoiceResult<Stream> + Send + 'static,
{
    spawn_parked(name, move || {
        let stream = build()?;
        stream.play()?;
        Ok(stream)
    })
    .await
}

/// Run `build` on a named thread and keep its result alive there until stopped.
async fn spawn_parked<T, F>(name: &'static str, build: F) -> VoiceResult<DeviceThread>
where
    T: 'static,
    F: FnOnce() -> VoiceResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let held = match build() {
                    Ok(held) => held,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until stop() drops the sender.
                let _ = stop_rx.recv();
                drop(held);
            })?;

        let mut thread = DeviceThread {
            stop: Some(stop_tx),
            handle: Some(handle),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(thread),
            Ok(Err(e)) => {
                thread.stop();
                Err(e)
            }
            Err(_) => {
                thread.stop();
                Err(VoiceError::AudioStream(format!("{name} thread exited during setup")))
            }
        }
    })
    .await
    .map_err(|e| VoiceError::AudioStream(format!("device setup task failed: {e}")))?
}

// ── Capture ───────────────────────────────────────────────────────

/// Turns device callbacks into fixed-size mono frames.
struct CaptureSink {
    target_rate: u32,
    frame_size: usize,
    channels: u16,
    resampler: LinearResampler,
    pending: Vec<f32>,
    events: Option<EventSender>,
    seq: u64,
}

impl CaptureSink {
    fn new(target_rate: u32, frame_size: usize) -> Self {
        Self {
            target_rate,
            frame_size: frame_size.max(1),
            channels: 1,
            resampler: LinearResampler::new(target_rate, target_rate),
            pending: Vec::new(),
            events: None,
            seq: 0,
        }
    }

    fn configure(&mut self, device_rate: u32, channels: u16) {
        self.channels = channels;
        self.resampler = LinearResampler::new(device_rate, self.target_rate);
    }

    /// Interleaved device samples in; frames out once started.
    fn push(&mut self, interleaved: &[f32]) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let mono = downmix(interleaved, self.channels);
        let resampled = if self.resampler.is_passthrough() {
            mono
        } else {
            self.resampler.process(&mono)
        };
        self.pending.extend_from_slice(&resampled);

        while self.pending.len() >= self.frame_size {
            let samples: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            let frame = CapturedFrame {
                seq: self.seq,
                samples,
            };
            self.seq += 1;
            if events.send(BridgeEvent::FrameCaptured(frame)).is_err() {
                self.events = None;
                self.pending.clear();
                return;
            }
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    sink: Arc<Mutex<CaptureSink>>,
) -> VoiceResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
            sink.lock().push(&samples);
        },
        |err| tracing::warn!(error = %err, "Microphone stream error"),
        None,
    )?;
    Ok(stream)
}

struct CpalCapture {
    sink: Arc<Mutex<CaptureSink>>,
    thread: Option<DeviceThread>,
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self, events: EventSender) -> VoiceResult<()> {
        if self.thread.is_none() {
            return Err(VoiceError::AudioStream("microphone already closed".to_string()));
        }
        self.sink.lock().events = Some(events);
        Ok(())
    }

    fn close(&mut self) -> VoiceResult<()> {
        {
            let mut sink = self.sink.lock();
            sink.events = None;
            sink.pending.clear();
        }
        if let Some(mut thread) = self.thread.take() {
            thread.stop();
            tracing::debug!("Microphone released");
        }
        Ok(())
    }
}

// ── Playback ──────────────────────────────────────────────────────

struct Voice {
    id: FragmentId,
    buffer: AudioBuffer,
    start: f64,
}

impl Voice {
    fn end(&self) -> f64 {
        self.start + self.buffer.duration()
    }

    /// Linearly interpolated sample at clock time `t`, silence outside.
    fn sample_at(&self, t: f64) -> f32 {
        let pos = (t - self.start) * f64::from(self.buffer.sample_rate);
        if pos < 0.0 {
            return 0.0;
        }
        let idx = pos as usize;
        let samples = &self.buffer.samples;
        let Some(&a) = samples.get(idx) else {
            return 0.0;
        };
        let b = samples.get(idx + 1).copied().unwrap_or(a);
        let frac = (pos - idx as f64) as f32;
        a + (b - a) * frac
    }
}

/// Device-clock mixer shared with the output callback.
struct Mixer {
    frames: u64,
    device_rate: u32,
    channels: u16,
    gain: f32,
    voices: Vec<Voice>,
    events: EventSender,
}

impl Mixer {
    fn new(gain: f32, events: EventSender) -> Self {
        Self {
            frames: 0,
            device_rate: 0,
            channels: 1,
            gain,
            voices: Vec::new(),
            events,
        }
    }

    fn configure(&mut self, device_rate: u32, channels: u16) {
        self.device_rate = device_rate;
        self.channels = channels.max(1);
    }

    fn now(&self) -> f64 {
        if self.device_rate == 0 {
            return 0.0;
        }
        self.frames as f64 / f64::from(self.device_rate)
    }

    /// Fill one interleaved buffer and advance the clock.
    fn render(&mut self, out: &mut [f32]) {
        let channels = usize::from(self.channels);
        for frame in out.chunks_mut(channels) {
            let t = self.now();
            let mixed: f32 = self.voices.iter().map(|v| v.sample_at(t)).sum();
            frame.fill((mixed * self.gain).clamp(-1.0, 1.0));
            self.frames += 1;
        }

        let now = self.now();
        let events = &self.events;
        self.voices.retain(|voice| {
            if voice.end() <= now {
                let _ = events.send(BridgeEvent::FragmentEnded(voice.id));
                false
            } else {
                true
            }
        });
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> VoiceResult<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.resize(data.len(), 0.0);
            mixer.lock().render(&mut scratch);
            for (out, value) in data.iter_mut().zip(&scratch) {
                *out = T::from_sample(*value);
            }
        },
        |err| tracing::warn!(error = %err, "Speaker stream error"),
        None,
    )?;
    Ok(stream)
}

struct CpalPlayback {
    mixer: Arc<Mutex<Mixer>>,
    thread: Option<DeviceThread>,
}

impl PlaybackDevice for CpalPlayback {
    fn current_time(&self) -> f64 {
        self.mixer.lock().now()
    }

    fn play(&mut self, id: FragmentId, buffer: AudioBuffer, start_at: f64) -> VoiceResult<()> {
        if self.thread.is_none() {
            return Err(VoiceError::AudioStream("speaker already closed".to_string()));
        }
        self.mixer.lock().voices.push(Voice {
            id,
            buffer,
            start: start_at,
        });
        Ok(())
    }

    fn stop(&mut self, id: FragmentId) -> VoiceResult<()> {
        self.mixer.lock().voices.retain(|v| v.id != id);
        Ok(())
    }

    fn close(&mut self) -> VoiceResult<()> {
        self.mixer.lock().voices.clear();
        if let Some(mut thread) = self.thread.take() {
            thread.stop();
            tracing::debug!("Speaker released");
        }
        Ok(())
    }
}
