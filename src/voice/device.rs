//! Audio device seams.
//!
//! The bridge never touches a sound card directly. An [`AudioBackend`]
//! hands out one [`CaptureDevice`] and one [`PlaybackDevice`] per call;
//! both report back through the call's event queue.
//!
//! | Implementor | Where used |
//! |---|---|
//! | `CpalBackend` | CLI: default microphone and speakers via cpal |
//! | test doubles | unit and integration tests, with a manual clock |

use async_trait::async_trait;

use super::error::VoiceResult;
use super::events::{EventSender, FragmentId};

/// Decoded mono audio ready to schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Rate frames must be delivered at (resampled if the device differs).
    pub sample_rate: u32,
    /// Samples per delivered frame.
    pub frame_size: usize,
    /// Substring of the device name; `None` picks the default input.
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackConfig {
    /// Rate of the fragments that will be scheduled.
    pub sample_rate: u32,
    /// Linear gain applied to every fragment.
    pub gain: f32,
    /// Substring of the device name; `None` picks the default output.
    pub device_name: Option<String>,
}

/// Creates the per-call device pair.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone. Does not deliver frames until `start`.
    async fn open_capture(&self, config: &CaptureConfig) -> VoiceResult<Box<dyn CaptureDevice>>;

    /// Open the output device. Natural fragment completion is reported as
    /// `FragmentEnded` on `events`.
    async fn open_playback(
        &self,
        config: &PlaybackConfig,
        events: EventSender,
    ) -> VoiceResult<Box<dyn PlaybackDevice>>;
}

/// An acquired microphone.
pub trait CaptureDevice: Send {
    /// Wire up the frame processor; frames go to `events` as `FrameCaptured`.
    fn start(&mut self, events: EventSender) -> VoiceResult<()>;

    /// Stop delivering frames and release the device. Idempotent.
    fn close(&mut self) -> VoiceResult<()>;
}

/// An output device with a monotonic clock and a shared gain stage.
pub trait PlaybackDevice: Send {
    /// Current position of the output clock, in seconds.
    fn current_time(&self) -> f64;

    /// Start `buffer` at `start_at` on the output clock.
    fn play(&mut self, id: FragmentId, buffer: AudioBuffer, start_at: f64) -> VoiceResult<()>;

    /// Stop a fragment early. Stopping one that already ended is not an error.
    fn stop(&mut self, id: FragmentId) -> VoiceResult<()>;

    /// Stop everything and release the device. Idempotent.
    fn close(&mut self) -> VoiceResult<()>;
}
