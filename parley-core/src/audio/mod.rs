//! Platform audio: microphone capture, output playback, device listing.
//!
//! # Design constraints
//!
//! The cpal callbacks run on an OS audio thread at elevated priority. They
//! **must not** block on a mutex or condvar or perform I/O. Capture writes
//! straight into the SPSC ring producer; playback receives commands over a
//! non-blocking channel (see `output`).
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). A stream is therefore created and dropped on one thread: the
//! capture thread for the microphone, a dedicated parked thread for output.

pub mod device;
pub mod output;
pub mod resample;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

use crate::{
    buffering::AudioProducer,
    error::{ParleyError, Result},
};

#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;

/// A live microphone stream. Dropping it releases the hardware.
pub trait InputStream {
    /// Rate (Hz) of the mono samples pushed into the ring.
    fn sample_rate(&self) -> u32;
}

/// Source of microphone streams.
///
/// `acquire` runs on the session's capture thread and may block while the
/// OS or user decides on access. The returned stream never leaves that thread.
pub trait Microphone: Send + Sync + 'static {
    /// Open the microphone and start pushing mono f32 samples into `producer`.
    /// The callback must no-op once `running` is cleared.
    ///
    /// # Errors
    /// `ParleyError::PermissionDenied` if access is refused, or a device /
    /// stream error.
    fn acquire(
        &self,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Box<dyn InputStream>>;
}

/// Keywords in backend error text that indicate an access refusal.
const DENIAL_KEYWORDS: &[&str] = &[
    "permission",
    "denied",
    "not authorized",
    "unauthorized",
    "not permitted",
    "access",
];

/// Map a backend stream-build error message onto the error taxonomy.
pub fn classify_stream_error(message: &str) -> ParleyError {
    let lowered = message.to_ascii_lowercase();
    if DENIAL_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        ParleyError::PermissionDenied(message.to_string())
    } else {
        ParleyError::AudioStream(message.to_string())
    }
}

/// Average interleaved frames of `channels` samples into `out` (resized to
/// the frame count).
#[cfg(feature = "audio-cpal")]
pub fn downmix_into<T>(data: &[T], channels: usize, out: &mut Vec<f32>)
where
    T: Sample,
    f32: FromSample<T>,
{
    let ch = channels.max(1);
    let frames = data.len() / ch;
    out.resize(frames, 0.0);
    if ch == 1 {
        for (dst, src) in out.iter_mut().zip(data) {
            *dst = f32::from_sample(*src);
        }
        return;
    }
    for (f, dst) in out.iter_mut().enumerate() {
        let base = f * ch;
        let sum: f32 = data[base..base + ch]
            .iter()
            .map(|s| f32::from_sample(*s))
            .sum();
        *dst = sum / ch as f32;
    }
}

/// Handle to an active cpal capture stream.
///
/// **Not `Send`**: create and drop it on the same OS thread.
#[cfg(feature = "audio-cpal")]
pub struct AudioCapture {
    _stream: Stream,
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl AudioCapture {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available device.
    pub fn open_with_preference(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let device = match preferred_device_name.and_then(|name| device::find_input(&host, name)) {
            Some(device) => device,
            None => match host.default_input_device() {
                Some(device) => device,
                None => {
                    let mut devices = host
                        .input_devices()
                        .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
                    let fallback = devices.next().ok_or(ParleyError::NoDefaultInputDevice)?;
                    warn!("no default input device, falling back to first available input");
                    fallback
                }
            },
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| classify_stream_error(&e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "input config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let run = Arc::clone(&running);
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_mono_input::<f32>(&device, &config, producer, run),
            SampleFormat::I16 => build_mono_input::<i16>(&device, &config, producer, run),
            SampleFormat::U8 => build_mono_input::<u8>(&device, &config, producer, run),
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| classify_stream_error(&e.to_string()))?;

        stream
            .play()
            .map_err(|e| classify_stream_error(&e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(feature = "audio-cpal")]
impl InputStream for AudioCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(feature = "audio-cpal")]
impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
        info!("input device released");
    }
}

#[cfg(feature = "audio-cpal")]
fn build_mono_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut mono: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _info: &cpal::InputCallbackInfo| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            downmix_into(data, channels, &mut mono);
            let written = producer.push_slice(&mono);
            if written < mono.len() {
                warn!("capture ring full: dropped {} samples", mono.len() - written);
            }
        },
        |err| error!("input stream error: {err}"),
        None,
    )
}

/// The system microphone via cpal.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    /// Device name to prefer over the system default.
    pub preferred_device: Option<String>,
}

impl CpalMicrophone {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

#[cfg(feature = "audio-cpal")]
impl Microphone for CpalMicrophone {
    fn acquire(
        &self,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Box<dyn InputStream>> {
        let preferred = self.preferred_device.as_deref();
        let capture = AudioCapture::open_with_preference(producer, running, preferred)?;
        Ok(Box::new(capture))
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl Microphone for CpalMicrophone {
    fn acquire(
        &self,
        _producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Box<dyn InputStream>> {
        running.store(false, Ordering::Release);
        Err(ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_access_refusals() {
        assert!(matches!(
            classify_stream_error("Access denied by the user"),
            ParleyError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_stream_error("kAudioHardwareNotRunningError: not authorized"),
            ParleyError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_stream_error("The requested stream configuration is not supported"),
            ParleyError::AudioStream(_)
        ));
    }

    #[cfg(feature = "audio-cpal")]
    #[test]
    fn downmix_averages_channels() {
        let mut out = Vec::new();
        downmix_into(&[0.5f32, -0.5, 1.0, 0.0], 2, &mut out);
        assert_eq!(out, vec![0.0, 0.5]);
    }

    #[cfg(feature = "audio-cpal")]
    #[test]
    fn downmix_converts_integer_formats() {
        let mut out = Vec::new();
        downmix_into(&[i16::MIN, 0i16], 1, &mut out);
        assert_eq!(out, vec![-1.0, 0.0]);

        downmix_into(&[128u8, 128u8, 0u8, 0u8], 2, &mut out);
        assert_eq!(out, vec![0.0, -1.0]);
    }
}
