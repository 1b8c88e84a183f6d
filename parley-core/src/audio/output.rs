//! Output device: sample-accurate chunk playback on the device clock.
//!
//! The scheduler hands over chunks pinned to absolute times. The non-RT side
//! converts them to device-rate frames and posts `SinkCommand`s on a lock-free
//! channel. The cpal callback drains that channel, mixes every voice that
//! overlaps the buffer it is rendering, and advances a frame counter which is
//! the output clock.
//!
//! Finished or stopped voices are passed back through a bounded channel so
//! their buffers are freed off the audio thread.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    audio::resample,
    buffering::chunk::PlaybackChunk,
    error::{ParleyError, Result},
    playback::{OutputClock, OutputDevice, PlaybackSink},
};

/// Retired voices waiting to be freed by the non-RT side.
const RETIRED_CAPACITY: usize = 256;

/// How far ahead of the rendered position a new voice is placed. Covers the
/// time between reading the clock and the callback draining the command, so
/// the head of a chunk admitted into silence is not skipped.
const SCHEDULING_LEAD_SECS: f64 = 0.02;

/// Absolute device frame at output-clock time `secs`.
fn device_frame(secs: f64, device_rate: u32) -> u64 {
    (secs * device_rate as f64).round().max(0.0) as u64
}

/// One chunk converted to device-rate frames.
#[derive(Debug, Clone)]
pub struct Voice {
    pub id: u64,
    /// Absolute device frame of the first sample.
    pub start_frame: u64,
    pub samples: Vec<f32>,
}

impl Voice {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Debug)]
pub enum SinkCommand {
    Play(Voice),
    Stop(u64),
}

/// Mixes scheduled voices into interleaved output buffers.
///
/// Holds no locks and only allocates when more voices are live than ever
/// before.
#[derive(Debug, Default)]
pub struct Mixer {
    voices: Vec<Voice>,
}

impl Mixer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            voices: Vec::with_capacity(capacity),
        }
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn apply<F>(&mut self, command: SinkCommand, mut retire: F)
    where
        F: FnMut(Voice),
    {
        match command {
            SinkCommand::Play(voice) => self.voices.push(voice),
            SinkCommand::Stop(id) => {
                if let Some(pos) = self.voices.iter().position(|v| v.id == id) {
                    retire(self.voices.swap_remove(pos));
                }
            }
        }
    }

    /// Render `out.len() / channels` frames starting at absolute frame
    /// `base_frame`. Mono voices are duplicated across channels.
    ///
    /// A voice whose start frame is already behind `base_frame` plays from
    /// the matching offset; its head is skipped. The sink's scheduling lead
    /// keeps this to callbacks running later than that lead.
    pub fn render<F>(
        &mut self,
        out: &mut [f32],
        channels: usize,
        base_frame: u64,
        mut retire: F,
    ) where
        F: FnMut(Voice),
    {
        let ch = channels.max(1);
        out.fill(0.0);
        let frames = (out.len() / ch) as u64;
        let end_frame = base_frame + frames;

        for voice in &self.voices {
            let from = voice.start_frame.max(base_frame);
            let to = voice.end_frame().min(end_frame);
            if from >= to {
                continue;
            }
            for frame in from..to {
                let sample = voice.samples[(frame - voice.start_frame) as usize];
                let base = ((frame - base_frame) as usize) * ch;
                for s in &mut out[base..base + ch] {
                    *s += sample;
                }
            }
        }

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }

        let mut i = 0;
        while i < self.voices.len() {
            if self.voices[i].end_frame() <= end_frame {
                retire(self.voices.swap_remove(i));
            } else {
                i += 1;
            }
        }
    }
}

/// Live output stream, driven from a dedicated thread.
pub struct CpalPlayback {
    commands: crossbeam_channel::Sender<SinkCommand>,
    retired: crossbeam_channel::Receiver<Voice>,
    frames_rendered: Arc<AtomicU64>,
    device_rate: u32,
    shutdown: Mutex<Option<std::sync::mpsc::Sender<()>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CpalPlayback {
    fn drain_retired(&self) {
        while self.retired.try_recv().is_ok() {}
    }
}

impl OutputClock for CpalPlayback {
    fn now(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }
}

impl PlaybackSink for CpalPlayback {
    fn schedule(&self, chunk: PlaybackChunk) -> Result<()> {
        self.drain_retired();
        // Both edges go through the same time-to-frame mapping, so a chunk
        // starting at the previous chunk's end starts on its last frame + 1.
        let start_frame = device_frame(chunk.scheduled_start, self.device_rate);
        let end_frame = device_frame(chunk.end_secs(), self.device_rate).max(start_frame);
        let samples = resample::resample_to_len(
            &chunk.samples,
            chunk.sample_rate,
            self.device_rate,
            (end_frame - start_frame) as usize,
        )?;
        self.commands
            .send(SinkCommand::Play(Voice {
                id: chunk.id,
                start_frame,
                samples,
            }))
            .map_err(|_| ParleyError::AudioStream("output stream is gone".into()))
    }

    fn scheduling_lead(&self) -> f64 {
        SCHEDULING_LEAD_SECS
    }

    fn stop(&self, id: u64) {
        if self.commands.send(SinkCommand::Stop(id)).is_err() {
            debug!(chunk_id = id, "stop after output stream closed");
        }
    }

    fn close(&self) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.lock().take() {
            handle
                .join()
                .map_err(|_| ParleyError::AudioStream("output thread panicked".into()))?;
        }
        self.drain_retired();
        Ok(())
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error while closing output stream: {e}");
        }
    }
}

/// The system speakers via cpal.
#[derive(Debug, Clone, Default)]
pub struct CpalOutputDevice {
    /// Device name to prefer over the system default.
    pub preferred_device: Option<String>,
}

impl CpalOutputDevice {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

#[cfg(feature = "audio-cpal")]
impl OutputDevice for CpalOutputDevice {
    fn open(&self, sample_rate: u32) -> Result<Arc<dyn PlaybackSink>> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (retired_tx, retired_rx) = crossbeam_channel::bounded(RETIRED_CAPACITY);
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u32>>();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        let preferred = self.preferred_device.clone();
        let frames = Arc::clone(&frames_rendered);
        let thread = std::thread::Builder::new()
            .name("parley-output".into())
            .spawn(move || {
                let opened = cpal_stream::open(preferred.as_deref(), cmd_rx, retired_tx, frames);
                let stream = match opened {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until close() or the playback handle is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                info!("output device released");
            })?;

        let device_rate = ready_rx
            .recv()
            .map_err(|_| ParleyError::AudioStream("output thread exited before opening".into()))??;

        info!(source_rate = sample_rate, device_rate, "playback output ready");

        Ok(Arc::new(CpalPlayback {
            commands: cmd_tx,
            retired: retired_rx,
            frames_rendered,
            device_rate,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        }))
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl OutputDevice for CpalOutputDevice {
    fn open(&self, _sample_rate: u32) -> Result<Arc<dyn PlaybackSink>> {
        Err(ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(feature = "audio-cpal")]
mod cpal_stream {
    use super::*;
    use crate::audio::device;
    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    };
    use tracing::error;

    pub(super) fn open(
        preferred: Option<&str>,
        commands: crossbeam_channel::Receiver<SinkCommand>,
        retired: crossbeam_channel::Sender<Voice>,
        frames_rendered: Arc<AtomicU64>,
    ) -> Result<(Stream, u32)> {
        let host = cpal::default_host();
        let device = match preferred.and_then(|name| device::find_output(&host, name)) {
            Some(device) => device,
            None => host
                .default_output_device()
                .ok_or(ParleyError::NoDefaultOutputDevice)?,
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "output config selected");

        let config: StreamConfig = supported.config();
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build::<f32>(&device, &config, commands, retired, frames_rendered),
            SampleFormat::I16 => build::<i16>(&device, &config, commands, retired, frames_rendered),
            SampleFormat::U16 => build::<u16>(&device, &config, commands, retired, frames_rendered),
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        Ok((stream, sample_rate))
    }

    fn build<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        commands: crossbeam_channel::Receiver<SinkCommand>,
        retired: crossbeam_channel::Sender<Voice>,
        frames_rendered: Arc<AtomicU64>,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = (config.channels as usize).max(1);
        let mut mixer = Mixer::with_capacity(64);
        let mut scratch: Vec<f32> = Vec::new();
        device.build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                let mut retire = |voice: Voice| {
                    let _ = retired.try_send(voice);
                };
                while let Ok(command) = commands.try_recv() {
                    mixer.apply(command, &mut retire);
                }
                scratch.resize(data.len(), 0.0);
                let base_frame = frames_rendered.load(Ordering::Relaxed);
                mixer.render(&mut scratch, channels, base_frame, &mut retire);
                for (dst, src) in data.iter_mut().zip(&scratch) {
                    *dst = T::from_sample(*src);
                }
                frames_rendered.fetch_add((data.len() / channels) as u64, Ordering::Release);
            },
            |err| error!("output stream error: {err}"),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(id: u64, start_frame: u64, samples: &[f32]) -> Voice {
        Voice {
            id,
            start_frame,
            samples: samples.to_vec(),
        }
    }

    fn playback(device_rate: u32) -> (CpalPlayback, crossbeam_channel::Receiver<SinkCommand>) {
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let (_, retired) = crossbeam_channel::bounded(RETIRED_CAPACITY);
        let playback = CpalPlayback {
            commands,
            retired,
            frames_rendered: Arc::new(AtomicU64::new(0)),
            device_rate,
            shutdown: Mutex::new(None),
            thread: Mutex::new(None),
        };
        (playback, command_rx)
    }

    fn played_voices(rx: &crossbeam_channel::Receiver<SinkCommand>) -> Vec<Voice> {
        rx.try_iter()
            .filter_map(|cmd| match cmd {
                SinkCommand::Play(voice) => Some(voice),
                SinkCommand::Stop(_) => None,
            })
            .collect()
    }

    #[test]
    fn back_to_back_chunks_are_contiguous_at_44k1() {
        let (playback, rx) = playback(44_100);
        let mut start = 0.0;
        for id in 0..6 {
            let chunk = PlaybackChunk::new(id, vec![0.1; 1_001], 24_000, start);
            start = chunk.end_secs();
            playback.schedule(chunk).unwrap();
        }

        let voices = played_voices(&rx);
        assert_eq!(voices.len(), 6);
        assert_eq!(voices[0].start_frame, 0);
        for pair in voices.windows(2) {
            assert_eq!(
                pair[1].start_frame,
                pair[0].end_frame(),
                "voice {} does not follow voice {}",
                pair[1].id,
                pair[0].id
            );
        }
        assert_eq!(voices[5].end_frame(), device_frame(start, 44_100));
    }

    #[test]
    fn mid_stream_chunk_lands_on_its_device_frame() {
        let (playback, rx) = playback(48_000);
        playback
            .schedule(PlaybackChunk::new(3, vec![0.1; 2_400], 24_000, 1.5))
            .unwrap();
        let voices = played_voices(&rx);
        assert_eq!(voices[0].start_frame, 72_000);
        assert_eq!(voices[0].samples.len(), 4_800);
    }

    #[test]
    fn new_voices_are_placed_ahead_of_the_clock() {
        let (playback, _rx) = playback(48_000);
        assert!(playback.scheduling_lead() > 0.0);
        assert_eq!(playback.now(), 0.0);
    }

    #[test]
    fn voice_starts_on_its_frame() {
        let mut mixer = Mixer::default();
        mixer.apply(SinkCommand::Play(voice(0, 2, &[0.1, 0.2, 0.3])), |_| {});

        let mut out = [9.0f32; 4];
        let mut retired = Vec::new();
        mixer.render(&mut out, 1, 0, |v| retired.push(v.id));
        assert_eq!(out, [0.0, 0.0, 0.1, 0.2]);
        assert!(retired.is_empty());

        mixer.render(&mut out, 1, 4, |v| retired.push(v.id));
        assert_eq!(out, [0.3, 0.0, 0.0, 0.0]);
        assert_eq!(retired, vec![0]);
        assert_eq!(mixer.voice_count(), 0);
    }

    #[test]
    fn adjacent_voices_are_gapless() {
        let mut mixer = Mixer::default();
        mixer.apply(SinkCommand::Play(voice(0, 0, &[0.5; 3])), |_| {});
        mixer.apply(SinkCommand::Play(voice(1, 3, &[0.25; 3])), |_| {});

        let mut out = [0.0f32; 6];
        mixer.render(&mut out, 1, 0, |_| {});
        assert_eq!(out, [0.5, 0.5, 0.5, 0.25, 0.25, 0.25]);
    }

    #[test]
    fn stop_silences_mid_voice() {
        let mut mixer = Mixer::default();
        mixer.apply(SinkCommand::Play(voice(7, 0, &[0.5; 8])), |_| {});
        let mut out = [0.0f32; 4];
        mixer.render(&mut out, 1, 0, |_| {});
        assert_eq!(out, [0.5; 4]);

        let mut retired = Vec::new();
        mixer.apply(SinkCommand::Stop(7), |v| retired.push(v.id));
        assert_eq!(retired, vec![7]);

        mixer.render(&mut out, 1, 4, |_| {});
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn stop_unknown_id_is_ignored() {
        let mut mixer = Mixer::default();
        mixer.apply(SinkCommand::Play(voice(1, 0, &[0.5; 8])), |_| {});
        mixer.apply(SinkCommand::Stop(99), |_| panic!("nothing to retire"));
        assert_eq!(mixer.voice_count(), 1);
    }

    #[test]
    fn mono_voice_fills_every_channel() {
        let mut mixer = Mixer::default();
        mixer.apply(SinkCommand::Play(voice(0, 0, &[0.1, 0.2])), |_| {});
        let mut out = [0.0f32; 4];
        mixer.render(&mut out, 2, 0, |_| {});
        assert_eq!(out, [0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn overlapping_voices_sum_and_clip() {
        let mut mixer = Mixer::default();
        mixer.apply(SinkCommand::Play(voice(0, 0, &[0.75; 2])), |_| {});
        mixer.apply(SinkCommand::Play(voice(1, 0, &[0.75; 2])), |_| {});
        let mut out = [0.0f32; 2];
        mixer.render(&mut out, 1, 0, |_| {});
        assert_eq!(out, [1.0, 1.0]);
    }
}
