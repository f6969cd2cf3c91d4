//! Local audio playback
//!
//! Playback blocks the calling thread until the clip has drained; async
//! callers run it under `spawn_blocking`.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Mono samples decoded from a compressed clip
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedAudio {
    /// Samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Samples per second
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Playing time of the clip
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.samples.len() as u64 * 1000 / u64::from(self.sample_rate.max(1)))
    }
}

/// Plays clips on the default output device
pub struct AudioPlayback {
    device: cpal::Device,
}

impl AudioPlayback {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if there is no output device
    pub fn new() -> Result<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            "audio playback initialized"
        );

        Ok(Self { device })
    }

    /// Decode and play an MP3 clip, returning once it has finished
    ///
    /// # Errors
    ///
    /// Returns error if decoding or playback fails
    pub fn play_mp3(&self, mp3: &[u8]) -> Result<()> {
        let audio = decode_mp3(mp3)?;
        self.play(&audio)
    }

    /// Play decoded samples, returning once they have finished
    ///
    /// # Errors
    ///
    /// Returns error if no output config fits or the stream fails
    pub fn play(&self, audio: &DecodedAudio) -> Result<()> {
        if audio.samples.is_empty() {
            return Ok(());
        }

        let config = self.output_config(audio.sample_rate)?;
        let channels = usize::from(config.channels);

        let samples: Arc<[f32]> = Arc::from(audio.samples.as_slice());
        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let stream = {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            let finished = Arc::clone(&finished);
            self.device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut pos = position.load(Ordering::Relaxed);
                        for frame in data.chunks_mut(channels) {
                            let sample = samples.get(pos).copied().unwrap_or(0.0);
                            frame.fill(sample);
                            if pos < samples.len() {
                                pos += 1;
                            }
                        }
                        position.store(pos, Ordering::Relaxed);
                        if pos >= samples.len() {
                            finished.store(true, Ordering::Release);
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))?
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let deadline = Instant::now() + audio.duration() + Duration::from_millis(500);
        while !finished.load(Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }

        // let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));
        drop(stream);

        tracing::debug!(
            samples = samples.len(),
            sample_rate = audio.sample_rate,
            "playback complete"
        );
        Ok(())
    }

    fn output_config(&self, sample_rate: u32) -> Result<StreamConfig> {
        let rate = SampleRate(sample_rate);
        let fits = |channels: u16| {
            self.device.supported_output_configs().ok()?.find(|c| {
                c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
            })
        };

        fits(1)
            .or_else(|| fits(2))
            .map(|c| c.with_sample_rate(rate).config())
            .ok_or_else(|| Error::Audio(format!("no output config at {sample_rate} Hz")))
    }
}

/// Decode MP3 bytes to mono samples, keeping the stream's sample rate
///
/// # Errors
///
/// Returns error on a malformed stream
pub fn decode_mp3(mp3: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3));
    let mut audio = DecodedAudio::default();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if audio.sample_rate == 0 {
                    audio.sample_rate = u32::try_from(frame.sample_rate).unwrap_or(24000);
                }
                if frame.channels == 2 {
                    audio.samples.extend(frame.data.chunks(2).map(|pair| {
                        let left = f32::from(pair[0]) / 32768.0;
                        let right = f32::from(pair.get(1).copied().unwrap_or(pair[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    audio
                        .samples
                        .extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(audio)
}
