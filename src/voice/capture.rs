//! Microphone capture and PCM helpers

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

/// Sample rate for local capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Captures audio from the default input device, downmixed to mono
///
/// Mono input configs are preferred; devices that only offer multi-channel
/// capture at the requested rate are averaged down per frame.
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    samples: Arc<Mutex<Vec<f32>>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the device has no input config at that rate
    pub fn new(sample_rate: u32) -> Result<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let rate = SampleRate(sample_rate);
        let mut candidates: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
            .collect();
        candidates.sort_by_key(cpal::SupportedStreamConfigRange::channels);

        let config = candidates
            .into_iter()
            .next()
            .map(|c| c.with_sample_rate(rate).config())
            .ok_or_else(|| Error::Audio(format!("no input config at {sample_rate} Hz")))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            samples: Arc::new(Mutex::new(Vec::new())),
            stream: None,
        })
    }

    /// Start capturing; a no-op while already running
    ///
    /// # Errors
    ///
    /// Returns error if the input stream cannot be built or started
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let samples = Arc::clone(&self.samples);
        let channels = usize::from(self.config.channels.max(1));

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let Ok(mut samples) = samples.lock() else {
                        return;
                    };
                    if channels == 1 {
                        samples.extend_from_slice(data);
                    } else {
                        #[allow(clippy::cast_precision_loss)]
                        samples.extend(
                            data.chunks(channels)
                                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                        );
                    }
                },
                |err| tracing::error!(error = %err, "audio capture error"),
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!(channels, "audio capture started");
        Ok(())
    }

    /// Stop capturing; buffered samples are kept
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("audio capture stopped");
        }
    }

    /// Drain mono samples captured since the last take
    #[must_use]
    pub fn take_samples(&self) -> Vec<f32> {
        self.samples
            .lock()
            .map(|mut samples| std::mem::take(&mut *samples))
            .unwrap_or_default()
    }

    /// Drain captured audio as 16-bit PCM
    #[must_use]
    pub fn take_pcm16(&self) -> Vec<u8> {
        f32_to_pcm16(&self.take_samples())
    }

    /// Capture sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }
}

/// Convert f32 samples in [-1.0, 1.0] to 16-bit little-endian PCM
#[must_use]
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            #[allow(clippy::cast_possible_truncation)]
            let v = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// Downmix interleaved 16-bit stereo samples to mono PCM bytes
#[must_use]
pub fn stereo_to_mono_pcm16(samples: &[i16]) -> Vec<u8> {
    samples
        .chunks(2)
        .flat_map(|pair| {
            let left = i32::from(pair[0]);
            let right = i32::from(pair.get(1).copied().unwrap_or(pair[0]));
            #[allow(clippy::cast_possible_truncation)]
            let mixed = ((left + right) / 2) as i16;
            mixed.to_le_bytes()
        })
        .collect()
}

/// Wrap mono 16-bit PCM in a WAV container for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for sample in super::vad::pcm16_samples(pcm) {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_conversion_clamps() {
        let pcm = f32_to_pcm16(&[0.0, 1.0, -1.5]);
        assert_eq!(super::super::vad::pcm16_samples(&pcm), vec![0, 32767, -32768]);
    }

    #[test]
    fn stereo_downmix_averages() {
        let mono = stereo_to_mono_pcm16(&[100, 300, -50, -150]);
        assert_eq!(super::super::vad::pcm16_samples(&mono), vec![200, -100]);
    }

    #[test]
    fn wav_header_and_length() {
        let pcm = f32_to_pcm16(&[0.0, 0.5, -0.5, 0.25]);
        let wav = pcm16_to_wav(&pcm, SAMPLE_RATE).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.len(), 4);
    }
}
