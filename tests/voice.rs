//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::time::{Duration, Instant};

use duet::Config;
use duet::config::file::DuetConfigFile;
use duet::voice::{
    AudioSegmenter, ENERGY_THRESHOLD, EnergyClassifier, SAMPLE_RATE, SpeakerId, VadConfig,
    VoiceActivityClassifier, WebRtcClassifier, f32_to_pcm16, pcm16_to_wav, prepare_text,
    stereo_to_mono_pcm16,
};

/// Generate sine wave audio samples
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

fn energy_segmenter(timeout: Duration) -> AudioSegmenter {
    let frame_bytes = VadConfig::default().frame_bytes();
    AudioSegmenter::new(
        Box::new(EnergyClassifier::new(frame_bytes, ENERGY_THRESHOLD)),
        SAMPLE_RATE,
        timeout,
    )
}

#[test]
fn test_energy_classifier_separates_tone_from_silence() {
    let mut classifier = EnergyClassifier::new(3200, ENERGY_THRESHOLD);

    let tone = f32_to_pcm16(&generate_sine_samples(440.0, 0.1, 0.3));
    let silence = f32_to_pcm16(&generate_silence(0.1));

    assert!(classifier.is_speech(&tone).unwrap());
    assert!(!classifier.is_speech(&silence).unwrap());
}

#[test]
fn test_webrtc_classifier_rejects_silence() {
    let config = VadConfig::default();
    let mut classifier = WebRtcClassifier::new(config).unwrap();
    let silence = vec![0u8; config.frame_bytes()];

    assert!(!classifier.is_speech(&silence).unwrap());
}

#[test]
fn test_webrtc_classifier_rejects_unsupported_geometry() {
    let config = VadConfig {
        sample_rate: 44100,
        ..VadConfig::default()
    };
    assert!(WebRtcClassifier::new(config).is_err());
}

#[test]
fn test_speakers_are_segmented_independently() {
    let segmenter = energy_segmenter(Duration::from_secs(1));
    let alice = SpeakerId::from("alice");
    let bob = SpeakerId::from("bob");
    let t0 = Instant::now();

    let tone = f32_to_pcm16(&generate_sine_samples(440.0, 0.3, 0.3));
    let quiet = f32_to_pcm16(&generate_silence(0.3));

    assert!(segmenter.feed_at(&alice, &tone, t0) > 0);
    assert_eq!(segmenter.feed_at(&bob, &quiet, t0), 0);
    // alice keeps talking after bob goes quiet
    segmenter.feed_at(&alice, &tone, t0 + Duration::from_millis(800));

    let first = segmenter.tick_at(t0 + Duration::from_secs(1));
    assert!(first.is_empty(), "bob held no speech, alice is still active");
    assert_eq!(segmenter.buffers().speakers(), vec![alice.clone()]);

    let second = segmenter.tick_at(t0 + Duration::from_millis(1800));
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].speaker, alice);
    assert_eq!(second[0].pcm.len(), tone.len() * 2);
    assert_eq!(second[0].sample_rate, SAMPLE_RATE);
    assert!(segmenter.buffers().is_empty());
}

#[test]
fn test_utterance_duration_matches_audio() {
    let segmenter = energy_segmenter(Duration::from_millis(500));
    let speaker = SpeakerId::from("u1");
    let t0 = Instant::now();

    segmenter.feed_at(&speaker, &f32_to_pcm16(&generate_sine_samples(440.0, 0.6, 0.3)), t0);
    let utterance = segmenter
        .tick_at(t0 + Duration::from_millis(500))
        .pop()
        .unwrap();

    assert_eq!(utterance.duration(), Duration::from_millis(600));
}

#[test]
fn test_discard_drops_pending_audio() {
    let segmenter = energy_segmenter(Duration::from_millis(100));
    let speaker = SpeakerId::from("u1");
    let t0 = Instant::now();

    segmenter.feed_at(&speaker, &f32_to_pcm16(&generate_sine_samples(440.0, 0.1, 0.3)), t0);
    segmenter.discard(&speaker);

    assert!(segmenter.tick_at(t0 + Duration::from_secs(1)).is_empty());
}

/// 20 ms of 48 kHz interleaved stereo, the way the voice platform delivers it
fn platform_ticks(count: usize) -> Vec<Vec<u8>> {
    const TICK_SAMPLES: usize = 960;
    (0..count)
        .map(|tick| {
            let stereo: Vec<i16> = (0..TICK_SAMPLES)
                .flat_map(|i| {
                    let t = (tick * TICK_SAMPLES + i) as f32 / 48000.0;
                    let v = (12000.0 * (2.0 * std::f32::consts::PI * 300.0 * t).sin()) as i16;
                    [v, v]
                })
                .collect();
            stereo_to_mono_pcm16(&stereo)
        })
        .collect()
}

#[test]
fn test_platform_ticks_shorter_than_a_frame_still_make_an_utterance() {
    let vad = VadConfig {
        sample_rate: 48000,
        ..VadConfig::default()
    };
    let segmenter = AudioSegmenter::new(
        Box::new(EnergyClassifier::new(vad.frame_bytes(), ENERGY_THRESHOLD)),
        48000,
        Duration::from_secs(5),
    );
    let speaker = SpeakerId::from("42");
    let t0 = Instant::now();

    let ticks = platform_ticks(100);
    assert!(ticks[0].len() < vad.frame_bytes());

    let speech: usize = ticks
        .iter()
        .enumerate()
        .map(|(i, tick)| segmenter.feed_at(&speaker, tick, t0 + Duration::from_millis(20 * i as u64)))
        .sum();
    // 100 ticks of 1920 bytes hold 66 whole 30 ms frames
    assert_eq!(speech, 66);

    let utterances = segmenter.tick_at(t0 + Duration::from_secs(10));
    assert_eq!(utterances.len(), 1);
    assert_eq!(utterances[0].pcm.len(), 100 * 1920);
    assert_eq!(utterances[0].duration(), Duration::from_secs(2));
}

#[test]
fn test_default_platform_segmenter_frames_across_ticks() {
    let config = Config::from_sources(DuetConfigFile::default(), |_| None).unwrap();
    let segmenter = config.segmenter(48000).unwrap();
    let speaker = SpeakerId::from("42");
    let t0 = Instant::now();

    for tick in platform_ticks(3) {
        segmenter.feed_at(&speaker, &tick, t0);
    }

    let buffer = segmenter.buffers().snapshot(&speaker);
    assert_eq!(buffer.len(), 3 * 1920);
    // two whole 2880-byte frames were cut from three ticks
    let taken = segmenter.buffers().clear(&speaker).unwrap();
    assert_eq!(taken.framed_bytes, 2 * 2880);
}

#[test]
fn test_wav_roundtrip() {
    let original_samples: Vec<f32> = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];
    let wav_data = pcm16_to_wav(&f32_to_pcm16(&original_samples), SAMPLE_RATE).unwrap();

    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");

    let mut reader = hound::WavReader::new(Cursor::new(wav_data)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);

    let read_samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read_samples.len(), original_samples.len());
    assert_eq!(read_samples[3], 32767);
}

#[test]
fn test_platform_stereo_is_downmixed() {
    let mono = stereo_to_mono_pcm16(&[1000, 3000, -200, -400]);
    assert_eq!(mono, [2000i16.to_le_bytes(), (-300i16).to_le_bytes()].concat());
}

#[test]
fn test_reply_text_is_prepared_for_speech() {
    assert_eq!(prepare_text("I *waves*   at (you)!"), "I waves at you!");
    assert_eq!(prepare_text("Hi"), "Hi ...");
}
