//! Front-end integration tests
//!
//! Feeds platform events into a `FrontEnd` backed by a recording gateway and
//! checks the chat replies, voice actions, and handshake records.

use std::sync::Arc;
use std::time::Duration;

use duet::frontend::{FrontEnd, FrontEndSettings, GatewayEvent};
use duet::voice::{AudioSegmenter, SpeakerId, Transcript};
use duet::{ChannelRef, SignalChannel, SignalName};

mod common;
use common::{
    FakeGateway, RecordingResponder, RecordingSynthesizer, ScriptedClassifier, ScriptedStt,
    eventually, pipeline,
};

struct Harness {
    front_end: FrontEnd<FakeGateway>,
    gateway: Arc<FakeGateway>,
    signals: SignalChannel,
    stt: Arc<ScriptedStt>,
    responder: Arc<RecordingResponder>,
    synth: Arc<RecordingSynthesizer>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_gateway(FakeGateway::default())
    }

    fn with_gateway(gateway: FakeGateway) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalChannel::open(dir.path(), Duration::from_millis(10)).unwrap();
        let gateway = Arc::new(gateway);

        // every frame is speech; a zero timeout finalizes on the next scan
        let segmenter = AudioSegmenter::new(
            Box::new(ScriptedClassifier::new(std::iter::repeat_n(true, 1024))),
            16000,
            Duration::ZERO,
        );
        let stt = Arc::new(ScriptedStt::new([Transcript::Text("hello".to_string())]));
        let responder = Arc::new(RecordingResponder::fixed("hi there"));
        let synth = Arc::new(RecordingSynthesizer::default());

        let front_end = FrontEnd::new(
            Arc::clone(&gateway),
            signals.clone(),
            segmenter,
            pipeline(stt.clone(), responder.clone(), 5),
            synth.clone(),
            FrontEndSettings::default(),
        )
        .unwrap();

        Self {
            front_end,
            gateway,
            signals,
            stt,
            responder,
            synth,
            _dir: dir,
        }
    }

    async fn join(&self) {
        self.front_end
            .handle_event(GatewayEvent::Join {
                text_channel: text_channel(),
                voice_channel: Some(voice_channel()),
            })
            .await;
    }

    async fn say(&self, content: &str) {
        self.front_end
            .handle_event(GatewayEvent::Message {
                author_id: "42".to_string(),
                author_name: "alice".to_string(),
                channel: text_channel(),
                content: content.to_string(),
            })
            .await;
    }

    async fn join_with_mode(&self, mode: &str) {
        self.join().await;
        self.say(mode).await;
    }
}

fn text_channel() -> ChannelRef {
    ChannelRef::new("t1", "chat").in_guild("g1")
}

fn voice_channel() -> ChannelRef {
    ChannelRef::new("v1", "General").in_guild("g1")
}

#[tokio::test]
async fn test_join_requires_a_voice_channel() {
    let h = Harness::new();

    h.front_end
        .handle_event(GatewayEvent::Join {
            text_channel: text_channel(),
            voice_channel: None,
        })
        .await;

    assert_eq!(h.gateway.last_sent().unwrap(), "You are not in a voice channel!");
    assert!(h.gateway.joined.lock().unwrap().is_empty());
    assert!(!h.signals.is_signaled(SignalName::JoinedChannel));
}

#[tokio::test]
async fn test_failed_join_writes_no_record() {
    let h = Harness::with_gateway(FakeGateway {
        fail_join: true,
        ..FakeGateway::default()
    });

    h.join().await;

    assert!(!h.signals.is_signaled(SignalName::JoinedChannel));
    assert!(h.front_end.session().voice_channel().is_none());
}

#[tokio::test]
async fn test_join_and_mode_choice_write_handshake_records() {
    let h = Harness::new();

    h.join().await;
    assert_eq!(*h.gateway.joined.lock().unwrap(), vec!["v1"]);
    assert!(h.signals.is_signaled(SignalName::JoinedChannel));
    assert!(h.front_end.session().awaiting_input_mode());
    assert_eq!(
        h.gateway.sent_to("t1"),
        vec![
            "Joined General",
            "Please choose your input mode: type 'voice' or 'text'."
        ]
    );

    h.say("maybe").await;
    assert_eq!(h.gateway.last_sent().unwrap(), "Please choose 'voice' or 'text'.");
    assert!(!h.signals.is_signaled(SignalName::InputMode));

    h.say(" Voice ").await;
    assert_eq!(
        h.signals.read_value(SignalName::InputMode).unwrap().as_deref(),
        Some("voice")
    );
    assert_eq!(
        h.gateway.last_sent().unwrap(),
        "Input mode set to voice. You can now provide input locally."
    );
    assert!(!h.front_end.session().awaiting_input_mode());
    assert!(h.responder.prompts().is_empty());
}

#[tokio::test]
async fn test_leave_clears_every_record() {
    let h = Harness::new();
    h.join_with_mode("voice").await;
    h.signals.signal(SignalName::VoiceModeActive, None).unwrap();

    h.front_end
        .handle_event(GatewayEvent::Leave {
            text_channel: text_channel(),
        })
        .await;

    assert_eq!(*h.gateway.left.lock().unwrap(), vec!["v1"]);
    assert_eq!(h.gateway.last_sent().unwrap(), "Left the voice channel!");
    for name in SignalName::ALL {
        assert!(!h.signals.is_signaled(name), "{name} should be removed");
    }
    assert!(h.front_end.session().voice_channel().is_none());
    assert!(!h.front_end.session().voice_mode_active());
}

#[tokio::test]
async fn test_leave_when_not_joined() {
    let h = Harness::new();

    h.front_end
        .handle_event(GatewayEvent::Leave {
            text_channel: text_channel(),
        })
        .await;

    assert_eq!(h.gateway.last_sent().unwrap(), "I'm not in a voice channel!");
    assert!(h.gateway.left.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_platform_speech_gets_announced_and_answered() {
    let h = Harness::new();
    h.join_with_mode("text").await;

    h.front_end
        .handle_event(GatewayEvent::Audio {
            speaker: SpeakerId::from("42"),
            display_name: "alice".to_string(),
            pcm: vec![1; 16],
        })
        .await;
    assert_eq!(h.front_end.scan(), 1);
    h.front_end.coordinator().wait_idle().await;

    let sent = h.gateway.sent_to("t1");
    assert!(sent.ends_with(&["alice said: hello".to_string(), "hi there".to_string()]));
    assert_eq!(h.synth.texts(), vec!["hi there"]);

    let played = h.gateway.played.lock().unwrap().clone();
    assert_eq!(played.len(), 1);
    assert!(!played[0].exists(), "reply audio should be removed after playback");
}

#[tokio::test]
async fn test_audio_outside_voice_is_ignored() {
    let h = Harness::new();

    h.front_end
        .handle_event(GatewayEvent::Audio {
            speaker: SpeakerId::from("42"),
            display_name: "alice".to_string(),
            pcm: vec![1; 16],
        })
        .await;

    assert_eq!(h.front_end.scan(), 0);
    assert!(h.stt.calls().is_empty());
}

#[tokio::test]
async fn test_voice_mode_suppresses_platform_turns_and_chat() {
    let h = Harness::new();
    h.join_with_mode("voice").await;
    h.signals.signal(SignalName::VoiceModeActive, None).unwrap();

    h.front_end
        .handle_event(GatewayEvent::Audio {
            speaker: SpeakerId::from("42"),
            display_name: "alice".to_string(),
            pcm: vec![1; 16],
        })
        .await;
    assert_eq!(h.front_end.scan(), 1);
    assert!(h.front_end.session().voice_mode_active());

    h.say("are you there?").await;
    h.front_end.coordinator().wait_idle().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.stt.calls().is_empty());
    assert!(h.responder.prompts().is_empty());
}

#[tokio::test]
async fn test_chat_messages_are_answered_in_their_channel() {
    let h = Harness::new();
    h.join_with_mode("text").await;

    h.say("how are you?").await;

    let gateway = Arc::clone(&h.gateway);
    eventually(|| gateway.played.lock().unwrap().len() == 1).await;

    assert_eq!(h.responder.prompts(), vec!["how are you?"]);
    assert_eq!(h.gateway.last_sent().unwrap(), "hi there");
    assert!(h.stt.calls().is_empty());
}

#[tokio::test]
async fn test_platform_disconnect_ends_the_session() {
    let h = Harness::new();
    h.join_with_mode("text").await;

    h.front_end
        .handle_event(GatewayEvent::VoiceMembership {
            user_id: "bot".to_string(),
            is_self: true,
            channel: None,
        })
        .await;

    assert!(h.front_end.session().voice_channel().is_none());
    assert!(!h.signals.is_signaled(SignalName::JoinedChannel));
    assert!(!h.signals.is_signaled(SignalName::InputMode));
}
