//! Discord gateway using serenity
//!
//! Text, commands and voice-state updates always work. Joining voice,
//! receiving speech and playing replies need the `discord-voice` feature
//! (songbird); without it the bot still runs the join/mode handshake and
//! answers in text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serenity::Client;
use serenity::all::{
    ChannelId, Context, CreateMessage, EventHandler, GatewayIntents, GuildId, Message, Ready,
    VoiceState,
};
use tokio::sync::mpsc;

use super::{ChatPlatformGateway, GatewayEvent};
use crate::session::ChannelRef;
use crate::{Error, Result};

/// Discord sends 48 kHz audio
pub const DISCORD_SAMPLE_RATE: u32 = 48000;

/// Prefix for bot commands
const COMMAND_PREFIX: char = '!';

/// Event queue depth between serenity and the front-end loop
const EVENT_BUFFER: usize = 256;

/// Discord adapter
pub struct DiscordGateway {
    http: Arc<serenity::http::Http>,
    #[cfg(feature = "discord-voice")]
    songbird: Arc<songbird::Songbird>,
    #[cfg(feature = "discord-voice")]
    events: mpsc::Sender<GatewayEvent>,
    #[cfg(feature = "discord-voice")]
    cache: Arc<serenity::cache::Cache>,
}

impl DiscordGateway {
    /// Log in and start the gateway in the background
    ///
    /// Returns the adapter and the stream of platform events.
    ///
    /// # Errors
    ///
    /// Returns error if the token is missing or the client cannot be built
    pub async fn connect(token: &str) -> Result<(Arc<Self>, mpsc::Receiver<GatewayEvent>)> {
        if token.is_empty() {
            return Err(Error::Config("DISCORD_TOKEN is required for the front-end".to_string()));
        }

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::GUILD_VOICE_STATES
            | GatewayIntents::MESSAGE_CONTENT;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handler = DiscordHandler { events: tx.clone() };

        let builder = Client::builder(token, intents).event_handler(handler);

        #[cfg(feature = "discord-voice")]
        let (builder, songbird) = {
            use songbird::SerenityInit;

            let config = songbird::Config::default().decode_mode(songbird::driver::DecodeMode::Decode);
            let songbird = songbird::Songbird::serenity_from_config(config);
            (builder.register_songbird_with(Arc::clone(&songbird)), songbird)
        };

        let mut client = builder
            .await
            .map_err(|e| Error::Channel(format!("Discord client error: {e}")))?;

        let gateway = Arc::new(Self {
            http: Arc::clone(&client.http),
            #[cfg(feature = "discord-voice")]
            songbird,
            #[cfg(feature = "discord-voice")]
            events: tx,
            #[cfg(feature = "discord-voice")]
            cache: Arc::clone(&client.cache),
        });

        tokio::spawn(async move {
            if let Err(e) = client.start().await {
                tracing::error!(error = %e, "Discord client error");
            }
        });

        tracing::info!("Discord gateway connecting");
        Ok((gateway, rx))
    }
}

fn parse_id(raw: &str, what: &str) -> Result<u64> {
    raw.parse()
        .map_err(|_| Error::Channel(format!("invalid Discord {what} id: {raw}")))
}

#[cfg(feature = "discord-voice")]
fn guild_of(channel: &ChannelRef) -> Result<GuildId> {
    let raw = channel
        .guild_id
        .as_deref()
        .ok_or_else(|| Error::Channel(format!("{} is not in a server", channel.name)))?;
    Ok(GuildId::new(parse_id(raw, "guild")?))
}

#[async_trait]
impl ChatPlatformGateway for DiscordGateway {
    fn sample_rate(&self) -> u32 {
        DISCORD_SAMPLE_RATE
    }

    async fn send_text(&self, channel: &ChannelRef, text: &str) -> Result<()> {
        let id = ChannelId::new(parse_id(&channel.id, "channel")?);
        id.send_message(&self.http, CreateMessage::new().content(text))
            .await
            .map_err(|e| Error::Channel(format!("Discord send error: {e}")))?;

        tracing::debug!(channel = %channel.name, "Discord message sent");
        Ok(())
    }

    #[cfg(feature = "discord-voice")]
    async fn join_voice(&self, channel: &ChannelRef) -> Result<()> {
        use songbird::{CoreEvent, Event};

        let guild = guild_of(channel)?;
        let id = ChannelId::new(parse_id(&channel.id, "channel")?);

        let call = self
            .songbird
            .join(guild, id)
            .await
            .map_err(|e| Error::Channel(format!("Discord voice join error: {e}")))?;

        let receiver = voice::Receiver::new(self.events.clone(), Arc::clone(&self.cache));
        let mut call = call.lock().await;
        call.add_global_event(Event::Core(CoreEvent::SpeakingStateUpdate), receiver.clone());
        call.add_global_event(Event::Core(CoreEvent::VoiceTick), receiver);

        tracing::info!(channel = %channel.name, "joined Discord voice channel");
        Ok(())
    }

    #[cfg(not(feature = "discord-voice"))]
    async fn join_voice(&self, channel: &ChannelRef) -> Result<()> {
        tracing::warn!(
            channel = %channel.name,
            "built without discord-voice; replies stay in text"
        );
        Ok(())
    }

    #[cfg(feature = "discord-voice")]
    async fn leave_voice(&self, channel: &ChannelRef) -> Result<()> {
        let guild = guild_of(channel)?;
        self.songbird
            .remove(guild)
            .await
            .map_err(|e| Error::Channel(format!("Discord voice leave error: {e}")))?;
        tracing::info!(channel = %channel.name, "left Discord voice channel");
        Ok(())
    }

    #[cfg(not(feature = "discord-voice"))]
    async fn leave_voice(&self, _channel: &ChannelRef) -> Result<()> {
        Ok(())
    }

    #[cfg(feature = "discord-voice")]
    async fn play_audio(&self, channel: &ChannelRef, path: &Path) -> Result<()> {
        use songbird::{Event, TrackEvent};

        let guild = guild_of(channel)?;
        let call = self
            .songbird
            .get(guild)
            .ok_or_else(|| Error::Channel("not connected to voice".to_string()))?;

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        {
            let mut call = call.lock().await;
            let input: songbird::input::Input = songbird::input::File::new(path.to_path_buf()).into();
            let track = call.play_input(input);
            track
                .add_event(Event::Track(TrackEvent::End), voice::TrackDone::new(done_tx))
                .map_err(|e| Error::Channel(format!("Discord playback error: {e}")))?;
        }

        // playback ends or the track is dropped; both mean done
        let _ = done_rx.await;
        tracing::debug!(path = %path.display(), "reply played in voice");
        Ok(())
    }

    #[cfg(not(feature = "discord-voice"))]
    async fn play_audio(&self, _channel: &ChannelRef, path: &Path) -> Result<()> {
        tracing::debug!(path = %path.display(), "voice playback unavailable in this build");
        Ok(())
    }
}

/// Serenity event handler forwarding into the front-end queue
struct DiscordHandler {
    events: mpsc::Sender<GatewayEvent>,
}

impl DiscordHandler {
    async fn forward(&self, event: GatewayEvent) {
        if let Err(e) = self.events.send(event).await {
            tracing::warn!(error = %e, "failed to forward Discord event");
        }
    }
}

async fn channel_ref(ctx: &Context, id: ChannelId, guild: Option<GuildId>) -> ChannelRef {
    let name = id.name(ctx).await.unwrap_or_else(|_| id.to_string());
    let channel = ChannelRef::new(id.to_string(), name);
    match guild {
        Some(guild) => channel.in_guild(guild.to_string()),
        None => channel,
    }
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, "Discord bot ready");
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let text_channel = channel_ref(&ctx, msg.channel_id, msg.guild_id).await;

        let event = match Command::parse(&msg.content) {
            Some(Command::Join) => {
                let voice_id = msg.guild(&ctx.cache).and_then(|guild| {
                    guild
                        .voice_states
                        .get(&msg.author.id)
                        .and_then(|state| state.channel_id)
                });
                let voice_channel = match voice_id {
                    Some(id) => Some(channel_ref(&ctx, id, msg.guild_id).await),
                    None => None,
                };
                GatewayEvent::Join {
                    text_channel,
                    voice_channel,
                }
            }
            Some(Command::Leave) => GatewayEvent::Leave { text_channel },
            None => GatewayEvent::Message {
                author_id: msg.author.id.to_string(),
                author_name: msg.author.name.clone(),
                channel: text_channel,
                content: msg.content.clone(),
            },
        };

        tracing::debug!(author = %msg.author.name, content = %msg.content, "Discord message received");
        self.forward(event).await;
    }

    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        let is_self = new.user_id == ctx.cache.current_user().id;
        let channel = match new.channel_id {
            Some(id) => Some(channel_ref(&ctx, id, new.guild_id).await),
            None => None,
        };

        self.forward(GatewayEvent::VoiceMembership {
            user_id: new.user_id.to_string(),
            is_self,
            channel,
        })
        .await;
    }
}

/// Recognized bot commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Join,
    Leave,
}

impl Command {
    fn parse(content: &str) -> Option<Self> {
        let name = content.trim().strip_prefix(COMMAND_PREFIX)?;
        match name.split_whitespace().next()?.to_ascii_lowercase().as_str() {
            "join" => Some(Self::Join),
            "leave" => Some(Self::Leave),
            _ => None,
        }
    }
}

#[cfg(feature = "discord-voice")]
mod voice {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, PoisonError};

    use async_trait::async_trait;
    use serenity::all::UserId;
    use songbird::events::context_data::VoiceTick;
    use songbird::{Event, EventContext, EventHandler};
    use tokio::sync::{mpsc, oneshot};

    use crate::frontend::GatewayEvent;
    use crate::voice::{SpeakerId, stereo_to_mono_pcm16};

    /// Maps voice SSRCs to users and forwards decoded audio
    #[derive(Clone)]
    pub(super) struct Receiver {
        events: mpsc::Sender<GatewayEvent>,
        cache: Arc<serenity::cache::Cache>,
        users: Arc<Mutex<HashMap<u32, u64>>>,
    }

    impl Receiver {
        pub(super) fn new(events: mpsc::Sender<GatewayEvent>, cache: Arc<serenity::cache::Cache>) -> Self {
            Self {
                events,
                cache,
                users: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        fn user_for(&self, ssrc: u32) -> Option<u64> {
            self.users
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&ssrc)
                .copied()
        }

        fn display_name(&self, user: u64) -> String {
            self.cache
                .user(UserId::new(user))
                .map_or_else(|| user.to_string(), |u| u.name.clone())
        }
    }

    #[async_trait]
    impl EventHandler for Receiver {
        async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
            match ctx {
                EventContext::SpeakingStateUpdate(speaking) => {
                    if let Some(user) = speaking.user_id {
                        self.users
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(speaking.ssrc, user.0);
                    }
                }
                EventContext::VoiceTick(VoiceTick { speaking, .. }) => {
                    for (&ssrc, data) in speaking {
                        let (Some(audio), Some(user)) = (&data.decoded_voice, self.user_for(ssrc)) else {
                            continue;
                        };
                        if audio.is_empty() {
                            continue;
                        }

                        let event = GatewayEvent::Audio {
                            speaker: SpeakerId::new(user.to_string()),
                            display_name: self.display_name(user),
                            pcm: stereo_to_mono_pcm16(audio),
                        };
                        // never stall the voice driver
                        if self.events.try_send(event).is_err() {
                            tracing::warn!(ssrc, "event queue full, voice frame dropped");
                        }
                    }
                }
                _ => {}
            }
            None
        }
    }

    /// Fires once when a track ends
    pub(super) struct TrackDone(Mutex<Option<oneshot::Sender<()>>>);

    impl TrackDone {
        pub(super) fn new(tx: oneshot::Sender<()>) -> Self {
            Self(Mutex::new(Some(tx)))
        }
    }

    #[async_trait]
    impl EventHandler for TrackDone {
        async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
            if let Some(tx) = self.0.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(());
            }
            Some(Event::Cancel)
        }
    }
}
