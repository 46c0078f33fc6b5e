#![forbid(unsafe_code)]

//! In-memory fakes for the platform boundary and the host sinks.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use streamchat_domain::{ChannelName, PlatformMessageId};
use streamchat_platform::{
	BadgeSet, Category, ChatConnection, ChatMessage, Chatters, Clip, CreatedClip, Credential, Emote, EventRx, Follower,
	HelixApi, PlatformConnector, PlatformEvent, SecretString, StreamInfo, StreamMarker, User, UserQuery,
};
use tokio::sync::broadcast;

use crate::config::{Settings, SharedSettings};
use crate::host::{
	AuxiliarySync, ClipboardSink, HostSinks, Line, MessageHandler, MessageRemovalSink, NotificationSink, SoundCue, SoundSink,
};

pub(crate) fn user(id: &str, login: &str) -> User {
	User {
		id: id.to_string(),
		login: login.to_string(),
		display_name: login.to_ascii_uppercase(),
		description: String::new(),
		broadcaster_type: String::new(),
		profile_image_url: String::new(),
	}
}

pub(crate) fn clip(id: &str) -> Clip {
	Clip {
		id: id.to_string(),
		url: format!("https://clips.twitch.tv/{id}"),
		broadcaster_id: String::new(),
		broadcaster_name: String::new(),
		creator_name: String::new(),
		title: String::new(),
		game_id: String::new(),
		view_count: 0,
		duration: 30.0,
	}
}

pub(crate) fn chan(name: &str) -> ChannelName {
	ChannelName::new(name).expect("valid channel")
}

pub(crate) fn settings_with(f: impl FnOnce(&mut Settings)) -> SharedSettings {
	let mut s = Settings {
		twitch_enabled: true,
		twitch_token: SecretString::new("token"),
		update_checker_enabled: false,
		..Settings::default()
	};
	f(&mut s);
	s.into_shared()
}

#[derive(Default)]
pub(crate) struct FakeApi {
	pub users: Mutex<Vec<User>>,
	pub games: Mutex<Vec<Category>>,
	pub clips: Mutex<Vec<Clip>>,
	pub streams: Mutex<Vec<StreamInfo>>,
	pub created: Mutex<Vec<CreatedClip>>,

	pub slow_users: AtomicBool,
	pub fail_users: AtomicBool,
	pub fail_create_clip: AtomicBool,
	pub fail_marker: AtomicBool,
	/// `get_clips_by_id` answers empty this many times before returning data.
	pub clip_polls_before_ready: AtomicUsize,

	pub user_calls: AtomicUsize,
	pub game_calls: AtomicUsize,
	pub clip_calls: AtomicUsize,
	pub create_clip_calls: AtomicUsize,
	pub chatter_calls: AtomicUsize,
	pub stream_calls: AtomicUsize,
	pub marker_calls: AtomicUsize,
}

#[async_trait]
impl HelixApi for FakeApi {
	async fn get_games(&self, ids: &[String]) -> anyhow::Result<Vec<Category>> {
		self.game_calls.fetch_add(1, Ordering::SeqCst);
		Ok(self.games.lock().iter().filter(|g| ids.contains(&g.id)).cloned().collect())
	}

	async fn get_clips_by_id(&self, ids: &[String]) -> anyhow::Result<Vec<Clip>> {
		self.clip_calls.fetch_add(1, Ordering::SeqCst);
		let pending = self.clip_polls_before_ready.load(Ordering::SeqCst);
		if pending > 0 {
			self.clip_polls_before_ready.store(pending - 1, Ordering::SeqCst);
			return Ok(Vec::new());
		}
		Ok(self.clips.lock().iter().filter(|c| ids.contains(&c.id)).cloned().collect())
	}

	async fn get_clips_by_broadcaster(&self, broadcaster_id: &str, _first: u32) -> anyhow::Result<Vec<Clip>> {
		Ok(self
			.clips
			.lock()
			.iter()
			.filter(|c| c.broadcaster_id == broadcaster_id)
			.cloned()
			.collect())
	}

	async fn create_clip(&self, _broadcaster_id: &str, _has_delay: bool) -> anyhow::Result<Vec<CreatedClip>> {
		self.create_clip_calls.fetch_add(1, Ordering::SeqCst);
		if self.fail_create_clip.load(Ordering::SeqCst) {
			anyhow::bail!("helix create clip failed: status=503");
		}
		Ok(self.created.lock().clone())
	}

	async fn get_users(&self, query: &UserQuery) -> anyhow::Result<Vec<User>> {
		self.user_calls.fetch_add(1, Ordering::SeqCst);
		if self.slow_users.load(Ordering::SeqCst) {
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
		if self.fail_users.load(Ordering::SeqCst) {
			anyhow::bail!("helix users failed: status=500");
		}
		let users = self.users.lock();
		Ok(match query {
			UserQuery::Ids(ids) => users.iter().filter(|u| ids.contains(&u.id)).cloned().collect(),
			UserQuery::Logins(logins) => users
				.iter()
				.filter(|u| logins.iter().any(|l| l.eq_ignore_ascii_case(&u.login)))
				.cloned()
				.collect(),
		})
	}

	async fn get_chatters(&self, channel: &ChannelName) -> anyhow::Result<Chatters> {
		self.chatter_calls.fetch_add(1, Ordering::SeqCst);
		Ok(Chatters {
			channel: channel.clone(),
			total: 1,
			logins: vec!["someone".to_string()],
		})
	}

	async fn get_streams(&self, logins: &[String]) -> anyhow::Result<Vec<StreamInfo>> {
		self.stream_calls.fetch_add(1, Ordering::SeqCst);
		Ok(self
			.streams
			.lock()
			.iter()
			.filter(|s| logins.iter().any(|l| l.eq_ignore_ascii_case(&s.user_login)))
			.cloned()
			.collect())
	}

	async fn create_stream_marker(&self, _broadcaster_id: &str, description: Option<&str>) -> anyhow::Result<StreamMarker> {
		self.marker_calls.fetch_add(1, Ordering::SeqCst);
		if self.fail_marker.load(Ordering::SeqCst) {
			anyhow::bail!("helix create marker failed: status=404");
		}
		Ok(StreamMarker {
			id: "m1".to_string(),
			description: description.unwrap_or_default().to_string(),
			position_seconds: 3725,
		})
	}

	async fn get_global_emotes(&self) -> anyhow::Result<Vec<Emote>> {
		Ok(Vec::new())
	}

	async fn get_channel_emotes(&self, _broadcaster_id: &str) -> anyhow::Result<Vec<Emote>> {
		Ok(Vec::new())
	}

	async fn get_global_badges(&self) -> anyhow::Result<Vec<BadgeSet>> {
		Ok(Vec::new())
	}

	async fn get_channel_badges(&self, _broadcaster_id: &str) -> anyhow::Result<Vec<BadgeSet>> {
		Ok(Vec::new())
	}

	async fn get_channel_followers(&self, _broadcaster_id: &str, _first: u32) -> anyhow::Result<Vec<Follower>> {
		Ok(Vec::new())
	}
}

pub(crate) fn stream(login: &str, started_secs_ago: i64) -> StreamInfo {
	let started_at = Utc::now() - chrono::Duration::seconds(started_secs_ago);
	StreamInfo {
		user_id: format!("id-{login}"),
		user_login: login.to_string(),
		user_name: login.to_ascii_uppercase(),
		game_name: "Just Chatting".to_string(),
		title: "hello".to_string(),
		viewer_count: 12,
		started_at: Utc.timestamp_opt(started_at.timestamp(), 0).single().unwrap_or(started_at),
	}
}

pub(crate) struct FakeChat {
	events_tx: broadcast::Sender<PlatformEvent>,
	pub joined: Mutex<BTreeSet<ChannelName>>,
	pub connected: AtomicBool,
	pub closed: AtomicBool,
	pub fail_connect: AtomicBool,
	/// `connect` never completes.
	pub hang_connect: AtomicBool,
	/// Joins that the connection silently ignores.
	pub ignore_join: Mutex<HashSet<ChannelName>>,
	/// Leaves that the connection silently ignores.
	pub ignore_leave: Mutex<HashSet<ChannelName>>,
	pub listened_ids: Mutex<Vec<String>>,
	pub follows: Mutex<BTreeSet<ChannelName>>,
	pub sent: Mutex<Vec<(ChannelName, String)>>,
	pub subscribed: AtomicBool,
}

impl Default for FakeChat {
	fn default() -> Self {
		let (events_tx, _) = broadcast::channel(64);
		Self {
			events_tx,
			joined: Mutex::new(BTreeSet::new()),
			connected: AtomicBool::new(false),
			closed: AtomicBool::new(false),
			fail_connect: AtomicBool::new(false),
			hang_connect: AtomicBool::new(false),
			ignore_join: Mutex::new(HashSet::new()),
			ignore_leave: Mutex::new(HashSet::new()),
			listened_ids: Mutex::new(Vec::new()),
			follows: Mutex::new(BTreeSet::new()),
			sent: Mutex::new(Vec::new()),
			subscribed: AtomicBool::new(false),
		}
	}
}

impl FakeChat {
	pub fn emit(&self, ev: PlatformEvent) {
		let _ = self.events_tx.send(ev);
	}
}

#[async_trait]
impl ChatConnection for FakeChat {
	fn events(&self) -> EventRx {
		self.subscribed.store(true, Ordering::SeqCst);
		self.events_tx.subscribe()
	}

	async fn connect(&self) -> anyhow::Result<()> {
		if self.fail_connect.load(Ordering::SeqCst) {
			anyhow::bail!("connect refused");
		}
		if self.hang_connect.load(Ordering::SeqCst) {
			std::future::pending::<()>().await;
		}
		self.connected.store(true, Ordering::SeqCst);
		self.closed.store(false, Ordering::SeqCst);
		Ok(())
	}

	async fn join(&self, channel: &ChannelName) -> anyhow::Result<()> {
		anyhow::ensure!(self.connected.load(Ordering::SeqCst), "not connected");
		if !self.ignore_join.lock().contains(channel) {
			self.joined.lock().insert(channel.clone());
		}
		Ok(())
	}

	async fn leave(&self, channel: &ChannelName) -> anyhow::Result<()> {
		if !self.ignore_leave.lock().contains(channel) {
			self.joined.lock().remove(channel);
		}
		Ok(())
	}

	fn joined_channels(&self) -> Vec<ChannelName> {
		self.joined.lock().iter().cloned().collect()
	}

	async fn send_message(&self, channel: &ChannelName, text: &str) -> anyhow::Result<()> {
		self.sent.lock().push((channel.clone(), text.to_string()));
		Ok(())
	}

	async fn listen_channel_events(&self, broadcaster_id: &str) -> anyhow::Result<()> {
		self.listened_ids.lock().push(broadcaster_id.to_string());
		Ok(())
	}

	async fn enable_follow_events(&self, channels: &[ChannelName]) -> anyhow::Result<()> {
		self.follows.lock().extend(channels.iter().cloned());
		Ok(())
	}

	async fn disable_follow_events(&self, channels: &[ChannelName]) -> anyhow::Result<()> {
		let mut follows = self.follows.lock();
		for c in channels {
			follows.remove(c);
		}
		Ok(())
	}

	async fn close(&self) {
		self.connected.store(false, Ordering::SeqCst);
		self.closed.store(true, Ordering::SeqCst);
	}
}

pub(crate) struct FakeConnector {
	pub api: Arc<FakeApi>,
	pub scopes: Mutex<Vec<String>>,
	pub fail_auth: AtomicBool,
	pub fail_listener_connect: AtomicBool,
	pub hang_listener_connect: AtomicBool,
	pub fail_revoke: AtomicBool,
	/// Channels a fresh listener reports as already joined.
	pub prejoined: Mutex<Vec<ChannelName>>,
	pub auth_calls: AtomicUsize,
	pub revoke_calls: AtomicUsize,
	pub listeners: Mutex<Vec<Arc<FakeChat>>>,
	pub senders: Mutex<Vec<Arc<FakeChat>>>,
}

impl Default for FakeConnector {
	fn default() -> Self {
		Self {
			api: Arc::new(FakeApi::default()),
			scopes: Mutex::new(vec!["chat:read".to_string(), "chat:edit".to_string()]),
			fail_auth: AtomicBool::new(false),
			fail_listener_connect: AtomicBool::new(false),
			hang_listener_connect: AtomicBool::new(false),
			fail_revoke: AtomicBool::new(false),
			prejoined: Mutex::new(Vec::new()),
			auth_calls: AtomicUsize::new(0),
			revoke_calls: AtomicUsize::new(0),
			listeners: Mutex::new(Vec::new()),
			senders: Mutex::new(Vec::new()),
		}
	}
}

impl FakeConnector {
	pub fn last_listener(&self) -> Arc<FakeChat> {
		self.listeners.lock().last().cloned().expect("a listener was built")
	}

	pub fn last_sender(&self) -> Arc<FakeChat> {
		self.senders.lock().last().cloned().expect("a sender was built")
	}
}

#[async_trait]
impl PlatformConnector for FakeConnector {
	async fn authenticate(&self, token: &SecretString) -> anyhow::Result<Credential> {
		self.auth_calls.fetch_add(1, Ordering::SeqCst);
		if self.fail_auth.load(Ordering::SeqCst) {
			anyhow::bail!("twitch validate token failed: status=401");
		}
		Ok(Credential {
			token: token.clone(),
			client_id: "client".to_string(),
			login: "me".to_string(),
			user_id: "100".to_string(),
			scopes: self.scopes.lock().clone(),
			expires_in: None,
		})
	}

	fn api(&self, _credential: &Credential) -> anyhow::Result<Arc<dyn HelixApi>> {
		Ok(self.api.clone())
	}

	fn listener(&self, _credential: &Credential, _api: Arc<dyn HelixApi>) -> anyhow::Result<Arc<dyn ChatConnection>> {
		let chat = Arc::new(FakeChat::default());
		chat.fail_connect
			.store(self.fail_listener_connect.load(Ordering::SeqCst), Ordering::SeqCst);
		chat.hang_connect
			.store(self.hang_listener_connect.load(Ordering::SeqCst), Ordering::SeqCst);
		chat.joined.lock().extend(self.prejoined.lock().iter().cloned());
		self.listeners.lock().push(chat.clone());
		Ok(chat)
	}

	fn sender(&self, _credential: &Credential) -> anyhow::Result<Arc<dyn ChatConnection>> {
		let chat = Arc::new(FakeChat::default());
		chat.joined.lock().insert(chan("leftover"));
		self.senders.lock().push(chat.clone());
		Ok(chat)
	}

	async fn revoke(&self, _token: &SecretString) -> anyhow::Result<()> {
		self.revoke_calls.fetch_add(1, Ordering::SeqCst);
		if self.fail_revoke.load(Ordering::SeqCst) {
			anyhow::bail!("twitch revoke token failed: status=400");
		}
		Ok(())
	}
}

/// Records everything the core hands to the host.
#[derive(Default)]
pub(crate) struct Recorder {
	pub lines: Mutex<Vec<Line>>,
	pub messages: Mutex<Vec<ChatMessage>>,
	pub removals: Mutex<Vec<String>>,
	pub sounds: Mutex<Vec<(SoundCue, f32, f32)>>,
	pub clipboard: Mutex<Vec<String>>,
	pub aux: Mutex<Vec<String>>,
	pub fail_aux: AtomicBool,
}

impl Recorder {
	pub fn texts(&self) -> Vec<String> {
		self.lines.lock().iter().map(Line::plain).collect()
	}

	pub fn has_text(&self, needle: &str) -> bool {
		self.texts().iter().any(|t| t.contains(needle))
	}

	pub fn sinks(self: &Arc<Self>) -> HostSinks {
		HostSinks {
			notifications: self.clone(),
			messages: self.clone(),
			removals: self.clone(),
			sounds: self.clone(),
			clipboard: self.clone(),
			aux: self.clone(),
		}
	}
}

impl NotificationSink for Recorder {
	fn add_line(&self, line: Line) {
		self.lines.lock().push(line);
	}
}

impl MessageHandler for Recorder {
	fn handle_message(&self, message: ChatMessage) {
		self.messages.lock().push(message);
	}
}

impl MessageRemovalSink for Recorder {
	fn remove_message(&self, channel_id: Option<&str>, message_id: &PlatformMessageId) {
		self.removals
			.lock()
			.push(format!("message:{}:{message_id}", channel_id.unwrap_or("-")));
	}

	fn clear_user_messages(&self, channel_id: Option<&str>, user: &str) {
		self.removals
			.lock()
			.push(format!("user:{}:{user}", channel_id.unwrap_or("-")));
	}

	fn clear_chat(&self, channel_id: Option<&str>) {
		self.removals.lock().push(format!("chat:{}", channel_id.unwrap_or("-")));
	}
}

impl SoundSink for Recorder {
	fn play(&self, cue: SoundCue, volume: f32, pitch: f32) {
		self.sounds.lock().push((cue, volume, pitch));
	}
}

impl ClipboardSink for Recorder {
	fn copy(&self, text: &str) {
		self.clipboard.lock().push(text.to_string());
	}
}

#[async_trait]
impl AuxiliarySync for Recorder {
	async fn sync_global_badges(&self, _api: &dyn HelixApi) -> anyhow::Result<()> {
		self.aux.lock().push("global_badges".to_string());
		Ok(())
	}

	async fn sync_channel_badges(&self, _api: &dyn HelixApi, channel_ids: &[String]) -> anyhow::Result<()> {
		if self.fail_aux.load(Ordering::SeqCst) {
			anyhow::bail!("badge sync failed");
		}
		self.aux.lock().push(format!("channel_badges:{}", channel_ids.join(",")));
		Ok(())
	}

	async fn sync_global_emotes(&self, _api: &dyn HelixApi) -> anyhow::Result<()> {
		self.aux.lock().push("global_emotes".to_string());
		Ok(())
	}

	async fn sync_channel_emotes(&self, _api: &dyn HelixApi, channel_ids: &[String]) -> anyhow::Result<()> {
		self.aux.lock().push(format!("channel_emotes:{}", channel_ids.join(",")));
		Ok(())
	}
}
