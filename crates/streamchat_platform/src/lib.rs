#![forbid(unsafe_code)]

pub mod twitch;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use streamchat_domain::{ChannelName, PlatformMessageId};
use tokio::sync::broadcast;

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Result of authenticating a user token.
#[derive(Debug, Clone)]
pub struct Credential {
	pub token: SecretString,
	pub client_id: String,
	pub login: String,
	pub user_id: String,
	pub scopes: Vec<String>,
	pub expires_in: Option<Duration>,
}

/// Platform user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub id: String,
	pub login: String,
	pub display_name: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub broadcaster_type: String,
	#[serde(default)]
	pub profile_image_url: String,
}

/// Game / stream category record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub box_art_url: String,
}

/// Materialized clip record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
	pub id: String,
	pub url: String,
	#[serde(default)]
	pub broadcaster_id: String,
	#[serde(default)]
	pub broadcaster_name: String,
	#[serde(default)]
	pub creator_name: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub game_id: String,
	#[serde(default)]
	pub view_count: u64,
	#[serde(default)]
	pub duration: f64,
}

/// Response to a clip creation request; the clip itself materializes later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedClip {
	pub id: String,
	#[serde(default)]
	pub edit_url: String,
}

/// Snapshot of users present in a channel's chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chatters {
	pub channel: ChannelName,
	pub total: u64,
	pub logins: Vec<String>,
}

/// Live stream record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
	pub user_id: String,
	pub user_login: String,
	pub user_name: String,
	#[serde(default)]
	pub game_name: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub viewer_count: u64,
	pub started_at: DateTime<Utc>,
}

impl StreamInfo {
	pub fn uptime(&self, now: DateTime<Utc>) -> Duration {
		(now - self.started_at).to_std().unwrap_or_default()
	}
}

/// Stream marker record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMarker {
	pub id: String,
	#[serde(default)]
	pub description: String,
	pub position_seconds: u64,
}

/// Chat emote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emote {
	pub id: String,
	pub name: String,
}

/// Chat badge set with its versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeSet {
	pub set_id: String,
	pub versions: Vec<BadgeVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeVersion {
	pub id: String,
	#[serde(default)]
	pub title: Option<String>,
	pub image_url_1x: String,
}

/// Channel follower record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follower {
	pub user_id: String,
	pub user_login: String,
	pub user_name: String,
}

/// User lookup selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserQuery {
	Ids(Vec<String>),
	Logins(Vec<String>),
}

/// Platform user reference carried by events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
	pub id: Option<String>,
	pub login: String,
	pub display: Option<String>,
}

impl UserRef {
	pub fn display_name(&self) -> &str {
		self.display.as_deref().filter(|d| !d.trim().is_empty()).unwrap_or(&self.login)
	}
}

/// Normalized chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
	pub channel: ChannelName,
	pub channel_id: Option<String>,
	pub id: Option<PlatformMessageId>,
	pub author: UserRef,
	pub text: String,
	/// `/me` message.
	pub is_action: bool,
	/// Badge ids as `set/version`.
	pub badges: Vec<String>,
	pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardRedemption {
	pub channel: ChannelName,
	pub channel_id: Option<String>,
	pub user: UserRef,
	pub reward: String,
}

/// Subscription tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubPlan {
	Prime,
	Tier1,
	Tier2,
	Tier3,
	Other(String),
}

impl SubPlan {
	pub fn parse(raw: &str) -> Self {
		match raw.trim() {
			"Prime" => Self::Prime,
			"1000" => Self::Tier1,
			"2000" => Self::Tier2,
			"3000" => Self::Tier3,
			other => Self::Other(other.to_string()),
		}
	}

	pub fn ordinal_name(&self) -> &str {
		match self {
			Self::Prime => "Prime",
			Self::Tier1 => "Tier 1",
			Self::Tier2 => "Tier 2",
			Self::Tier3 => "Tier 3",
			Self::Other(raw) => raw,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
	pub channel: ChannelName,
	pub channel_id: Option<String>,
	pub user: UserRef,
	pub plan: SubPlan,
	pub months: Option<u32>,
	pub gift: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cheer {
	pub channel: ChannelName,
	pub channel_id: Option<String>,
	pub user: UserRef,
	pub bits: u64,
	pub total_bits: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Follow {
	pub channel: ChannelName,
	pub channel_id: String,
	pub user: UserRef,
}

/// Server notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
	pub channel: Option<ChannelName>,
	/// `msg-id` tag, lowercase snake case.
	pub tag: Option<String>,
	/// Notice body; `None` when the server sent an empty one.
	pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raid {
	pub channel: ChannelName,
	pub channel_id: Option<String>,
	pub raider: UserRef,
	pub viewers: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundHost {
	pub channel: ChannelName,
	pub hoster: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeleted {
	pub channel: ChannelName,
	pub channel_id: Option<String>,
	pub message_id: PlatformMessageId,
	pub login: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCleared {
	pub channel: ChannelName,
	pub channel_id: Option<String>,
}

/// Timeout or ban of a single user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRestricted {
	pub channel: ChannelName,
	pub channel_id: Option<String>,
	pub user: UserRef,
	pub duration: Option<Duration>,
}

/// Normalized inbound platform event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
	Message(ChatMessage),
	Reward(RewardRedemption),
	Subscription(Subscription),
	Cheer(Cheer),
	Follow(Follow),
	Notice(Notice),
	Raid(Raid),
	Host(InboundHost),
	MessageDeleted(MessageDeleted),
	ChatCleared(ChatCleared),
	UserTimedOut(UserRestricted),
	UserBanned(UserRestricted),
}

/// Event categories a listener can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
	Reward,
	Subscription,
	Cheer,
	Message,
	Follow,
	Notice,
	Raid,
	Host,
	MessageDeleted,
	ChatCleared,
	UserTimedOut,
	UserBanned,
}

impl EventCategory {
	pub const ALL: [EventCategory; 12] = [
		Self::Reward,
		Self::Subscription,
		Self::Cheer,
		Self::Message,
		Self::Follow,
		Self::Notice,
		Self::Raid,
		Self::Host,
		Self::MessageDeleted,
		Self::ChatCleared,
		Self::UserTimedOut,
		Self::UserBanned,
	];

	/// Categories scoped to a single broadcaster (topic-style listening).
	pub fn is_channel_scoped(self) -> bool {
		matches!(self, Self::Reward | Self::Subscription | Self::Cheer)
	}
}

impl PlatformEvent {
	pub fn category(&self) -> EventCategory {
		match self {
			Self::Message(_) => EventCategory::Message,
			Self::Reward(_) => EventCategory::Reward,
			Self::Subscription(_) => EventCategory::Subscription,
			Self::Cheer(_) => EventCategory::Cheer,
			Self::Follow(_) => EventCategory::Follow,
			Self::Notice(_) => EventCategory::Notice,
			Self::Raid(_) => EventCategory::Raid,
			Self::Host(_) => EventCategory::Host,
			Self::MessageDeleted(_) => EventCategory::MessageDeleted,
			Self::ChatCleared(_) => EventCategory::ChatCleared,
			Self::UserTimedOut(_) => EventCategory::UserTimedOut,
			Self::UserBanned(_) => EventCategory::UserBanned,
		}
	}

	/// Broadcaster id the event belongs to, when the platform reported one.
	pub fn channel_id(&self) -> Option<&str> {
		match self {
			Self::Message(m) => m.channel_id.as_deref(),
			Self::Reward(r) => r.channel_id.as_deref(),
			Self::Subscription(s) => s.channel_id.as_deref(),
			Self::Cheer(c) => c.channel_id.as_deref(),
			Self::Follow(f) => Some(f.channel_id.as_str()),
			Self::Raid(r) => r.channel_id.as_deref(),
			Self::MessageDeleted(d) => d.channel_id.as_deref(),
			Self::ChatCleared(c) => c.channel_id.as_deref(),
			Self::UserTimedOut(u) | Self::UserBanned(u) => u.channel_id.as_deref(),
			Self::Notice(_) | Self::Host(_) => None,
		}
	}
}

/// Receiving end of a connection's event stream.
pub type EventRx = broadcast::Receiver<PlatformEvent>;

/// Remote lookup/mutation API of the platform.
#[async_trait]
pub trait HelixApi: Send + Sync + 'static {
	async fn get_games(&self, ids: &[String]) -> anyhow::Result<Vec<Category>>;

	async fn get_clips_by_id(&self, ids: &[String]) -> anyhow::Result<Vec<Clip>>;

	async fn get_clips_by_broadcaster(&self, broadcaster_id: &str, first: u32) -> anyhow::Result<Vec<Clip>>;

	async fn create_clip(&self, broadcaster_id: &str, has_delay: bool) -> anyhow::Result<Vec<CreatedClip>>;

	async fn get_users(&self, query: &UserQuery) -> anyhow::Result<Vec<User>>;

	async fn get_chatters(&self, channel: &ChannelName) -> anyhow::Result<Chatters>;

	async fn get_streams(&self, logins: &[String]) -> anyhow::Result<Vec<StreamInfo>>;

	async fn create_stream_marker(&self, broadcaster_id: &str, description: Option<&str>) -> anyhow::Result<StreamMarker>;

	async fn get_global_emotes(&self) -> anyhow::Result<Vec<Emote>>;

	async fn get_channel_emotes(&self, broadcaster_id: &str) -> anyhow::Result<Vec<Emote>>;

	async fn get_global_badges(&self) -> anyhow::Result<Vec<BadgeSet>>;

	async fn get_channel_badges(&self, broadcaster_id: &str) -> anyhow::Result<Vec<BadgeSet>>;

	async fn get_channel_followers(&self, broadcaster_id: &str, first: u32) -> anyhow::Result<Vec<Follower>>;
}

/// A persistent chat connection.
///
/// The listener flavour receives events and joins channels; the sender
/// flavour is only used to write messages.
#[async_trait]
pub trait ChatConnection: Send + Sync + 'static {
	/// Subscribe to decoded events. Subscribe before `connect` to see everything.
	fn events(&self) -> EventRx;

	async fn connect(&self) -> anyhow::Result<()>;

	async fn join(&self, channel: &ChannelName) -> anyhow::Result<()>;

	async fn leave(&self, channel: &ChannelName) -> anyhow::Result<()>;

	fn joined_channels(&self) -> Vec<ChannelName>;

	fn is_joined(&self, channel: &ChannelName) -> bool {
		self.joined_channels().contains(channel)
	}

	async fn send_message(&self, channel: &ChannelName, text: &str) -> anyhow::Result<()>;

	/// Start delivering channel-scoped events (rewards, subs, cheers) for a broadcaster.
	async fn listen_channel_events(&self, broadcaster_id: &str) -> anyhow::Result<()>;

	async fn enable_follow_events(&self, channels: &[ChannelName]) -> anyhow::Result<()>;

	async fn disable_follow_events(&self, channels: &[ChannelName]) -> anyhow::Result<()>;

	async fn close(&self);
}

/// Factory for authenticated platform handles.
#[async_trait]
pub trait PlatformConnector: Send + Sync + 'static {
	async fn authenticate(&self, token: &SecretString) -> anyhow::Result<Credential>;

	fn api(&self, credential: &Credential) -> anyhow::Result<Arc<dyn HelixApi>>;

	fn listener(&self, credential: &Credential, api: Arc<dyn HelixApi>) -> anyhow::Result<Arc<dyn ChatConnection>>;

	fn sender(&self, credential: &Credential) -> anyhow::Result<Arc<dyn ChatConnection>>;

	async fn revoke(&self, token: &SecretString) -> anyhow::Result<()>;
}
