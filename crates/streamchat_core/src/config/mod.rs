#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use parking_lot::RwLock;
use serde::Deserialize;
use streamchat_domain::{ChannelName, dedup_channels, push_unique_channel};
use streamchat_platform::SecretString;
use tracing::{info, warn};


pub const DEFAULT_PREFIX: &str = "[TWITCH]";
const DEFAULT_EVENT_SOUND_VOLUME: f32 = 1.0;

/// Settings shared between the facade, the session and the dispatcher.
pub type SharedSettings = Arc<RwLock<Settings>>;

/// Default config path: `~/.streamchat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".streamchat").join("config.toml"))
}

/// Load settings from the default path and env overrides.
pub fn load_settings() -> anyhow::Result<Settings> {
	let path = default_config_path()?;
	load_settings_from_path(&path)
}

/// Same as `load_settings` but with an explicit config path.
pub fn load_settings_from_path(path: &Path) -> anyhow::Result<Settings> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut settings = Settings::from_file(file_cfg);
	apply_env_overrides(&mut settings);
	Ok(settings)
}

/// Typed runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
	pub twitch_enabled: bool,
	pub twitch_token: SecretString,
	/// Configured channels, case-normalized and deduplicated.
	pub twitch_channels: Vec<ChannelName>,
	pub twitch_selected_channel: Option<ChannelName>,
	pub follow_event_enabled: bool,
	pub allow_message_deletion: bool,
	pub force_show_channel_name: bool,
	pub play_sound_on_follow: bool,
	pub play_sound_on_message: bool,
	/// 0.0..=1.0
	pub event_sound_volume: f32,
	pub update_checker_enabled: bool,
	/// GitHub `owner/name` whose releases the update checker follows.
	pub release_repository: Option<String>,
	/// Prefix of host lines that announce platform events.
	pub prefix: String,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			twitch_enabled: false,
			twitch_token: SecretString::default(),
			twitch_channels: Vec::new(),
			twitch_selected_channel: None,
			follow_event_enabled: false,
			allow_message_deletion: true,
			force_show_channel_name: false,
			play_sound_on_follow: true,
			play_sound_on_message: false,
			event_sound_volume: DEFAULT_EVENT_SOUND_VOLUME,
			update_checker_enabled: true,
			release_repository: None,
			prefix: DEFAULT_PREFIX.to_string(),
		}
	}
}

impl Settings {
	pub fn into_shared(self) -> SharedSettings {
		Arc::new(RwLock::new(self))
	}

	pub fn has_token(&self) -> bool {
		!self.twitch_token.is_blank()
	}

	/// Add a channel unless an equal one is configured. Returns `true` when the list changed.
	pub fn add_channel(&mut self, channel: ChannelName) -> bool {
		push_unique_channel(&mut self.twitch_channels, channel)
	}

	/// Remove a channel. Returns `true` when the list changed.
	pub fn remove_channel(&mut self, channel: &ChannelName) -> bool {
		let before = self.twitch_channels.len();
		self.twitch_channels.retain(|c| c != channel);
		before != self.twitch_channels.len()
	}

	fn from_file(file: FileConfig) -> Self {
		let defaults = Settings::default();
		let channels = file.twitch.channels.iter().filter_map(|raw| match ChannelName::new(raw) {
			Ok(c) => Some(c),
			Err(e) => {
				warn!(channel = %raw, error = %e, "config: ignoring invalid channel");
				None
			}
		});

		Self {
			twitch_enabled: file.twitch.enabled.unwrap_or(defaults.twitch_enabled),
			twitch_token: file
				.twitch
				.token
				.map(|t| SecretString::new(t.trim()))
				.unwrap_or_default(),
			twitch_channels: dedup_channels(channels),
			twitch_selected_channel: file
				.twitch
				.selected_channel
				.filter(|s| !s.trim().is_empty())
				.and_then(|s| ChannelName::new(s).ok()),
			follow_event_enabled: file.twitch.follow_event_enabled.unwrap_or(defaults.follow_event_enabled),
			allow_message_deletion: file
				.twitch
				.allow_message_deletion
				.unwrap_or(defaults.allow_message_deletion),
			force_show_channel_name: file
				.twitch
				.force_show_channel_name
				.unwrap_or(defaults.force_show_channel_name),
			play_sound_on_follow: file.sounds.play_on_follow.unwrap_or(defaults.play_sound_on_follow),
			play_sound_on_message: file.sounds.play_on_message.unwrap_or(defaults.play_sound_on_message),
			event_sound_volume: file
				.sounds
				.event_volume
				.map(|v| v.clamp(0.0, 1.0))
				.unwrap_or(defaults.event_sound_volume),
			update_checker_enabled: file.update_checker_enabled.unwrap_or(defaults.update_checker_enabled),
			release_repository: file
				.release_repository
				.map(|r| r.trim().trim_matches('/').to_string())
				.filter(|r| !r.is_empty()),
			prefix: file.prefix.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.prefix),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	prefix: Option<String>,
	update_checker_enabled: Option<bool>,
	release_repository: Option<String>,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	sounds: FileSoundSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	enabled: Option<bool>,
	token: Option<String>,
	#[serde(default)]
	channels: Vec<String>,
	selected_channel: Option<String>,
	follow_event_enabled: Option<bool>,
	allow_message_deletion: Option<bool>,
	force_show_channel_name: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSoundSettings {
	play_on_follow: Option<bool>,
	play_on_message: Option<bool>,
	event_volume: Option<f32>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(settings: &mut Settings) {
	if let Ok(v) = std::env::var("STREAMCHAT_TWITCH_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		settings.twitch_enabled = enabled;
		info!(enabled, "twitch config: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("STREAMCHAT_TWITCH_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			settings.twitch_token = SecretString::new(v);
			info!("twitch config: token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("STREAMCHAT_TWITCH_CHANNELS") {
		let channels = v.split(',').filter(|s| !s.trim().is_empty()).filter_map(|s| ChannelName::new(s).ok());
		settings.twitch_channels = dedup_channels(channels);
		info!(
			count = settings.twitch_channels.len(),
			"twitch config: channels overridden by env"
		);
	}

	if let Ok(v) = std::env::var("STREAMCHAT_TWITCH_SELECTED_CHANNEL") {
		settings.twitch_selected_channel = ChannelName::new(&v).ok();
		info!("twitch config: selected_channel overridden by env");
	}

	if let Ok(v) = std::env::var("STREAMCHAT_FOLLOW_EVENTS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		settings.follow_event_enabled = enabled;
		info!(enabled, "twitch config: follow_event_enabled overridden by env");
	}

	if let Ok(v) = std::env::var("STREAMCHAT_ALLOW_MESSAGE_DELETION")
		&& let Some(allow) = parse_env_bool(&v)
	{
		settings.allow_message_deletion = allow;
		info!(allow, "twitch config: allow_message_deletion overridden by env");
	}

	if let Ok(v) = std::env::var("STREAMCHAT_UPDATE_CHECKER")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		settings.update_checker_enabled = enabled;
		info!(enabled, "config: update_checker_enabled overridden by env");
	}

	if let Ok(v) = std::env::var("STREAMCHAT_RELEASE_REPOSITORY") {
		let v = v.trim().trim_matches('/').to_string();
		settings.release_repository = (!v.is_empty()).then_some(v);
		info!("config: release_repository overridden by env");
	}

	if settings.twitch_enabled && !settings.has_token() {
		warn!("twitch config: enabled without a token; the session will not start");
	}

	if let Some(selected) = &settings.twitch_selected_channel
		&& !settings.twitch_channels.contains(selected)
	{
		warn!(channel = %selected, "twitch config: selected channel is not in the channel list");
	}
}
