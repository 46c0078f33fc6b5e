#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use streamchat_core::config::load_settings;
use streamchat_core::coordinator::ScheduleOutcome;
use streamchat_core::host::{
	AuxiliarySync, ClipboardSink, HostSinks, Line, MessageHandler, MessageRemovalSink, NotificationSink, SoundCue, SoundSink,
};
use streamchat_core::update::{GithubReleases, ReleaseSource};
use streamchat_core::{StreamChat, VERSION};
use streamchat_domain::{ChannelName, PlatformMessageId};
use streamchat_platform::twitch::{TwitchConfig, TwitchConnector};
use streamchat_platform::{ChatMessage, HelixApi};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,streamchat_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Terminal host: lines go to stdout, everything else is logged.
struct Console;

impl NotificationSink for Console {
	fn add_line(&self, line: Line) {
		println!("{}", line.plain());
	}
}

impl MessageHandler for Console {
	fn handle_message(&self, message: ChatMessage) {
		let sep = if message.is_action { " " } else { ": " };
		println!(
			"[{}] {}{sep}{}",
			message.channel,
			message.author.display_name(),
			message.text
		);
	}
}

impl MessageRemovalSink for Console {
	fn remove_message(&self, channel_id: Option<&str>, message_id: &PlatformMessageId) {
		info!(channel_id, message_id = %message_id, "message removed");
	}

	fn clear_user_messages(&self, channel_id: Option<&str>, user: &str) {
		info!(channel_id, user, "user messages cleared");
	}

	fn clear_chat(&self, channel_id: Option<&str>) {
		info!(channel_id, "chat cleared");
	}
}

impl SoundSink for Console {
	fn play(&self, cue: SoundCue, volume: f32, pitch: f32) {
		debug!(?cue, volume, pitch, "sound cue");
	}
}

impl ClipboardSink for Console {
	fn copy(&self, text: &str) {
		info!(text, "copy to clipboard");
	}
}

#[async_trait]
impl AuxiliarySync for Console {
	async fn sync_global_badges(&self, api: &dyn HelixApi) -> anyhow::Result<()> {
		let sets = api.get_global_badges().await?;
		debug!(sets = sets.len(), "global badges synced");
		Ok(())
	}

	async fn sync_channel_badges(&self, api: &dyn HelixApi, channel_ids: &[String]) -> anyhow::Result<()> {
		for id in channel_ids {
			let sets = api.get_channel_badges(id).await?;
			debug!(channel_id = %id, sets = sets.len(), "channel badges synced");
		}
		Ok(())
	}

	async fn sync_global_emotes(&self, api: &dyn HelixApi) -> anyhow::Result<()> {
		let emotes = api.get_global_emotes().await?;
		debug!(emotes = emotes.len(), "global emotes synced");
		Ok(())
	}

	async fn sync_channel_emotes(&self, api: &dyn HelixApi, channel_ids: &[String]) -> anyhow::Result<()> {
		for id in channel_ids {
			let emotes = api.get_channel_emotes(id).await?;
			debug!(channel_id = %id, emotes = emotes.len(), "channel emotes synced");
		}
		Ok(())
	}
}

fn console_sinks() -> HostSinks {
	let console = Arc::new(Console);
	HostSinks {
		notifications: console.clone(),
		messages: console.clone(),
		removals: console.clone(),
		sounds: console.clone(),
		clipboard: console.clone(),
		aux: console,
	}
}

fn channel_arg(arg: Option<&str>) -> Option<ChannelName> {
	let name = arg?;
	match ChannelName::new(name) {
		Ok(c) => Some(c),
		Err(e) => {
			println!("Invalid channel {name:?}: {e}");
			None
		}
	}
}

/// One command per stdin line. Returns `false` on `quit`.
fn run_command(chat: &StreamChat, line: &str) -> bool {
	let mut parts = line.split_whitespace();
	let Some(cmd) = parts.next() else {
		return true;
	};
	let rest: Vec<&str> = parts.collect();
	let outcome = match cmd {
		"quit" | "exit" => return false,
		"status" => {
			chat.print_status();
			return true;
		}
		"enable" => chat.start_session(true),
		"disable" => chat.stop_session(),
		"reload" => chat.restart_session(true),
		"revoke" => chat.revoke_token(),
		"follows" => chat.update_follow_events(),
		"join" => match channel_arg(rest.first().copied()) {
			Some(c) => chat.join_channel(c),
			None => return true,
		},
		"leave" => match channel_arg(rest.first().copied()) {
			Some(c) => chat.leave_channel(c),
			None => return true,
		},
		"clip" => chat.create_clip(rest.first().map(|s| s.to_string()), true, false),
		"marker" => {
			let description = (!rest.is_empty()).then(|| rest.join(" "));
			chat.create_marker(description, None)
		}
		"stats" => chat.show_stream_stats(rest.first().and_then(|c| channel_arg(Some(c)))),
		other => {
			println!(
				"Unknown command: {other} (status, enable, disable, reload, revoke, follows, join, leave, clip, marker, stats, quit)"
			);
			return true;
		}
	};
	if !outcome.is_accepted() {
		println!("Please wait, the previous action has not finished yet.");
	}
	true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let settings = load_settings()?;
	let releases = match settings.release_repository.as_deref() {
		Some(repo) => match GithubReleases::new(repo) {
			Ok(source) => Some(Arc::new(source) as Arc<dyn ReleaseSource>),
			Err(e) => {
				warn!(error = ?e, "update checker unavailable");
				None
			}
		},
		None => None,
	};
	let connector = Arc::new(TwitchConnector::new(TwitchConfig::new()?));

	info!(version = VERSION, "starting streamchat");
	let chat = StreamChat::new(settings, connector, console_sinks(), releases);
	if let ScheduleOutcome::Rejected(reason) = chat.boot() {
		warn!(%reason, "twitch session start was not scheduled");
	}

	let mut stdin = BufReader::new(tokio::io::stdin()).lines();
	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => break,
			line = stdin.next_line() => match line? {
				Some(line) => {
					if !run_command(&chat, line.trim()) {
						break;
					}
				}
				None => {
					tokio::signal::ctrl_c().await?;
					break;
				}
			},
		}
	}

	chat.shutdown().await;
	Ok(())
}
