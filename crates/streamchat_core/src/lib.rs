#![forbid(unsafe_code)]

//! Twitch chat session coordination for a long-running host application.
//!
//! [`StreamChat`] is the host-facing entry point. Session mutations and
//! remote calls run on a single action worker; lookups go through
//! read-through caches; platform events come back to the host through the
//! sinks in [`host`].

pub mod cache;
pub mod clip;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod host;
pub mod session;
pub mod update;

#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use streamchat_domain::ChannelName;
use streamchat_platform::{Category, Chatters, Clip, PlatformConnector, User};
use tracing::{info, warn};

use crate::cache::{ApiSlot, LookupCache};
use crate::clip::{ClipCreator, ClipError};
use crate::config::{Settings, SharedSettings};
use crate::coordinator::{ActionCoordinator, RejectReason, ScheduleOutcome};
use crate::host::{HostSinks, Line, Link, Span, Tone};
use crate::session::{SessionController, SessionError};
use crate::update::{ReleaseSource, UpdateChecker, VersionStatus};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Scopes the token needs for every feature to work.
pub const REQUIRED_SCOPES: [&str; 9] = [
	"channel:read:subscriptions",
	"channel:read:redemptions",
	"chat:read",
	"chat:edit",
	"channel:moderate",
	"channel:manage:broadcast",
	"user:edit:broadcast",
	"clips:edit",
	"bits:read",
];

const NOT_ENABLED: &str = "Twitch chat is not enabled!";
const TOKEN_HINT: &str = "/twitch token";

/// Host-facing handle. Cheap to clone.
#[derive(Clone)]
pub struct StreamChat {
	inner: Arc<Inner>,
}

struct Inner {
	settings: SharedSettings,
	sinks: HostSinks,
	connector: Arc<dyn PlatformConnector>,
	api: Arc<ApiSlot>,
	cache: Arc<LookupCache>,
	sessions: SessionController,
	coordinator: ActionCoordinator,
	clips: ClipCreator,
	updates: Option<UpdateChecker>,
}

impl StreamChat {
	/// Wire every component. Must be called from within a tokio runtime.
	pub fn new(
		settings: Settings,
		connector: Arc<dyn PlatformConnector>,
		sinks: HostSinks,
		releases: Option<Arc<dyn ReleaseSource>>,
	) -> Self {
		let settings = settings.into_shared();
		let api = Arc::new(ApiSlot::default());
		let cache = Arc::new(LookupCache::new(api.clone()));
		let sessions = SessionController::new(
			connector.clone(),
			settings.clone(),
			api.clone(),
			cache.clone(),
			sinks.clone(),
		);
		let coordinator = ActionCoordinator::start(sinks.notifications.clone());
		let updates =
			releases.map(|source| UpdateChecker::new(source, VERSION, settings.clone(), sinks.notifications.clone()));

		Self {
			inner: Arc::new(Inner {
				settings,
				sinks,
				connector,
				api,
				cache,
				sessions,
				coordinator,
				clips: ClipCreator::new(),
				updates,
			}),
		}
	}

	pub fn settings(&self) -> &SharedSettings {
		&self.inner.settings
	}

	/// Start what the settings ask for: the update checker and the session.
	pub fn boot(&self) -> ScheduleOutcome {
		if self.inner.settings.read().update_checker_enabled {
			self.start_update_checker(true);
		}
		if self.inner.settings.read().twitch_enabled {
			self.start_session(true)
		} else {
			ScheduleOutcome::Accepted
		}
	}

	fn schedule<F, Fut>(&self, label: &'static str, important: bool, f: F) -> ScheduleOutcome
	where
		F: FnOnce(Arc<Inner>) -> Fut,
		Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		let action = f(self.inner.clone());
		self.inner.coordinator.schedule(label, important, action)
	}

	/// `true` while a session start/stop/restart/revoke is pending.
	pub fn is_action_scheduled(&self) -> bool {
		self.inner.coordinator.is_action_scheduled()
	}

	pub fn start_session(&self, sync_aux: bool) -> ScheduleOutcome {
		self.schedule("start_session", true, move |inner| async move {
			match inner.sessions.start(sync_aux).await {
				Ok(_) => {
					inner.sinks.success("Enabled the Twitch Chat!");
					inner.check_scopes();
				}
				Err(e) => inner.report_start_failure("start", &e),
			}
			Ok(())
		})
	}

	pub fn stop_session(&self) -> ScheduleOutcome {
		self.schedule("stop_session", true, |inner| async move {
			inner.sessions.stop().await;
			inner.sinks.success("Disabled the Twitch Chat!");
			Ok(())
		})
	}

	pub fn restart_session(&self, sync_aux: bool) -> ScheduleOutcome {
		self.schedule("restart_session", true, move |inner| async move {
			match inner.sessions.restart(sync_aux).await {
				Ok(_) => {
					inner.sinks.success("Restarted the Twitch Chat!");
					inner.check_scopes();
				}
				Err(e) => inner.report_start_failure("restart", &e),
			}
			Ok(())
		})
	}

	/// Stop the session, disable the feature and revoke the configured token.
	pub fn revoke_token(&self) -> ScheduleOutcome {
		self.schedule("revoke_token", true, |inner| async move {
			inner.sessions.stop().await;
			let token = {
				let mut s = inner.settings.write();
				s.twitch_enabled = false;
				s.twitch_token.clone()
			};
			match inner.connector.revoke(&token).await {
				Ok(()) => {
					inner.settings.write().twitch_token = Default::default();
					info!("twitch token revoked");
					inner.sinks.success("The token has been revoked!");
				}
				Err(e) => {
					warn!(error = ?e, "failed to revoke twitch token");
					inner
						.sinks
						.error("Could not revoke the token! It may be invalid, or the request could not have been sent!");
				}
			}
			Ok(())
		})
	}

	pub fn join_channel(&self, channel: ChannelName) -> ScheduleOutcome {
		self.schedule("join_channel", false, |inner| async move {
			match inner.sessions.join_channel(&channel).await {
				Ok(()) => inner.sinks.success(format!("Joined {channel}'s chat!")),
				Err(SessionError::NotActive) => inner.sinks.error(NOT_ENABLED),
				Err(SessionError::Inconsistent { .. }) => {
					inner.sinks.error("Something went wrong: Could not join the channel.")
				}
				Err(e) => return Err(e.into()),
			}
			Ok(())
		})
	}

	pub fn leave_channel(&self, channel: ChannelName) -> ScheduleOutcome {
		self.schedule("leave_channel", false, |inner| async move {
			match inner.sessions.leave_channel(&channel).await {
				Ok(()) => inner.sinks.success(format!("Left {channel}'s chat!")),
				Err(SessionError::NotActive) => inner.sinks.error(NOT_ENABLED),
				Err(SessionError::Inconsistent { .. }) => {
					inner.sinks.error("Something went wrong: Could not leave the channel.")
				}
				Err(e) => return Err(e.into()),
			}
			Ok(())
		})
	}

	pub fn update_follow_events(&self) -> ScheduleOutcome {
		self.schedule("update_follow_events", false, |inner| async move {
			match inner.sessions.update_follow_events().await {
				Ok(_) => inner.sinks.success("Follow event listeners updated!"),
				Err(SessionError::NotActive) => inner.sinks.error(NOT_ENABLED),
				Err(e) => return Err(e.into()),
			}
			Ok(())
		})
	}

	/// Clip a broadcaster's stream; defaults to the selected channel.
	///
	/// An explicit `broadcaster_id` is passed to the platform as is.
	pub fn create_clip(&self, broadcaster_id: Option<String>, copy_to_clipboard: bool, has_delay: bool) -> ScheduleOutcome {
		self.schedule("create_clip", false, move |inner| async move {
			if !inner.sessions.is_active() {
				inner.sinks.error(NOT_ENABLED);
				return Ok(());
			}
			if let Err(e) = inner.clips.check_cooldown() {
				inner.sinks.error(e.to_string());
				return Ok(());
			}
			let broadcaster_id = match broadcaster_id {
				Some(id) => id,
				None => match inner.resolve_broadcaster(None).await {
					Some(user) => user.id.clone(),
					None => return Ok(()),
				},
			};

			match inner.clips.create(inner.api.snapshot(), &broadcaster_id, has_delay).await {
				Ok(clip) => {
					inner.sinks.line(
						Line::text(Tone::Green, "Clip created: ").push(
							Span::new(Tone::Aqua, clip.url.clone())
								.link(Link::Url(clip.url.clone()), "Click to open or copy clip URL"),
						),
					);
					if copy_to_clipboard {
						inner.sinks.clipboard.copy(&clip.url);
					}
				}
				Err(ClipError::EmptyResponse) => inner.sinks.line(
					Line::text(Tone::Red, "Twitch API did not return any newClips! ").add(
						Tone::Gray,
						format!("(Maybe try resetting your token with {TOKEN_HINT}?)"),
					),
				),
				Err(ClipError::Remote(e)) => return Err(e.context("create clip")),
				Err(e) => inner.sinks.error(e.to_string()),
			}
			Ok(())
		})
	}

	/// Mark the current position of a broadcaster's stream; defaults to the selected channel.
	pub fn create_marker(&self, description: Option<String>, broadcaster_id: Option<String>) -> ScheduleOutcome {
		self.schedule("create_marker", false, move |inner| async move {
			let Some(api) = inner.api.snapshot() else {
				inner.sinks.error(NOT_ENABLED);
				return Ok(());
			};
			let Some(broadcaster) = inner.resolve_broadcaster(broadcaster_id.as_deref()).await else {
				return Ok(());
			};

			match api.create_stream_marker(&broadcaster.id, description.as_deref()).await {
				Ok(marker) => {
					let p = marker.position_seconds;
					inner.sinks.success(format!(
						"Successfully created a marker on {}'s stream at {:02}:{:02}:{:02}",
						broadcaster.display_name,
						p / 3600,
						p / 60 % 60,
						p % 60
					));
				}
				Err(e) => {
					warn!(broadcaster = %broadcaster.id, error = ?e, "failed to create stream marker");
					inner.sinks.lines(vec![
						Line::text(
							Tone::Red,
							format!("Failed to create marker on {}'s stream: {e:#}", broadcaster.display_name),
						),
						Line::new().push(
							Span::new(
								Tone::Gray,
								"Make sure they are streaming and that you have editor permissions on their channel!",
							)
							.italic(),
						),
						Line::new().push(
							Span::new(
								Tone::Gray,
								format!("If error persists, try regenerating your token using {TOKEN_HINT}."),
							)
							.italic(),
						),
					]);
				}
			}
			Ok(())
		})
	}

	/// Show title, category, viewers and uptime of a stream; defaults to the selected channel.
	pub fn show_stream_stats(&self, channel: Option<ChannelName>) -> ScheduleOutcome {
		let Some(channel) = channel.or_else(|| self.inner.selected_channel()) else {
			self.inner.sinks.error("No channel is selected!");
			return ScheduleOutcome::Rejected(RejectReason::NoChannelSelected);
		};
		self.schedule("show_stream_stats", false, |inner| async move {
			let Some(api) = inner.api.snapshot() else {
				inner.sinks.error(NOT_ENABLED);
				return Ok(());
			};
			let streams = match api.get_streams(&[channel.as_str().to_string()]).await {
				Ok(s) => s,
				Err(e) => {
					warn!(channel = %channel, error = ?e, "failed to look up stream");
					inner.sinks.error(format!(
						"Failed to lookup {channel}'s stream, an unexpected error occurred."
					));
					return Ok(());
				}
			};
			let Some(stream) = streams.into_iter().next() else {
				inner.sinks.line(
					Line::new()
						.push(Span::new(Tone::Red, channel.as_str()).bold())
						.add(Tone::Red, " is offline! ")
						.push(Span::new(Tone::Gray, "(or doesn't exist)").italic()),
				);
				return Ok(());
			};

			let uptime = stream.uptime(Utc::now()).as_secs();
			let field = |name: &str, value: String| Line::text(Tone::Gray, format!("{name}: ")).add(Tone::Aqua, value);
			inner.sinks.lines(vec![
				Line::new()
					.push(Span::new(Tone::Aqua, channel.as_str()).bold())
					.add(Tone::DarkAqua, "'s stream stats:"),
				field("Stream Title", stream.title),
				field("Game", stream.game_name),
				field("Viewers", stream.viewer_count.to_string()),
				field(
					"Stream uptime",
					format!(
						"{} hours {} minutes {} seconds",
						uptime / 3600,
						uptime / 60 % 60,
						uptime % 60
					),
				),
			]);
			Ok(())
		})
	}

	pub async fn get_user_by_id(&self, id: &str) -> Option<Arc<User>> {
		self.inner.cache.user_by_id(id).await
	}

	pub async fn get_user_by_name(&self, name: &str) -> Option<Arc<User>> {
		self.inner.cache.user_by_name(name).await
	}

	pub async fn get_clip(&self, id: &str) -> Option<Arc<Clip>> {
		self.inner.cache.clip(id).await
	}

	pub async fn get_category(&self, id: &str) -> Option<Arc<Category>> {
		self.inner.cache.category(id).await
	}

	pub async fn get_chatters(&self, channel: &ChannelName) -> Option<Arc<Chatters>> {
		self.inner.cache.chatters(channel).await
	}

	/// Warn when the session's token misses any of [`REQUIRED_SCOPES`].
	pub fn check_scopes(&self) {
		self.inner.check_scopes();
	}

	pub fn print_status(&self) {
		let inner = &self.inner;
		let prefix = inner.settings.read().prefix.clone();

		let state = match inner.updates.as_ref().map(UpdateChecker::status) {
			Some(VersionStatus::Latest) => Span::new(Tone::Green, "Latest version"),
			Some(VersionStatus::UpdateAvailable(release)) => {
				Span::new(Tone::Gold, format!("Update available: {}", release.version)).link(
					Link::Url(release.page_url),
					"Click here to see releases on GitHub!",
				)
			}
			Some(VersionStatus::Unknown) | None => Span::new(Tone::Red, "Could not check latest version"),
		};
		inner.sinks.line(
			Line::prefixed(&prefix, None)
				.add(Tone::Gray, "Version: ")
				.push(Span::new(Tone::Aqua, VERSION).bold())
				.add(Tone::Gray, " (")
				.push(state)
				.add(Tone::Gray, ")"),
		);

		let (enabled, has_token, selected) = {
			let s = inner.settings.read();
			(s.twitch_enabled, s.has_token(), s.twitch_selected_channel.clone())
		};
		match inner.sessions.current() {
			Some(session) if enabled => {
				let selected = match selected {
					Some(c) => Span::new(Tone::Aqua, c.as_str()).bold(),
					None => Span::new(Tone::Red, "None"),
				};
				inner.sinks.lines(vec![
					Line::prefixed(&prefix, None)
						.add(Tone::Gray, "Twitch Chat status: ")
						.add(Tone::Green, "Enabled"),
					Line::prefixed(&prefix, None)
						.add(Tone::Gray, "Logged in as: ")
						.push(Span::new(Tone::Aqua, session.username()).bold()),
					Line::prefixed(&prefix, None)
						.add(Tone::Gray, "Channels joined: ")
						.push(Span::new(Tone::Aqua, session.listener().joined_channels().len().to_string()).bold()),
					Line::prefixed(&prefix, None)
						.add(Tone::Gray, "Selected channel: ")
						.push(selected),
				]);
				inner.check_scopes();
			}
			_ => {
				let hint = if enabled && has_token { ", the token may be invalid!" } else { "" };
				inner.sinks.line(
					Line::prefixed(&prefix, None)
						.add(Tone::Gray, "Twitch Chat status: ")
						.add(Tone::Red, format!("Disabled{hint}")),
				);
			}
		}
	}

	/// Start the recurring update check. Returns `false` when already running
	/// or when no release source is configured.
	pub fn start_update_checker(&self, check_now: bool) -> bool {
		self.inner.updates.as_ref().is_some_and(|u| u.start(check_now))
	}

	pub fn stop_update_checker(&self) {
		if let Some(updates) = &self.inner.updates {
			updates.stop();
		}
	}

	/// Stop background work: update checks, pending actions, then the session.
	pub async fn shutdown(&self) {
		info!("shutting down");
		self.stop_update_checker();
		self.inner.coordinator.shutdown().await;
		self.inner.sessions.stop().await;
		// An aborted start may have published its API without installing a session.
		self.inner.api.clear();
		self.inner.cache.invalidate_all();
	}
}

impl Inner {
	fn selected_channel(&self) -> Option<ChannelName> {
		self.settings.read().twitch_selected_channel.clone()
	}

	/// Broadcaster by id, or the selected channel's user. Reports why on `None`.
	async fn resolve_broadcaster(&self, broadcaster_id: Option<&str>) -> Option<Arc<User>> {
		match broadcaster_id {
			Some(id) => {
				let user = self.cache.user_by_id(id).await;
				if user.is_none() {
					self.sinks.error(format!("Could not find a Twitch user with ID {id}"));
				}
				user
			}
			None => {
				let Some(channel) = self.selected_channel() else {
					self.sinks.error("No channel is selected!");
					return None;
				};
				let user = self.cache.user_by_name(channel.as_str()).await;
				if user.is_none() {
					self.sinks
						.error(format!("Could not find ID of current selected channel, {channel}"));
				}
				user
			}
		}
	}

	fn check_scopes(&self) {
		let Some(session) = self.sessions.current() else {
			return;
		};
		let granted = session.scopes();
		let missing: Vec<&str> = REQUIRED_SCOPES
			.into_iter()
			.filter(|s| !granted.iter().any(|g| g.as_str() == *s))
			.collect();
		if missing.is_empty() {
			return;
		}
		warn!(missing = ?missing, "token is missing required scopes");
		self.sinks.line(
			Line::text(
				Tone::Red,
				"Warning: Your current token seems to be missing some required scopes. Please regenerate your token using ",
			)
			.add(Tone::Gray, TOKEN_HINT),
		);
	}

	fn report_start_failure(&self, verb: &str, e: &SessionError) {
		match e {
			SessionError::Remote(_) => {
				self.sinks
					.error(format!("Could not {verb} the Twitch client, the token may be invalid!"));
			}
			other => self.sinks.error(format!("Could not {verb} the Twitch client: {other}")),
		}
	}
}
