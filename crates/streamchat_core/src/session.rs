#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::{Mutex, RwLock};
use streamchat_domain::ChannelName;
use streamchat_platform::{ChatConnection, Credential, HelixApi, PlatformConnector, SecretString};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{ApiSlot, LookupCache};
use crate::config::SharedSettings;
use crate::dispatch::EventDispatcher;
use crate::host::HostSinks;

#[derive(Debug, Error)]
pub enum SessionError {
	#[error("twitch chat is disabled in the configuration")]
	Disabled,
	#[error("no twitch token is configured")]
	MissingToken,
	#[error("a twitch session is already active")]
	AlreadyActive,
	#[error("twitch chat is not enabled")]
	NotActive,
	#[error("could not {action} the channel {channel}")]
	Inconsistent { action: &'static str, channel: ChannelName },
	#[error(transparent)]
	Remote(#[from] anyhow::Error),
}

/// One authenticated presence on the platform: a listener and a sender
/// connection sharing a credential.
pub struct Session {
	id: Uuid,
	credential: Credential,
	api: Arc<dyn HelixApi>,
	listener: Arc<dyn ChatConnection>,
	sender: Arc<dyn ChatConnection>,
	dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
	pub fn id(&self) -> Uuid {
		self.id
	}

	pub fn username(&self) -> &str {
		&self.credential.login
	}

	pub fn user_id(&self) -> &str {
		&self.credential.user_id
	}

	pub fn scopes(&self) -> &[String] {
		&self.credential.scopes
	}

	pub fn api(&self) -> &Arc<dyn HelixApi> {
		&self.api
	}

	pub fn listener(&self) -> &Arc<dyn ChatConnection> {
		&self.listener
	}

	pub fn sender(&self) -> &Arc<dyn ChatConnection> {
		&self.sender
	}

	fn stop_dispatcher(&self) {
		if let Some(task) = self.dispatcher.lock().take() {
			task.abort();
		}
	}
}

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("id", &self.id)
			.field("username", &self.credential.login)
			.field("scopes", &self.credential.scopes)
			.finish_non_exhaustive()
	}
}

/// Connections opened so far by a start attempt; closed again if it fails.
#[derive(Default)]
struct Opening {
	listener: Option<Arc<dyn ChatConnection>>,
	sender: Option<Arc<dyn ChatConnection>>,
	dispatcher: Option<JoinHandle<()>>,
}

impl Opening {
	async fn tear_down(mut self) {
		if let Some(task) = self.dispatcher.take() {
			task.abort();
		}
		if let Some(listener) = self.listener.take() {
			listener.close().await;
		}
		if let Some(sender) = self.sender.take() {
			sender.close().await;
		}
	}
}

/// A start attempt dropped mid-way (its action was aborted) still stops the dispatcher.
impl Drop for Opening {
	fn drop(&mut self) {
		if let Some(task) = self.dispatcher.take() {
			task.abort();
		}
	}
}

/// Owner of the process-wide optional [`Session`].
///
/// Lifecycle operations are meant to run on the action worker as important
/// actions; readers only ever see point-in-time snapshots.
pub struct SessionController {
	connector: Arc<dyn PlatformConnector>,
	settings: SharedSettings,
	api: Arc<ApiSlot>,
	cache: Arc<LookupCache>,
	sinks: HostSinks,
	current: RwLock<Option<Arc<Session>>>,
}

impl SessionController {
	pub fn new(
		connector: Arc<dyn PlatformConnector>,
		settings: SharedSettings,
		api: Arc<ApiSlot>,
		cache: Arc<LookupCache>,
		sinks: HostSinks,
	) -> Self {
		Self {
			connector,
			settings,
			api,
			cache,
			sinks,
			current: RwLock::new(None),
		}
	}

	pub fn current(&self) -> Option<Arc<Session>> {
		self.current.read().clone()
	}

	pub fn is_active(&self) -> bool {
		self.current.read().is_some()
	}

	/// Bring up a session from the current settings.
	///
	/// Any failure closes whatever was opened and leaves the controller absent.
	pub async fn start(&self, sync_aux: bool) -> Result<Arc<Session>, SessionError> {
		if self.is_active() {
			return Err(SessionError::AlreadyActive);
		}
		let token = {
			let s = self.settings.read();
			if !s.twitch_enabled {
				return Err(SessionError::Disabled);
			}
			if !s.has_token() {
				return Err(SessionError::MissingToken);
			}
			s.twitch_token.clone()
		};

		let id = Uuid::new_v4();
		info!(session = %id, "starting twitch session");
		let mut opening = Opening::default();
		match self.open(id, &token, sync_aux, &mut opening).await {
			Ok(session) => {
				let installed = {
					let mut current = self.current.write();
					if current.is_some() {
						false
					} else {
						*current = Some(session.clone());
						true
					}
				};
				if !installed {
					session.stop_dispatcher();
					opening.tear_down().await;
					return Err(SessionError::AlreadyActive);
				}
				metrics::counter!("streamchat_sessions_started_total").increment(1);
				info!(session = %id, user = %session.username(), "twitch session started");
				Ok(session)
			}
			Err(e) => {
				warn!(session = %id, error = ?e, "failed to start twitch session");
				metrics::counter!("streamchat_session_start_failures_total").increment(1);
				opening.tear_down().await;
				self.api.clear();
				self.cache.invalidate_all();
				Err(SessionError::Remote(e))
			}
		}
	}

	async fn open(
		&self,
		id: Uuid,
		token: &SecretString,
		sync_aux: bool,
		opening: &mut Opening,
	) -> anyhow::Result<Arc<Session>> {
		let credential = self.connector.authenticate(token).await.context("authenticate token")?;
		let api = self.connector.api(&credential).context("build api client")?;
		self.api.set(api.clone());

		let listener = self
			.connector
			.listener(&credential, api.clone())
			.context("build listener connection")?;
		opening.listener = Some(listener.clone());

		let (channels, selected, follow) = {
			let s = self.settings.read();
			(
				s.twitch_channels.clone(),
				s.twitch_selected_channel.clone(),
				s.follow_event_enabled,
			)
		};
		let channel_ids = self.cache.resolve_ids(&channels).await;

		if sync_aux {
			self.sync_aux(&*api, &channel_ids).await?;
		}

		match &selected {
			Some(name) => match self.cache.user_by_name(name.as_str()).await {
				Some(user) => listener
					.listen_channel_events(&user.id)
					.await
					.context("listen for channel events")?,
				None => warn!(session = %id, channel = %name, "selected channel could not be resolved; channel events disabled"),
			},
			None => debug!(session = %id, "no selected channel; channel events disabled"),
		}

		let events = listener.events();
		let dispatcher = EventDispatcher::new(
			self.settings.clone(),
			self.sinks.clone(),
			self.cache.clone(),
			listener.clone(),
		);
		opening.dispatcher = Some(dispatcher.spawn(events));

		listener.connect().await.context("connect listener")?;
		for joined in listener.joined_channels() {
			if !channels.contains(&joined) {
				listener.leave(&joined).await.with_context(|| format!("leave {joined}"))?;
			}
		}
		for channel in &channels {
			listener.join(channel).await.with_context(|| format!("join {channel}"))?;
		}

		if follow && !channels.is_empty() {
			listener
				.enable_follow_events(&channels)
				.await
				.context("enable follow events")?;
		}

		let sender = self.connector.sender(&credential).context("build sender connection")?;
		opening.sender = Some(sender.clone());
		sender.connect().await.context("connect sender")?;
		for joined in sender.joined_channels() {
			sender.leave(&joined).await.with_context(|| format!("sender leave {joined}"))?;
		}

		Ok(Arc::new(Session {
			id,
			credential,
			api,
			listener,
			sender,
			dispatcher: Mutex::new(opening.dispatcher.take()),
		}))
	}

	async fn sync_aux(&self, api: &dyn HelixApi, channel_ids: &[String]) -> anyhow::Result<()> {
		let aux = &self.sinks.aux;
		self.sinks.info("Synchronising global badge cache...");
		aux.sync_global_badges(api).await.context("sync global badges")?;
		self.sinks.info("Synchronising channel badge cache...");
		aux.sync_channel_badges(api, channel_ids)
			.await
			.context("sync channel badges")?;
		self.sinks.info("Synchronising global emote cache...");
		aux.sync_global_emotes(api).await.context("sync global emotes")?;
		self.sinks.info("Synchronising channel emote cache...");
		aux.sync_channel_emotes(api, channel_ids)
			.await
			.context("sync channel emotes")?;
		Ok(())
	}

	/// Tear the session down. Returns `false` when none was active.
	pub async fn stop(&self) -> bool {
		let Some(session) = self.current.write().take() else {
			return false;
		};
		let id = session.id;
		info!(session = %id, "stopping twitch session");

		for joined in session.listener.joined_channels() {
			if let Err(e) = session.listener.leave(&joined).await {
				warn!(session = %id, channel = %joined, error = ?e, "failed to leave channel");
			}
		}
		let channels = self.settings.read().twitch_channels.clone();
		if !channels.is_empty()
			&& let Err(e) = session.listener.disable_follow_events(&channels).await
		{
			warn!(session = %id, error = ?e, "failed to disable follow events");
		}
		session.stop_dispatcher();
		session.listener.close().await;
		session.sender.close().await;

		self.api.clear();
		self.cache.invalidate_all();
		metrics::counter!("streamchat_sessions_stopped_total").increment(1);
		info!(session = %id, "twitch session stopped");
		true
	}

	/// Stop, then start again. A failed start leaves the controller absent.
	pub async fn restart(&self, sync_aux: bool) -> Result<Arc<Session>, SessionError> {
		self.stop().await;
		self.start(sync_aux).await
	}

	/// Join a channel and add it to the configured list.
	pub async fn join_channel(&self, channel: &ChannelName) -> Result<(), SessionError> {
		let session = self.current().ok_or(SessionError::NotActive)?;
		session
			.listener
			.join(channel)
			.await
			.with_context(|| format!("join {channel}"))?;
		if !session.listener.is_joined(channel) {
			return Err(SessionError::Inconsistent {
				action: "join",
				channel: channel.clone(),
			});
		}

		let follow = {
			let mut s = self.settings.write();
			s.add_channel(channel.clone());
			s.follow_event_enabled
		};
		if follow {
			session
				.listener
				.enable_follow_events(std::slice::from_ref(channel))
				.await
				.context("enable follow events")?;
		}

		match self.cache.user_by_name(channel.as_str()).await {
			Some(user) => {
				let ids = [user.id.clone()];
				let aux = &self.sinks.aux;
				self.sinks.info(format!("Syncing {channel}'s channel badges..."));
				aux.sync_channel_badges(&**session.api(), &ids)
					.await
					.context("sync channel badges")?;
				self.sinks.info(format!("Syncing {channel}'s channel emotes..."));
				aux.sync_channel_emotes(&**session.api(), &ids)
					.await
					.context("sync channel emotes")?;
			}
			None => warn!(session = %session.id, channel = %channel, "joined channel could not be resolved; skipping asset sync"),
		}

		info!(session = %session.id, channel = %channel, "joined channel");
		Ok(())
	}

	/// Leave a channel and drop it from the configured list.
	pub async fn leave_channel(&self, channel: &ChannelName) -> Result<(), SessionError> {
		let session = self.current().ok_or(SessionError::NotActive)?;
		session
			.listener
			.leave(channel)
			.await
			.with_context(|| format!("leave {channel}"))?;
		if session.listener.is_joined(channel) {
			return Err(SessionError::Inconsistent {
				action: "leave",
				channel: channel.clone(),
			});
		}

		let follow = {
			let mut s = self.settings.write();
			s.remove_channel(channel);
			s.follow_event_enabled
		};
		if follow {
			session
				.listener
				.disable_follow_events(std::slice::from_ref(channel))
				.await
				.context("disable follow events")?;
		}

		info!(session = %session.id, channel = %channel, "left channel");
		Ok(())
	}

	/// Apply `follow_event_enabled` to every configured channel. Returns the applied state.
	pub async fn update_follow_events(&self) -> Result<bool, SessionError> {
		let session = self.current().ok_or(SessionError::NotActive)?;
		let (channels, enabled) = {
			let s = self.settings.read();
			(s.twitch_channels.clone(), s.follow_event_enabled)
		};
		if enabled {
			session.listener.enable_follow_events(&channels).await?;
		} else {
			session.listener.disable_follow_events(&channels).await?;
		}
		Ok(enabled)
	}
}
