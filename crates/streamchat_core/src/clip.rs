#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::Mutex;
use streamchat_platform::{Clip, HelixApi};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Time between two clip attempts.
pub const CLIP_COOLDOWN: Duration = Duration::from_secs(2 * 60);
/// Shorter cooldown applied after a failed attempt.
pub const CLIP_FAILURE_COOLDOWN: Duration = Duration::from_secs(60);
pub const CLIP_POLL_ATTEMPTS: u32 = 16;
pub const CLIP_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClipError {
	#[error("Please wait {0} seconds before creating another clip.")]
	Cooldown(u64),
	#[error("Twitch chat is not enabled!")]
	SessionAbsent,
	#[error("Twitch API did not return any newClips!")]
	EmptyResponse,
	#[error("Clip creation timed out :(")]
	TimedOut,
	#[error(transparent)]
	Remote(#[from] anyhow::Error),
}

/// Cooldown-gated create-then-poll clip creation.
///
/// The cooldown is stamped before the remote call, so a slow or hung attempt
/// still blocks the next one.
pub struct ClipCreator {
	next_allowed: Mutex<Option<Instant>>,
	poll_attempts: u32,
	poll_interval: Duration,
}

impl Default for ClipCreator {
	fn default() -> Self {
		Self::new()
	}
}

impl ClipCreator {
	pub fn new() -> Self {
		Self {
			next_allowed: Mutex::new(None),
			poll_attempts: CLIP_POLL_ATTEMPTS,
			poll_interval: CLIP_POLL_INTERVAL,
		}
	}

	/// Time left until the next attempt is allowed.
	pub fn remaining(&self) -> Option<Duration> {
		let next = (*self.next_allowed.lock())?;
		let now = Instant::now();
		(now < next).then(|| next - now)
	}

	/// Fails with [`ClipError::Cooldown`] while an attempt would be refused. Makes no remote call.
	pub fn check_cooldown(&self) -> Result<(), ClipError> {
		match self.remaining() {
			Some(left) => Err(ClipError::Cooldown(left.as_secs())),
			None => Ok(()),
		}
	}

	pub async fn create(
		&self,
		api: Option<Arc<dyn HelixApi>>,
		broadcaster_id: &str,
		has_delay: bool,
	) -> Result<Clip, ClipError> {
		let api = {
			let mut next = self.next_allowed.lock();
			let now = Instant::now();
			if let Some(at) = *next
				&& now < at
			{
				return Err(ClipError::Cooldown((at - now).as_secs()));
			}
			let api = api.ok_or(ClipError::SessionAbsent)?;
			*next = Some(now + CLIP_COOLDOWN);
			api
		};

		metrics::counter!("streamchat_clip_attempts_total").increment(1);
		match self.create_and_poll(&*api, broadcaster_id, has_delay).await {
			Ok(clip) => {
				info!(broadcaster_id, clip = %clip.id, "clip created");
				Ok(clip)
			}
			Err(e) => {
				*self.next_allowed.lock() = Some(Instant::now() + CLIP_FAILURE_COOLDOWN);
				metrics::counter!("streamchat_clip_failures_total").increment(1);
				warn!(broadcaster_id, error = %e, "clip creation failed");
				Err(e)
			}
		}
	}

	async fn create_and_poll(&self, api: &dyn HelixApi, broadcaster_id: &str, has_delay: bool) -> Result<Clip, ClipError> {
		let created = api
			.create_clip(broadcaster_id, has_delay)
			.await
			.context("create clip")?
			.into_iter()
			.next()
			.ok_or(ClipError::EmptyResponse)?;

		let ids = [created.id];
		for attempt in 1..=self.poll_attempts {
			let clips = api.get_clips_by_id(&ids).await.context("get created clip")?;
			if let Some(clip) = clips.into_iter().next() {
				return Ok(clip);
			}
			debug!(clip = %ids[0], attempt, "clip not materialized yet");
			tokio::time::sleep(self.poll_interval).await;
		}
		Err(ClipError::TimedOut)
	}
}
