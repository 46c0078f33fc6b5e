#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use streamchat_domain::ChannelName;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{Follow, Follower, HelixApi, PlatformEvent, UserQuery, UserRef};

const FOLLOWERS_PAGE: u32 = 20;

/// Polls the followers endpoint per channel and emits `Follow` for new entries.
///
/// The first poll of each channel only seeds the known set, so existing
/// followers are never announced.
pub(crate) struct FollowPoller {
	api: Arc<dyn HelixApi>,
	events_tx: broadcast::Sender<PlatformEvent>,
	interval: Duration,
	tasks: Mutex<HashMap<ChannelName, JoinHandle<()>>>,
}

impl FollowPoller {
	pub(crate) fn new(api: Arc<dyn HelixApi>, events_tx: broadcast::Sender<PlatformEvent>, interval: Duration) -> Self {
		Self {
			api,
			events_tx,
			interval,
			tasks: Mutex::new(HashMap::new()),
		}
	}

	pub(crate) fn is_polling(&self, channel: &ChannelName) -> bool {
		self.tasks.lock().contains_key(channel)
	}

	pub(crate) async fn enable(&self, channels: &[ChannelName]) -> anyhow::Result<()> {
		let pending: Vec<ChannelName> = channels.iter().filter(|c| !self.is_polling(c)).cloned().collect();
		if pending.is_empty() {
			return Ok(());
		}

		let logins = pending.iter().map(|c| c.as_str().to_string()).collect();
		let users = self.api.get_users(&UserQuery::Logins(logins)).await?;

		for channel in pending {
			let Some(user) = users.iter().find(|u| u.login.eq_ignore_ascii_case(channel.as_str())) else {
				warn!(channel = %channel, "follow events: could not resolve channel id");
				continue;
			};

			let mut tasks = self.tasks.lock();
			if tasks.contains_key(&channel) {
				continue;
			}
			info!(channel = %channel, "follow events enabled");
			let handle = tokio::spawn(poll_followers(
				self.api.clone(),
				self.events_tx.clone(),
				channel.clone(),
				user.id.clone(),
				self.interval,
			));
			tasks.insert(channel, handle);
		}

		Ok(())
	}

	pub(crate) fn disable(&self, channels: &[ChannelName]) {
		let mut tasks = self.tasks.lock();
		for channel in channels {
			if let Some(handle) = tasks.remove(channel) {
				handle.abort();
				info!(channel = %channel, "follow events disabled");
			}
		}
	}

	pub(crate) fn disable_all(&self) {
		for (_, handle) in self.tasks.lock().drain() {
			handle.abort();
		}
	}
}

impl Drop for FollowPoller {
	fn drop(&mut self) {
		self.disable_all();
	}
}

async fn poll_followers(
	api: Arc<dyn HelixApi>,
	events_tx: broadcast::Sender<PlatformEvent>,
	channel: ChannelName,
	channel_id: String,
	every: Duration,
) {
	let mut seen: Option<HashSet<String>> = None;
	let mut ticker = tokio::time::interval(every);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		ticker.tick().await;

		let followers = match api.get_channel_followers(&channel_id, FOLLOWERS_PAGE).await {
			Ok(f) => f,
			Err(e) => {
				metrics::counter!("streamchat_follow_poll_errors_total").increment(1);
				warn!(channel = %channel, error = %e, "follower poll failed");
				continue;
			}
		};

		let Some(known) = seen.as_mut() else {
			debug!(channel = %channel, count = followers.len(), "seeded follower set");
			seen = Some(followers.into_iter().map(|f| f.user_id).collect());
			continue;
		};

		// Helix lists newest first.
		for follower in followers.into_iter().rev() {
			if !known.insert(follower.user_id.clone()) {
				continue;
			}
			let _ = events_tx.send(follow_event(&channel, &channel_id, follower));
		}
	}
}

fn follow_event(channel: &ChannelName, channel_id: &str, follower: Follower) -> PlatformEvent {
	PlatformEvent::Follow(Follow {
		channel: channel.clone(),
		channel_id: channel_id.to_string(),
		user: UserRef {
			id: Some(follower.user_id),
			login: follower.user_login,
			display: Some(follower.user_name),
		},
	})
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;

	use super::*;
	use crate::{BadgeSet, Category, Chatters, Clip, CreatedClip, Emote, StreamInfo, StreamMarker, User};

	#[derive(Default)]
	struct FollowerApi {
		followers: Mutex<Vec<Follower>>,
	}

	fn follower(id: &str) -> Follower {
		Follower {
			user_id: id.to_string(),
			user_login: format!("user{id}"),
			user_name: format!("User{id}"),
		}
	}

	#[async_trait]
	impl HelixApi for FollowerApi {
		async fn get_games(&self, _ids: &[String]) -> anyhow::Result<Vec<Category>> {
			anyhow::bail!("unused")
		}
		async fn get_clips_by_id(&self, _ids: &[String]) -> anyhow::Result<Vec<Clip>> {
			anyhow::bail!("unused")
		}
		async fn get_clips_by_broadcaster(&self, _id: &str, _first: u32) -> anyhow::Result<Vec<Clip>> {
			anyhow::bail!("unused")
		}
		async fn create_clip(&self, _id: &str, _has_delay: bool) -> anyhow::Result<Vec<CreatedClip>> {
			anyhow::bail!("unused")
		}
		async fn get_users(&self, query: &UserQuery) -> anyhow::Result<Vec<User>> {
			let UserQuery::Logins(logins) = query else {
				anyhow::bail!("unused");
			};
			Ok(logins
				.iter()
				.filter(|l| l.as_str() != "ghost")
				.map(|l| User {
					id: format!("id-{l}"),
					login: l.clone(),
					display_name: l.clone(),
					description: String::new(),
					broadcaster_type: String::new(),
					profile_image_url: String::new(),
				})
				.collect())
		}
		async fn get_chatters(&self, _channel: &ChannelName) -> anyhow::Result<Chatters> {
			anyhow::bail!("unused")
		}
		async fn get_streams(&self, _logins: &[String]) -> anyhow::Result<Vec<StreamInfo>> {
			anyhow::bail!("unused")
		}
		async fn create_stream_marker(&self, _id: &str, _d: Option<&str>) -> anyhow::Result<StreamMarker> {
			anyhow::bail!("unused")
		}
		async fn get_global_emotes(&self) -> anyhow::Result<Vec<Emote>> {
			anyhow::bail!("unused")
		}
		async fn get_channel_emotes(&self, _id: &str) -> anyhow::Result<Vec<Emote>> {
			anyhow::bail!("unused")
		}
		async fn get_global_badges(&self) -> anyhow::Result<Vec<BadgeSet>> {
			anyhow::bail!("unused")
		}
		async fn get_channel_badges(&self, _id: &str) -> anyhow::Result<Vec<BadgeSet>> {
			anyhow::bail!("unused")
		}
		async fn get_channel_followers(&self, _id: &str, _first: u32) -> anyhow::Result<Vec<Follower>> {
			Ok(self.followers.lock().clone())
		}
	}

	#[tokio::test(start_paused = true)]
	async fn announces_only_followers_after_seed() {
		let api = Arc::new(FollowerApi::default());
		api.followers.lock().push(follower("1"));

		let (tx, mut rx) = broadcast::channel(16);
		let poller = FollowPoller::new(api.clone(), tx, Duration::from_secs(30));
		let chan = ChannelName::new("streamer").unwrap();
		poller.enable(std::slice::from_ref(&chan)).await.unwrap();
		assert!(poller.is_polling(&chan));

		tokio::time::sleep(Duration::from_millis(10)).await;
		api.followers.lock().insert(0, follower("2"));

		let ev = tokio::time::timeout(Duration::from_secs(60), rx.recv())
			.await
			.expect("follow within one interval")
			.unwrap();
		let PlatformEvent::Follow(f) = ev else {
			panic!("expected follow");
		};
		assert_eq!(f.channel_id, "id-streamer");
		assert_eq!(f.user.display_name(), "User2");
		assert!(rx.try_recv().is_err());

		poller.disable(std::slice::from_ref(&chan));
		assert!(!poller.is_polling(&chan));
	}

	#[tokio::test]
	async fn unresolved_channels_are_skipped() {
		let api = Arc::new(FollowerApi::default());
		let (tx, _rx) = broadcast::channel(4);
		let poller = FollowPoller::new(api, tx, Duration::from_secs(30));
		let ghost = ChannelName::new("ghost").unwrap();
		let real = ChannelName::new("real").unwrap();
		poller.enable(&[ghost.clone(), real.clone()]).await.unwrap();
		assert!(!poller.is_polling(&ghost));
		assert!(poller.is_polling(&real));
		poller.disable_all();
		assert!(!poller.is_polling(&real));
	}
}
