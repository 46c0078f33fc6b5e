#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use parking_lot::RwLock;
use streamchat_domain::ChannelName;
use streamchat_platform::{Category, Chatters, Clip, HelixApi, User, UserQuery};
use thiserror::Error;
use tracing::{debug, warn};

const CLIP_CAPACITY: u64 = 32;
const CLIP_TTL: Duration = Duration::from_secs(5 * 60);
const USER_CAPACITY: u64 = 128;
const CHATTERS_TTL: Duration = Duration::from_secs(60);

/// Point-in-time access to the active session's remote API.
///
/// Readers take a snapshot and must tolerate `None`: the session may go away
/// between two calls.
#[derive(Default)]
pub struct ApiSlot(RwLock<Option<Arc<dyn HelixApi>>>);

impl ApiSlot {
	pub fn snapshot(&self) -> Option<Arc<dyn HelixApi>> {
		self.0.read().clone()
	}

	pub fn is_present(&self) -> bool {
		self.0.read().is_some()
	}

	pub(crate) fn set(&self, api: Arc<dyn HelixApi>) {
		*self.0.write() = Some(api);
	}

	pub(crate) fn clear(&self) {
		*self.0.write() = None;
	}
}

/// Why a load produced no value. Never memoized, never surfaced to readers.
#[derive(Debug, Error)]
enum LookupError {
	#[error("platform session is absent")]
	SessionAbsent,
	#[error(transparent)]
	Remote(#[from] anyhow::Error),
}

type Entry<V> = Option<Arc<V>>;

/// Read-through caches over the remote lookup API.
///
/// Each keyspace loads at most once per key concurrently; a "no such entity"
/// answer is memoized as `None` like any other value. Users are reachable by
/// id and by login, and a load through either keyspace fills the other.
pub struct LookupCache {
	api: Arc<ApiSlot>,
	categories: Cache<String, Entry<Category>>,
	clips: Cache<String, Entry<Clip>>,
	users_by_id: Cache<String, Entry<User>>,
	users_by_name: Cache<String, Entry<User>>,
	chatters: Cache<String, Entry<Chatters>>,
}

async fn load<V, F, Fut>(
	slot: &ApiSlot,
	cache: &Cache<String, Entry<V>>,
	kind: &'static str,
	key: String,
	loader: F,
) -> Entry<V>
where
	V: Send + Sync + 'static,
	F: FnOnce(Arc<dyn HelixApi>) -> Fut,
	Fut: Future<Output = anyhow::Result<Entry<V>>>,
{
	let init = async {
		let api = slot.snapshot().ok_or(LookupError::SessionAbsent)?;
		metrics::counter!("streamchat_cache_loads_total", "cache" => kind).increment(1);
		debug!(cache = kind, key = %key, "cache miss; loading");
		Ok::<_, LookupError>(loader(api).await?)
	};

	match cache.try_get_with(key.clone(), init).await {
		Ok(v) => v,
		Err(e) => {
			match e.as_ref() {
				LookupError::SessionAbsent => {
					warn!(cache = kind, key = %key, "platform session was absent during a lookup");
				}
				LookupError::Remote(err) => {
					metrics::counter!("streamchat_cache_load_errors_total", "cache" => kind).increment(1);
					warn!(cache = kind, key = %key, error = %err, "lookup failed");
				}
			}
			None
		}
	}
}

fn user_key(name: &str) -> String {
	name.trim().trim_start_matches('#').to_ascii_lowercase()
}

impl LookupCache {
	pub fn new(api: Arc<ApiSlot>) -> Self {
		Self {
			api,
			categories: Cache::builder().build(),
			clips: Cache::builder().max_capacity(CLIP_CAPACITY).time_to_live(CLIP_TTL).build(),
			users_by_id: Cache::builder().max_capacity(USER_CAPACITY).build(),
			users_by_name: Cache::builder().max_capacity(USER_CAPACITY).build(),
			chatters: Cache::builder().time_to_live(CHATTERS_TTL).build(),
		}
	}

	pub async fn category(&self, id: &str) -> Option<Arc<Category>> {
		let id = id.trim().to_string();
		if id.is_empty() {
			return None;
		}
		let query = vec![id.clone()];
		load(&self.api, &self.categories, "category", id, |api| async move {
			Ok(api.get_games(&query).await?.into_iter().next().map(Arc::new))
		})
		.await
	}

	pub async fn clip(&self, id: &str) -> Option<Arc<Clip>> {
		let id = id.trim().to_string();
		if id.is_empty() {
			return None;
		}
		let query = vec![id.clone()];
		load(&self.api, &self.clips, "clip", id, |api| async move {
			Ok(api.get_clips_by_id(&query).await?.into_iter().next().map(Arc::new))
		})
		.await
	}

	pub async fn user_by_id(&self, id: &str) -> Option<Arc<User>> {
		let id = id.trim().to_string();
		if id.is_empty() {
			return None;
		}
		let by_name = &self.users_by_name;
		let query = UserQuery::Ids(vec![id.clone()]);
		load(&self.api, &self.users_by_id, "user_by_id", id, |api| async move {
			let user = api.get_users(&query).await?.into_iter().next().map(Arc::new);
			if let Some(u) = &user {
				by_name.insert(user_key(&u.login), Some(u.clone())).await;
			}
			Ok(user)
		})
		.await
	}

	pub async fn user_by_name(&self, name: &str) -> Option<Arc<User>> {
		let key = user_key(name);
		if key.is_empty() {
			return None;
		}
		let by_id = &self.users_by_id;
		let query = UserQuery::Logins(vec![key.clone()]);
		load(&self.api, &self.users_by_name, "user_by_name", key, |api| async move {
			let user = api.get_users(&query).await?.into_iter().next().map(Arc::new);
			if let Some(u) = &user {
				by_id.insert(u.id.clone(), Some(u.clone())).await;
			}
			Ok(user)
		})
		.await
	}

	pub async fn chatters(&self, channel: &ChannelName) -> Option<Arc<Chatters>> {
		let channel = channel.clone();
		load(
			&self.api,
			&self.chatters,
			"chatters",
			channel.as_str().to_string(),
			|api| async move { Ok(Some(Arc::new(api.get_chatters(&channel).await?))) },
		)
		.await
	}

	/// Resolve channel logins to user ids, skipping unknown ones.
	pub async fn resolve_ids(&self, channels: &[ChannelName]) -> Vec<String> {
		let mut ids = Vec::with_capacity(channels.len());
		for channel in channels {
			match self.user_by_name(channel.as_str()).await {
				Some(user) => ids.push(user.id.clone()),
				None => warn!(channel = %channel, "could not resolve channel id"),
			}
		}
		ids
	}

	/// Drop every entry; entries belong to the session that loaded them.
	pub fn invalidate_all(&self) {
		self.categories.invalidate_all();
		self.clips.invalidate_all();
		self.users_by_id.invalidate_all();
		self.users_by_name.invalidate_all();
		self.chatters.invalidate_all();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::Ordering;

	use super::*;
	use crate::testing::{FakeApi, user};

	fn cache_with(api: &Arc<FakeApi>) -> LookupCache {
		let slot = Arc::new(ApiSlot::default());
		slot.set(api.clone());
		LookupCache::new(slot)
	}

	#[tokio::test]
	async fn concurrent_misses_load_once() {
		let api = Arc::new(FakeApi::default());
		api.users.lock().push(user("1", "alpha"));
		api.slow_users.store(true, Ordering::SeqCst);
		let cache = Arc::new(cache_with(&api));

		let mut handles = Vec::new();
		for _ in 0..16 {
			let cache = cache.clone();
			handles.push(tokio::spawn(async move { cache.user_by_id("1").await }));
		}
		for h in handles {
			assert_eq!(h.await.unwrap().unwrap().login, "alpha");
		}
		assert_eq!(api.user_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn user_keyspaces_cross_populate() {
		let api = Arc::new(FakeApi::default());
		api.users.lock().push(user("1", "alpha"));
		api.users.lock().push(user("2", "beta"));
		let cache = cache_with(&api);

		let by_id = cache.user_by_id("1").await.unwrap();
		let by_name = cache.user_by_name("Alpha").await.unwrap();
		assert!(Arc::ptr_eq(&by_id, &by_name));
		assert_eq!(api.user_calls.load(Ordering::SeqCst), 1);

		let beta = cache.user_by_name("#beta").await.unwrap();
		assert_eq!(cache.user_by_id("2").await.unwrap(), beta);
		assert_eq!(api.user_calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn not_found_is_memoized() {
		let api = Arc::new(FakeApi::default());
		let cache = cache_with(&api);

		assert!(cache.category("404").await.is_none());
		assert!(cache.category("404").await.is_none());
		assert_eq!(api.game_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn absent_session_and_failures_are_not_memoized() {
		let api = Arc::new(FakeApi::default());
		api.users.lock().push(user("1", "alpha"));
		let slot = Arc::new(ApiSlot::default());
		let cache = LookupCache::new(slot.clone());

		assert!(cache.user_by_id("1").await.is_none());
		assert_eq!(api.user_calls.load(Ordering::SeqCst), 0);

		slot.set(api.clone());
		api.fail_users.store(true, Ordering::SeqCst);
		assert!(cache.user_by_id("1").await.is_none());

		api.fail_users.store(false, Ordering::SeqCst);
		assert_eq!(cache.user_by_id("1").await.unwrap().login, "alpha");
		assert_eq!(api.user_calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn invalidate_all_forces_reload() {
		let api = Arc::new(FakeApi::default());
		api.clips.lock().push(crate::testing::clip("c1"));
		let cache = cache_with(&api);

		assert!(cache.clip("c1").await.is_some());
		cache.invalidate_all();
		assert!(cache.clip("c1").await.is_some());
		assert_eq!(api.clip_calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn chatter_keys_are_channel_names() {
		let api = Arc::new(FakeApi::default());
		let cache = cache_with(&api);
		let chan = ChannelName::new("#Loud").unwrap();

		let chatters = cache.chatters(&chan).await.unwrap();
		assert_eq!(chatters.channel.as_str(), "loud");
		cache.chatters(&ChannelName::new("LOUD").unwrap()).await.unwrap();
		assert_eq!(api.chatter_calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn eviction_policies_differ_per_keyspace() {
		let cache = LookupCache::new(Arc::new(ApiSlot::default()));
		assert_eq!(cache.categories.policy().max_capacity(), None);
		assert_eq!(cache.categories.policy().time_to_live(), None);
		assert_eq!(cache.clips.policy().max_capacity(), Some(32));
		assert_eq!(cache.clips.policy().time_to_live(), Some(Duration::from_secs(300)));
		assert_eq!(cache.users_by_id.policy().max_capacity(), Some(128));
		assert_eq!(cache.users_by_name.policy().max_capacity(), Some(128));
		assert_eq!(cache.users_by_name.policy().time_to_live(), None);
		assert_eq!(cache.chatters.policy().max_capacity(), None);
		assert_eq!(cache.chatters.policy().time_to_live(), Some(Duration::from_secs(60)));
	}
}
