#![forbid(unsafe_code)]

mod notice;


use std::sync::Arc;

use streamchat_platform::{
	ChatConnection, ChatMessage, Cheer, EventRx, Follow, PlatformEvent, Raid, RewardRedemption, Subscription,
	UserRestricted,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use notice::{NoticeRule, classify, render_notice};

use crate::cache::LookupCache;
use crate::config::SharedSettings;
use crate::host::{HostSinks, Line, SoundCue, Tone};

/// Pitch of the reward/subscription/cheer cue.
const EVENT_PITCH: f32 = 1.25;

/// Issues page of this project, empty when the package has no repository.
pub fn issues_url() -> String {
	let repo = env!("CARGO_PKG_REPOSITORY").trim_end_matches('/');
	if repo.is_empty() { String::new() } else { format!("{repo}/issues") }
}

/// Converts platform events of one session into host notifications.
///
/// Every event is handled on its own; the only shared state is read-only
/// settings and the lookup caches.
pub struct EventDispatcher {
	settings: SharedSettings,
	sinks: HostSinks,
	cache: Arc<LookupCache>,
	listener: Arc<dyn ChatConnection>,
	issues_url: String,
}

impl EventDispatcher {
	pub fn new(
		settings: SharedSettings,
		sinks: HostSinks,
		cache: Arc<LookupCache>,
		listener: Arc<dyn ChatConnection>,
	) -> Self {
		Self {
			settings,
			sinks,
			cache,
			listener,
			issues_url: issues_url(),
		}
	}

	/// Drain `rx` until the sending side goes away.
	pub fn spawn(self, mut rx: EventRx) -> JoinHandle<()> {
		tokio::spawn(async move {
			loop {
				match rx.recv().await {
					Ok(ev) => self.dispatch(ev).await,
					Err(RecvError::Lagged(n)) => {
						metrics::counter!("streamchat_events_lagged_total").increment(n);
						warn!(skipped = n, "event dispatcher lagged behind; events dropped");
					}
					Err(RecvError::Closed) => break,
				}
			}
			debug!("event stream closed; dispatcher exiting");
		})
	}

	pub async fn dispatch(&self, ev: PlatformEvent) {
		metrics::counter!("streamchat_events_dispatched_total").increment(1);
		match ev {
			PlatformEvent::Message(m) => self.on_message(m),
			PlatformEvent::Reward(r) => self.on_reward(r),
			PlatformEvent::Subscription(s) => self.on_subscription(s),
			PlatformEvent::Cheer(c) => self.on_cheer(c),
			PlatformEvent::Follow(f) => self.on_follow(f).await,
			PlatformEvent::Notice(n) => {
				let (prefix, show) = (self.prefix(), self.show_channel());
				let lines = render_notice(&n, &prefix, show, &self.issues_url);
				if !lines.is_empty() {
					self.sinks.lines(lines);
				}
			}
			PlatformEvent::Raid(r) => self.on_raid(r),
			PlatformEvent::Host(h) => {
				self.announce(Line::prefixed(&self.prefix(), None).add(Tone::Green, format!("{} is hosting your channel", h.hoster)));
			}
			PlatformEvent::MessageDeleted(d) => {
				if self.deletion_allowed() {
					self.sinks.removals.remove_message(d.channel_id.as_deref(), &d.message_id);
				}
			}
			PlatformEvent::ChatCleared(c) => {
				if self.deletion_allowed() {
					self.sinks.removals.clear_chat(c.channel_id.as_deref());
				}
				let channel = self.show_channel().then_some(&c.channel);
				self.announce(Line::prefixed(&self.prefix(), channel).add(Tone::Gray, "The chat has been cleared."));
			}
			PlatformEvent::UserTimedOut(u) | PlatformEvent::UserBanned(u) => self.on_restricted(u),
		}
	}

	fn prefix(&self) -> String {
		self.settings.read().prefix.clone()
	}

	fn deletion_allowed(&self) -> bool {
		self.settings.read().allow_message_deletion
	}

	/// Disclose the channel when asked to, or when more than one is joined.
	fn show_channel(&self) -> bool {
		self.settings.read().force_show_channel_name || self.listener.joined_channels().len() > 1
	}

	fn announce(&self, line: Line) {
		self.sinks.line(line);
	}

	fn event_sound(&self) {
		let volume = self.settings.read().event_sound_volume;
		self.sinks.sounds.play(SoundCue::Event, volume, EVENT_PITCH);
	}

	fn on_message(&self, message: ChatMessage) {
		let (play, volume) = {
			let s = self.settings.read();
			(s.play_sound_on_message, s.event_sound_volume)
		};
		if play {
			self.sinks.sounds.play(SoundCue::Message, volume, 1.0);
		}
		self.sinks.messages.handle_message(message);
	}

	fn on_reward(&self, r: RewardRedemption) {
		self.announce(
			Line::prefixed(&self.prefix(), None)
				.add(Tone::Green, format!("{} redeemed ", r.user.display_name()))
				.add(Tone::Gold, r.reward),
		);
		self.event_sound();
	}

	fn on_subscription(&self, s: Subscription) {
		self.announce(
			Line::prefixed(&self.prefix(), None)
				.add(Tone::Green, format!("{} subscribed with a ", s.user.display_name()))
				.add(Tone::Gold, s.plan.ordinal_name()),
		);
		self.event_sound();
	}

	fn on_cheer(&self, c: Cheer) {
		let amount = match c.total_bits {
			Some(total) => format!("{} bits! Total amount is: {total} bits!", c.bits),
			None => format!("{} bits!", c.bits),
		};
		self.announce(
			Line::prefixed(&self.prefix(), None)
				.add(Tone::Green, format!("{} cheered with ", c.user.display_name()))
				.add(Tone::Gold, amount),
		);
		self.event_sound();
	}

	async fn on_follow(&self, f: Follow) {
		let channel = match self.cache.user_by_name(f.channel.as_str()).await {
			Some(user) => user.display_name.clone(),
			None => f.channel.to_string(),
		};
		self.announce(Line::prefixed(&self.prefix(), None).add(
			Tone::Green,
			format!("{} is now following {channel}", f.user.display_name()),
		));

		let (play, volume) = {
			let s = self.settings.read();
			(s.play_sound_on_follow, s.event_sound_volume)
		};
		if play {
			self.sinks.sounds.play(SoundCue::Follow, volume, 1.0);
		}
	}

	fn on_raid(&self, r: Raid) {
		self.announce(
			Line::prefixed(&self.prefix(), None)
				.add(Tone::Green, format!("{} is raiding your channel with ", r.raider.display_name()))
				.add(Tone::Gold, format!("{} viewers", r.viewers)),
		);
	}

	fn on_restricted(&self, u: UserRestricted) {
		if !self.deletion_allowed() {
			return;
		}
		let user = u.user.id.as_deref().unwrap_or(&u.user.login);
		self.sinks.removals.clear_user_messages(u.channel_id.as_deref(), user);
	}
}
