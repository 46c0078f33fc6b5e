#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use streamchat_domain::{ChannelName, PlatformMessageId};
use thiserror::Error;

use crate::{
	ChatCleared, ChatMessage, Cheer, InboundHost, MessageDeleted, Notice, PlatformEvent, Raid, RewardRedemption, SubPlan,
	Subscription, UserRef, UserRestricted,
};

#[cfg(test)]
mod tests;

const ACTION_PREFIX: &str = "\u{1}ACTION ";
const HOST_MARKERS: [&str; 2] = [" is now hosting you", " is now auto hosting you"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IrcParseError {
	#[error("empty irc line")]
	Empty,
	#[error("irc line has no command: {0}")]
	MissingCommand(String),
}

/// One parsed IRC line with IRCv3 tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrcLine {
	pub tags: BTreeMap<String, String>,
	pub prefix: Option<String>,
	pub command: String,
	pub params: Vec<String>,
}

fn unescape_tag_value(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut chars = raw.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some('s') => out.push(' '),
			Some(':') => out.push(';'),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}

impl IrcLine {
	pub fn parse(raw: &str) -> Result<Self, IrcParseError> {
		let mut rest = raw.trim_end_matches(['\r', '\n']);
		if rest.trim().is_empty() {
			return Err(IrcParseError::Empty);
		}

		let mut line = IrcLine::default();

		if let Some(tagged) = rest.strip_prefix('@') {
			let (tags, tail) = tagged.split_once(' ').unwrap_or((tagged, ""));
			for pair in tags.split(';').filter(|p| !p.is_empty()) {
				let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
				line.tags.insert(k.to_string(), unescape_tag_value(v));
			}
			rest = tail;
		}

		rest = rest.trim_start_matches(' ');
		if let Some(prefixed) = rest.strip_prefix(':') {
			let (prefix, tail) = prefixed.split_once(' ').unwrap_or((prefixed, ""));
			line.prefix = Some(prefix.to_string());
			rest = tail;
		}

		rest = rest.trim_start_matches(' ');
		let (command, mut params) = rest.split_once(' ').unwrap_or((rest, ""));
		if command.is_empty() {
			return Err(IrcParseError::MissingCommand(raw.to_string()));
		}
		line.command = command.to_ascii_uppercase();

		loop {
			params = params.trim_start_matches(' ');
			if params.is_empty() {
				break;
			}
			if let Some(trailing) = params.strip_prefix(':') {
				line.params.push(trailing.to_string());
				break;
			}
			let (param, tail) = params.split_once(' ').unwrap_or((params, ""));
			line.params.push(param.to_string());
			params = tail;
		}

		Ok(line)
	}

	/// Non-empty tag value.
	pub fn tag(&self, key: &str) -> Option<&str> {
		self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
	}

	/// Nick part of the `nick!user@host` prefix.
	pub fn nick(&self) -> Option<&str> {
		let prefix = self.prefix.as_deref()?;
		let nick = prefix.split_once('!').map(|(n, _)| n).unwrap_or(prefix);
		(!nick.is_empty()).then_some(nick)
	}

	pub fn param(&self, idx: usize) -> Option<&str> {
		self.params.get(idx).map(String::as_str)
	}

	/// Channel named by the first parameter, if it is one.
	pub fn channel(&self) -> Option<ChannelName> {
		let first = self.param(0)?;
		if !first.starts_with('#') {
			return None;
		}
		ChannelName::new(first).ok()
	}

	fn tag_u64(&self, key: &str) -> Option<u64> {
		self.tag(key).and_then(|v| v.parse().ok())
	}

	fn tag_u32(&self, key: &str) -> Option<u32> {
		self.tag(key).and_then(|v| v.parse().ok())
	}

	fn room_id(&self) -> Option<String> {
		self.tag("room-id").map(str::to_string)
	}

	fn tagged_user(&self) -> Option<UserRef> {
		let login = self.tag("login").map(str::to_string).or_else(|| self.nick().map(str::to_string))?;
		Some(UserRef {
			id: self.tag("user-id").map(str::to_string),
			login,
			display: self.tag("display-name").map(str::to_string),
		})
	}
}

/// Decode one line into the events it carries.
///
/// A cheer or a reward redemption with text yields the event and the chat
/// message. Protocol housekeeping (PING, 001, JOIN echo...) yields nothing.
pub fn decode_event(line: &IrcLine) -> Vec<PlatformEvent> {
	match line.command.as_str() {
		"PRIVMSG" => decode_privmsg(line),
		"NOTICE" => decode_notice(line).into_iter().collect(),
		"CLEARCHAT" => decode_clearchat(line).into_iter().collect(),
		"CLEARMSG" => decode_clearmsg(line).into_iter().collect(),
		"USERNOTICE" => decode_usernotice(line).into_iter().collect(),
		_ => Vec::new(),
	}
}

fn decode_privmsg(line: &IrcLine) -> Vec<PlatformEvent> {
	let (Some(channel), Some(raw_text)) = (line.channel(), line.param(1)) else {
		return Vec::new();
	};
	let Some(author) = line.tagged_user() else {
		return Vec::new();
	};

	if author.login == "jtv" {
		return decode_host(channel, raw_text).into_iter().collect();
	}

	let (text, is_action) = match raw_text.strip_prefix(ACTION_PREFIX) {
		Some(action) => (action.trim_end_matches('\u{1}').to_string(), true),
		None => (raw_text.to_string(), false),
	};

	let channel_id = line.room_id();
	let mut out = Vec::with_capacity(2);

	if let Some(bits) = line.tag_u64("bits").filter(|b| *b > 0) {
		out.push(PlatformEvent::Cheer(Cheer {
			channel: channel.clone(),
			channel_id: channel_id.clone(),
			user: author.clone(),
			bits,
			total_bits: None,
		}));
	}

	if let Some(reward) = line.tag("custom-reward-id") {
		out.push(PlatformEvent::Reward(RewardRedemption {
			channel: channel.clone(),
			channel_id: channel_id.clone(),
			user: author.clone(),
			reward: reward.to_string(),
		}));
	}

	out.push(PlatformEvent::Message(ChatMessage {
		channel,
		channel_id,
		id: line.tag("id").and_then(|id| PlatformMessageId::new(id).ok()),
		author,
		text,
		is_action,
		badges: line
			.tag("badges")
			.map(|b| b.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
			.unwrap_or_default(),
		color: line.tag("color").map(str::to_string),
	}));

	out
}

fn decode_host(channel: ChannelName, text: &str) -> Option<PlatformEvent> {
	if !HOST_MARKERS.iter().any(|m| text.contains(m)) {
		return None;
	}
	let hoster = text.split_whitespace().next()?.to_string();
	Some(PlatformEvent::Host(InboundHost { channel, hoster }))
}

fn decode_notice(line: &IrcLine) -> Option<PlatformEvent> {
	let message = line.param(1).map(str::trim).filter(|m| !m.is_empty()).map(str::to_string);
	Some(PlatformEvent::Notice(Notice {
		channel: line.channel(),
		tag: line.tag("msg-id").map(str::to_ascii_lowercase),
		message,
	}))
}

fn decode_clearchat(line: &IrcLine) -> Option<PlatformEvent> {
	let channel = line.channel()?;
	let channel_id = line.room_id();

	let Some(target) = line.param(1).filter(|t| !t.is_empty()) else {
		return Some(PlatformEvent::ChatCleared(ChatCleared { channel, channel_id }));
	};

	let duration = line.tag_u64("ban-duration").map(Duration::from_secs);
	let restricted = UserRestricted {
		channel,
		channel_id,
		user: UserRef {
			id: line.tag("target-user-id").map(str::to_string),
			login: target.to_ascii_lowercase(),
			display: None,
		},
		duration,
	};

	Some(if duration.is_some() {
		PlatformEvent::UserTimedOut(restricted)
	} else {
		PlatformEvent::UserBanned(restricted)
	})
}

fn decode_clearmsg(line: &IrcLine) -> Option<PlatformEvent> {
	let channel = line.channel()?;
	let message_id = PlatformMessageId::new(line.tag("target-msg-id")?).ok()?;
	Some(PlatformEvent::MessageDeleted(MessageDeleted {
		channel,
		channel_id: line.room_id(),
		message_id,
		login: line.tag("login").map(str::to_string),
	}))
}

fn decode_usernotice(line: &IrcLine) -> Option<PlatformEvent> {
	let channel = line.channel()?;
	let channel_id = line.room_id();

	match line.tag("msg-id")? {
		"sub" | "resub" => Some(PlatformEvent::Subscription(Subscription {
			channel,
			channel_id,
			user: line.tagged_user()?,
			plan: SubPlan::parse(line.tag("msg-param-sub-plan").unwrap_or_default()),
			months: line.tag_u32("msg-param-cumulative-months"),
			gift: false,
		})),
		"subgift" | "anonsubgift" => {
			let login = line.tag("msg-param-recipient-user-name")?.to_string();
			Some(PlatformEvent::Subscription(Subscription {
				channel,
				channel_id,
				user: UserRef {
					id: line.tag("msg-param-recipient-id").map(str::to_string),
					login,
					display: line.tag("msg-param-recipient-display-name").map(str::to_string),
				},
				plan: SubPlan::parse(line.tag("msg-param-sub-plan").unwrap_or_default()),
				months: line.tag_u32("msg-param-months"),
				gift: true,
			}))
		}
		"raid" => {
			let login = line
				.tag("msg-param-login")
				.or_else(|| line.tag("login"))?
				.to_string();
			Some(PlatformEvent::Raid(Raid {
				channel,
				channel_id,
				raider: UserRef {
					id: line.tag("user-id").map(str::to_string),
					login,
					display: line.tag("msg-param-displayName").map(str::to_string),
				},
				viewers: line.tag_u64("msg-param-viewerCount").unwrap_or(0),
			}))
		}
		_ => None,
	}
}
