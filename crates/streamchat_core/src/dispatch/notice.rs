#![forbid(unsafe_code)]

//! Server notice classification.
//!
//! Notices are keyed by their `msg-id` tag. A fixed set of chat-mode toggles
//! renders as informational lines; everything else falls through an ordered
//! table of tag patterns.

use streamchat_domain::ChannelName;
use streamchat_platform::Notice;

use crate::host::{Line, Link, Span, Tone};

/// How a notice is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeRule {
	/// Chat mode changed; prefixed gray line, channel disclosed when needed.
	StateToggle,
	/// The server held back a message.
	Rejected,
	NoPermission,
	Success,
	MessageFailed,
	WhisperFailed,
	DeleteFailed,
	BanFailed,
	TimeoutFailed,
	Failed,
}

const STATE_TOGGLES: &[&str] = &[
	"emote_only_off",
	"emote_only_on",
	"followers_off",
	"followers_on",
	"followers_onzero",
	"r9k_off",
	"r9k_on",
	"slow_off",
	"slow_on",
	"subs_off",
	"subs_on",
	"host_off",
	"host_on",
];

enum Pattern {
	Exact(&'static str),
	Prefix(&'static str),
	Suffix(&'static str),
}

impl Pattern {
	fn matches(&self, tag: &str) -> bool {
		match self {
			Self::Exact(p) => tag == *p,
			Self::Prefix(p) => tag.starts_with(p),
			Self::Suffix(p) => tag.ends_with(p),
		}
	}
}

/// First matching row wins; unmatched tags are [`NoticeRule::Failed`].
const RULES: &[(Pattern, NoticeRule)] = &[
	(Pattern::Exact("msg_rejected"), NoticeRule::Rejected),
	(Pattern::Exact("no_permission"), NoticeRule::NoPermission),
	(Pattern::Suffix("success"), NoticeRule::Success),
	(Pattern::Prefix("msg"), NoticeRule::MessageFailed),
	(Pattern::Prefix("whisper"), NoticeRule::WhisperFailed),
	(Pattern::Prefix("bad_delete"), NoticeRule::DeleteFailed),
	(Pattern::Prefix("bad_ban"), NoticeRule::BanFailed),
	(Pattern::Prefix("bad_timeout"), NoticeRule::TimeoutFailed),
];

pub fn classify(tag: &str) -> NoticeRule {
	let tag = tag.trim().to_ascii_lowercase();
	if STATE_TOGGLES.contains(&tag.as_str()) {
		return NoticeRule::StateToggle;
	}
	RULES
		.iter()
		.find(|(pattern, _)| pattern.matches(&tag))
		.map(|(_, rule)| *rule)
		.unwrap_or(NoticeRule::Failed)
}

impl NoticeRule {
	pub fn tone(self) -> Tone {
		match self {
			Self::StateToggle => Tone::Gray,
			Self::Rejected => Tone::Yellow,
			Self::Success => Tone::Green,
			_ => Tone::Red,
		}
	}

	/// Text placed before the notice body.
	pub fn label(self) -> &'static str {
		match self {
			Self::NoPermission => "Action failed: ",
			Self::MessageFailed => "Message sending failed: ",
			Self::WhisperFailed => "Whisper failed: ",
			Self::DeleteFailed => "Message delete failed: ",
			Self::BanFailed => "Ban failed: ",
			Self::TimeoutFailed => "Timeout failed: ",
			Self::StateToggle | Self::Rejected | Self::Success | Self::Failed => "",
		}
	}
}

/// Render a notice. Notices without a tag produce nothing.
///
/// `issues_url` is attached to the diagnostic line emitted for a notice that
/// arrived without a body; an empty url leaves the line unlinked.
pub fn render_notice(notice: &Notice, prefix: &str, show_channel: bool, issues_url: &str) -> Vec<Line> {
	let Some(tag) = notice.tag.as_deref() else {
		return Vec::new();
	};

	let Some(message) = notice.message.as_deref() else {
		let mut report = Span::new(
			Tone::Gray,
			"Please report this as an issue, so a fallback message can be created",
		);
		if !issues_url.is_empty() {
			report = report.link(Link::Url(issues_url.to_string()), "Click to open the issues page");
		}
		return vec![
			Line::text(
				Tone::Yellow,
				format!("Received a Twitch IRC Notice without a message, type: {tag}"),
			),
			Line::new().push(report),
		];
	};

	let rule = classify(tag);
	let line = match rule {
		NoticeRule::StateToggle => {
			let channel: Option<&ChannelName> = if show_channel { notice.channel.as_ref() } else { None };
			Line::prefixed(prefix, channel).add(rule.tone(), message)
		}
		_ => Line::text(rule.tone(), format!("{}{message}", rule.label())),
	};
	vec![line]
}
