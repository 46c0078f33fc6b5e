#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use streamchat_domain::{ChannelName, PlatformMessageId};
use streamchat_platform::{ChatMessage, HelixApi};

/// Display colour of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tone {
	#[default]
	Plain,
	Gray,
	Green,
	Gold,
	Yellow,
	Red,
	Aqua,
	DarkAqua,
}

/// Click action attached to a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
	Url(String),
	/// Host command to run.
	Command(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Span {
	pub text: String,
	pub tone: Tone,
	pub bold: bool,
	pub italic: bool,
	pub link: Option<Link>,
	/// Hover text.
	pub hint: Option<String>,
}

impl Span {
	pub fn new(tone: Tone, text: impl Into<String>) -> Self {
		Self {
			text: text.into(),
			tone,
			..Self::default()
		}
	}

	pub fn bold(mut self) -> Self {
		self.bold = true;
		self
	}

	pub fn italic(mut self) -> Self {
		self.italic = true;
		self
	}

	pub fn link(mut self, link: Link, hint: impl Into<String>) -> Self {
		self.link = Some(link);
		self.hint = Some(hint.into());
		self
	}
}

/// One host-visible line of rich text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Line {
	pub spans: Vec<Span>,
}

impl Line {
	pub fn new() -> Self {
		Self::default()
	}

	/// Single-span line.
	pub fn text(tone: Tone, text: impl Into<String>) -> Self {
		Self::new().push(Span::new(tone, text))
	}

	/// Line starting with the configured prefix, plus the channel when it should be disclosed.
	pub fn prefixed(prefix: &str, channel: Option<&ChannelName>) -> Self {
		let mut line = Self::new();
		if !prefix.is_empty() {
			line = line.push(Span::new(Tone::DarkAqua, format!("{prefix} ")));
		}
		if let Some(channel) = channel {
			line = line.push(Span::new(Tone::Gray, format!("[{channel}] ")));
		}
		line
	}

	pub fn push(mut self, span: Span) -> Self {
		self.spans.push(span);
		self
	}

	pub fn add(self, tone: Tone, text: impl Into<String>) -> Self {
		self.push(Span::new(tone, text))
	}

	/// Text without styling.
	pub fn plain(&self) -> String {
		self.spans.iter().map(|s| s.text.as_str()).collect()
	}
}

/// Host surface for notification lines.
pub trait NotificationSink: Send + Sync + 'static {
	fn add_line(&self, line: Line);

	/// Lines that belong together; hosts may render them atomically.
	fn add_lines(&self, lines: Vec<Line>) {
		for line in lines {
			self.add_line(line);
		}
	}
}

/// Host-side chat message handling. Implementations move onto the host's own
/// execution context before touching host state.
pub trait MessageHandler: Send + Sync + 'static {
	fn handle_message(&self, message: ChatMessage);
}

/// Removal of already rendered chat content.
pub trait MessageRemovalSink: Send + Sync + 'static {
	fn remove_message(&self, channel_id: Option<&str>, message_id: &PlatformMessageId);

	/// `user` is the platform user id, or the login when the id is unknown.
	fn clear_user_messages(&self, channel_id: Option<&str>, user: &str);

	fn clear_chat(&self, channel_id: Option<&str>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCue {
	Event,
	Follow,
	Message,
}

pub trait SoundSink: Send + Sync + 'static {
	fn play(&self, cue: SoundCue, volume: f32, pitch: f32);
}

pub trait ClipboardSink: Send + Sync + 'static {
	fn copy(&self, text: &str);
}

/// Badge/emote asset synchronisation, owned by the host.
#[async_trait]
pub trait AuxiliarySync: Send + Sync + 'static {
	async fn sync_global_badges(&self, api: &dyn HelixApi) -> anyhow::Result<()>;

	async fn sync_channel_badges(&self, api: &dyn HelixApi, channel_ids: &[String]) -> anyhow::Result<()>;

	async fn sync_global_emotes(&self, api: &dyn HelixApi) -> anyhow::Result<()>;

	async fn sync_channel_emotes(&self, api: &dyn HelixApi, channel_ids: &[String]) -> anyhow::Result<()>;
}

/// All host collaborators in one place.
#[derive(Clone)]
pub struct HostSinks {
	pub notifications: Arc<dyn NotificationSink>,
	pub messages: Arc<dyn MessageHandler>,
	pub removals: Arc<dyn MessageRemovalSink>,
	pub sounds: Arc<dyn SoundSink>,
	pub clipboard: Arc<dyn ClipboardSink>,
	pub aux: Arc<dyn AuxiliarySync>,
}

impl HostSinks {
	pub fn line(&self, line: Line) {
		self.notifications.add_line(line);
	}

	pub fn lines(&self, lines: Vec<Line>) {
		self.notifications.add_lines(lines);
	}

	pub fn error(&self, text: impl Into<String>) {
		self.line(Line::text(Tone::Red, text));
	}

	pub fn success(&self, text: impl Into<String>) {
		self.line(Line::text(Tone::Green, text));
	}

	pub fn info(&self, text: impl Into<String>) {
		self.line(Line::text(Tone::Gray, text));
	}
}
