#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use streamchat_domain::ChannelName;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::follows::FollowPoller;
use super::irc::{IrcLine, decode_event};
use crate::{ChatConnection, EventRx, PlatformEvent, SecretString};

pub const DEFAULT_IRC_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const LOGIN_FAILURE_MARKERS: [&str; 2] = ["Login authentication failed", "Improperly formatted auth"];

#[derive(Clone, Debug)]
pub struct TwitchChatConfig {
	pub ws_url: Url,
	pub login: String,
	pub token: SecretString,
	pub login_timeout: Duration,
	pub reconnect_min: Duration,
	pub reconnect_max: Duration,
	pub event_buffer: usize,
}

impl TwitchChatConfig {
	pub fn new(login: impl Into<String>, token: SecretString) -> anyhow::Result<Self> {
		Ok(Self {
			ws_url: Url::parse(DEFAULT_IRC_WS_URL).context("parse irc ws url")?,
			login: login.into().to_ascii_lowercase(),
			token,
			login_timeout: Duration::from_secs(10),
			reconnect_min: Duration::from_millis(500),
			reconnect_max: Duration::from_secs(30),
			event_buffer: 1024,
		})
	}
}

/// State shared between the handle and its socket task.
struct Shared {
	events_tx: broadcast::Sender<PlatformEvent>,
	joined: Mutex<BTreeSet<ChannelName>>,
	scoped_ids: Mutex<HashSet<String>>,
}

impl Shared {
	fn publish(&self, line: &IrcLine) {
		for ev in decode_event(line) {
			if ev.category().is_channel_scoped() {
				let listening = ev.channel_id().is_some_and(|id| self.scoped_ids.lock().contains(id));
				if !listening {
					continue;
				}
			}
			metrics::counter!("streamchat_twitch_events_total").increment(1);
			let _ = self.events_tx.send(ev);
		}
	}
}

struct Running {
	out_tx: mpsc::UnboundedSender<String>,
	task: JoinHandle<()>,
}

/// Twitch chat over the IRC websocket gateway.
///
/// A listener instance carries a follower poller; a sender instance does not.
pub struct TwitchChat {
	cfg: TwitchChatConfig,
	shared: Arc<Shared>,
	running: Mutex<Option<Running>>,
	follows: Option<FollowPoller>,
}

enum PumpEnd {
	/// Handle closed the outgoing queue.
	Closed,
	Lost(String),
}

fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

fn sanitize_line(text: &str) -> String {
	text.replace(['\r', '\n'], " ")
}

async fn send_raw(ws: &mut TwitchWs, line: &str) -> anyhow::Result<()> {
	ws.send(Message::Text(line.to_string().into()))
		.await
		.context("twitch irc send")
}

async fn open_session(cfg: &TwitchChatConfig) -> anyhow::Result<TwitchWs> {
	let (mut ws, _resp) = tokio_tungstenite::connect_async(cfg.ws_url.as_str())
		.await
		.context("connect_async to twitch irc ws")?;

	send_raw(&mut ws, "CAP REQ :twitch.tv/tags twitch.tv/commands").await?;
	send_raw(&mut ws, &format!("PASS oauth:{}", cfg.token.expose())).await?;
	send_raw(&mut ws, &format!("NICK {}", cfg.login)).await?;

	let deadline = Instant::now() + cfg.login_timeout;
	loop {
		let msg = tokio::time::timeout_at(deadline, ws.next())
			.await
			.context("twitch irc login timed out")?;
		let Some(msg) = msg else {
			anyhow::bail!("twitch irc closed during login");
		};

		match msg.context("twitch irc read during login")? {
			Message::Text(t) => {
				for raw in t.as_str().lines() {
					let Ok(line) = IrcLine::parse(raw) else {
						continue;
					};
					match line.command.as_str() {
						"001" => return Ok(ws),
						"PING" => {
							let payload = line.param(0).unwrap_or("tmi.twitch.tv");
							send_raw(&mut ws, &format!("PONG :{payload}")).await?;
						}
						"NOTICE" => {
							let body = line.param(1).unwrap_or_default();
							if LOGIN_FAILURE_MARKERS.iter().any(|m| body.contains(m)) {
								anyhow::bail!("twitch irc login failed: {body}");
							}
						}
						_ => {}
					}
				}
			}
			Message::Ping(p) => {
				let _ = ws.send(Message::Pong(p)).await;
			}
			Message::Close(c) => {
				anyhow::bail!("twitch irc closed during login: {c:?}");
			}
			_ => {}
		}
	}
}

async fn pump(ws: &mut TwitchWs, out_rx: &mut mpsc::UnboundedReceiver<String>, shared: &Shared) -> PumpEnd {
	loop {
		tokio::select! {
			out = out_rx.recv() => {
				let Some(line) = out else {
					let _ = ws.send(Message::Text("QUIT".to_string().into())).await;
					let _ = ws.close(None).await;
					return PumpEnd::Closed;
				};
				if let Err(e) = send_raw(ws, &line).await {
					return PumpEnd::Lost(format!("{e:#}"));
				}
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					return PumpEnd::Lost("twitch irc ws ended".to_string());
				};
				let msg = match msg {
					Ok(m) => m,
					Err(e) => return PumpEnd::Lost(format!("twitch irc ws read error: {e}")),
				};

				match msg {
					Message::Text(t) => {
						for raw in t.as_str().lines() {
							let line = match IrcLine::parse(raw) {
								Ok(l) => l,
								Err(e) => {
									debug!(error = %e, "skipping malformed irc line");
									continue;
								}
							};
							match line.command.as_str() {
								"PING" => {
									let payload = line.param(0).unwrap_or("tmi.twitch.tv");
									if let Err(e) = send_raw(ws, &format!("PONG :{payload}")).await {
										return PumpEnd::Lost(format!("{e:#}"));
									}
								}
								"RECONNECT" => return PumpEnd::Lost("server requested reconnect".to_string()),
								_ => shared.publish(&line),
							}
						}
					}
					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
					}
					Message::Close(frame) => {
						return PumpEnd::Lost(format!("twitch irc ws closed: {frame:?}"));
					}
					_ => {}
				}
			}
		}
	}
}

async fn run_socket(
	cfg: TwitchChatConfig,
	first: TwitchWs,
	mut out_rx: mpsc::UnboundedReceiver<String>,
	shared: Arc<Shared>,
) {
	let mut ws = Some(first);
	let mut attempt: u32 = 0;

	loop {
		let mut socket = match ws.take() {
			Some(s) => s,
			None => {
				if out_rx.is_closed() {
					return;
				}
				let delay = backoff_delay(attempt, cfg.reconnect_min, cfg.reconnect_max);
				attempt = attempt.saturating_add(1);
				sleep(delay).await;

				match open_session(&cfg).await {
					Ok(mut s) => {
						let channels: Vec<ChannelName> = shared.joined.lock().iter().cloned().collect();
						for channel in channels {
							if let Err(e) = send_raw(&mut s, &format!("JOIN {}", channel.irc())).await {
								warn!(channel = %channel, error = %e, "rejoin failed");
							}
						}
						info!(login = %cfg.login, "twitch irc reconnected");
						attempt = 0;
						s
					}
					Err(e) => {
						metrics::counter!("streamchat_twitch_reconnect_failures_total").increment(1);
						warn!(error = %e, attempt, "twitch irc reconnect failed");
						continue;
					}
				}
			}
		};

		match pump(&mut socket, &mut out_rx, &shared).await {
			PumpEnd::Closed => {
				debug!(login = %cfg.login, "twitch irc socket closed");
				return;
			}
			PumpEnd::Lost(reason) => {
				warn!(login = %cfg.login, %reason, "twitch irc connection lost");
			}
		}
	}
}

impl TwitchChat {
	pub fn new(cfg: TwitchChatConfig) -> Self {
		let (events_tx, _) = broadcast::channel(cfg.event_buffer.max(1));
		Self::build_with(cfg, events_tx, None)
	}

	pub(crate) fn with_follows(cfg: TwitchChatConfig, api: Arc<dyn crate::HelixApi>, poll_interval: Duration) -> Self {
		let (events_tx, _) = broadcast::channel(cfg.event_buffer.max(1));
		let follows = FollowPoller::new(api, events_tx.clone(), poll_interval);
		Self::build_with(cfg, events_tx, Some(follows))
	}

	fn build_with(cfg: TwitchChatConfig, events_tx: broadcast::Sender<PlatformEvent>, follows: Option<FollowPoller>) -> Self {
		Self {
			cfg,
			shared: Arc::new(Shared {
				events_tx,
				joined: Mutex::new(BTreeSet::new()),
				scoped_ids: Mutex::new(HashSet::new()),
			}),
			running: Mutex::new(None),
			follows,
		}
	}

	fn send_line(&self, line: String) -> anyhow::Result<()> {
		let guard = self.running.lock();
		let running = guard.as_ref().context("twitch chat is not connected")?;
		running
			.out_tx
			.send(line)
			.map_err(|_| anyhow::anyhow!("twitch chat socket task has stopped"))
	}
}

#[async_trait]
impl ChatConnection for TwitchChat {
	fn events(&self) -> EventRx {
		self.shared.events_tx.subscribe()
	}

	async fn connect(&self) -> anyhow::Result<()> {
		if self.running.lock().as_ref().is_some_and(|r| !r.task.is_finished()) {
			return Ok(());
		}

		let ws = open_session(&self.cfg).await?;
		info!(login = %self.cfg.login, "twitch irc connected");

		let (out_tx, out_rx) = mpsc::unbounded_channel();
		let task = tokio::spawn(run_socket(self.cfg.clone(), ws, out_rx, self.shared.clone()));

		if let Some(old) = self.running.lock().replace(Running { out_tx, task }) {
			old.task.abort();
		}
		Ok(())
	}

	async fn join(&self, channel: &ChannelName) -> anyhow::Result<()> {
		self.send_line(format!("JOIN {}", channel.irc()))?;
		self.shared.joined.lock().insert(channel.clone());
		debug!(channel = %channel, "joined twitch channel");
		Ok(())
	}

	async fn leave(&self, channel: &ChannelName) -> anyhow::Result<()> {
		self.send_line(format!("PART {}", channel.irc()))?;
		self.shared.joined.lock().remove(channel);
		debug!(channel = %channel, "left twitch channel");
		Ok(())
	}

	fn joined_channels(&self) -> Vec<ChannelName> {
		self.shared.joined.lock().iter().cloned().collect()
	}

	fn is_joined(&self, channel: &ChannelName) -> bool {
		self.shared.joined.lock().contains(channel)
	}

	async fn send_message(&self, channel: &ChannelName, text: &str) -> anyhow::Result<()> {
		self.send_line(format!("PRIVMSG {} :{}", channel.irc(), sanitize_line(text)))
	}

	async fn listen_channel_events(&self, broadcaster_id: &str) -> anyhow::Result<()> {
		anyhow::ensure!(!broadcaster_id.trim().is_empty(), "empty broadcaster id");
		self.shared.scoped_ids.lock().insert(broadcaster_id.to_string());
		Ok(())
	}

	async fn enable_follow_events(&self, channels: &[ChannelName]) -> anyhow::Result<()> {
		let follows = self.follows.as_ref().context("follow events need a listener connection")?;
		follows.enable(channels).await
	}

	async fn disable_follow_events(&self, channels: &[ChannelName]) -> anyhow::Result<()> {
		if let Some(follows) = &self.follows {
			follows.disable(channels);
		}
		Ok(())
	}

	async fn close(&self) {
		if let Some(follows) = &self.follows {
			follows.disable_all();
		}

		let running = self.running.lock().take();
		if let Some(Running { out_tx, task }) = running {
			drop(out_tx);
			if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
				warn!(login = %self.cfg.login, "twitch irc socket did not close in time");
			}
		}

		self.shared.joined.lock().clear();
		self.shared.scoped_ids.lock().clear();
		info!(login = %self.cfg.login, "twitch irc closed");
	}
}
