#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SharedSettings;
use crate::host::{Line, Link, NotificationSink, Span, Tone};

pub const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const DISABLE_COMMAND: &str = "/twitch updatechecker disable";

/// A published release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
	/// Version without a leading `v`.
	pub version: String,
	pub page_url: String,
}

/// Where the latest release is looked up.
#[async_trait]
pub trait ReleaseSource: Send + Sync + 'static {
	async fn latest(&self) -> anyhow::Result<Release>;
}

/// `releases/latest` of a GitHub repository.
pub struct GithubReleases {
	http: reqwest::Client,
	repository: String,
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
	tag_name: String,
	html_url: String,
}

impl GithubReleases {
	/// `repository` is `owner/name`.
	pub fn new(repository: impl Into<String>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent(concat!("streamchat/", env!("CARGO_PKG_VERSION"), " (update-checker)"))
			.timeout(Duration::from_secs(10))
			.build()
			.context("build reqwest client")?;
		Ok(Self {
			http,
			repository: repository.into(),
		})
	}
}

#[async_trait]
impl ReleaseSource for GithubReleases {
	async fn latest(&self) -> anyhow::Result<Release> {
		let url = format!("https://api.github.com/repos/{}/releases/latest", self.repository);
		let resp = self
			.http
			.get(&url)
			.header("Accept", "application/vnd.github+json")
			.send()
			.await
			.context("github releases send")?;
		let status = resp.status();
		if !status.is_success() {
			anyhow::bail!("github releases failed: status={status}");
		}
		let release: GithubRelease = resp.json().await.context("github releases decode")?;
		Ok(Release {
			version: release.tag_name.trim_start_matches('v').to_string(),
			page_url: release.html_url,
		})
	}
}

/// Numeric dotted comparison; non-numeric parts compare as zero.
pub fn is_newer(candidate: &str, current: &str) -> bool {
	fn parts(v: &str) -> Vec<u64> {
		v.trim()
			.trim_start_matches('v')
			.split(['.', '-', '+'])
			.take(3)
			.map(|p| p.parse().unwrap_or(0))
			.collect()
	}
	let (mut a, mut b) = (parts(candidate), parts(current));
	let len = a.len().max(b.len());
	a.resize(len, 0);
	b.resize(len, 0);
	a > b
}

/// What the last check found out about the running version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionStatus {
	Latest,
	UpdateAvailable(Release),
	Unknown,
}

struct Running {
	cancel: watch::Sender<bool>,
	task: JoinHandle<()>,
}

struct Shared {
	source: Arc<dyn ReleaseSource>,
	current_version: String,
	settings: SharedSettings,
	notifications: Arc<dyn NotificationSink>,
	latest: RwLock<Option<Release>>,
}

impl Shared {
	async fn check(&self) {
		let release = match self.source.latest().await {
			Ok(r) => r,
			Err(e) => {
				warn!(error = ?e, "update check failed");
				return;
			}
		};

		let previous = self.latest.write().replace(release.clone());
		if !is_newer(&release.version, &self.current_version) {
			debug!(latest = %release.version, "running the latest version");
			return;
		}
		if previous.as_ref().is_some_and(|p| p.version == release.version) {
			return;
		}

		warn!(latest = %release.version, current = %self.current_version, "new version available");
		let prefix = self.settings.read().prefix.clone();
		self.notifications.add_lines(vec![
			Line::prefixed(&prefix, None).push(
				Span::new(Tone::Gold, format!("New update published: v{}", release.version)).link(
					Link::Url(release.page_url.clone()),
					"Click here to see releases on GitHub!",
				),
			),
			Line::prefixed(&prefix, None).push(
				Span::new(Tone::Gray, "Want to check for updates only on startup? Click here!")
					.italic()
					.link(Link::Command(DISABLE_COMMAND.to_string()), format!("Use {DISABLE_COMMAND} to disable")),
			),
		]);
	}
}

/// Recurring release check.
///
/// Stopping never interrupts a check in progress; it only prevents the next one.
pub struct UpdateChecker {
	shared: Arc<Shared>,
	interval: Duration,
	running: Mutex<Option<Running>>,
}

impl UpdateChecker {
	pub fn new(
		source: Arc<dyn ReleaseSource>,
		current_version: impl Into<String>,
		settings: SharedSettings,
		notifications: Arc<dyn NotificationSink>,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				source,
				current_version: current_version.into(),
				settings,
				notifications,
				latest: RwLock::new(None),
			}),
			interval: UPDATE_CHECK_INTERVAL,
			running: Mutex::new(None),
		}
	}

	pub fn with_interval(mut self, interval: Duration) -> Self {
		self.interval = interval;
		self
	}

	pub fn current_version(&self) -> &str {
		&self.shared.current_version
	}

	pub fn is_running(&self) -> bool {
		self.running.lock().as_ref().is_some_and(|r| !r.task.is_finished())
	}

	/// Start the recurring check. Returns `false` when it was already running.
	pub fn start(&self, check_now: bool) -> bool {
		let mut running = self.running.lock();
		if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
			return false;
		}

		let (cancel, mut cancelled) = watch::channel(false);
		let shared = self.shared.clone();
		let interval = self.interval;
		let task = tokio::spawn(async move {
			let mut first = check_now;
			loop {
				if !first {
					tokio::select! {
						_ = tokio::time::sleep(interval) => {}
						_ = cancelled.changed() => {}
					}
				}
				first = false;
				if *cancelled.borrow() {
					break;
				}
				shared.check().await;
			}
			debug!("update checker stopped");
		});
		info!(interval_secs = interval.as_secs(), check_now, "update checker started");
		*running = Some(Running { cancel, task });
		true
	}

	pub fn stop(&self) {
		if let Some(running) = self.running.lock().take() {
			let _ = running.cancel.send(true);
			info!("update checker stopping");
		}
	}

	/// Run one check right away.
	pub async fn check_now(&self) {
		self.shared.check().await;
	}

	pub fn status(&self) -> VersionStatus {
		match self.shared.latest.read().as_ref() {
			None => VersionStatus::Unknown,
			Some(r) if is_newer(&r.version, &self.shared.current_version) => VersionStatus::UpdateAvailable(r.clone()),
			Some(_) => VersionStatus::Latest,
		}
	}
}

impl Drop for UpdateChecker {
	fn drop(&mut self) {
		self.stop();
	}
}
