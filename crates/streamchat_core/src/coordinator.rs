#![forbid(unsafe_code)]

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::host::{Line, NotificationSink, Tone};

/// First grace period for the worker to drain on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Extra time granted after the worker was told to abort.
pub const SHUTDOWN_FORCE_GRACE: Duration = Duration::from_secs(10);

/// Boxed unit of work run by the action worker.
pub type Action = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
	#[error("another important action is still pending")]
	Busy,
	#[error("the action worker has shut down")]
	Closed,
	/// The command needs a selected channel and none is configured.
	#[error("no channel is selected")]
	NoChannelSelected,
}

/// Whether `schedule` enqueued the action.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
	Accepted,
	Rejected(RejectReason),
}

impl ScheduleOutcome {
	pub fn is_accepted(self) -> bool {
		matches!(self, Self::Accepted)
	}
}

struct Job {
	label: &'static str,
	important: bool,
	action: Action,
}

/// Single-worker queue for session mutations and remote lookups.
///
/// Actions run one at a time in submission order. While an important action
/// is queued or running every new submission is rejected synchronously.
pub struct ActionCoordinator {
	tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
	worker: Mutex<Option<JoinHandle<()>>>,
	important: Arc<AtomicBool>,
}

impl ActionCoordinator {
	/// Spawn the worker. Must be called from within a tokio runtime.
	pub fn start(notifications: Arc<dyn NotificationSink>) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		let important = Arc::new(AtomicBool::new(false));
		let worker = tokio::spawn(run_worker(rx, important.clone(), notifications));

		Self {
			tx: Mutex::new(Some(tx)),
			worker: Mutex::new(Some(worker)),
			important,
		}
	}

	/// Enqueue an action.
	///
	/// Rejected with [`RejectReason::Busy`] when an important action is pending.
	/// For important actions the flag is raised before enqueueing and lowered
	/// once the action finished, whatever its result.
	pub fn schedule<F>(&self, label: &'static str, important: bool, action: F) -> ScheduleOutcome
	where
		F: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		let acquired = if important {
			self.important
				.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
		} else {
			!self.important.load(Ordering::Acquire)
		};
		if !acquired {
			metrics::counter!("streamchat_actions_rejected_total", "reason" => "busy").increment(1);
			debug!(action = label, "action rejected: important action pending");
			return ScheduleOutcome::Rejected(RejectReason::Busy);
		}

		let job = Job {
			label,
			important,
			action: action.boxed(),
		};
		let sent = match self.tx.lock().as_ref() {
			Some(tx) => tx.send(job).is_ok(),
			None => false,
		};
		if !sent {
			if important {
				self.important.store(false, Ordering::Release);
			}
			metrics::counter!("streamchat_actions_rejected_total", "reason" => "closed").increment(1);
			return ScheduleOutcome::Rejected(RejectReason::Closed);
		}

		metrics::counter!("streamchat_actions_accepted_total").increment(1);
		debug!(action = label, important, "action scheduled");
		ScheduleOutcome::Accepted
	}

	/// `true` while an important action is queued or running.
	pub fn is_action_scheduled(&self) -> bool {
		self.important.load(Ordering::Acquire)
	}

	/// Stop accepting actions and drain the worker.
	///
	/// Waits [`SHUTDOWN_GRACE`], then aborts the worker and waits up to
	/// [`SHUTDOWN_FORCE_GRACE`] more.
	pub async fn shutdown(&self) {
		drop(self.tx.lock().take());
		let Some(mut worker) = self.worker.lock().take() else {
			return;
		};

		if tokio::time::timeout(SHUTDOWN_GRACE, &mut worker).await.is_ok() {
			info!("action worker drained");
			return;
		}
		warn!("action worker did not terminate after 5 seconds; aborting");
		worker.abort();

		if tokio::time::timeout(SHUTDOWN_FORCE_GRACE, &mut worker).await.is_err() {
			error!("action worker did not terminate after 15 seconds");
		}
		// The aborted action never reached its own release.
		self.important.store(false, Ordering::Release);
	}
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Job>, important: Arc<AtomicBool>, notifications: Arc<dyn NotificationSink>) {
	while let Some(job) = rx.recv().await {
		let result = AssertUnwindSafe(job.action).catch_unwind().await;
		match result {
			Ok(Ok(())) => debug!(action = job.label, "action finished"),
			Ok(Err(e)) => report_failure(&*notifications, job.label, &format!("{e:#}")),
			Err(panic) => report_failure(&*notifications, job.label, &panic_message(&*panic)),
		}
		if job.important {
			important.store(false, Ordering::Release);
		}
	}
	debug!("action queue closed; worker exiting");
}

fn report_failure(notifications: &dyn NotificationSink, label: &str, message: &str) {
	metrics::counter!("streamchat_actions_failed_total").increment(1);
	error!(action = label, error = %message, "async action failed");
	notifications.add_line(Line::text(Tone::Red, format!("An async action has failed: {message}")));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		format!("panicked: {s}")
	} else if let Some(s) = payload.downcast_ref::<String>() {
		format!("panicked: {s}")
	} else {
		"panicked".to_string()
	}
}
