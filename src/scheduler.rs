//! Proactive token renewal.
//!
//! A background task follows the gateway's token events. Each new pair arms a
//! single timer that fires `LEAD_WINDOW` before the access token expires and
//! calls [`AuthGateway::refresh`]. A successful refresh publishes a new pair,
//! which re-arms the timer from the new expiry; a failed one leaves the timer
//! disarmed until the next login or reactive refresh. A refreshed token that
//! is already inside the lead window is not re-armed.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::gateway::{AuthGateway, TokenEvent};

/// Renew this long before the access token expires.
pub const DEFAULT_LEAD_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Time until the proactive refresh should run.
///
/// Zero when the token is already inside the lead window (or expired).
pub fn refresh_delay(exp_ms: i64, now_ms: i64, lead_window: Duration) -> Duration {
    let lead_ms = i64::try_from(lead_window.as_millis()).unwrap_or(i64::MAX);
    let delay_ms = exp_ms.saturating_sub(now_ms).saturating_sub(lead_ms).max(0);
    Duration::from_millis(delay_ms as u64)
}

/// Owns the background refresh task. Dropping it stops the task.
#[derive(Debug)]
pub struct RefreshScheduler {
    gateway: AuthGateway,
    /// Carries the session epoch current when the cancel was requested.
    cancel: mpsc::UnboundedSender<u64>,
    handle: JoinHandle<()>,
}

impl RefreshScheduler {
    /// Spawn the timer task. Must be called inside a tokio runtime.
    pub fn spawn(gateway: AuthGateway, lead_window: Duration) -> Self {
        let events = gateway.subscribe();
        let (cancel, cancelled) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(gateway.clone(), events, cancelled, lead_window));
        Self {
            gateway,
            cancel,
            handle,
        }
    }

    /// Disarm the pending timer, if any. Pairs published in the current
    /// session are not armed; the next session's first pair is.
    pub fn cancel(&self) {
        let _ = self.cancel.send(self.gateway.epoch());
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn delay_for(event: &TokenEvent, lead_window: Duration) -> Option<Duration> {
    let TokenEvent::Set(claims) = event else {
        return None;
    };
    let exp_ms = claims.exp_millis()?;
    Some(refresh_delay(
        exp_ms,
        chrono::Utc::now().timestamp_millis(),
        lead_window,
    ))
}

fn arm(delay: Option<Duration>) -> Option<Instant> {
    let delay = delay?;
    debug!(delay_ms = delay.as_millis() as u64, "Proactive refresh armed");
    Some(Instant::now() + delay)
}

async fn run(
    gateway: AuthGateway,
    mut events: watch::Receiver<TokenEvent>,
    mut cancelled: mpsc::UnboundedReceiver<u64>,
    lead_window: Duration,
) {
    let mut deadline = arm(delay_for(&events.borrow_and_update(), lead_window));
    // Set by a proactive refresh until the pair it produced has been seen.
    let mut just_refreshed = false;

    loop {
        let timer = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            message = cancelled.recv() => {
                let Some(epoch) = message else {
                    return;
                };
                events.mark_unchanged();
                just_refreshed = false;
                if deadline.take().is_some() {
                    debug!("Proactive refresh cancelled");
                }
                // Epochs advance before their events are published, so a
                // newer epoch means the current value belongs to a session
                // that started after the cancel.
                if gateway.epoch() > epoch {
                    deadline = arm(delay_for(&events.borrow(), lead_window));
                }
            }
            changed = events.changed() => {
                if changed.is_err() {
                    return;
                }
                // Replaces any armed timer.
                let delay = delay_for(&events.borrow_and_update(), lead_window);
                if std::mem::take(&mut just_refreshed) && delay == Some(Duration::ZERO) {
                    // The server issues tokens that live no longer than the
                    // lead window; renewing again now would spin.
                    warn!("Refreshed token is already inside the lead window, not re-arming");
                    deadline = None;
                } else {
                    deadline = arm(delay);
                }
            }
            () = timer => {
                deadline = None;
                debug!("Running proactive refresh");
                match gateway.refresh().await {
                    Ok(_) => just_refreshed = true,
                    Err(e) => warn!(kind = %e.kind, error = %e, "Proactive refresh failed"),
                }
            }
        }
    }
}
