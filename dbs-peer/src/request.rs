//! Request/reply driver: subscribe the pending action on the reply channel,
//! send, and wait with exponential backoff until it is satisfied or the
//! attempt budget runs out.

use std::future::Future;
use std::sync::Arc;

use dbs_core::action::{ActionStatus, PendingAction, Subscriptions};
use dbs_core::RetryPolicy;
use tracing::{debug, warn};

use crate::channel::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    /// `Satisfied` or `Expired`.
    pub status: ActionStatus,
    /// Sends performed.
    pub attempts: u32,
}

impl RequestOutcome {
    pub fn is_satisfied(&self) -> bool {
        self.status == ActionStatus::Satisfied
    }
}

/// Expires and unsubscribes the action when dropped, so a request whose
/// future is cancelled mid-wait leaves nothing behind on the channel.
struct Subscription<'a> {
    subscriptions: &'a Subscriptions,
    action: Arc<PendingAction>,
}

impl<'a> Subscription<'a> {
    fn new(subscriptions: &'a Subscriptions, action: Arc<PendingAction>) -> Self {
        subscriptions.subscribe(action.clone());
        Self {
            subscriptions,
            action,
        }
    }
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.action.expire();
        self.subscriptions.unsubscribe(self.action.id());
    }
}

/// Run `action` to completion. `send` is called once per attempt with the
/// attempt number; a failed send is logged and counts as an unanswered
/// attempt. The action is unsubscribed on return and on cancellation.
pub async fn request<S, Fut>(
    subscriptions: &Subscriptions,
    action: Arc<PendingAction>,
    policy: &RetryPolicy,
    mut send: S,
) -> RequestOutcome
where
    S: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), ChannelError>>,
{
    // Subscribe first so a fast reply cannot slip past.
    let subscription = Subscription::new(subscriptions, action.clone());
    let mut attempts = 0;
    while let Some(wait) = policy.interval(attempts) {
        attempts += 1;
        if let Err(e) = send(attempts - 1).await {
            warn!(error = %e, attempt = attempts, "request send failed");
        }
        match tokio::time::timeout(wait, action.completed()).await {
            Ok(ActionStatus::Satisfied) => {
                return RequestOutcome {
                    status: ActionStatus::Satisfied,
                    attempts,
                };
            }
            Ok(_) => break,
            Err(_) => debug!(
                attempt = attempts,
                replies = action.responders().len(),
                required = action.required(),
                "no complete reply yet"
            ),
        }
    }
    drop(subscription);
    RequestOutcome {
        // A reply may have landed between the last timeout and the expiry.
        status: action.status(),
        attempts,
    }
}
