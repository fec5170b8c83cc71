use super::callbacks::{invoke_guarded, CallbackSlot};
use crate::host::SharedDocument;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Polls the document location and reports every change to the callbacks.
///
/// This is the fallback for SPA routers that change the location without
/// dispatching any navigation event.
pub(crate) fn spawn_location_poller(
    document: SharedDocument,
    callbacks: Arc<CallbackSlot>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_location = document.location();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    break;
                }
                _ = ticker.tick() => {
                    let current = document.location();
                    if current == last_location {
                        continue;
                    }

                    let previous = std::mem::replace(&mut last_location, current.clone());
                    tracing::debug!(
                        target: "overlay_sync::observer",
                        from = %previous,
                        to = %current,
                        "location change detected by poller"
                    );
                    let callbacks = callbacks.get();
                    invoke_guarded("on_url_change", || {
                        callbacks.on_url_change(&current, &previous)
                    });
                }
            }
        }

        tracing::trace!(target: "overlay_sync::observer", "location poller stopped");
    })
}
