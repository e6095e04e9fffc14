//! Terminal post writes with local retry.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tracing::warn;

use crier_store::{Store, StoreError, TerminalUpdate};

/// Apply `update` if the post is still `SCHEDULED`, retrying transient storage
/// errors in place.
///
/// Returns true if this call performed the transition.
pub(crate) async fn finalize(
    store: &Store,
    post_id: &str,
    update: &TerminalUpdate,
) -> Result<bool, StoreError> {
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(2),
        max_elapsed_time: Some(Duration::from_secs(30)),
        ..Default::default()
    };

    loop {
        match store.finalize_post(post_id, update) {
            Ok(applied) => return Ok(applied),
            Err(e) if e.is_transient() => match backoff.next_backoff() {
                Some(wait) => {
                    warn!(post_id, error = %e, "terminal write failed, retrying");
                    tokio::time::sleep(wait).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}
