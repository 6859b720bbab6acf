//! One-shot outcome shared between the task running an operation and the
//! callers that joined it while it was in flight.

use tokio::sync::watch;
use walletkit_core::BridgeError;

pub(crate) type Outcome = Option<Result<(), BridgeError>>;

pub(crate) fn channel() -> (watch::Sender<Outcome>, watch::Receiver<Outcome>) {
    watch::channel(None)
}

/// Wait for the leader's result. `None` when the leader went away without
/// publishing one (its task was cancelled).
pub(crate) async fn join(mut outcome: watch::Receiver<Outcome>) -> Outcome {
    outcome
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|published| published.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn joiners_see_the_published_result() {
        let (tx, rx) = channel();
        let joiner = tokio::spawn(join(rx));
        tokio::task::yield_now().await;
        tx.send_replace(Some(Err(BridgeError::Destroyed)));
        assert_eq!(joiner.await.unwrap(), Some(Err(BridgeError::Destroyed)));
    }

    #[tokio::test]
    async fn dropped_leader_yields_none() {
        let (tx, rx) = channel();
        drop(tx);
        assert_eq!(join(rx).await, None);
    }
}
