//! Bounded hand-off of confirmations to the run pipeline.
//!
//! Head processing never waits on the consumer. With [OverflowPolicy::DropOldest] the queue is
//! a broadcast ring: a slow receiver loses the oldest entries and sees the lag count. With
//! [OverflowPolicy::RejectNewest] it is a bounded mpsc queue and a full queue refuses the new
//! confirmation.

use crate::config::{ConfirmationQueueConfig, OverflowPolicy};
use crate::confirmation::Confirmation;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full under [OverflowPolicy::RejectNewest].
    Rejected,
    /// Receiver dropped.
    Closed,
}

#[derive(Debug)]
pub(crate) enum ConfirmationSender {
    Broadcast(broadcast::Sender<Confirmation>),
    Bounded(mpsc::Sender<Confirmation>),
}

impl ConfirmationSender {
    /// Capacity must be non-zero.
    pub(crate) fn channel(config: &ConfirmationQueueConfig) -> (Self, Confirmations) {
        match config.overflow {
            OverflowPolicy::DropOldest => {
                let (tx, rx) = broadcast::channel(config.capacity);
                (
                    ConfirmationSender::Broadcast(tx),
                    Confirmations::new(Receiver::Broadcast(rx)),
                )
            }
            OverflowPolicy::RejectNewest => {
                let (tx, rx) = mpsc::channel(config.capacity);
                (
                    ConfirmationSender::Bounded(tx),
                    Confirmations::new(Receiver::Bounded(rx)),
                )
            }
        }
    }

    pub(crate) fn send(&self, confirmation: Confirmation) -> Delivery {
        match self {
            ConfirmationSender::Broadcast(tx) => match tx.send(confirmation) {
                Ok(_) => Delivery::Queued,
                Err(_) => Delivery::Closed,
            },
            ConfirmationSender::Bounded(tx) => match tx.try_send(confirmation) {
                Ok(()) => Delivery::Queued,
                Err(mpsc::error::TrySendError::Full(_)) => Delivery::Rejected,
                Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
            },
        }
    }
}

#[derive(Debug)]
enum Receiver {
    Broadcast(broadcast::Receiver<Confirmation>),
    Bounded(mpsc::Receiver<Confirmation>),
}

/// Receiving end of the confirmation stream. Ends after the engine is stopped and the queue
/// is drained.
#[derive(Debug)]
pub struct Confirmations {
    inner: Receiver,
    lagged: u64,
}

impl Confirmations {
    fn new(inner: Receiver) -> Self {
        Self { inner, lagged: 0 }
    }

    /// Next confirmation; `None` once the engine has stopped and everything queued was read.
    pub async fn recv(&mut self) -> Option<Confirmation> {
        match &mut self.inner {
            Receiver::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(c) => return Some(c),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "confirmation receiver lagged; oldest dropped");
                        self.lagged += n;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Receiver::Bounded(rx) => rx.recv().await,
        }
    }

    /// Non-blocking variant of [Confirmations::recv].
    pub fn try_recv(&mut self) -> Option<Confirmation> {
        match &mut self.inner {
            Receiver::Broadcast(rx) => loop {
                match rx.try_recv() {
                    Ok(c) => return Some(c),
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "confirmation receiver lagged; oldest dropped");
                        self.lagged += n;
                    }
                    Err(_) => return None,
                }
            },
            Receiver::Bounded(rx) => rx.try_recv().ok(),
        }
    }

    /// Everything currently queued.
    pub fn drain(&mut self) -> Vec<Confirmation> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Confirmations overwritten before this receiver read them.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::TriggerId;
    use crate::head::{BlockHash, Head};
    use crate::job::JobId;

    fn confirmation(n: u64) -> Confirmation {
        let head = Head::new(n, BlockHash([n as u8 + 1; 32]), BlockHash([n as u8 + 2; 32]));
        Confirmation {
            trigger_id: TriggerId(n),
            job_id: JobId::from("job"),
            initiator: 0,
            log_index: 0,
            observed_at: head,
            confirmed_at: head,
            confirmations: 1,
        }
    }

    #[test]
    fn drop_oldest_overwrites_and_reports_lag() {
        let config = ConfirmationQueueConfig {
            capacity: 2,
            overflow: OverflowPolicy::DropOldest,
        };
        let (tx, mut rx) = ConfirmationSender::channel(&config);
        for n in 0..4 {
            assert_eq!(tx.send(confirmation(n)), Delivery::Queued);
        }
        let got: Vec<_> = rx.drain().into_iter().map(|c| c.trigger_id).collect();
        assert_eq!(got, vec![TriggerId(2), TriggerId(3)]);
        assert_eq!(rx.lagged(), 2);
    }

    #[test]
    fn reject_newest_refuses_when_full() {
        let config = ConfirmationQueueConfig {
            capacity: 2,
            overflow: OverflowPolicy::RejectNewest,
        };
        let (tx, mut rx) = ConfirmationSender::channel(&config);
        assert_eq!(tx.send(confirmation(0)), Delivery::Queued);
        assert_eq!(tx.send(confirmation(1)), Delivery::Queued);
        assert_eq!(tx.send(confirmation(2)), Delivery::Rejected);
        let got: Vec<_> = rx.drain().into_iter().map(|c| c.trigger_id).collect();
        assert_eq!(got, vec![TriggerId(0), TriggerId(1)]);
    }

    #[tokio::test]
    async fn recv_ends_when_sender_dropped() {
        let (tx, mut rx) = ConfirmationSender::channel(&ConfirmationQueueConfig::default());
        tx.send(confirmation(0));
        drop(tx);
        assert_eq!(rx.recv().await.map(|c| c.trigger_id), Some(TriggerId(0)));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn send_after_receiver_dropped_is_closed() {
        let (tx, rx) = ConfirmationSender::channel(&ConfirmationQueueConfig::default());
        drop(rx);
        assert_eq!(tx.send(confirmation(0)), Delivery::Closed);
    }
}
