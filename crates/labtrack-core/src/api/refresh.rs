//! Single-flight coordination of token refreshes.
//!
//! At most one refresh ticket exists at a time. The first caller to see an
//! expired token becomes the ticket owner and runs the refresh; everyone who
//! arrives while the ticket is outstanding waits on it and receives the same
//! outcome. Ticket creation is guarded by a mutex, outcomes are broadcast
//! through a watch channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, warn};

/// Result every participant of a refresh ticket observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New credentials are stored; re-dispatch once.
    Retry,
    /// The refresh failed and the session was ended.
    Fail(String),
}

struct Ticket {
    id: u64,
    outcome: watch::Receiver<Option<RefreshOutcome>>,
}

#[derive(Default)]
pub struct RefreshCoordinator {
    ticket: Mutex<Option<Ticket>>,
    next_id: AtomicU64,
}

/// Role handed to a caller that asked to join a refresh.
pub enum Join {
    /// No ticket was outstanding: the caller created one and must resolve it.
    Owner(TicketOwner, TicketWaiter),
    /// A ticket was outstanding: wait for its outcome.
    Waiter(TicketWaiter),
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(self: &Arc<Self>) -> Join {
        let mut slot = self.ticket.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ticket) = slot.as_ref() {
            debug!(ticket = ticket.id, "Joining outstanding refresh");
            return Join::Waiter(TicketWaiter {
                outcome: ticket.outcome.clone(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = watch::channel(None);
        *slot = Some(Ticket {
            id,
            outcome: rx.clone(),
        });
        debug!(ticket = id, "Created refresh ticket");

        Join::Owner(
            TicketOwner {
                id,
                tx: Some(tx),
                coordinator: Arc::clone(self),
            },
            TicketWaiter { outcome: rx },
        )
    }

    pub fn is_outstanding(&self) -> bool {
        self.ticket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn discard(&self, id: u64) {
        let mut slot = self.ticket.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map(|t| t.id) == Some(id) {
            *slot = None;
        }
    }
}

/// Exclusive right to resolve the outstanding ticket.
///
/// Dropping an owner without resolving (e.g. the refresh task panicked)
/// releases waiters with a failure and discards the ticket.
pub struct TicketOwner {
    id: u64,
    tx: Option<watch::Sender<Option<RefreshOutcome>>>,
    coordinator: Arc<RefreshCoordinator>,
}

impl TicketOwner {
    /// Discard the ticket, then release every waiter with `outcome`.
    pub fn resolve(mut self, outcome: RefreshOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: RefreshOutcome) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        // Discard first so callers arriving after release start a fresh ticket
        // instead of reading this one's outcome.
        self.coordinator.discard(self.id);
        debug!(
            ticket = self.id,
            waiters = tx.receiver_count(),
            ?outcome,
            "Releasing refresh waiters"
        );
        tx.send_replace(Some(outcome));
    }
}

impl Drop for TicketOwner {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!(ticket = self.id, "Refresh ticket dropped without an outcome");
            self.finish(RefreshOutcome::Fail("refresh was interrupted".to_string()));
        }
    }
}

pub struct TicketWaiter {
    outcome: watch::Receiver<Option<RefreshOutcome>>,
}

impl TicketWaiter {
    pub async fn wait(mut self) -> RefreshOutcome {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome)
                .clone()
                .unwrap_or_else(|| RefreshOutcome::Fail("refresh produced no outcome".to_string())),
            Err(_) => RefreshOutcome::Fail("refresh was interrupted".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_join_waits_on_first_ticket() {
        let coordinator = Arc::new(RefreshCoordinator::new());

        let Join::Owner(owner, owner_wait) = coordinator.join() else {
            panic!("first join must own the ticket");
        };
        let Join::Waiter(waiter) = coordinator.join() else {
            panic!("second join must wait");
        };
        assert!(coordinator.is_outstanding());

        owner.resolve(RefreshOutcome::Retry);
        assert!(!coordinator.is_outstanding());
        assert_eq!(waiter.wait().await, RefreshOutcome::Retry);
        assert_eq!(owner_wait.wait().await, RefreshOutcome::Retry);
    }

    #[tokio::test]
    async fn test_all_waiters_see_failure() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let Join::Owner(owner, _) = coordinator.join() else {
            panic!("first join must own the ticket");
        };
        let waiters: Vec<_> = (0..5)
            .map(|_| match coordinator.join() {
                Join::Waiter(w) => w,
                Join::Owner(..) => panic!("only one owner"),
            })
            .collect();

        owner.resolve(RefreshOutcome::Fail("rejected".to_string()));
        for waiter in waiters {
            assert_eq!(waiter.wait().await, RefreshOutcome::Fail("rejected".to_string()));
        }
    }

    #[tokio::test]
    async fn test_new_ticket_after_resolution() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let Join::Owner(first, first_wait) = coordinator.join() else {
            panic!("first join must own the ticket");
        };
        first.resolve(RefreshOutcome::Fail("rejected".to_string()));

        let Join::Owner(second, second_wait) = coordinator.join() else {
            panic!("resolved ticket must not be joined");
        };
        second.resolve(RefreshOutcome::Retry);
        assert_eq!(first_wait.wait().await, RefreshOutcome::Fail("rejected".to_string()));
        assert_eq!(second_wait.wait().await, RefreshOutcome::Retry);
    }

    #[tokio::test]
    async fn test_dropped_owner_releases_waiters() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let Join::Owner(owner, _) = coordinator.join() else {
            panic!("first join must own the ticket");
        };
        let Join::Waiter(waiter) = coordinator.join() else {
            panic!("second join must wait");
        };

        drop(owner);
        assert!(matches!(waiter.wait().await, RefreshOutcome::Fail(_)));
        assert!(!coordinator.is_outstanding());
    }
}
