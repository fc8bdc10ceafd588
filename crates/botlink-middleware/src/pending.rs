//! [`PendingResult`] – a settle-once result cell with any number of waiters.
//!
//! The owner settles the cell with a value or cancels it.  Only the first
//! call wins.  Dropping an unsettled cell resolves every waiter as
//! [`Settlement::Cancelled`], so a superseded result can never leave a
//! waiter hanging.

use tokio::sync::watch;

/// How a [`PendingResult`] was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement<T> {
    Value(T),
    Cancelled,
}

impl<T> Settlement<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Settlement::Value(v) => Some(v),
            Settlement::Cancelled => None,
        }
    }
}

/// Single-shot result cell.
#[derive(Debug)]
pub struct PendingResult<T> {
    slot: watch::Sender<Option<Settlement<T>>>,
}

impl<T: Clone> PendingResult<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Settle with `value`.  Returns `false` if already resolved.
    pub fn settle(&self, value: T) -> bool {
        self.resolve(Settlement::Value(value))
    }

    /// Resolve as cancelled.  Returns `false` if already resolved.
    pub fn cancel(&self) -> bool {
        self.resolve(Settlement::Cancelled)
    }

    pub fn is_settled(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// A handle that resolves when this cell does.
    pub fn waiter(&self) -> Waiter<T> {
        Waiter {
            slot: self.slot.subscribe(),
        }
    }

    fn resolve(&self, settlement: Settlement<T>) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(settlement);
                true
            } else {
                false
            }
        })
    }
}

impl<T: Clone> Default for PendingResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaitable side of a [`PendingResult`].
#[derive(Debug, Clone)]
pub struct Waiter<T> {
    slot: watch::Receiver<Option<Settlement<T>>>,
}

impl<T: Clone> Waiter<T> {
    /// Wait for the cell to resolve.
    pub async fn wait(mut self) -> Settlement<T> {
        if let Ok(slot) = self.slot.wait_for(Option::is_some).await
            && let Some(settlement) = slot.clone()
        {
            return settlement;
        }
        // The cell was dropped; honour a value that raced the drop.
        self.slot.borrow().clone().unwrap_or(Settlement::Cancelled)
    }

    /// Current resolution, if any, without waiting.
    pub fn peek(&self) -> Option<Settlement<T>> {
        self.slot.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_settlement_wins() {
        let pending = PendingResult::new();
        let waiter = pending.waiter();
        assert!(pending.settle(true));
        assert!(!pending.settle(false));
        assert!(!pending.cancel());
        assert_eq!(waiter.wait().await, Settlement::Value(true));
    }

    #[tokio::test]
    async fn every_waiter_sees_the_same_outcome() {
        let pending = PendingResult::new();
        let a = pending.waiter();
        let b = pending.waiter();
        let task = tokio::spawn(async move { a.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pending.settle(7u32);
        assert_eq!(task.await.unwrap(), Settlement::Value(7));
        assert_eq!(b.wait().await, Settlement::Value(7));
    }

    #[tokio::test]
    async fn waiter_created_after_settling_resolves_immediately() {
        let pending = PendingResult::new();
        pending.cancel();
        let settled = tokio::time::timeout(Duration::from_millis(50), pending.waiter().wait())
            .await
            .expect("settled cell must not block");
        assert_eq!(settled, Settlement::<bool>::Cancelled);
    }

    #[tokio::test]
    async fn dropping_unsettled_cell_cancels_waiters() {
        let pending = PendingResult::<bool>::new();
        let waiter = pending.waiter();
        drop(pending);
        let settled = tokio::time::timeout(Duration::from_millis(50), waiter.wait())
            .await
            .expect("dropped cell must not leave the waiter hanging");
        assert_eq!(settled, Settlement::Cancelled);
    }

    #[test]
    fn peek_reflects_state() {
        let pending = PendingResult::new();
        let waiter = pending.waiter();
        assert!(waiter.peek().is_none());
        assert!(!pending.is_settled());
        pending.settle("granted");
        assert!(pending.is_settled());
        assert_eq!(waiter.peek(), Some(Settlement::Value("granted")));
    }
}
