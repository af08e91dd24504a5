//! Single-slot follow-up message queue (§4.5).
//!
//! While a backend turn is in flight, a consumer may queue at most one
//! follow-up message. A second `queue_message` replaces the first rather
//! than appending — there is no FIFO here, only "the next thing to say".

use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub user_id: String,
    pub text: String,
}

/// Why an ownership-gated mutation (`update`/`cancel`) was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMutationError {
    Empty,
    NotOwner,
}

#[derive(Default)]
pub struct FollowUpQueue {
    slot: RwLock<Option<QueuedMessage>>,
}

impl FollowUpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the queued message, returning the one it displaced, if any.
    pub fn queue(&self, user_id: String, text: String) -> Option<QueuedMessage> {
        self.slot.write().replace(QueuedMessage { user_id, text })
    }

    /// Update the text of the currently queued message in place. Only the
    /// original author may do this (§4.5 "Only the original author... may
    /// update_queued_message or cancel_queued_message").
    pub fn update(&self, user_id: &str, text: String) -> Result<(), QueueMutationError> {
        let mut slot = self.slot.write();
        match slot.as_mut() {
            Some(existing) if existing.user_id == user_id => {
                existing.text = text;
                Ok(())
            }
            Some(_) => Err(QueueMutationError::NotOwner),
            None => Err(QueueMutationError::Empty),
        }
    }

    /// Drop the queued message without sending it. Only the original author
    /// may do this.
    pub fn cancel(&self, user_id: &str) -> Result<(), QueueMutationError> {
        let mut slot = self.slot.write();
        match slot.as_ref() {
            Some(existing) if existing.user_id == user_id => {
                *slot = None;
                Ok(())
            }
            Some(_) => Err(QueueMutationError::NotOwner),
            None => Err(QueueMutationError::Empty),
        }
    }

    /// Take (and clear) the queued message, if any — called once the
    /// backend turn that was in flight completes.
    pub fn take(&self) -> Option<QueuedMessage> {
        self.slot.write().take()
    }

    pub fn peek(&self) -> Option<QueuedMessage> {
        self.slot.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queueing_a_second_message_replaces_the_first() {
        let q = FollowUpQueue::new();
        assert!(q.queue("u1".into(), "first".into()).is_none());
        let displaced = q.queue("u1".into(), "second".into()).unwrap();
        assert_eq!(displaced.text, "first");
        assert_eq!(q.peek().unwrap().text, "second");
    }

    #[test]
    fn update_with_nothing_queued_is_rejected() {
        let q = FollowUpQueue::new();
        assert_eq!(q.update("u1", "x".into()), Err(QueueMutationError::Empty));
    }

    #[test]
    fn update_by_non_owner_is_rejected() {
        let q = FollowUpQueue::new();
        q.queue("u1".into(), "hi".into());
        assert_eq!(q.update("u2", "bye".into()), Err(QueueMutationError::NotOwner));
        assert_eq!(q.peek().unwrap().text, "hi");
    }

    #[test]
    fn cancel_empties_the_slot() {
        let q = FollowUpQueue::new();
        q.queue("u1".into(), "hi".into());
        assert_eq!(q.cancel("u1"), Ok(()));
        assert!(q.peek().is_none());
        assert_eq!(q.cancel("u1"), Err(QueueMutationError::Empty));
    }

    #[test]
    fn cancel_by_non_owner_is_rejected() {
        let q = FollowUpQueue::new();
        q.queue("u1".into(), "hi".into());
        assert_eq!(q.cancel("u2"), Err(QueueMutationError::NotOwner));
        assert!(q.peek().is_some());
    }

    #[test]
    fn take_clears_the_slot() {
        let q = FollowUpQueue::new();
        q.queue("u1".into(), "hi".into());
        let taken = q.take().unwrap();
        assert_eq!(taken.text, "hi");
        assert!(q.peek().is_none());
    }
}
