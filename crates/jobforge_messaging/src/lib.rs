//! In-process named mailboxes.
//!
//! A mailbox is an ordered, multi-producer/single-consumer queue of
//! [`Message`] values, identified by an opaque name. Sending to an unknown
//! mailbox auto-creates it; popping an empty mailbox returns `None` rather
//! than blocking or erroring.
//!
//! The scheduler and worker pool trade messages through named mailboxes
//! rather than a socket, since everything here runs in one process.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use jobforge_protocol::Message;
use tracing::trace;

/// The messaging backend: a registry of named FIFO mailboxes.
#[derive(Default)]
pub struct MessagingBackend {
    mailboxes: Mutex<HashMap<String, VecDeque<Message>>>,
}

impl MessagingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` to the named mailbox, creating it if it doesn't
    /// exist yet. Returns once durably enqueued (i.e. once the lock is
    /// released) — there is no further acknowledgment to wait on.
    pub fn send(&self, mailbox_name: &str, message: Message) {
        let mut mailboxes = self.mailboxes.lock().expect("mailbox lock poisoned");
        mailboxes
            .entry(mailbox_name.to_string())
            .or_default()
            .push_back(message);
        trace!(mailbox = mailbox_name, "message enqueued");
    }

    /// Non-blocking pop of the oldest message in the named mailbox.
    pub fn pop(&self, mailbox_name: &str) -> Option<Message> {
        let mut mailboxes = self.mailboxes.lock().expect("mailbox lock poisoned");
        mailboxes.get_mut(mailbox_name)?.pop_front()
    }

    /// Non-blocking pop of the first message in the named mailbox matching
    /// `predicate`, preserving the relative order of the remaining
    /// messages. Used by the scheduler to correlate a specific job's
    /// response out of an otherwise FIFO stream.
    pub fn pop_matching<F>(&self, mailbox_name: &str, mut predicate: F) -> Option<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let mut mailboxes = self.mailboxes.lock().expect("mailbox lock poisoned");
        let queue = mailboxes.get_mut(mailbox_name)?;
        let index = queue.iter().position(|m| predicate(m))?;
        queue.remove(index)
    }

    /// Number of messages currently queued in `mailbox_name` (0 if unknown).
    pub fn len(&self, mailbox_name: &str) -> usize {
        let mailboxes = self.mailboxes.lock().expect("mailbox lock poisoned");
        mailboxes.get(mailbox_name).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self, mailbox_name: &str) -> bool {
        self.len(mailbox_name) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_protocol::JobId;

    fn started(job_id: JobId) -> Message {
        Message::JobStarted { job_id }
    }

    #[test]
    fn pop_on_unknown_mailbox_returns_none() {
        let bus = MessagingBackend::new();
        assert!(bus.pop("nope").is_none());
    }

    #[test]
    fn send_then_pop_is_fifo() {
        let bus = MessagingBackend::new();
        let first = JobId::new();
        let second = JobId::new();
        bus.send("scheduler", started(first.clone()));
        bus.send("scheduler", started(second.clone()));

        assert_eq!(bus.pop("scheduler").unwrap().job_id(), &first);
        assert_eq!(bus.pop("scheduler").unwrap().job_id(), &second);
        assert!(bus.pop("scheduler").is_none());
    }

    #[test]
    fn pop_matching_skips_non_matching_and_preserves_order() {
        let bus = MessagingBackend::new();
        let target = JobId::new();
        let other_a = JobId::new();
        let other_b = JobId::new();
        bus.send("scheduler", started(other_a.clone()));
        bus.send("scheduler", started(target.clone()));
        bus.send("scheduler", started(other_b.clone()));

        let found = bus
            .pop_matching("scheduler", |m| m.job_id() == &target)
            .unwrap();
        assert_eq!(found.job_id(), &target);

        assert_eq!(bus.pop("scheduler").unwrap().job_id(), &other_a);
        assert_eq!(bus.pop("scheduler").unwrap().job_id(), &other_b);
    }

    #[test]
    fn len_reflects_queue_size() {
        let bus = MessagingBackend::new();
        assert_eq!(bus.len("scheduler"), 0);
        bus.send("scheduler", started(JobId::new()));
        assert_eq!(bus.len("scheduler"), 1);
    }
}
