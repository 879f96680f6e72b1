//! Priority mailbox for executor tasks.
//!
//! Two unbounded tokio channels, one per lane, drained with a biased
//! `select!`. `High` messages (SUSPEND, TERMINATE) are always received before
//! any `Normal` message that is still queued, so an executor sees a stop
//! request at its next receive even when it has posted follow-up work to
//! itself.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

/// Receiving side, owned by the executor task.
pub struct Mailbox<M> {
    high: mpsc::UnboundedReceiver<M>,
    normal: mpsc::UnboundedReceiver<M>,
    sender: MailboxSender<M>,
}

/// Sending side; cheap to clone and hand to other tasks or threads.
pub struct MailboxSender<M> {
    high: mpsc::UnboundedSender<M>,
    normal: mpsc::UnboundedSender<M>,
}

impl<M> Clone for MailboxSender<M> {
    fn clone(&self) -> Self {
        Self {
            high: self.high.clone(),
            normal: self.normal.clone(),
        }
    }
}

/// Create a mailbox and a sender for it.
pub fn mailbox<M>() -> (MailboxSender<M>, Mailbox<M>) {
    let (high_tx, high_rx) = mpsc::unbounded_channel();
    let (normal_tx, normal_rx) = mpsc::unbounded_channel();
    let sender = MailboxSender {
        high: high_tx,
        normal: normal_tx,
    };
    let mailbox = Mailbox {
        high: high_rx,
        normal: normal_rx,
        sender: sender.clone(),
    };
    (sender, mailbox)
}

impl<M> Mailbox<M> {
    /// Sender for messages the executor posts to itself.
    pub fn sender(&self) -> MailboxSender<M> {
        self.sender.clone()
    }

    /// Wait for the next message. `None` once the mailbox is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<M> {
        tokio::select! {
            biased;
            Some(msg) = self.high.recv() => Some(msg),
            Some(msg) = self.normal.recv() => Some(msg),
            else => None,
        }
    }

    /// Refuse further messages. Already queued ones can still be received.
    pub fn close(&mut self) {
        self.high.close();
        self.normal.close();
    }
}

impl<M> MailboxSender<M> {
    /// Queue a message. Returns false when the receiving executor is gone.
    pub fn send(&self, msg: M, priority: Priority) -> bool {
        let lane = match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
        };
        lane.send(msg).is_ok()
    }
}
