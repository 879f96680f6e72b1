//! Executor tasks with a two-phase start/stop rendezvous.
//!
//! `spawn_executor` returns only after the new task has acquired its
//! resources and reported ready over a oneshot channel (or reported why it
//! could not start). `ExecutorHandle::stop` posts a termination message and
//! returns only after the task has finished. The task body hands back its
//! result value `T` through its join handle.

use std::future::Future;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, SmfError};
use crate::mailbox::{mailbox, Mailbox, MailboxSender, Priority};

/// Held by the executor task until it has started (or failed to).
pub struct Rendezvous {
    tx: oneshot::Sender<Result<()>>,
}

impl Rendezvous {
    pub fn ready(self) {
        let _ = self.tx.send(Ok(()));
    }

    pub fn failed(self, err: SmfError) {
        let _ = self.tx.send(Err(err));
    }
}

pub struct ExecutorHandle<M, T = ()> {
    name: String,
    sender: MailboxSender<M>,
    task: Option<JoinHandle<T>>,
}

/// Spawn the future built by `body` and wait for it to report ready.
///
/// `body` receives the executor's mailbox and the rendezvous it must
/// resolve before doing any work.
pub async fn spawn_executor<M, T, F, Fut>(name: &str, body: F) -> Result<ExecutorHandle<M, T>>
where
    M: Send + 'static,
    T: Send + 'static,
    F: FnOnce(Mailbox<M>, Rendezvous) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let (sender, mailbox) = mailbox();
    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(body(mailbox, Rendezvous { tx }));

    match rx.await {
        Ok(Ok(())) => {
            debug!(executor = name, "executor ready");
            Ok(ExecutorHandle {
                name: name.to_string(),
                sender,
                task: Some(task),
            })
        }
        Ok(Err(err)) => {
            let _ = task.await;
            Err(err)
        }
        // The body returned without reporting either way.
        Err(_) => {
            let _ = task.await;
            Err(SmfError::ExecutorGone(name.to_string()))
        }
    }
}

impl<M, T> ExecutorHandle<M, T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post(&self, msg: M, priority: Priority) -> Result<()> {
        if self.sender.send(msg, priority) {
            Ok(())
        } else {
            Err(SmfError::ExecutorGone(self.name.clone()))
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the task to finish on its own and collect its result.
    /// `None` if the task panicked or was already joined.
    pub async fn join(&mut self) -> Option<T> {
        let task = self.task.take()?;
        let result = task.await.ok();
        debug!(executor = %self.name, "executor joined");
        result
    }

    /// Post `terminate` with high priority, then join.
    pub async fn stop(&mut self, terminate: M) -> Option<T> {
        self.sender.send(terminate, Priority::High);
        self.join().await
    }
}
