//! Cooperative actor layer for non-blocking mailboxes.
//!
//! An actor mailbox never exposes a blocking receive. Instead the
//! scheduler owns the receiving half and runs one logical task per
//! actor: each arriving message resumes the task, which invokes the
//! actor's handler exactly once. Handler invocations are dispatched on
//! the runtime's worker pool but stay serialized per task; there is
//! never more than one in-flight invocation for the same actor.
//!
//! Cancelling an actor is observed between messages: an in-flight
//! handler always completes before the task retires.
use crate::mailbox::{Delivery, MailboxCore, Msg};
use crate::node::{NodeShared, SendError};
use crate::term::{Atom, Pid, Term};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// What an actor wants to happen after handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep the task alive and wait for the next message.
    Continue,

    /// Retire the task and close the mailbox.
    Stop,
}

/// A message-driven actor bound to a non-blocking mailbox.
pub trait Actor: Send + 'static {
    /// Called once before the first message.
    ///
    /// Returning [`Flow::Stop`] ends the task immediately, before any
    /// message is consumed.
    fn started(&mut self, ctx: &ActorContext) -> impl Future<Output = Flow> + Send {
        let _ = ctx;
        async { Flow::Continue }
    }

    /// Called for each message, in mailbox FIFO order.
    fn handle(&mut self, ctx: &ActorContext, msg: Msg) -> impl Future<Output = Flow> + Send;
}

/// Execution context handed to an actor's callbacks.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pid: Pid,
    node: Weak<NodeShared>,
}

impl ActorContext {
    pub(crate) fn new(pid: Pid, node: Weak<NodeShared>) -> Self {
        Self { pid, node }
    }

    /// The pid of the actor's mailbox.
    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    /// Sends `term` to the mailbox owning `to`, local or remote.
    pub async fn send(&self, to: &Pid, term: Term) -> Result<(), SendError> {
        self.node()?.send_to_pid(to, term).await
    }

    /// Sends `term` to the locally registered name `name`.
    pub async fn send_to_name(&self, name: &str, term: Term) -> Result<(), SendError> {
        self.node()?.reg_send_local(&self.pid, name, term).await
    }

    /// Sends `term` to the name `name` registered on the node `node`.
    pub async fn send_to_remote_name(
        &self,
        name: &str,
        node: &str,
        term: Term,
    ) -> Result<(), SendError> {
        self.node()?
            .reg_send_remote(&self.pid, name, node, term)
            .await
    }

    fn node(&self) -> Result<Arc<NodeShared>, SendError> {
        self.node.upgrade().ok_or(SendError::NodeClosed)
    }
}

struct TaskEntry {
    cancel: Arc<Notify>,
}

/// Dispatcher for actor tasks.
#[derive(Default)]
pub(crate) struct Scheduler {
    tasks: Mutex<HashMap<Pid, TaskEntry>>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates the task for an actor mailbox and advances it to its
    /// first suspension point.
    pub(crate) fn spawn<A: Actor>(
        &self,
        node: &Arc<NodeShared>,
        core: Arc<MailboxCore>,
        rx: mpsc::UnboundedReceiver<Delivery>,
        actor: A,
    ) {
        let pid = core.pid.clone();
        let cancel = Arc::new(Notify::new());
        let ctx = ActorContext::new(pid.clone(), Arc::downgrade(node));
        let weak_node = Arc::downgrade(node);
        tokio::spawn(run_task(
            actor,
            ctx,
            core,
            rx,
            Arc::clone(&cancel),
            weak_node,
        ));
        self.tasks
            .lock()
            .expect("poisoned lock")
            .insert(pid, TaskEntry { cancel });
    }

    /// Marks the task for `pid` inactive; it is discarded at its next
    /// scheduling point.
    pub(crate) fn cancel(&self, pid: &Pid) {
        if let Some(entry) = self.tasks.lock().expect("poisoned lock").remove(pid) {
            entry.cancel.notify_one();
        }
    }

    /// Retires every task. Used by node shutdown.
    pub(crate) fn shutdown(&self) {
        let entries: Vec<TaskEntry> = self
            .tasks
            .lock()
            .expect("poisoned lock")
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            entry.cancel.notify_one();
        }
    }

    pub(crate) fn forget(&self, pid: &Pid) {
        self.tasks.lock().expect("poisoned lock").remove(pid);
    }
}

async fn run_task<A: Actor>(
    mut actor: A,
    ctx: ActorContext,
    core: Arc<MailboxCore>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    cancel: Arc<Notify>,
    node: Weak<NodeShared>,
) {
    let mut reason = Term::Atom(Atom::from("normal"));
    if matches!(actor.started(&ctx).await, Flow::Continue) {
        loop {
            let delivery = tokio::select! {
                _ = cancel.notified() => break,
                delivery = rx.recv() => delivery,
            };
            match delivery {
                None => break,
                Some(Delivery::Message { from, payload }) => {
                    let msg = Msg::from_parts(from, payload);
                    if matches!(actor.handle(&ctx, msg).await, Flow::Stop) {
                        break;
                    }
                }
                Some(Delivery::Exit {
                    from,
                    reason: exit_reason,
                }) => {
                    // An exit signal retires the actor; the exit reason
                    // propagates to whoever else the mailbox is linked to.
                    core.remove_link(&from);
                    reason = exit_reason;
                    break;
                }
                Some(Delivery::Auth { .. }) => break,
            }
        }
    }

    // Retire: close the mailbox and break outstanding links.
    let links = core.take_links();
    core.set_closed();
    if let Some(node) = node.upgrade() {
        node.unregister(&core);
        node.scheduler().forget(&core.pid);
        for to in links {
            let _ = node.break_link(&core.pid, &to, reason.clone()).await;
        }
    }
}
