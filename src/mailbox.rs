//! Mailboxes: in-process FIFO endpoints addressable by pid and name.
use crate::codec::DecodeError;
use crate::message::Payload;
use crate::node::{NodeShared, SendError};
use crate::term::{Pid, Term};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// One queued mailbox event.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// An ordinary message (SEND or REG_SEND).
    Message { from: Option<Pid>, payload: Payload },

    /// An exit signal (link break or explicit exit request).
    Exit { from: Pid, reason: Term },

    /// The connection to `node` failed cookie authentication while a
    /// message for this mailbox was in flight.
    Auth { node: String },
}

/// A received message: sender information plus the payload, which stays
/// in its encoded form until first access when it arrived from a peer.
#[derive(Debug)]
pub struct Msg {
    from: Option<Pid>,
    payload: Payload,
}

impl Msg {
    pub(crate) fn from_parts(from: Option<Pid>, payload: Payload) -> Self {
        Self { from, payload }
    }

    /// Pid of the sender, when the carrying control message had one.
    pub fn sender(&self) -> Option<&Pid> {
        self.from.as_ref()
    }

    /// Borrows the payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Decodes the payload if necessary and returns the term.
    pub fn into_term(self) -> Result<Term, DecodeError> {
        self.payload.into_term()
    }
}

/// Errors raised by the receive operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RecvError {
    /// An exit signal reached the mailbox.
    #[error("received exit signal from {from}: reason {reason}")]
    Exited {
        /// Pid the signal came from.
        from: Pid,
        /// Exit reason term.
        reason: Term,
    },

    /// A peer failed cookie authentication.
    #[error("peer node {node} failed cookie authentication")]
    Auth {
        /// Name of the offending peer.
        node: String,
    },

    /// The receive deadline passed with no message.
    #[error("receive timed out")]
    Timeout,

    /// The mailbox was closed.
    #[error("mailbox is closed")]
    Closed,
}

// Shared mailbox state. The node registry holds this behind `Weak`, so a
// dropped mailbox handle leaves only a dead entry that the next lookup
// sweeps away.
pub(crate) struct MailboxCore {
    pub(crate) pid: Pid,
    name: Mutex<Option<String>>,
    tx: mpsc::UnboundedSender<Delivery>,
    links: Mutex<HashSet<Pid>>,
    closed: AtomicBool,
}

impl MailboxCore {
    pub(crate) fn channel(
        pid: Pid,
        name: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Arc::new(Self {
            pid,
            name: Mutex::new(name),
            tx,
            links: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        (core, rx)
    }

    /// Queues one event; returns `false` when the mailbox is gone.
    pub(crate) fn deliver(&self, delivery: Delivery) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(delivery).is_ok()
    }

    pub(crate) fn registered_name(&self) -> Option<String> {
        self.name.lock().expect("poisoned lock").clone()
    }

    pub(crate) fn set_registered_name(&self, name: Option<String>) {
        *self.name.lock().expect("poisoned lock") = name;
    }

    pub(crate) fn add_link(&self, pid: Pid) {
        self.links.lock().expect("poisoned lock").insert(pid);
    }

    pub(crate) fn remove_link(&self, pid: &Pid) {
        self.links.lock().expect("poisoned lock").remove(pid);
    }

    pub(crate) fn take_links(&self) -> Vec<Pid> {
        self.links
            .lock()
            .expect("poisoned lock")
            .drain()
            .collect()
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for MailboxCore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MailboxCore")
            .field("pid", &self.pid)
            .field("name", &self.registered_name())
            .finish_non_exhaustive()
    }
}

fn convert(delivery: Delivery) -> Result<Msg, RecvError> {
    match delivery {
        Delivery::Message { from, payload } => Ok(Msg { from, payload }),
        Delivery::Exit { from, reason } => Err(RecvError::Exited { from, reason }),
        Delivery::Auth { node } => Err(RecvError::Auth { node }),
    }
}

/// A mailbox handle.
///
/// The consumer drives `recv`; dropping the handle retires the mailbox
/// (the node registry only keeps a weak entry). [`Mailbox::close`] should
/// be called instead of a bare drop when the mailbox holds links, so the
/// peers learn about the exit.
#[derive(Debug)]
pub struct Mailbox {
    core: Arc<MailboxCore>,
    rx: mpsc::UnboundedReceiver<Delivery>,
    node: Weak<NodeShared>,
}

impl Mailbox {
    pub(crate) fn new(
        core: Arc<MailboxCore>,
        rx: mpsc::UnboundedReceiver<Delivery>,
        node: Weak<NodeShared>,
    ) -> Self {
        Self { core, rx, node }
    }

    pub(crate) fn core(&self) -> &Arc<MailboxCore> {
        &self.core
    }

    /// The pid of this mailbox.
    pub fn pid(&self) -> &Pid {
        &self.core.pid
    }

    /// The registered name, if any.
    pub fn name(&self) -> Option<String> {
        self.core.registered_name()
    }

    /// Waits until a message is available.
    ///
    /// An exit signal or an authentication failure at the head of the
    /// queue is raised as an error instead of being returned.
    pub async fn recv(&mut self) -> Result<Msg, RecvError> {
        let delivery = self.rx.recv().await;
        match delivery {
            Some(delivery) => {
                self.note_exit(&delivery);
                convert(delivery)
            }
            None => Err(RecvError::Closed),
        }
    }

    /// As [`recv`](Self::recv), but gives up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Msg, RecvError> {
        let outcome = tokio::time::timeout(timeout, self.rx.recv()).await;
        match outcome {
            Ok(Some(delivery)) => {
                self.note_exit(&delivery);
                convert(delivery)
            }
            Ok(None) => Err(RecvError::Closed),
            Err(_) => Err(RecvError::Timeout),
        }
    }

    /// Non-blocking poll; returns `Ok(None)` when the queue is empty.
    pub fn try_recv(&mut self) -> Result<Option<Msg>, RecvError> {
        let polled = self.rx.try_recv();
        match polled {
            Ok(delivery) => {
                self.note_exit(&delivery);
                convert(delivery).map(Some)
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(RecvError::Closed),
        }
    }

    // An exit signal consumes the link it travelled over.
    fn note_exit(&self, delivery: &Delivery) {
        if let Delivery::Exit { from, .. } = delivery {
            self.core.remove_link(from);
        }
    }

    /// Sends `term` to the mailbox owning `to`, local or remote.
    pub async fn send(&self, to: &Pid, term: Term) -> Result<(), SendError> {
        self.node()?.send_to_pid(to, term).await
    }

    /// Sends `term` to the locally registered name `name`.
    pub async fn send_to_name(&self, name: &str, term: Term) -> Result<(), SendError> {
        self.node()?
            .reg_send_local(&self.core.pid, name, term)
            .await
    }

    /// Sends `term` to the name `name` registered on the node `node`.
    pub async fn send_to_remote_name(
        &self,
        name: &str,
        node: &str,
        term: Term,
    ) -> Result<(), SendError> {
        self.node()?
            .reg_send_remote(&self.core.pid, name, node, term)
            .await
    }

    /// Links this mailbox to `to`.
    ///
    /// When either side exits, the other receives an exit signal. Linking
    /// twice to the same pid is a no-op.
    pub async fn link(&self, to: &Pid) -> Result<(), SendError> {
        self.node()?.link_from(&self.core, to).await
    }

    /// Removes a link to `to`.
    pub async fn unlink(&self, to: &Pid) -> Result<(), SendError> {
        self.node()?.unlink_from(&self.core, to).await
    }

    /// Sends an exit request to `to` with the given reason.
    pub async fn exit(&self, to: &Pid, reason: Term) -> Result<(), SendError> {
        self.node()?
            .exit2_from(&self.core.pid, to, reason)
            .await
    }

    /// Closes the mailbox with reason `normal`.
    pub async fn close(self) {
        self.close_with(Term::Atom(crate::term::Atom::from("normal")))
            .await;
    }

    /// Closes the mailbox: breaks every outstanding link with `reason`,
    /// unregisters the name and removes the mailbox from the node.
    pub async fn close_with(self, reason: Term) {
        let links = self.core.take_links();
        self.core.set_closed();
        if let Some(node) = self.node.upgrade() {
            node.unregister(&self.core);
            for to in links {
                let _ = node.break_link(&self.core.pid, &to, reason.clone()).await;
            }
        }
    }

    fn node(&self) -> Result<Arc<NodeShared>, SendError> {
        self.node.upgrade().ok_or(SendError::NodeClosed)
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.core.set_closed();
        if let Some(node) = self.node.upgrade() {
            node.unregister(&self.core);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Atom;

    fn pid(id: u32) -> Pid {
        Pid {
            node: Atom::from("n@h"),
            id,
            serial: 0,
            creation: 0,
        }
    }

    fn detached_mailbox() -> (Arc<MailboxCore>, Mailbox) {
        let (core, rx) = MailboxCore::channel(pid(1), None);
        let mbox = Mailbox::new(Arc::clone(&core), rx, Weak::new());
        (core, mbox)
    }

    #[tokio::test]
    async fn deliveries_come_out_in_fifo_order() {
        let (core, mut mbox) = detached_mailbox();
        for i in 0..10 {
            assert!(core.deliver(Delivery::Message {
                from: None,
                payload: Payload::Term(Term::from(i)),
            }));
        }
        for i in 0..10 {
            let msg = mbox.recv().await.unwrap();
            assert_eq!(msg.into_term().unwrap(), Term::from(i));
        }
    }

    #[tokio::test]
    async fn exit_at_queue_head_raises() {
        let (core, mut mbox) = detached_mailbox();
        core.add_link(pid(9));
        core.deliver(Delivery::Exit {
            from: pid(9),
            reason: Term::Atom(Atom::from("noconnection")),
        });
        match mbox.recv().await {
            Err(RecvError::Exited { from, reason }) => {
                assert_eq!(from, pid(9));
                assert_eq!(reason, Term::Atom(Atom::from("noconnection")));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // The exit consumed the link.
        assert!(core.take_links().is_empty());
    }

    #[tokio::test]
    async fn recv_timeout_expires() {
        let (_core, mut mbox) = detached_mailbox();
        let result = mbox.recv_timeout(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(RecvError::Timeout)));
    }

    #[tokio::test]
    async fn try_recv_polls_without_blocking() {
        let (core, mut mbox) = detached_mailbox();
        assert!(mbox.try_recv().unwrap().is_none());
        core.deliver(Delivery::Message {
            from: Some(pid(2)),
            payload: Payload::Term(Term::from(5)),
        });
        let msg = mbox.try_recv().unwrap().expect("message expected");
        assert_eq!(msg.sender(), Some(&pid(2)));
    }

    #[tokio::test]
    async fn closed_mailbox_refuses_delivery() {
        let (core, mbox) = detached_mailbox();
        drop(mbox);
        assert!(!core.deliver(Delivery::Message {
            from: None,
            payload: Payload::Term(Term::from(1)),
        }));
    }

    #[tokio::test]
    async fn encoded_payload_is_decoded_on_access() {
        let (core, mut mbox) = detached_mailbox();
        let term = Term::Tuple(crate::term::Tuple::from(vec![
            Term::Atom(Atom::from("hello")),
            Term::from(7),
        ]));
        let mut bytes = Vec::new();
        term.encode(&mut bytes).unwrap();
        core.deliver(Delivery::Message {
            from: None,
            payload: Payload::Encoded(bytes),
        });
        assert_eq!(mbox.recv().await.unwrap().into_term().unwrap(), term);
    }
}
