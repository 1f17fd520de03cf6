//! Post-handshake connection: the framed message loop.
//!
//! Frames are `[len:u32 BE][payload]`; a zero length is a tick that the
//! peer answers with four zero bytes. Non-tick payloads carry a
//! pass-through byte, a control tuple and, for SEND/REG_SEND, the
//! message payload.
use crate::codec::DecodeError;
use crate::link::{Link, LinkTable};
use crate::mailbox::{Delivery, MailboxCore};
use crate::message::{Message, Payload};
use crate::node::{NodeShared, SendError};
use crate::term::{Atom, List, Pid, Str, Term, Tuple};
use crate::TraceLevel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;

const PASS_THROUGH: u8 = 0x70;
const TOCK: [u8; 4] = [0; 4];

// Shared state of one authenticated connection. The write half lives
// behind an async mutex so each outgoing message is a single contiguous
// framed write; the receive loop owns the read half.
pub(crate) struct ConnectionShared {
    pub(crate) peer_name: String,
    local_cookie: String,
    links: Mutex<LinkTable>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    shutdown: Notify,
    cookie_ok: AtomicBool,
    send_cookie: AtomicBool,
    done: AtomicBool,
    cleaned: AtomicBool,
    trace: TraceLevel,
}

impl ConnectionShared {
    pub(crate) fn new(
        peer_name: String,
        local_cookie: String,
        writer: OwnedWriteHalf,
        trace: TraceLevel,
    ) -> Self {
        Self {
            peer_name,
            local_cookie,
            links: Mutex::new(LinkTable::new()),
            writer: tokio::sync::Mutex::new(Some(writer)),
            shutdown: Notify::new(),
            cookie_ok: AtomicBool::new(false),
            // The handshake already authenticated the peer, so cookies
            // are no longer sent on outbound control tuples.
            send_cookie: AtomicBool::new(false),
            done: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            trace,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn add_link(&self, local: Pid, remote: Pid) {
        self.links.lock().expect("poisoned lock").add(local, remote);
    }

    pub(crate) fn remove_link(&self, local: &Pid, remote: &Pid) {
        self.links
            .lock()
            .expect("poisoned lock")
            .remove(local, remote);
    }

    pub(crate) fn clear_links(&self) -> Vec<Link> {
        self.links.lock().expect("poisoned lock").clear_all()
    }

    /// The cookie atom to put into outbound control tuples.
    pub(crate) fn outgoing_cookie(&self) -> Atom {
        if self.send_cookie.load(Ordering::Acquire) {
            Atom::from(self.local_cookie.as_str())
        } else {
            Atom::from("")
        }
    }

    /// Writes one control message (and its payload, when present) as a
    /// single frame.
    pub(crate) async fn send_message(&self, msg: Message) -> Result<(), SendError> {
        if self.is_done() {
            return Err(SendError::NotConnected {
                node: self.peer_name.clone(),
            });
        }
        if self.trace.send() {
            tracing::trace!(peer = %self.peer_name, ?msg, "send");
        }
        let mut body = vec![PASS_THROUGH];
        msg.write_into(&mut body)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| SendError::NotConnected {
            node: self.peer_name.clone(),
        })?;
        let result: std::io::Result<()> = async {
            writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
            writer.write_all(&body).await?;
            writer.flush().await
        }
        .await;
        if result.is_err() {
            self.done.store(true, Ordering::Release);
        }
        result.map_err(SendError::from)
    }

    async fn send_tock(&self) -> std::io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed")
        })?;
        writer.write_all(&TOCK).await?;
        writer.flush().await
    }

    /// Claims the terminal cleanup; only the first caller wins.
    pub(crate) fn begin_cleanup(&self) -> bool {
        !self.cleaned.swap(true, Ordering::AcqRel)
    }

    /// Closes the connection. Idempotent; the receive loop observes the
    /// shutdown and runs the terminal cleanup.
    pub(crate) async fn close(&self) {
        self.done.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
        self.shutdown.notify_one();
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl std::fmt::Debug for ConnectionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ConnectionShared")
            .field("peer_name", &self.peer_name)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

enum FrameFailure {
    Decode(DecodeError),
    Auth,
}

impl From<DecodeError> for FrameFailure {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Drives one connection until the transport dies or the node closes it.
///
/// Every terminal outcome funnels into the node's cleanup: links break
/// with `noconnection`, the cache entry goes away, and the status
/// observer hears about it.
pub(crate) async fn receive_loop(
    node: Arc<NodeShared>,
    conn: Arc<ConnectionShared>,
    mut reader: OwnedReadHalf,
) {
    let failure = run_loop(&node, &conn, &mut reader).await;
    conn.close().await;
    node.connection_terminated(&conn, failure).await;
}

async fn run_loop(
    node: &Arc<NodeShared>,
    conn: &Arc<ConnectionShared>,
    reader: &mut OwnedReadHalf,
) -> Option<String> {
    loop {
        let mut len_buf = [0; 4];
        tokio::select! {
            _ = conn.shutdown.notified() => return None,
            result = reader.read_exact(&mut len_buf) => {
                if let Err(e) = result {
                    return Some(e.to_string());
                }
            }
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            // tick
            if let Err(e) = conn.send_tock().await {
                return Some(e.to_string());
            }
            continue;
        }
        let mut frame = vec![0; len];
        tokio::select! {
            _ = conn.shutdown.notified() => return None,
            result = reader.read_exact(&mut frame) => {
                if let Err(e) = result {
                    return Some(e.to_string());
                }
            }
        }
        match handle_frame(node, conn, &frame).await {
            Ok(()) => {}
            Err(FrameFailure::Decode(e)) => return Some(e.to_string()),
            Err(FrameFailure::Auth) => return Some("bad cookie".to_owned()),
        }
    }
}

async fn handle_frame(
    node: &Arc<NodeShared>,
    conn: &Arc<ConnectionShared>,
    frame: &[u8],
) -> Result<(), FrameFailure> {
    if frame.first() != Some(&PASS_THROUGH) {
        return Err(DecodeError::UnknownTag {
            tag: frame.first().copied().unwrap_or(0),
        }
        .into());
    }
    let mut slice = &frame[1..];
    let msg = Message::read_from(&mut slice)?;
    if conn.trace.ctrl() {
        tracing::trace!(peer = %conn.peer_name, ?msg, "recv");
    }
    match msg {
        Message::Send(m) => {
            let target = node.lookup_pid(&m.to_pid);
            check_cookie(node, conn, &m.cookie, target.as_ref()).await?;
            deliver_message(target, None, m.message);
        }
        Message::SendTt(m) => {
            let target = node.lookup_pid(&m.to_pid);
            check_cookie(node, conn, &m.cookie, target.as_ref()).await?;
            deliver_message(target, None, m.message);
        }
        Message::RegSend(m) => {
            let target = node.lookup_name(&m.to_name.name);
            check_cookie(node, conn, &m.cookie, target.as_ref()).await?;
            deliver_message(target, Some(m.from_pid), m.message);
        }
        Message::RegSendTt(m) => {
            let target = node.lookup_name(&m.to_name.name);
            check_cookie(node, conn, &m.cookie, target.as_ref()).await?;
            deliver_message(target, Some(m.from_pid), m.message);
        }
        Message::Link(m) => match node.lookup_pid(&m.to_pid) {
            Some(mbox) => {
                conn.add_link(m.to_pid.clone(), m.from_pid.clone());
                mbox.add_link(m.from_pid);
            }
            None => {
                // No such process: answer with an immediate exit.
                let _ = conn
                    .send_message(Message::exit(
                        m.to_pid,
                        m.from_pid,
                        Term::Atom(Atom::from("noproc")),
                    ))
                    .await;
            }
        },
        Message::Unlink(m) => {
            conn.remove_link(&m.to_pid, &m.from_pid);
            if let Some(mbox) = node.lookup_pid(&m.to_pid) {
                mbox.remove_link(&m.from_pid);
            }
        }
        Message::Exit(m) => {
            handle_exit(node, conn, m.from_pid, m.to_pid, m.reason, true);
        }
        Message::ExitTt(m) => {
            handle_exit(node, conn, m.from_pid, m.to_pid, m.reason, true);
        }
        Message::Exit2(m) => {
            handle_exit(node, conn, m.from_pid, m.to_pid, m.reason, false);
        }
        Message::Exit2Tt(m) => {
            handle_exit(node, conn, m.from_pid, m.to_pid, m.reason, false);
        }
        Message::NodeLink(_) | Message::GroupLeader(_) => {
            // Accepted and ignored.
        }
    }
    Ok(())
}

fn deliver_message(target: Option<Arc<MailboxCore>>, from: Option<Pid>, payload: Payload) {
    if let Some(mbox) = target {
        mbox.deliver(Delivery::Message { from, payload });
    }
    // Messages to unknown pids or names are dropped.
}

// EXIT (a link break) tears the link down before delivering; EXIT2 (an
// explicit exit request) leaves any link in place.
fn handle_exit(
    node: &Arc<NodeShared>,
    conn: &Arc<ConnectionShared>,
    from_pid: Pid,
    to_pid: Pid,
    reason: Term,
    remove_link: bool,
) {
    if remove_link {
        conn.remove_link(&to_pid, &from_pid);
    }
    if let Some(mbox) = node.lookup_pid(&to_pid) {
        if remove_link {
            mbox.remove_link(&from_pid);
        }
        mbox.deliver(Delivery::Exit {
            from: from_pid,
            reason,
        });
    }
}

// The first SEND/REG_SEND on a connection settles the cookie question.
// The peer was authenticated during the handshake and normally sends the
// empty cookie atom from then on; anything else must match our own
// cookie. On mismatch the peer gets the well-known error report and the
// connection dies with an auth failure.
async fn check_cookie(
    node: &Arc<NodeShared>,
    conn: &Arc<ConnectionShared>,
    cookie: &Atom,
    target: Option<&Arc<MailboxCore>>,
) -> Result<(), FrameFailure> {
    if conn.cookie_ok.load(Ordering::Acquire) {
        return Ok(());
    }
    if cookie.name.is_empty() || cookie.name == conn.local_cookie {
        conn.cookie_ok.store(true, Ordering::Release);
        return Ok(());
    }

    let report = Term::Tuple(Tuple::from(vec![
        Term::Atom(Atom::from("$gen_cast")),
        Term::Tuple(Tuple::from(vec![
            Term::Atom(Atom::from("print")),
            Term::Str(Str::from(format!(
                "~n** Bad cookie sent to {} **~n",
                node.name_str()
            ))),
            Term::List(List::nil()),
        ])),
    ]));
    let _ = conn
        .send_message(Message::reg_send(
            node.system_pid(),
            conn.outgoing_cookie(),
            Atom::from("auth"),
            Payload::Term(report),
        ))
        .await;
    if let Some(mbox) = target {
        mbox.deliver(Delivery::Auth {
            node: conn.peer_name.clone(),
        });
    }
    Err(FrameFailure::Auth)
}
