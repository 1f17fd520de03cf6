//! The node: listener, registries, connection cache and identifiers.
use crate::codec::EncodeError;
use crate::connection::{self, ConnectionShared};
use crate::epmd::{EpmdClient, EpmdError, NodeInfo};
use crate::flags::DistributionFlags;
use crate::handshake::{Handshake, HandshakeError};
use crate::mailbox::{Delivery, Mailbox, MailboxCore, Msg, RecvError};
use crate::message::{Message, Payload};
use crate::scheduler::{Actor, ActorContext, Flow, Scheduler};
use crate::term::{Atom, Pid, Port, Reference, Term, Tuple};
use crate::{Creation, NodeName, NodeNameError, TraceLevel};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Observer interface for node status changes.
///
/// Every callback is invoked with panics caught and logged, so an
/// ill-behaved observer cannot take the node down. All methods default
/// to doing nothing.
pub trait StatusHandler: Send + Sync + 'static {
    /// A remote node came up (`up == true`) or went down.
    fn remote_status(&self, node: &str, up: bool, info: Option<&str>) {
        let _ = (node, up, info);
    }

    /// The local node registered with (`up == true`) or left EPMD.
    fn local_status(&self, node: &str, up: bool, info: Option<&str>) {
        let _ = (node, up, info);
    }

    /// A connection attempt (incoming or outgoing) failed or was refused.
    fn conn_attempt(&self, node: &str, incoming: bool, info: Option<&str>) {
        let _ = (node, incoming, info);
    }
}

/// Errors that can occur while setting up or running a node.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum NodeError {
    #[error(transparent)]
    BadName(#[from] NodeNameError),

    #[error(transparent)]
    Epmd(#[from] EpmdError),

    #[error("the name {name:?} is already registered")]
    NameTaken { name: String },

    #[error("node is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while establishing an outbound connection.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum ConnectError {
    #[error("invalid peer node name: {0}")]
    BadPeerName(#[from] NodeNameError),

    #[error("node {node} is not registered with its EPMD")]
    UnknownNode { node: String },

    #[error(transparent)]
    Epmd(#[from] EpmdError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while sending.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum SendError {
    #[error("not connected to node {node}")]
    NotConnected { node: String },

    #[error("the local node is closed")]
    NodeClosed,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configuration of a [`Node`].
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    cookie: Option<String>,
    flags: Option<DistributionFlags>,
    trace: TraceLevel,
    epmd_port: Option<u16>,
}

impl NodeConfig {
    /// Makes a new configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cookie. When unset, the cookie file is consulted and a
    /// missing file yields the empty cookie.
    pub fn cookie(mut self, cookie: &str) -> Self {
        self.cookie = Some(cookie.to_owned());
        self
    }

    /// Overrides the announced capability flags.
    pub fn flags(mut self, flags: DistributionFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Sets the trace level for this node.
    pub fn trace(mut self, trace: TraceLevel) -> Self {
        self.trace = trace;
        self
    }

    /// Overrides the EPMD port (otherwise `ERL_EPMD_PORT` or 4369).
    pub fn epmd_port(mut self, port: u16) -> Self {
        self.epmd_port = Some(port);
        self
    }
}

// Monotonic id sources; widths and wraparound per the wire format.
#[derive(Debug)]
struct IdCounters {
    pid_id: u32,
    pid_serial: u32,
    port_id: u32,
    ref_ids: [u32; 3],
}

impl IdCounters {
    fn new() -> Self {
        Self {
            pid_id: 1,
            pid_serial: 0,
            port_id: 1,
            ref_ids: [1, 0, 0],
        }
    }

    fn next_pid(&mut self) -> (u32, u32) {
        let ids = (self.pid_id, self.pid_serial);
        self.pid_id = (self.pid_id + 1) & 0x7fff;
        if self.pid_id == 0 {
            self.pid_serial = (self.pid_serial + 1) & 0x1fff;
        }
        ids
    }

    fn next_port(&mut self) -> u32 {
        let id = self.port_id;
        self.port_id = (self.port_id + 1) & 0x0fff_ffff;
        id
    }

    fn next_ref(&mut self) -> [u32; 3] {
        let ids = self.ref_ids;
        self.ref_ids[0] = (self.ref_ids[0] + 1) & 0x0003_ffff;
        if self.ref_ids[0] == 0 {
            self.ref_ids[1] = self.ref_ids[1].wrapping_add(1);
            if self.ref_ids[1] == 0 {
                self.ref_ids[2] = self.ref_ids[2].wrapping_add(1);
            }
        }
        ids
    }
}

// Mailbox registries. Entries are weak: a mailbox whose every handle was
// dropped shows up as a dead entry and is swept on the next lookup.
#[derive(Debug, Default)]
struct Registry {
    by_pid: HashMap<Pid, Weak<MailboxCore>>,
    by_name: HashMap<String, Weak<MailboxCore>>,
}

impl Registry {
    fn lookup_pid(&mut self, pid: &Pid) -> Option<Arc<MailboxCore>> {
        match self.by_pid.get(pid)?.upgrade() {
            Some(core) => Some(core),
            None => {
                self.by_pid.remove(pid);
                None
            }
        }
    }

    fn lookup_name(&mut self, name: &str) -> Option<Arc<MailboxCore>> {
        match self.by_name.get(name)?.upgrade() {
            Some(core) => Some(core),
            None => {
                self.by_name.remove(name);
                None
            }
        }
    }

    fn insert_pid(&mut self, core: &Arc<MailboxCore>) {
        self.by_pid.insert(core.pid.clone(), Arc::downgrade(core));
    }

    // Registration is insert-if-absent: a live holder of the name wins.
    fn insert_name(&mut self, name: &str, core: &Arc<MailboxCore>) -> bool {
        if self.lookup_name(name).is_some() {
            return false;
        }
        self.by_name.insert(name.to_owned(), Arc::downgrade(core));
        true
    }

    fn remove(&mut self, core: &MailboxCore) {
        self.by_pid.remove(&core.pid);
        if let Some(name) = core.registered_name() {
            if let Some(entry) = self.by_name.get(&name) {
                let stale = match entry.upgrade() {
                    Some(current) => std::ptr::eq(current.as_ref(), core),
                    None => true,
                };
                if stale {
                    self.by_name.remove(&name);
                }
            }
        }
    }
}

pub(crate) struct NodeShared {
    node_name: NodeName,
    full_name: String,
    cookie: String,
    flags: DistributionFlags,
    trace: TraceLevel,
    creation: Creation,
    port: u16,
    epmd_port: u16,
    registry: Mutex<Registry>,
    connections: tokio::sync::Mutex<HashMap<String, Arc<ConnectionShared>>>,
    counters: Mutex<IdCounters>,
    status: Mutex<Option<Arc<dyn StatusHandler>>>,
    scheduler: Scheduler,
    closed: AtomicBool,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    // The open EPMD socket is the registration: dropping it unpublishes.
    epmd_socket: Mutex<Option<TcpStream>>,
}

impl NodeShared {
    pub(crate) fn name_str(&self) -> &str {
        &self.full_name
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // Pid 0.0 stands for the node itself in system messages.
    pub(crate) fn system_pid(&self) -> Pid {
        Pid {
            node: Atom::from(self.full_name.as_str()),
            id: 0,
            serial: 0,
            creation: (self.creation.get() & 0x3) as u8,
        }
    }

    fn create_pid(&self) -> Pid {
        let (id, serial) = self.counters.lock().expect("poisoned lock").next_pid();
        Pid {
            node: Atom::from(self.full_name.as_str()),
            id,
            serial,
            creation: (self.creation.get() & 0x3) as u8,
        }
    }

    fn create_port(&self) -> Port {
        let id = self.counters.lock().expect("poisoned lock").next_port();
        Port {
            node: Atom::from(self.full_name.as_str()),
            id,
            creation: (self.creation.get() & 0x3) as u8,
        }
    }

    fn create_ref(&self) -> Reference {
        let ids = self.counters.lock().expect("poisoned lock").next_ref();
        Reference {
            node: Atom::from(self.full_name.as_str()),
            creation: (self.creation.get() & 0x3) as u8,
            ids: ids.to_vec(),
        }
    }

    pub(crate) fn lookup_pid(&self, pid: &Pid) -> Option<Arc<MailboxCore>> {
        self.registry.lock().expect("poisoned lock").lookup_pid(pid)
    }

    pub(crate) fn lookup_name(&self, name: &str) -> Option<Arc<MailboxCore>> {
        self.registry
            .lock()
            .expect("poisoned lock")
            .lookup_name(name)
    }

    pub(crate) fn unregister(&self, core: &MailboxCore) {
        self.registry.lock().expect("poisoned lock").remove(core);
    }

    fn is_local(&self, pid: &Pid) -> bool {
        pid.node.name == self.full_name
    }

    pub(crate) async fn send_to_pid(self: &Arc<Self>, to: &Pid, term: Term) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::NodeClosed);
        }
        if self.trace.send() {
            tracing::trace!(to = %to, "send to pid");
        }
        if self.is_local(to) {
            if let Some(mbox) = self.lookup_pid(to) {
                mbox.deliver(Delivery::Message {
                    from: None,
                    payload: Payload::Term(term),
                });
            }
            return Ok(());
        }
        let conn = self.get_connection(&to.node.name).await?;
        conn.send_message(Message::send(
            conn.outgoing_cookie(),
            to.clone(),
            Payload::Term(term),
        ))
        .await
    }

    pub(crate) async fn reg_send_local(
        self: &Arc<Self>,
        from: &Pid,
        name: &str,
        term: Term,
    ) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::NodeClosed);
        }
        if let Some(mbox) = self.lookup_name(name) {
            mbox.deliver(Delivery::Message {
                from: Some(from.clone()),
                payload: Payload::Term(term),
            });
        }
        Ok(())
    }

    pub(crate) async fn reg_send_remote(
        self: &Arc<Self>,
        from: &Pid,
        name: &str,
        node: &str,
        term: Term,
    ) -> Result<(), SendError> {
        if node == self.full_name {
            return self.reg_send_local(from, name, term).await;
        }
        let conn = self.get_connection(node).await?;
        conn.send_message(Message::reg_send(
            from.clone(),
            conn.outgoing_cookie(),
            Atom::from(name),
            Payload::Term(term),
        ))
        .await
    }

    pub(crate) async fn link_from(
        self: &Arc<Self>,
        from: &Arc<MailboxCore>,
        to: &Pid,
    ) -> Result<(), SendError> {
        if self.is_local(to) {
            match self.lookup_pid(to) {
                Some(target) => {
                    from.add_link(to.clone());
                    target.add_link(from.pid.clone());
                }
                None => {
                    from.deliver(Delivery::Exit {
                        from: to.clone(),
                        reason: Term::Atom(Atom::from("noproc")),
                    });
                }
            }
            return Ok(());
        }
        let conn = self.get_connection(&to.node.name).await?;
        conn.send_message(Message::link(from.pid.clone(), to.clone()))
            .await?;
        conn.add_link(from.pid.clone(), to.clone());
        from.add_link(to.clone());
        Ok(())
    }

    pub(crate) async fn unlink_from(
        self: &Arc<Self>,
        from: &Arc<MailboxCore>,
        to: &Pid,
    ) -> Result<(), SendError> {
        from.remove_link(to);
        if self.is_local(to) {
            if let Some(target) = self.lookup_pid(to) {
                target.remove_link(&from.pid);
            }
            return Ok(());
        }
        if let Some(conn) = self.cached_connection(&to.node.name).await {
            conn.remove_link(&from.pid, to);
            conn.send_message(Message::unlink(from.pid.clone(), to.clone()))
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn exit2_from(
        self: &Arc<Self>,
        from: &Pid,
        to: &Pid,
        reason: Term,
    ) -> Result<(), SendError> {
        if self.is_local(to) {
            if let Some(target) = self.lookup_pid(to) {
                target.deliver(Delivery::Exit {
                    from: from.clone(),
                    reason,
                });
            }
            return Ok(());
        }
        let conn = self.get_connection(&to.node.name).await?;
        conn.send_message(Message::exit2(from.clone(), to.clone(), reason))
            .await
    }

    // Breaks one link on mailbox close: the peer side receives an EXIT
    // signal with the closing reason. Remote peers are reached only over
    // an existing connection; a vanished connection already broke the
    // link with `noconnection`.
    pub(crate) async fn break_link(
        self: &Arc<Self>,
        from: &Pid,
        to: &Pid,
        reason: Term,
    ) -> Result<(), SendError> {
        if self.is_local(to) {
            if let Some(target) = self.lookup_pid(to) {
                target.remove_link(from);
                target.deliver(Delivery::Exit {
                    from: from.clone(),
                    reason,
                });
            }
            return Ok(());
        }
        if let Some(conn) = self.cached_connection(&to.node.name).await {
            conn.remove_link(from, to);
            conn.send_message(Message::exit(from.clone(), to.clone(), reason))
                .await?;
        }
        Ok(())
    }

    async fn cached_connection(&self, peer: &str) -> Option<Arc<ConnectionShared>> {
        self.connections.lock().await.get(peer).cloned()
    }

    /// Returns the cached open connection to `peer`, or establishes a new
    /// one. Look-up-or-create is atomic under the connections lock.
    pub(crate) async fn get_connection(
        self: &Arc<Self>,
        peer: &str,
    ) -> Result<Arc<ConnectionShared>, SendError> {
        if self.is_closed() {
            return Err(SendError::NodeClosed);
        }
        let mut conns = self.connections.lock().await;
        if let Some(conn) = conns.get(peer) {
            if !conn.is_done() {
                return Ok(Arc::clone(conn));
            }
            conns.remove(peer);
        }
        match self.connect_to(peer).await {
            Ok(stream) => {
                let conn = self.install_connection(stream, peer.to_owned());
                conns.insert(peer.to_owned(), Arc::clone(&conn));
                drop(conns);
                self.notify_remote_status(peer, true, None);
                Ok(conn)
            }
            Err(e) => {
                self.notify_conn_attempt(peer, false, Some(&e.to_string()));
                Err(SendError::Connect(e))
            }
        }
    }

    // EPMD lookup plus TCP connect plus initiating handshake.
    async fn connect_to(self: &Arc<Self>, peer: &str) -> Result<TcpStream, ConnectError> {
        let peer_name: NodeName = peer.parse()?;
        if self.trace.epmd() {
            tracing::debug!(peer = %peer, "looking up peer via EPMD");
        }
        let epmd_addr = format!("{}:{}", peer_name.host(), self.epmd_port);
        let stream = TcpStream::connect(epmd_addr.as_str()).await?;
        let port = match EpmdClient::new(stream).get_node_info(peer_name.name()).await {
            Ok(Some(info)) => info.port,
            Ok(None) => {
                return Err(ConnectError::UnknownNode {
                    node: peer.to_owned(),
                })
            }
            Err(e) if e.suggests_legacy_peer() => {
                let stream = TcpStream::connect(epmd_addr.as_str()).await?;
                EpmdClient::new(stream)
                    .get_port_legacy(peer_name.name())
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        let peer_addr = format!("{}:{}", peer_name.host(), port);
        let stream = TcpStream::connect(peer_addr.as_str()).await?;
        let mut handshake = Handshake::new(&self.full_name, &self.cookie);
        handshake.flags(self.flags).trace(self.trace);
        let (stream, _peer) = handshake.connect(stream).await?;
        Ok(stream)
    }

    fn install_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_name: String,
    ) -> Arc<ConnectionShared> {
        let (reader, writer) = stream.into_split();
        let conn = Arc::new(ConnectionShared::new(
            peer_name,
            self.cookie.clone(),
            writer,
            self.trace,
        ));
        tokio::spawn(connection::receive_loop(
            Arc::clone(self),
            Arc::clone(&conn),
            reader,
        ));
        conn
    }

    /// Terminal connection cleanup: drop the cache entry, break every
    /// link with `noconnection`, and tell the status observer.
    pub(crate) async fn connection_terminated(
        self: &Arc<Self>,
        conn: &Arc<ConnectionShared>,
        info: Option<String>,
    ) {
        if !conn.begin_cleanup() {
            return;
        }
        {
            let mut conns = self.connections.lock().await;
            if let Some(current) = conns.get(&conn.peer_name) {
                if Arc::ptr_eq(current, conn) {
                    conns.remove(&conn.peer_name);
                }
            }
        }
        let noconnection = Term::Atom(Atom::from("noconnection"));
        for link in conn.clear_links() {
            if let Some(mbox) = self.lookup_pid(&link.local) {
                mbox.remove_link(&link.remote);
                mbox.deliver(Delivery::Exit {
                    from: link.remote,
                    reason: noconnection.clone(),
                });
            }
        }
        self.notify_remote_status(&conn.peer_name, false, info.as_deref());
    }

    fn status_handler(&self) -> Option<Arc<dyn StatusHandler>> {
        self.status.lock().expect("poisoned lock").clone()
    }

    fn call_status<F>(&self, f: F)
    where
        F: FnOnce(&dyn StatusHandler),
    {
        if let Some(handler) = self.status_handler() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| f(handler.as_ref())));
            if result.is_err() {
                tracing::warn!("status handler panicked; ignoring");
            }
        }
    }

    pub(crate) fn notify_remote_status(&self, node: &str, up: bool, info: Option<&str>) {
        self.call_status(|h| h.remote_status(node, up, info));
    }

    fn notify_local_status(&self, node: &str, up: bool, info: Option<&str>) {
        self.call_status(|h| h.local_status(node, up, info));
    }

    pub(crate) fn notify_conn_attempt(&self, node: &str, incoming: bool, info: Option<&str>) {
        self.call_status(|h| h.conn_attempt(node, incoming, info));
    }
}

impl std::fmt::Debug for NodeShared {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NodeShared")
            .field("name", &self.full_name)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

async fn acceptor_loop(node: Arc<NodeShared>, listener: TcpListener) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                if node.is_closed() {
                    break;
                }
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let mut handshake = Handshake::new(&node.full_name, &node.cookie);
            handshake.flags(node.flags).trace(node.trace);
            match handshake.accept(stream).await {
                Ok((stream, peer)) => {
                    let conn = node.install_connection(stream, peer.name.clone());
                    let stale = {
                        let mut conns = node.connections.lock().await;
                        conns.insert(peer.name.clone(), Arc::clone(&conn))
                    };
                    if let Some(stale) = stale {
                        stale.close().await;
                    }
                    node.notify_remote_status(&peer.name, true, None);
                }
                Err(e) => {
                    node.notify_conn_attempt(&addr.to_string(), true, Some(&e.to_string()));
                }
            }
        });
    }
}

// Services inbound `net_kernel` requests so remote pings get answered:
// `{'$gen_call', {From, Ref}, {is_auth, Node}}` is acknowledged with
// `{Ref, yes}`.
struct NetKernel;

impl Actor for NetKernel {
    async fn handle(&mut self, ctx: &ActorContext, msg: Msg) -> Flow {
        let Ok(term) = msg.into_term() else {
            return Flow::Continue;
        };
        if let Some((from, reply)) = Self::reply_for(term) {
            let _ = ctx.send(&from, reply).await;
        }
        Flow::Continue
    }
}

impl NetKernel {
    fn reply_for(term: Term) -> Option<(Pid, Term)> {
        let Term::Tuple(mut envelope) = term else {
            return None;
        };
        if envelope.elements.len() != 3 {
            return None;
        }
        match &envelope.elements[0] {
            Term::Atom(tag) if tag.name == "$gen_call" => {}
            _ => return None,
        }
        match &envelope.elements[2] {
            Term::Tuple(req)
                if matches!(req.elements.first(), Some(Term::Atom(a)) if a.name == "is_auth") => {}
            _ => return None,
        }
        let Term::Tuple(mut from_tuple) =
            std::mem::replace(&mut envelope.elements[1], Term::from(0))
        else {
            return None;
        };
        if from_tuple.elements.len() != 2 {
            return None;
        }
        let reference = from_tuple.elements.remove(1);
        let Term::Pid(from) = from_tuple.elements.remove(0) else {
            return None;
        };
        let reply = Term::Tuple(Tuple::from(vec![
            reference,
            Term::Atom(Atom::from("yes")),
        ]));
        Some((from, reply))
    }
}

/// A distribution node.
///
/// Owns the listening socket, the EPMD registration, the mailbox
/// registries and the outbound connection cache. Cloning the handle is
/// cheap; [`Node::close`] shuts everything down.
#[derive(Debug, Clone)]
pub struct Node {
    shared: Arc<NodeShared>,
}

impl Node {
    /// Starts a node: binds a listener, registers with EPMD (keeping the
    /// registration socket open), starts the acceptor and the resident
    /// `net_kernel` service.
    pub async fn new(name: &str, config: NodeConfig) -> Result<Self, NodeError> {
        let node_name: NodeName = name.parse()?;
        let cookie = config
            .cookie
            .unwrap_or_else(crate::cookie::default_cookie);
        let epmd_port = config.epmd_port.unwrap_or_else(crate::epmd::epmd_port);
        let flags = config.flags.unwrap_or_default();

        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();

        if config.trace.epmd() {
            tracing::debug!(node = %name, port, "publishing node via EPMD");
        }
        let stream = TcpStream::connect(("127.0.0.1", epmd_port)).await?;
        let info = NodeInfo::new(node_name.name(), port);
        let (epmd_socket, creation) = match EpmdClient::new(stream).register(info).await {
            Ok(registered) => registered,
            Err(e) if e.suggests_legacy_peer() => {
                let stream = TcpStream::connect(("127.0.0.1", epmd_port)).await?;
                EpmdClient::new(stream)
                    .register_legacy(node_name.name(), port)
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        let shared = Arc::new(NodeShared {
            full_name: node_name.to_string(),
            node_name,
            cookie,
            flags,
            trace: config.trace,
            creation,
            port,
            epmd_port,
            registry: Mutex::new(Registry::default()),
            connections: tokio::sync::Mutex::new(HashMap::new()),
            counters: Mutex::new(IdCounters::new()),
            status: Mutex::new(None),
            scheduler: Scheduler::new(),
            closed: AtomicBool::new(false),
            acceptor: Mutex::new(None),
            epmd_socket: Mutex::new(Some(epmd_socket)),
        });

        let acceptor = tokio::spawn(acceptor_loop(Arc::clone(&shared), listener));
        *shared.acceptor.lock().expect("poisoned lock") = Some(acceptor);

        let node = Self { shared };
        node.spawn_actor(Some("net_kernel"), NetKernel)?;
        node.shared.notify_local_status(name, true, None);
        Ok(node)
    }

    /// The full node name (`alive@host`).
    pub fn name(&self) -> &str {
        &self.shared.full_name
    }

    /// The host part of the node name.
    pub fn host(&self) -> &str {
        self.shared.node_name.host()
    }

    /// The incarnation assigned by EPMD.
    pub fn creation(&self) -> Creation {
        self.shared.creation
    }

    /// The distribution listening port.
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Installs the status observer, replacing any previous one.
    pub fn set_status_handler<H: StatusHandler>(&self, handler: H) {
        *self.shared.status.lock().expect("poisoned lock") = Some(Arc::new(handler));
    }

    /// Creates an anonymous mailbox whose consumer drives `recv`.
    pub fn create_mbox(&self) -> Result<Mailbox, NodeError> {
        self.create_mbox_inner(None)
    }

    /// Creates a mailbox registered under `name`.
    pub fn create_named_mbox(&self, name: &str) -> Result<Mailbox, NodeError> {
        self.create_mbox_inner(Some(name))
    }

    fn create_mbox_inner(&self, name: Option<&str>) -> Result<Mailbox, NodeError> {
        if self.shared.is_closed() {
            return Err(NodeError::Closed);
        }
        let pid = self.shared.create_pid();
        let (core, rx) = MailboxCore::channel(pid, name.map(str::to_owned));
        {
            let mut registry = self.shared.registry.lock().expect("poisoned lock");
            if let Some(name) = name {
                if !registry.insert_name(name, &core) {
                    return Err(NodeError::NameTaken {
                        name: name.to_owned(),
                    });
                }
            }
            registry.insert_pid(&core);
        }
        Ok(Mailbox::new(core, rx, Arc::downgrade(&self.shared)))
    }

    /// Spawns an actor mailbox: the scheduler owns the receiving side and
    /// feeds the actor one message at a time.
    pub fn spawn_actor<A: Actor>(&self, name: Option<&str>, actor: A) -> Result<Pid, NodeError> {
        if self.shared.is_closed() {
            return Err(NodeError::Closed);
        }
        let pid = self.shared.create_pid();
        let (core, rx) = MailboxCore::channel(pid.clone(), name.map(str::to_owned));
        {
            let mut registry = self.shared.registry.lock().expect("poisoned lock");
            if let Some(name) = name {
                if !registry.insert_name(name, &core) {
                    return Err(NodeError::NameTaken {
                        name: name.to_owned(),
                    });
                }
            }
            registry.insert_pid(&core);
        }
        self.shared.scheduler.spawn(&self.shared, core, rx, actor);
        Ok(pid)
    }

    /// Marks an actor task inactive; it retires at its next scheduling
    /// point (an in-flight handler invocation completes first).
    pub fn cancel_actor(&self, pid: &Pid) {
        self.shared.scheduler.cancel(pid);
    }

    /// Registers `mbox` under `name`.
    ///
    /// Registration is at-most-once: when another live mailbox already
    /// holds the name this is a no-op returning `false`.
    pub fn register(&self, name: &str, mbox: &Mailbox) -> bool {
        let core = mbox.core();
        let mut registry = self.shared.registry.lock().expect("poisoned lock");
        if !registry.insert_name(name, core) {
            return false;
        }
        core.set_registered_name(Some(name.to_owned()));
        true
    }

    /// Looks up the pid registered under `name`.
    pub fn whereis(&self, name: &str) -> Option<Pid> {
        self.shared.lookup_name(name).map(|core| core.pid.clone())
    }

    /// Names of the peers this node currently holds connections to.
    pub async fn nodes(&self) -> Vec<String> {
        self.shared
            .connections
            .lock()
            .await
            .iter()
            .filter(|(_, conn)| !conn.is_done())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Makes a fresh reference.
    pub fn make_ref(&self) -> Reference {
        self.shared.create_ref()
    }

    /// Makes a fresh port identifier.
    pub fn make_port(&self) -> Port {
        self.shared.create_port()
    }

    /// Checks whether `peer` is alive, waiting at most `timeout`.
    ///
    /// Sends the `net_kernel` `is_auth` envelope and waits for the
    /// `{Ref, yes}` acknowledgement; any failure, including an
    /// unreachable peer or an expired deadline, yields `false`.
    pub async fn ping(&self, peer: &str, timeout: Duration) -> bool {
        if peer == self.name() {
            return true;
        }
        let Ok(mut mbox) = self.create_mbox() else {
            return false;
        };
        let reference = self.make_ref();
        let envelope = Term::Tuple(Tuple::from(vec![
            Term::Atom(Atom::from("$gen_call")),
            Term::Tuple(Tuple::from(vec![
                Term::Pid(mbox.pid().clone()),
                Term::Reference(reference.clone()),
            ])),
            Term::Tuple(Tuple::from(vec![
                Term::Atom(Atom::from("is_auth")),
                Term::Atom(Atom::from(self.name())),
            ])),
        ]));
        if mbox
            .send_to_remote_name("net_kernel", peer, envelope)
            .await
            .is_err()
        {
            return false;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match mbox.recv_timeout(remaining).await {
                Ok(msg) => {
                    if Self::is_pong(msg, &reference) {
                        return true;
                    }
                }
                Err(RecvError::Timeout) => return false,
                Err(_) => return false,
            }
        }
    }

    fn is_pong(msg: Msg, reference: &Reference) -> bool {
        let Ok(Term::Tuple(tuple)) = msg.into_term() else {
            return false;
        };
        if tuple.elements.len() != 2 {
            return false;
        }
        let ref_matches = tuple.elements[0] == Term::Reference(reference.clone());
        let yes = matches!(&tuple.elements[1], Term::Atom(a) if a.name == "yes");
        ref_matches && yes
    }

    /// Shuts the node down: stops accepting, drops the EPMD registration
    /// (unpublishing the node), closes every connection and retires every
    /// actor. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(acceptor) = self.shared.acceptor.lock().expect("poisoned lock").take() {
            acceptor.abort();
        }
        // Closing the EPMD socket is the unpublish.
        self.shared.epmd_socket.lock().expect("poisoned lock").take();

        let conns: Vec<Arc<ConnectionShared>> = self
            .shared
            .connections
            .lock()
            .await
            .values()
            .cloned()
            .collect();
        for conn in conns {
            conn.close().await;
        }
        self.shared.scheduler.shutdown();
        self.shared
            .notify_local_status(&self.shared.full_name, false, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_ids_wrap_at_their_bit_widths() {
        let mut counters = IdCounters::new();
        let (first_id, first_serial) = counters.next_pid();
        assert_eq!((first_id, first_serial), (1, 0));

        counters.pid_id = 0x7fff;
        let (id, serial) = counters.next_pid();
        assert_eq!((id, serial), (0x7fff, 0));
        // id wrapped, serial bumped.
        let (id, serial) = counters.next_pid();
        assert_eq!((id, serial), (0, 1));

        counters.pid_id = 0x7fff;
        counters.pid_serial = 0x1fff;
        counters.next_pid();
        let (id, serial) = counters.next_pid();
        // Both overflowed: back to the start.
        assert_eq!((id, serial), (0, 0));
    }

    #[test]
    fn ref_first_word_is_18_bits() {
        let mut counters = IdCounters::new();
        counters.ref_ids = [0x0003_ffff, 0, 0];
        assert_eq!(counters.next_ref(), [0x0003_ffff, 0, 0]);
        assert_eq!(counters.next_ref(), [0, 1, 0]);
    }

    #[test]
    fn port_ids_wrap_at_28_bits() {
        let mut counters = IdCounters::new();
        counters.port_id = 0x0fff_ffff;
        assert_eq!(counters.next_port(), 0x0fff_ffff);
        assert_eq!(counters.next_port(), 0);
    }

    #[test]
    fn registry_registration_is_at_most_once() {
        let mut registry = Registry::default();
        let (core_a, _rx_a) = MailboxCore::channel(test_pid(1), None);
        let (core_b, _rx_b) = MailboxCore::channel(test_pid(2), None);

        assert!(registry.insert_name("echo", &core_a));
        assert!(!registry.insert_name("echo", &core_b));
        assert_eq!(registry.lookup_name("echo").map(|c| c.pid.clone()), Some(test_pid(1)));
    }

    #[test]
    fn registry_sweeps_dead_entries_on_lookup() {
        let mut registry = Registry::default();
        let (core, _rx) = MailboxCore::channel(test_pid(1), None);
        registry.insert_pid(&core);
        assert!(registry.insert_name("gone", &core));
        drop(core);
        drop(_rx);

        // All strong references are gone: the sweep clears both maps and
        // the name becomes available again.
        assert!(registry.lookup_pid(&test_pid(1)).is_none());
        assert!(registry.lookup_name("gone").is_none());
        let (fresh, _rx) = MailboxCore::channel(test_pid(3), None);
        assert!(registry.insert_name("gone", &fresh));
    }

    #[test]
    fn net_kernel_recognizes_is_auth_envelope() {
        let reference = Reference {
            node: Atom::from("a@h"),
            creation: 0,
            ids: vec![1, 2, 3],
        };
        let envelope = Term::Tuple(Tuple::from(vec![
            Term::Atom(Atom::from("$gen_call")),
            Term::Tuple(Tuple::from(vec![
                Term::Pid(test_pid(7)),
                Term::Reference(reference.clone()),
            ])),
            Term::Tuple(Tuple::from(vec![
                Term::Atom(Atom::from("is_auth")),
                Term::Atom(Atom::from("b@h")),
            ])),
        ]));
        let (from, reply) = NetKernel::reply_for(envelope).expect("should match");
        assert_eq!(from, test_pid(7));
        assert_eq!(
            reply,
            Term::Tuple(Tuple::from(vec![
                Term::Reference(reference),
                Term::Atom(Atom::from("yes")),
            ]))
        );

        assert!(NetKernel::reply_for(Term::from(1)).is_none());
        assert!(NetKernel::reply_for(Term::Tuple(Tuple::nil())).is_none());
    }

    fn test_pid(id: u32) -> Pid {
        Pid {
            node: Atom::from("n@h"),
            id,
            serial: 0,
            creation: 0,
        }
    }
}
