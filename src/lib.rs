//! Rust implementation of an Erlang distribution node.
//!
//! This crate lets a Rust process participate in an Erlang cluster as a
//! first-class node: it registers with the local EPMD, authenticates
//! peer connections with the MD5 cookie handshake, speaks the external
//! term format, and multiplexes traffic across in-process mailboxes
//! addressed by pid or registered name.
//!
//! Reference: [Distribution Protocol](https://www.erlang.org/doc/apps/erts/erl_dist_protocol.html)
//!
//! # Example
//!
//! ```no_run
//! use erl_node::node::{Node, NodeConfig};
//! use erl_node::term::Term;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::new("demo@localhost", NodeConfig::default()).await?;
//! let mbox = node.create_mbox()?;
//! mbox.send_to_remote_name("shell", "erl@localhost", Term::from(42)).await?;
//! # Ok(())
//! # }
//! ```
pub mod codec;
pub mod cookie;
pub mod epmd;
pub mod flags;
pub mod handshake;
pub mod link;
pub mod mailbox;
pub mod message;
pub mod node;
pub mod scheduler;
pub mod term;

mod connection;
mod socket;

pub use crate::flags::DistributionFlags;

/// Incarnation identifier of a node.
///
/// [`Creation`] is assigned by EPMD when the node registers and is baked
/// into the pids, ports and references the node creates. If the node
/// restarts, the value of [`Creation`] will be changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Creation(u32);

impl Creation {
    /// Makes a new [`Creation`] instance.
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Gets the value.
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Errors that can occur while parsing node names.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum NodeNameError {
    #[error("node name length must be less than 256, but got {size} characters")]
    TooLongName { size: usize },

    #[error("the name part of a node name is empty")]
    EmptyName,

    #[error("the host part of a node name is empty")]
    EmptyHost,

    #[error("node name must contain an '@' character")]
    MissingAtmark,
}

/// Full node name with the format "{NAME}@{HOST}".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeName {
    name: String,
    host: String,
}

impl NodeName {
    /// Makes a new [`NodeName`] instance.
    pub fn new(name: &str, host: &str) -> Result<Self, NodeNameError> {
        let size = name.len() + 1 + host.len();
        if size > 255 {
            Err(NodeNameError::TooLongName { size })
        } else if name.is_empty() {
            Err(NodeNameError::EmptyName)
        } else if host.is_empty() {
            Err(NodeNameError::EmptyHost)
        } else {
            Ok(Self {
                name: name.to_owned(),
                host: host.to_owned(),
            })
        }
    }

    /// Returns the name (alive) part.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the name length.
    ///
    /// Note that the result will never be less than `3`.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.name.len() + 1 + self.host.len()
    }
}

impl std::str::FromStr for NodeName {
    type Err = NodeNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.splitn(2, '@');
        if let (Some(name), Some(host)) = (tokens.next(), tokens.next()) {
            Self::new(name, host)
        } else {
            Err(NodeNameError::MissingAtmark)
        }
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}

/// Verbosity selector for protocol tracing.
///
/// Each node carries its own level; there is no process-global state.
/// Increasing levels are cumulative:
///
/// - `0` — silent
/// - `1` — ordinary send and receive events
/// - `2` — control messages (link, exit, ...)
/// - `3` — handshake progress
/// - `4` — EPMD requests
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceLevel(u8);

impl TraceLevel {
    /// Makes a new [`TraceLevel`], clamped to the valid `0..=4` range.
    pub fn new(level: u8) -> Self {
        Self(level.min(4))
    }

    /// Gets the raw level.
    pub fn get(self) -> u8 {
        self.0
    }

    /// `true` when ordinary message traffic should be logged.
    pub fn send(self) -> bool {
        self.0 >= 1
    }

    /// `true` when control messages should be logged.
    pub fn ctrl(self) -> bool {
        self.0 >= 2
    }

    /// `true` when handshake progress should be logged.
    pub fn handshake(self) -> bool {
        self.0 >= 3
    }

    /// `true` when EPMD traffic should be logged.
    pub fn epmd(self) -> bool {
        self.0 >= 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_name_parses() {
        let name: NodeName = "foo@bar.example".parse().unwrap();
        assert_eq!(name.name(), "foo");
        assert_eq!(name.host(), "bar.example");
        assert_eq!(name.to_string(), "foo@bar.example");
        assert_eq!(name.len(), 15);
    }

    #[test]
    fn node_name_rejects_malformed_input() {
        assert!(matches!(
            "foo".parse::<NodeName>(),
            Err(NodeNameError::MissingAtmark)
        ));
        assert!(matches!(
            "@host".parse::<NodeName>(),
            Err(NodeNameError::EmptyName)
        ));
        assert!(matches!(
            "foo@".parse::<NodeName>(),
            Err(NodeNameError::EmptyHost)
        ));
        let long = format!("{}@host", "x".repeat(255));
        assert!(matches!(
            long.parse::<NodeName>(),
            Err(NodeNameError::TooLongName { .. })
        ));
    }

    #[test]
    fn trace_level_thresholds() {
        let silent = TraceLevel::default();
        assert!(!silent.send());

        let full = TraceLevel::new(9);
        assert_eq!(full.get(), 4);
        assert!(full.send() && full.ctrl() && full.handshake() && full.epmd());

        let ctrl = TraceLevel::new(2);
        assert!(ctrl.send() && ctrl.ctrl());
        assert!(!ctrl.handshake());
    }
}
