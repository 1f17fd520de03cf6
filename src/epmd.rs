//! EPMD protocol client.
//!
//! "EPMD" stands for "Erlang Port Mapper Daemon" and
//! it provides name resolution functionalities for distributed erlang nodes.
//!
//! See [EPMD Protocol](https://www.erlang.org/doc/apps/erts/erl_dist_protocol.html#epmd-protocol)
//! for more details about the protocol.
use crate::socket::Socket;
use crate::Creation;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};

/// The default listening port of the EPMD.
pub const DEFAULT_EPMD_PORT: u16 = 4369;

const TAG_ALIVE_REQ: u8 = 97; // r3
const TAG_ALIVE_OK_RESP: u8 = 89; // r3, 'Y'
const TAG_PORT_PLEASE_REQ: u8 = 112; // r3
const TAG_NAMES_REQ: u8 = 110;
const TAG_STOP_REQ: u8 = 115;
const TAG_PORT2_RESP: u8 = 119;
const TAG_ALIVE2_REQ: u8 = 120;
const TAG_ALIVE2_RESP: u8 = 121;
const TAG_PORT_PLEASE2_REQ: u8 = 122;

/// The EPMD port to use, honoring the `ERL_EPMD_PORT` environment variable.
pub fn epmd_port() -> u16 {
    std::env::var("ERL_EPMD_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_EPMD_PORT)
}

/// One `name NAME at port PORT` line of a names listing.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// Alive name of the node.
    pub name: String,

    /// Distribution listening port of the node.
    pub port: u16,
}

impl FromStr for NodeEntry {
    type Err = EpmdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with("name ") {
            return Err(EpmdError::MalformedNodeNameLine);
        }

        let s = &s["name ".len()..];
        let pos = s
            .find(" at port ")
            .ok_or(EpmdError::MalformedNodeNameLine)?;
        let name = s[..pos].to_string();
        let port = s[pos + " at port ".len()..]
            .parse()
            .map_err(|_| EpmdError::MalformedNodeNameLine)?;
        Ok(Self { name, port })
    }
}

/// Type of a distributed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NodeType {
    /// Hidden node (C-node).
    Hidden = 72,

    /// Normal Erlang node.
    Normal = 77,
}

impl TryFrom<u8> for NodeType {
    type Error = EpmdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            72 => Ok(Self::Hidden),
            77 => Ok(Self::Normal),
            _ => Err(EpmdError::UnknownNodeType { value }),
        }
    }
}

/// Protocol for communicating with a distributed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP/IPv4.
    TcpIpV4 = 0,
}

impl TryFrom<u8> for Protocol {
    type Error = EpmdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::TcpIpV4),
            _ => Err(EpmdError::UnknownProtocol { value }),
        }
    }
}

/// Node information published to, or fetched from, EPMD.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// The alive name (the part before `@`).
    pub name: String,

    /// The port number on which the node accepts connection requests.
    pub port: u16,

    /// The node type.
    pub node_type: NodeType,

    /// The protocol for communicating with the node.
    pub protocol: Protocol,

    /// The highest distribution version that this node can handle.
    pub highest_version: u16,

    /// The lowest distribution version that this node can handle.
    pub lowest_version: u16,

    /// Extra field.
    pub extra: Vec<u8>,
}

impl NodeInfo {
    /// Makes a [`NodeInfo`] for a hidden node speaking distribution
    /// version 5 on `port`.
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_owned(),
            port,
            node_type: NodeType::Hidden,
            protocol: Protocol::TcpIpV4,
            highest_version: 5,
            lowest_version: 5,
            extra: Vec::new(),
        }
    }

    fn bytes_len(&self) -> usize {
        2 + self.name.len() + // name
        2 + // port
        1 + // node_type
        1 + // protocol
        2 + // highest_version
        2 + // lowest_version
        2 + self.extra.len() // extra
    }
}

/// Errors raised by [`EpmdClient`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum EpmdError {
    #[error("malformed line in an EPMD names response")]
    MalformedNodeNameLine,

    #[error("unexpected EPMD response tag")]
    UnexpectedTag,

    #[error("EPMD port lookup failed with code {code}")]
    GetNodeInfoError { code: u8 },

    #[error("unknown node type {value}")]
    UnknownNodeType { value: u8 },

    #[error("unknown protocol {value}")]
    UnknownProtocol { value: u8 },

    #[error("unknown EPMD response tag {tag}")]
    UnknownResponseTag { tag: u8 },

    #[error("EPMD registration failed with code {code}")]
    RegisterNodeError { code: u8 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EpmdError {
    /// `true` when the failure suggests talking to a pre-r4 EPMD, in
    /// which case the caller should reconnect and retry with the legacy
    /// requests.
    pub fn suggests_legacy_peer(&self) -> bool {
        match self {
            Self::UnknownResponseTag { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// EPMD client over an established connection.
#[derive(Debug)]
pub struct EpmdClient<T> {
    socket: Socket<T>,
}

impl<T> EpmdClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connection to an EPMD instance.
    pub fn new(socket: T) -> Self {
        Self {
            socket: Socket::new(socket),
        }
    }

    /// Registers a node in EPMD (r4 `ALIVE2` request).
    ///
    /// The returned socket must be kept as long as the node is a
    /// distributed node: EPMD holds the registration only while the
    /// connection lives, and closing it unregisters the node.
    pub async fn register(mut self, node: NodeInfo) -> Result<(T, Creation), EpmdError> {
        self.socket.write_u16(1 + node.bytes_len() as u16).await?;
        self.socket.write_u8(TAG_ALIVE2_REQ).await?;
        self.socket.write_u16(node.port).await?;
        self.socket.write_u8(node.node_type as u8).await?;
        self.socket.write_u8(node.protocol as u8).await?;
        self.socket.write_u16(node.highest_version).await?;
        self.socket.write_u16(node.lowest_version).await?;
        self.socket.write_u16(node.name.len() as u16).await?;
        self.socket.write_all(node.name.as_bytes()).await?;
        self.socket.write_u16(node.extra.len() as u16).await?;
        self.socket.write_all(&node.extra).await?;
        self.socket.flush().await?;

        match self.socket.read_u8().await? {
            TAG_ALIVE2_RESP => {
                match self.socket.read_u8().await? {
                    0 => {}
                    code => return Err(EpmdError::RegisterNodeError { code }),
                }

                let creation = Creation::new(u32::from(self.socket.read_u16().await?));
                Ok((self.socket.into_inner(), creation))
            }
            tag => Err(EpmdError::UnknownResponseTag { tag }),
        }
    }

    /// Registers a node with a pre-r4 EPMD (`ALIVE` request).
    ///
    /// Used as a fallback when [`register`](Self::register) fails in a way
    /// that [`EpmdError::suggests_legacy_peer`] reports.
    pub async fn register_legacy(
        mut self,
        name: &str,
        port: u16,
    ) -> Result<(T, Creation), EpmdError> {
        self.socket.write_u16(3 + name.len() as u16).await?;
        self.socket.write_u8(TAG_ALIVE_REQ).await?;
        self.socket.write_u16(port).await?;
        self.socket.write_all(name.as_bytes()).await?;
        self.socket.flush().await?;

        match self.socket.read_u8().await? {
            TAG_ALIVE_OK_RESP => {
                let creation = Creation::new(u32::from(self.socket.read_u16().await?));
                Ok((self.socket.into_inner(), creation))
            }
            tag => Err(EpmdError::UnknownResponseTag { tag }),
        }
    }

    /// Gets the distribution port (and other information) of the
    /// `node_name` node from EPMD (r4 `PORT_PLEASE2` request).
    ///
    /// If the node has not been registered in the connected EPMD, this method will return `None`.
    pub async fn get_node_info(mut self, node_name: &str) -> Result<Option<NodeInfo>, EpmdError> {
        self.socket.write_u16((1 + node_name.len()) as u16).await?;
        self.socket.write_u8(TAG_PORT_PLEASE2_REQ).await?;
        self.socket.write_all(node_name.as_bytes()).await?;
        self.socket.flush().await?;

        match self.socket.read_u8().await? {
            TAG_PORT2_RESP => {}
            tag => return Err(EpmdError::UnknownResponseTag { tag }),
        }

        match self.socket.read_u8().await? {
            0 => {}
            1 => {
                return Ok(None);
            }
            code => {
                return Err(EpmdError::GetNodeInfoError { code });
            }
        }

        Ok(Some(NodeInfo {
            port: self.socket.read_u16().await?,
            node_type: NodeType::try_from(self.socket.read_u8().await?)?,
            protocol: Protocol::try_from(self.socket.read_u8().await?)?,
            highest_version: self.socket.read_u16().await?,
            lowest_version: self.socket.read_u16().await?,
            name: self.socket.read_u16_string().await?,
            extra: self.socket.read_u16_bytes().await?,
        }))
    }

    /// Gets the distribution port of `node_name` from a pre-r4 EPMD
    /// (`PORT_PLEASE` request). The legacy response carries the port only.
    pub async fn get_port_legacy(mut self, node_name: &str) -> Result<u16, EpmdError> {
        self.socket.write_u16((1 + node_name.len()) as u16).await?;
        self.socket.write_u8(TAG_PORT_PLEASE_REQ).await?;
        self.socket.write_all(node_name.as_bytes()).await?;
        self.socket.flush().await?;

        let port = self.socket.read_u16().await?;
        Ok(port)
    }

    /// Gets all registered names from EPMD.
    pub async fn get_names(mut self) -> Result<Vec<NodeEntry>, EpmdError> {
        self.socket.write_u16(1).await?;
        self.socket.write_u8(TAG_NAMES_REQ).await?;
        self.socket.flush().await?;

        let _epmd_port = self.socket.read_u32().await?;
        let node_info_text = self.socket.read_string().await?;

        node_info_text
            .split('\n')
            .filter(|s| !s.is_empty())
            .map(NodeEntry::from_str)
            .collect()
    }

    /// Asks EPMD to forget the registration of `node_name`.
    ///
    /// EPMD answers with a short status text (`STOPPED` or `NOEXIST`).
    pub async fn stop(mut self, node_name: &str) -> Result<String, EpmdError> {
        self.socket.write_u16((1 + node_name.len()) as u16).await?;
        self.socket.write_u8(TAG_STOP_REQ).await?;
        self.socket.write_all(node_name.as_bytes()).await?;
        self.socket.flush().await?;

        let result = self.socket.read_string().await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_entry_parses_names_line() {
        let entry: NodeEntry = "name foo at port 4711".parse().unwrap();
        assert_eq!(entry.name, "foo");
        assert_eq!(entry.port, 4711);

        assert!("foo at port 4711".parse::<NodeEntry>().is_err());
        assert!("name foo at port x".parse::<NodeEntry>().is_err());
    }

    #[test]
    fn legacy_fallback_detection() {
        assert!(EpmdError::UnknownResponseTag { tag: 3 }.suggests_legacy_peer());
        assert!(EpmdError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof"
        ))
        .suggests_legacy_peer());
        assert!(!EpmdError::RegisterNodeError { code: 1 }.suggests_legacy_peer());
    }

    #[test]
    fn default_port_env_override() {
        assert_eq!(DEFAULT_EPMD_PORT, 4369);
    }
}
