//! Distribution handshake (version 5).
//!
//! Both sides exchange u16-length-prefixed frames: name, status,
//! challenge, challenge-reply and challenge-ack. Authentication is the
//! MD5 digest of the shared cookie concatenated with the peer's challenge
//! rendered as an unsigned decimal string.
use crate::flags::DistributionFlags;
use crate::socket::Socket;
use crate::TraceLevel;
use tokio::io::{AsyncRead, AsyncWrite};

pub const TAG_NAME: u8 = b'n';
pub const TAG_STATUS: u8 = b's';
pub const TAG_CHALLENGE: u8 = b'n';
pub const TAG_REPLY: u8 = b'r';
pub const TAG_ACK: u8 = b'a';

/// The distribution protocol version this node speaks.
pub const DISTRIBUTION_VERSION: u16 = 5;

/// Errors raised during the handshake.
///
/// Digest and status failures are authentication errors; everything else
/// is a transport or protocol-shape problem.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum HandshakeError {
    #[error("peer answered the handshake with status {status:?}")]
    RefusedStatus { status: String },

    #[error("peer digest does not match the shared cookie")]
    DigestMismatch,

    #[error("peer speaks distribution version {version}, this node requires {DISTRIBUTION_VERSION}")]
    UnsupportedVersion { version: u16 },

    #[error("peer lacks mandatory capability flags (got {flags:?})")]
    MissingCapabilities { flags: DistributionFlags },

    #[error("unexpected handshake frame tag {tag}")]
    UnexpectedTag { tag: u8 },

    #[error("handshake frame is too short")]
    TooShortFrame,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// `true` for failures caused by authentication rather than transport.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::DigestMismatch | Self::RefusedStatus { .. })
    }
}

/// What the handshake learned about the peer.
#[derive(Debug, Clone)]
pub struct HandshakePeer {
    /// Full node name (`alive@host`).
    pub name: String,

    /// Capability flags the peer announced.
    pub flags: DistributionFlags,

    /// Negotiated distribution version.
    pub version: u16,
}

/// Handshake driver for one side of a fresh TCP connection.
#[derive(Debug, Clone)]
pub struct Handshake {
    local_node: String,
    cookie: String,
    flags: DistributionFlags,
    trace: TraceLevel,
}

impl Handshake {
    /// Makes a new [`Handshake`] for the node `local_node` (full
    /// `alive@host` name) authenticating with `cookie`.
    pub fn new(local_node: &str, cookie: &str) -> Self {
        Self {
            local_node: local_node.to_owned(),
            cookie: cookie.to_owned(),
            flags: DistributionFlags::default(),
            trace: TraceLevel::default(),
        }
    }

    /// Overrides the announced capability flags.
    pub fn flags(&mut self, flags: DistributionFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Sets the trace level used for handshake logging.
    pub fn trace(&mut self, trace: TraceLevel) -> &mut Self {
        self.trace = trace;
        self
    }

    /// Runs the initiating side of the handshake on `stream`.
    pub async fn connect<T>(&self, stream: T) -> Result<(T, HandshakePeer), HandshakeError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut socket = Socket::new(stream);

        // send_name
        if self.trace.handshake() {
            tracing::debug!(node = %self.local_node, "handshake: send_name");
        }
        let mut name_frame = FrameWriter::new();
        name_frame.put_u8(TAG_NAME);
        name_frame.put_u16(DISTRIBUTION_VERSION);
        name_frame.put_u32(self.flags.bits());
        name_frame.put_bytes(self.local_node.as_bytes());
        name_frame.finish(&mut socket).await?;

        // recv_status
        let mut frame = FrameReader::read_from(&mut socket).await?;
        frame.expect_tag(TAG_STATUS)?;
        let status = frame.take_string()?;
        check_status(&status)?;
        if self.trace.handshake() {
            tracing::debug!(%status, "handshake: recv_status");
        }

        // recv_challenge
        let mut frame = FrameReader::read_from(&mut socket).await?;
        frame.expect_tag(TAG_CHALLENGE)?;
        let version = frame.take_u16()?;
        if version != DISTRIBUTION_VERSION {
            return Err(HandshakeError::UnsupportedVersion { version });
        }
        let peer_flags = DistributionFlags::from_bits_truncate(frame.take_u32()?);
        let peer_challenge = frame.take_u32()?;
        let peer_name = frame.take_string()?;
        if self.trace.handshake() {
            tracing::debug!(peer = %peer_name, ?peer_flags, "handshake: recv_challenge");
        }

        // send_challenge_reply
        let our_challenge = rand::random::<u32>();
        let mut reply = FrameWriter::new();
        reply.put_u8(TAG_REPLY);
        reply.put_u32(our_challenge);
        reply.put_bytes(&digest(&self.cookie, peer_challenge));
        reply.finish(&mut socket).await?;

        // recv_challenge_ack
        let mut frame = FrameReader::read_from(&mut socket).await?;
        frame.expect_tag(TAG_ACK)?;
        let mut their_digest = [0; 16];
        frame.take_exact(&mut their_digest)?;
        if their_digest != digest(&self.cookie, our_challenge) {
            return Err(HandshakeError::DigestMismatch);
        }
        if self.trace.handshake() {
            tracing::debug!(peer = %peer_name, "handshake: connected");
        }

        Ok((
            socket.into_inner(),
            HandshakePeer {
                name: peer_name,
                flags: peer_flags,
                version,
            },
        ))
    }

    /// Runs the accepting side of the handshake on `stream`.
    pub async fn accept<T>(&self, stream: T) -> Result<(T, HandshakePeer), HandshakeError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut socket = Socket::new(stream);

        // recv_name
        let mut frame = FrameReader::read_from(&mut socket).await?;
        frame.expect_tag(TAG_NAME)?;
        let peer_version = frame.take_u16()?;
        let peer_flags = DistributionFlags::from_bits_truncate(frame.take_u32()?);
        let peer_name = frame.take_string()?;
        if self.trace.handshake() {
            tracing::debug!(peer = %peer_name, version = peer_version, "handshake: recv_name");
        }

        let version = peer_version.min(DISTRIBUTION_VERSION);
        if version < DISTRIBUTION_VERSION {
            return Err(HandshakeError::UnsupportedVersion {
                version: peer_version,
            });
        }
        if !peer_flags.contains(DistributionFlags::mandatory()) {
            return Err(HandshakeError::MissingCapabilities { flags: peer_flags });
        }

        // send_status
        let mut status = FrameWriter::new();
        status.put_u8(TAG_STATUS);
        status.put_bytes(b"ok");
        status.finish(&mut socket).await?;

        // send_challenge
        let our_challenge = rand::random::<u32>();
        let mut challenge = FrameWriter::new();
        challenge.put_u8(TAG_CHALLENGE);
        challenge.put_u16(version);
        challenge.put_u32(self.flags.bits());
        challenge.put_u32(our_challenge);
        challenge.put_bytes(self.local_node.as_bytes());
        challenge.finish(&mut socket).await?;

        // recv_challenge_reply
        let mut frame = FrameReader::read_from(&mut socket).await?;
        frame.expect_tag(TAG_REPLY)?;
        let peer_challenge = frame.take_u32()?;
        let mut their_digest = [0; 16];
        frame.take_exact(&mut their_digest)?;
        if their_digest != digest(&self.cookie, our_challenge) {
            return Err(HandshakeError::DigestMismatch);
        }

        // send_challenge_ack
        let mut ack = FrameWriter::new();
        ack.put_u8(TAG_ACK);
        ack.put_bytes(&digest(&self.cookie, peer_challenge));
        ack.finish(&mut socket).await?;
        if self.trace.handshake() {
            tracing::debug!(peer = %peer_name, "handshake: accepted");
        }

        Ok((
            socket.into_inner(),
            HandshakePeer {
                name: peer_name,
                flags: peer_flags,
                version,
            },
        ))
    }
}

fn check_status(status: &str) -> Result<(), HandshakeError> {
    match status {
        "ok" | "ok_simultaneous" => Ok(()),
        _ => Err(HandshakeError::RefusedStatus {
            status: status.to_owned(),
        }),
    }
}

// The challenge feeds the digest as its unsigned decimal rendering; a
// signed formatting here breaks compatibility with Erlang peers.
fn digest(cookie: &str, challenge: u32) -> [u8; 16] {
    md5::compute(format!("{}{}", cookie, challenge)).0
}

// A handshake frame under construction; `finish` prefixes the u16 length.
#[derive(Debug)]
struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    async fn finish<T>(self, socket: &mut Socket<T>) -> Result<(), HandshakeError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        if self.buf.len() > usize::from(u16::MAX) {
            return Err(HandshakeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "handshake frame exceeds the u16 length prefix",
            )));
        }
        socket.write_u16(self.buf.len() as u16).await?;
        socket.write_all(&self.buf).await?;
        socket.flush().await?;
        Ok(())
    }
}

// One received handshake frame, fully buffered.
#[derive(Debug)]
struct FrameReader {
    buf: Vec<u8>,
    pos: usize,
}

impl FrameReader {
    async fn read_from<T>(socket: &mut Socket<T>) -> Result<Self, HandshakeError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let len = usize::from(socket.read_u16().await?);
        let mut buf = vec![0; len];
        socket.read_exact(&mut buf).await?;
        Ok(Self { buf, pos: 0 })
    }

    fn expect_tag(&mut self, tag: u8) -> Result<(), HandshakeError> {
        let got = self.take_u8()?;
        if got == tag {
            Ok(())
        } else {
            Err(HandshakeError::UnexpectedTag { tag: got })
        }
    }

    fn take_u8(&mut self) -> Result<u8, HandshakeError> {
        let v = *self
            .buf
            .get(self.pos)
            .ok_or(HandshakeError::TooShortFrame)?;
        self.pos += 1;
        Ok(v)
    }

    fn take_u16(&mut self) -> Result<u16, HandshakeError> {
        let mut bytes = [0; 2];
        self.take_exact(&mut bytes)?;
        Ok(u16::from_be_bytes(bytes))
    }

    fn take_u32(&mut self) -> Result<u32, HandshakeError> {
        let mut bytes = [0; 4];
        self.take_exact(&mut bytes)?;
        Ok(u32::from_be_bytes(bytes))
    }

    fn take_exact(&mut self, out: &mut [u8]) -> Result<(), HandshakeError> {
        let end = self.pos + out.len();
        let src = self
            .buf
            .get(self.pos..end)
            .ok_or(HandshakeError::TooShortFrame)?;
        out.copy_from_slice(src);
        self.pos = end;
        Ok(())
    }

    fn take_string(&mut self) -> Result<String, HandshakeError> {
        let rest = self.buf.split_off(self.pos);
        String::from_utf8(rest).map_err(|_| {
            HandshakeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "handshake frame did not contain valid UTF-8",
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[test]
    fn digest_uses_unsigned_decimal_challenge() {
        // A challenge with the sign bit set must hash as its unsigned
        // decimal form, not a negative number.
        let challenge: u32 = 0xdead_beef;
        let expected = md5::compute(format!("cookie{}", 3_735_928_559u32)).0;
        assert_eq!(digest("cookie", challenge), expected);
    }

    #[test]
    fn status_check() {
        assert!(check_status("ok").is_ok());
        assert!(check_status("ok_simultaneous").is_ok());
        assert!(matches!(
            check_status("nok"),
            Err(HandshakeError::RefusedStatus { .. })
        ));
        assert!(check_status("alive").is_err());
    }

    #[tokio::test]
    async fn accept_responds_ok_to_name_frame() {
        // Name frame for `foo@host`, dist 5, flags 0x104 (extended refs
        // plus extended pids/ports, the mandatory pair).
        let name_frame: Vec<u8> = vec![
            0x00, 0x0f, 0x6e, 0x00, 0x05, 0x00, 0x00, 0x01, 0x04, 0x66, 0x6f, 0x6f, 0x40, 0x68,
            0x6f, 0x73, 0x74,
        ];
        let (mut client, server) = tokio::io::duplex(1024);
        let accept =
            tokio::spawn(
                async move { Handshake::new("bar@host", "secret").accept(server).await },
            );

        client.write_all(&name_frame).await.unwrap();

        // recv status frame: must be "s","o","k".
        let mut socket = Socket::new(&mut client);
        let len = socket.read_u16().await.unwrap();
        assert_eq!(len, 3);
        let mut status = [0; 3];
        socket.read_exact(&mut status).await.unwrap();
        assert_eq!(&status, b"sok");

        // The initiator hangs up after the status frame, so the acceptor
        // fails with an IO error rather than an auth error.
        drop(socket);
        drop(client);
        let result = accept.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn full_handshake_between_two_sides() {
        let (client, server) = tokio::io::duplex(4096);
        let acceptor = tokio::spawn(async move {
            Handshake::new("a@localhost", "monster").accept(server).await
        });
        let initiator = tokio::spawn(async move {
            Handshake::new("b@localhost", "monster")
                .connect(client)
                .await
        });

        let (_, peer_seen_by_a) = acceptor.await.unwrap().unwrap();
        let (_, peer_seen_by_b) = initiator.await.unwrap().unwrap();
        assert_eq!(peer_seen_by_a.name, "b@localhost");
        assert_eq!(peer_seen_by_b.name, "a@localhost");
        assert_eq!(peer_seen_by_a.version, DISTRIBUTION_VERSION);
    }

    #[tokio::test]
    async fn cookie_mismatch_is_an_auth_error() {
        let (client, server) = tokio::io::duplex(4096);
        let acceptor = tokio::spawn(async move {
            Handshake::new("a@localhost", "right").accept(server).await
        });
        let initiator = tokio::spawn(async move {
            Handshake::new("b@localhost", "wrong").connect(client).await
        });

        let accept_err = acceptor.await.unwrap().unwrap_err();
        assert!(accept_err.is_auth_error());
        let _ = initiator.await.unwrap();
    }
}
