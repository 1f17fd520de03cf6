//! Control messages passed between connected nodes.
//!
//! Each message is a control tuple whose first element is the operation
//! tag; SEND and REG_SEND (and their trace-token variants) are followed
//! by the message payload, encoded as a second root term in the same
//! frame.
//!
//! Reference: [Protocol between Connected Nodes](https://www.erlang.org/doc/apps/erts/erl_dist_protocol.html#protocol-between-connected-nodes)
use crate::codec::DecodeError;
use crate::codec::EncodeError;
use crate::term::{Atom, Integer, List, Pid, Term, Tuple};
use std::io::{Read, Write};

/// A message payload: either an already decoded term (local delivery) or
/// the still-encoded buffer it arrived in (decoded on first access).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Decoded term.
    Term(Term),

    /// Encoded bytes, version byte included.
    Encoded(Vec<u8>),
}

impl Payload {
    /// Decodes the payload if necessary and returns the term.
    pub fn into_term(self) -> Result<Term, DecodeError> {
        match self {
            Self::Term(term) => Ok(term),
            Self::Encoded(bytes) => Term::decode(&bytes[..]),
        }
    }

    fn write_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::Term(term) => term.encode(writer),
            Self::Encoded(bytes) => {
                writer.write_all(bytes)?;
                Ok(())
            }
        }
    }
}

impl From<Term> for Payload {
    fn from(term: Term) -> Self {
        Self::Term(term)
    }
}

pub trait ReadTermExt: Read {
    fn read_tuple(&mut self) -> Result<Tuple, DecodeError> {
        let term = self.read_term()?;
        term.try_into()
            .map_err(|value| DecodeError::unexpected_type(value, "tuple"))
    }

    fn read_term(&mut self) -> Result<Term, DecodeError> {
        Term::decode(self)
    }
}

impl<T: Read> ReadTermExt for T {}

pub trait WriteTermExt: Write {
    fn write_tagged_tuple1(&mut self, tag: i32) -> Result<(), EncodeError> {
        let tuple = Tuple {
            elements: vec![Term::from(tag)],
        };
        self.write_term(tuple)
    }

    fn write_tagged_tuple3<T0, T1>(
        &mut self,
        tag: i32,
        term0: T0,
        term1: T1,
    ) -> Result<(), EncodeError>
    where
        Term: From<T0>,
        Term: From<T1>,
    {
        let tuple = Tuple {
            elements: vec![Term::from(tag), Term::from(term0), Term::from(term1)],
        };
        self.write_term(tuple)
    }

    fn write_tagged_tuple4<T0, T1, T2>(
        &mut self,
        tag: i32,
        term0: T0,
        term1: T1,
        term2: T2,
    ) -> Result<(), EncodeError>
    where
        Term: From<T0>,
        Term: From<T1>,
        Term: From<T2>,
    {
        let tuple = Tuple {
            elements: vec![
                Term::from(tag),
                Term::from(term0),
                Term::from(term1),
                Term::from(term2),
            ],
        };
        self.write_term(tuple)
    }

    fn write_tagged_tuple5<T0, T1, T2, T3>(
        &mut self,
        tag: i32,
        term0: T0,
        term1: T1,
        term2: T2,
        term3: T3,
    ) -> Result<(), EncodeError>
    where
        Term: From<T0>,
        Term: From<T1>,
        Term: From<T2>,
        Term: From<T3>,
    {
        let tuple = Tuple {
            elements: vec![
                Term::from(tag),
                Term::from(term0),
                Term::from(term1),
                Term::from(term2),
                Term::from(term3),
            ],
        };
        self.write_term(tuple)
    }

    fn write_term<T>(&mut self, term: T) -> Result<(), EncodeError>
    where
        Term: From<T>,
    {
        Term::from(term).encode(self)
    }
}

impl<T: Write> WriteTermExt for T {}

pub trait TupleExt {
    fn check_len(&self, n: usize) -> Result<(), DecodeError>;
    fn take_as<T>(&mut self, i: usize, expected: &str) -> Result<T, DecodeError>
    where
        Term: TryInto<T, Error = Term>;
    fn take(&mut self, i: usize) -> Term;
}

impl TupleExt for Tuple {
    fn check_len(&self, n: usize) -> Result<(), DecodeError> {
        if self.elements.len() == n {
            Ok(())
        } else {
            Err(DecodeError::unexpected_type(
                self.clone().into(),
                &format!("{} elements tuple", n),
            ))
        }
    }

    fn take_as<T>(&mut self, i: usize, expected: &str) -> Result<T, DecodeError>
    where
        Term: TryInto<T, Error = Term>,
    {
        self.take(i)
            .try_into()
            .map_err(|value| DecodeError::unexpected_type(value, expected))
    }

    fn take(&mut self, i: usize) -> Term {
        std::mem::replace(&mut self.elements[i], List::nil().into())
    }
}

fn missing_payload() -> DecodeError {
    DecodeError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "control message is missing its payload term",
    ))
}

fn read_payload<R: Read>(reader: &mut R) -> Result<Payload, DecodeError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    if bytes.is_empty() {
        return Err(missing_payload());
    }
    Ok(Payload::Encoded(bytes))
}

trait DistributionMessage: Sized {
    const OP: i32;
    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError>;
    fn read_from<R: Read>(reader: &mut R, ctrl_msg: Tuple) -> Result<Self, DecodeError>;
}

/// `{1, FromPid, ToPid}`
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub from_pid: Pid,
    pub to_pid: Pid,
}

impl DistributionMessage for Link {
    const OP: i32 = 1;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple3(Self::OP, self.from_pid, self.to_pid)?;
        Ok(())
    }

    fn read_from<R: Read>(_reader: &mut R, mut ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(3)?;
        let from_pid = ctrl_msg.take_as::<Pid>(1, "pid")?;
        let to_pid = ctrl_msg.take_as::<Pid>(2, "pid")?;
        Ok(Self { from_pid, to_pid })
    }
}

/// `{2, Cookie, ToPid}` followed by the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Send {
    pub cookie: Atom,
    pub to_pid: Pid,
    pub message: Payload,
}

impl DistributionMessage for Send {
    const OP: i32 = 2;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple3(Self::OP, self.cookie, self.to_pid)?;
        self.message.write_into(writer)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R, mut ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(3)?;
        let cookie = ctrl_msg.take_as::<Atom>(1, "atom")?;
        let to_pid = ctrl_msg.take_as::<Pid>(2, "pid")?;
        let message = read_payload(reader)?;
        Ok(Self {
            cookie,
            to_pid,
            message,
        })
    }
}

/// `{3, FromPid, ToPid, Reason}`
#[derive(Debug, Clone, PartialEq)]
pub struct Exit {
    pub from_pid: Pid,
    pub to_pid: Pid,
    pub reason: Term,
}

impl DistributionMessage for Exit {
    const OP: i32 = 3;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple4(Self::OP, self.from_pid, self.to_pid, self.reason)?;
        Ok(())
    }

    fn read_from<R: Read>(_reader: &mut R, mut ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(4)?;
        let from_pid = ctrl_msg.take_as::<Pid>(1, "pid")?;
        let to_pid = ctrl_msg.take_as::<Pid>(2, "pid")?;
        let reason = ctrl_msg.take(3);
        Ok(Self {
            from_pid,
            to_pid,
            reason,
        })
    }
}

/// `{4, FromPid, ToPid}`
#[derive(Debug, Clone, PartialEq)]
pub struct Unlink {
    pub from_pid: Pid,
    pub to_pid: Pid,
}

impl DistributionMessage for Unlink {
    const OP: i32 = 4;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple3(Self::OP, self.from_pid, self.to_pid)?;
        Ok(())
    }

    fn read_from<R: Read>(_reader: &mut R, mut ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(3)?;
        let from_pid = ctrl_msg.take_as::<Pid>(1, "pid")?;
        let to_pid = ctrl_msg.take_as::<Pid>(2, "pid")?;
        Ok(Self { from_pid, to_pid })
    }
}

/// `{5}` — accepted and ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLink {}

impl DistributionMessage for NodeLink {
    const OP: i32 = 5;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple1(Self::OP)?;
        Ok(())
    }

    fn read_from<R: Read>(_reader: &mut R, ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(1)?;
        Ok(Self {})
    }
}

/// `{6, FromPid, Cookie, ToName}` followed by the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RegSend {
    pub from_pid: Pid,
    pub cookie: Atom,
    pub to_name: Atom,
    pub message: Payload,
}

impl DistributionMessage for RegSend {
    const OP: i32 = 6;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple4(Self::OP, self.from_pid, self.cookie, self.to_name)?;
        self.message.write_into(writer)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R, mut ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(4)?;
        let from_pid = ctrl_msg.take_as::<Pid>(1, "pid")?;
        let cookie = ctrl_msg.take_as::<Atom>(2, "atom")?;
        let to_name = ctrl_msg.take_as::<Atom>(3, "atom")?;
        let message = read_payload(reader)?;
        Ok(Self {
            from_pid,
            cookie,
            to_name,
            message,
        })
    }
}

/// `{7, FromPid, ToPid}` — accepted and ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupLeader {
    pub from_pid: Pid,
    pub to_pid: Pid,
}

impl DistributionMessage for GroupLeader {
    const OP: i32 = 7;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple3(Self::OP, self.from_pid, self.to_pid)?;
        Ok(())
    }

    fn read_from<R: Read>(_reader: &mut R, mut ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(3)?;
        let from_pid = ctrl_msg.take_as::<Pid>(1, "pid")?;
        let to_pid = ctrl_msg.take_as::<Pid>(2, "pid")?;
        Ok(Self { from_pid, to_pid })
    }
}

/// `{8, FromPid, ToPid, Reason}`
#[derive(Debug, Clone, PartialEq)]
pub struct Exit2 {
    pub from_pid: Pid,
    pub to_pid: Pid,
    pub reason: Term,
}

impl DistributionMessage for Exit2 {
    const OP: i32 = 8;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple4(Self::OP, self.from_pid, self.to_pid, self.reason)?;
        Ok(())
    }

    fn read_from<R: Read>(_reader: &mut R, mut ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(4)?;
        let from_pid = ctrl_msg.take_as::<Pid>(1, "pid")?;
        let to_pid = ctrl_msg.take_as::<Pid>(2, "pid")?;
        let reason = ctrl_msg.take(3);
        Ok(Self {
            from_pid,
            to_pid,
            reason,
        })
    }
}

/// `{12, Cookie, ToPid, TraceToken}` followed by the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SendTt {
    pub cookie: Atom,
    pub to_pid: Pid,
    pub trace_token: Term,
    pub message: Payload,
}

impl DistributionMessage for SendTt {
    const OP: i32 = 12;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple4(Self::OP, self.cookie, self.to_pid, self.trace_token)?;
        self.message.write_into(writer)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R, mut ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(4)?;
        let cookie = ctrl_msg.take_as::<Atom>(1, "atom")?;
        let to_pid = ctrl_msg.take_as::<Pid>(2, "pid")?;
        let trace_token = ctrl_msg.take(3);
        let message = read_payload(reader)?;
        Ok(Self {
            cookie,
            to_pid,
            trace_token,
            message,
        })
    }
}

/// `{13, FromPid, ToPid, TraceToken, Reason}`
#[derive(Debug, Clone, PartialEq)]
pub struct ExitTt {
    pub from_pid: Pid,
    pub to_pid: Pid,
    pub trace_token: Term,
    pub reason: Term,
}

impl DistributionMessage for ExitTt {
    const OP: i32 = 13;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple5(
            Self::OP,
            self.from_pid,
            self.to_pid,
            self.trace_token,
            self.reason,
        )?;
        Ok(())
    }

    fn read_from<R: Read>(_reader: &mut R, mut ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(5)?;
        let from_pid = ctrl_msg.take_as::<Pid>(1, "pid")?;
        let to_pid = ctrl_msg.take_as::<Pid>(2, "pid")?;
        let trace_token = ctrl_msg.take(3);
        let reason = ctrl_msg.take(4);
        Ok(Self {
            from_pid,
            to_pid,
            trace_token,
            reason,
        })
    }
}

/// `{16, FromPid, Cookie, ToName, TraceToken}` followed by the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RegSendTt {
    pub from_pid: Pid,
    pub cookie: Atom,
    pub to_name: Atom,
    pub trace_token: Term,
    pub message: Payload,
}

impl DistributionMessage for RegSendTt {
    const OP: i32 = 16;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple5(
            Self::OP,
            self.from_pid,
            self.cookie,
            self.to_name,
            self.trace_token,
        )?;
        self.message.write_into(writer)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R, mut ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(5)?;
        let from_pid = ctrl_msg.take_as::<Pid>(1, "pid")?;
        let cookie = ctrl_msg.take_as::<Atom>(2, "atom")?;
        let to_name = ctrl_msg.take_as::<Atom>(3, "atom")?;
        let trace_token = ctrl_msg.take(4);
        let message = read_payload(reader)?;
        Ok(Self {
            from_pid,
            cookie,
            to_name,
            trace_token,
            message,
        })
    }
}

/// `{18, FromPid, ToPid, TraceToken, Reason}`
#[derive(Debug, Clone, PartialEq)]
pub struct Exit2Tt {
    pub from_pid: Pid,
    pub to_pid: Pid,
    pub trace_token: Term,
    pub reason: Term,
}

impl DistributionMessage for Exit2Tt {
    const OP: i32 = 18;

    fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_tagged_tuple5(
            Self::OP,
            self.from_pid,
            self.to_pid,
            self.trace_token,
            self.reason,
        )?;
        Ok(())
    }

    fn read_from<R: Read>(_reader: &mut R, mut ctrl_msg: Tuple) -> Result<Self, DecodeError> {
        ctrl_msg.check_len(5)?;
        let from_pid = ctrl_msg.take_as::<Pid>(1, "pid")?;
        let to_pid = ctrl_msg.take_as::<Pid>(2, "pid")?;
        let trace_token = ctrl_msg.take(3);
        let reason = ctrl_msg.take(4);
        Ok(Self {
            from_pid,
            to_pid,
            trace_token,
            reason,
        })
    }
}

/// One decoded control message.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Link(Link),
    Send(Send),
    Exit(Exit),
    Unlink(Unlink),
    NodeLink(NodeLink),
    RegSend(RegSend),
    GroupLeader(GroupLeader),
    Exit2(Exit2),
    SendTt(SendTt),
    ExitTt(ExitTt),
    RegSendTt(RegSendTt),
    Exit2Tt(Exit2Tt),
}

impl Message {
    /// Makes a SEND control message.
    pub fn send(cookie: Atom, to_pid: Pid, message: Payload) -> Self {
        Self::Send(Send {
            cookie,
            to_pid,
            message,
        })
    }

    /// Makes a REG_SEND control message.
    pub fn reg_send(from_pid: Pid, cookie: Atom, to_name: Atom, message: Payload) -> Self {
        Self::RegSend(RegSend {
            from_pid,
            cookie,
            to_name,
            message,
        })
    }

    /// Makes a LINK control message.
    pub fn link(from_pid: Pid, to_pid: Pid) -> Self {
        Self::Link(Link { from_pid, to_pid })
    }

    /// Makes an UNLINK control message.
    pub fn unlink(from_pid: Pid, to_pid: Pid) -> Self {
        Self::Unlink(Unlink { from_pid, to_pid })
    }

    /// Makes an EXIT control message (link break).
    pub fn exit(from_pid: Pid, to_pid: Pid, reason: Term) -> Self {
        Self::Exit(Exit {
            from_pid,
            to_pid,
            reason,
        })
    }

    /// Makes an EXIT2 control message (explicit exit request).
    pub fn exit2(from_pid: Pid, to_pid: Pid, reason: Term) -> Self {
        Self::Exit2(Exit2 {
            from_pid,
            to_pid,
            reason,
        })
    }

    /// Serializes the control tuple (and payload, when one is carried)
    /// into `writer`.
    pub fn write_into<W: Write>(self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::Link(x) => x.write_into(writer),
            Self::Send(x) => x.write_into(writer),
            Self::Exit(x) => x.write_into(writer),
            Self::Unlink(x) => x.write_into(writer),
            Self::NodeLink(x) => x.write_into(writer),
            Self::RegSend(x) => x.write_into(writer),
            Self::GroupLeader(x) => x.write_into(writer),
            Self::Exit2(x) => x.write_into(writer),
            Self::SendTt(x) => x.write_into(writer),
            Self::ExitTt(x) => x.write_into(writer),
            Self::RegSendTt(x) => x.write_into(writer),
            Self::Exit2Tt(x) => x.write_into(writer),
        }
    }

    /// Reads one control message (with its payload, when one is carried)
    /// from `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut ctrl_msg = reader.read_tuple()?;
        if ctrl_msg.elements.is_empty() {
            return Err(DecodeError::unexpected_type(
                ctrl_msg.into(),
                "non empty tuple",
            ));
        }
        let op = ctrl_msg.take_as::<Integer>(0, "integer")?.to_i32()?;
        let msg = match op {
            Link::OP => Link::read_from(reader, ctrl_msg).map(Self::Link)?,
            Send::OP => Send::read_from(reader, ctrl_msg).map(Self::Send)?,
            Exit::OP => Exit::read_from(reader, ctrl_msg).map(Self::Exit)?,
            Unlink::OP => Unlink::read_from(reader, ctrl_msg).map(Self::Unlink)?,
            NodeLink::OP => NodeLink::read_from(reader, ctrl_msg).map(Self::NodeLink)?,
            RegSend::OP => RegSend::read_from(reader, ctrl_msg).map(Self::RegSend)?,
            GroupLeader::OP => GroupLeader::read_from(reader, ctrl_msg).map(Self::GroupLeader)?,
            Exit2::OP => Exit2::read_from(reader, ctrl_msg).map(Self::Exit2)?,
            SendTt::OP => SendTt::read_from(reader, ctrl_msg).map(Self::SendTt)?,
            ExitTt::OP => ExitTt::read_from(reader, ctrl_msg).map(Self::ExitTt)?,
            RegSendTt::OP => RegSendTt::read_from(reader, ctrl_msg).map(Self::RegSendTt)?,
            Exit2Tt::OP => Exit2Tt::read_from(reader, ctrl_msg).map(Self::Exit2Tt)?,
            op => return Err(DecodeError::UnknownControlOp { op }),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: u32) -> Pid {
        Pid {
            node: Atom::from("n@h"),
            id,
            serial: 0,
            creation: 0,
        }
    }

    fn round_trip(msg: Message) -> Message {
        let mut buf = Vec::new();
        msg.clone().write_into(&mut buf).unwrap();
        let decoded = Message::read_from(&mut &buf[..]).unwrap();
        decoded
    }

    #[test]
    fn send_round_trips_with_payload() {
        let payload = Payload::Term(Term::from(42));
        let msg = Message::send(Atom::from(""), pid(1), payload);
        match round_trip(msg) {
            Message::Send(send) => {
                assert_eq!(send.to_pid, pid(1));
                assert_eq!(send.cookie, Atom::from(""));
                assert_eq!(send.message.into_term().unwrap(), Term::from(42));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn reg_send_round_trips() {
        let msg = Message::reg_send(
            pid(3),
            Atom::from(""),
            Atom::from("net_kernel"),
            Payload::Term(Term::Atom(Atom::from("hello"))),
        );
        match round_trip(msg) {
            Message::RegSend(rs) => {
                assert_eq!(rs.to_name, Atom::from("net_kernel"));
                assert_eq!(rs.from_pid, pid(3));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn exit_variants_round_trip() {
        let reason = Term::Atom(Atom::from("normal"));
        assert_eq!(
            round_trip(Message::exit(pid(1), pid(2), reason.clone())),
            Message::exit(pid(1), pid(2), reason.clone())
        );
        assert_eq!(
            round_trip(Message::exit2(pid(1), pid(2), reason.clone())),
            Message::exit2(pid(1), pid(2), reason)
        );
    }

    #[test]
    fn trace_token_variants_round_trip() {
        let token = Term::from(77);
        let msg = Message::SendTt(SendTt {
            cookie: Atom::from(""),
            to_pid: pid(9),
            trace_token: token.clone(),
            message: Payload::Term(Term::from(1)),
        });
        match round_trip(msg) {
            Message::SendTt(tt) => assert_eq!(tt.trace_token, token),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn node_link_and_group_leader_parse() {
        assert_eq!(
            round_trip(Message::NodeLink(NodeLink {})),
            Message::NodeLink(NodeLink {})
        );
        let gl = Message::GroupLeader(GroupLeader {
            from_pid: pid(1),
            to_pid: pid(2),
        });
        assert_eq!(round_trip(gl.clone()), gl);
    }

    #[test]
    fn unknown_op_is_a_decode_error() {
        let mut buf = Vec::new();
        buf.write_tagged_tuple3(99, pid(1), pid(2)).unwrap();
        assert!(matches!(
            Message::read_from(&mut &buf[..]),
            Err(DecodeError::UnknownControlOp { op: 99 })
        ));
    }

    #[test]
    fn send_without_payload_is_rejected() {
        let mut buf = Vec::new();
        buf.write_tagged_tuple3(Send::OP, Atom::from(""), pid(1))
            .unwrap();
        assert!(Message::read_from(&mut &buf[..]).is_err());
    }
}
