//! External term format (version 131) codec.
//!
//! Reference: [External Term Format](https://www.erlang.org/doc/apps/erts/erl_ext_dist.html)
//!
//! The tag values are frozen protocol constants; changing any of them
//! breaks interoperability with every Erlang release.
use crate::term::{
    Atom, Binary, BitString, ExternalFun, ImproperList, Integer, InternalFun, List, Pid, Port,
    RangeError, Reference, Str, Term, Tuple,
};
use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use num_bigint::{BigInt, Sign};
use std::io::{Read, Write};

/// Leading version byte of every encoded root term.
pub const VERSION: u8 = 131;

/// How deep compressed wrappers may nest before decoding refuses to
/// inflate further.
pub const COMPRESSION_DEPTH_LIMIT: usize = 4;

mod tag {
    pub const NEW_FLOAT: u8 = 70;
    pub const BIT_BINARY: u8 = 77;
    pub const COMPRESSED: u8 = 80;
    pub const SMALL_INTEGER: u8 = 97;
    pub const INTEGER: u8 = 98;
    pub const FLOAT: u8 = 99;
    pub const ATOM: u8 = 100;
    pub const REFERENCE: u8 = 101;
    pub const PORT: u8 = 102;
    pub const PID: u8 = 103;
    pub const SMALL_TUPLE: u8 = 104;
    pub const LARGE_TUPLE: u8 = 105;
    pub const NIL: u8 = 106;
    pub const STRING: u8 = 107;
    pub const LIST: u8 = 108;
    pub const BINARY: u8 = 109;
    pub const SMALL_BIG: u8 = 110;
    pub const LARGE_BIG: u8 = 111;
    pub const NEW_FUN: u8 = 112;
    pub const EXTERNAL_FUN: u8 = 113;
    pub const NEW_REFERENCE: u8 = 114;
    pub const FUN: u8 = 117;
}

const PID_ID_MASK: u32 = 0x7fff;
const PID_SERIAL_MASK: u32 = 0x1fff;
const PORT_ID_MASK: u32 = 0x0fff_ffff;
const REF_ID_MASK: u32 = 0x0003_ffff;
const CREATION_MASK: u8 = 0x03;

const ERL_INT_MIN: i64 = -(1 << 27);
const ERL_INT_MAX: i64 = (1 << 27) - 1;

/// Errors that can occur while decoding a term.
///
/// No term is partially constructed on failure.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("unsupported version byte {version}, expected {VERSION}")]
    UnsupportedVersion { version: u8 },

    #[error("unknown term tag {tag}")]
    UnknownTag { tag: u8 },

    #[error("atom length must be at most 255 bytes, but got {length}")]
    TooLongAtomName { length: usize },

    #[error("expected a {expected}, but got {value}")]
    UnexpectedType { value: Term, expected: String },

    #[error("invalid bignum sign byte {sign}")]
    InvalidSign { sign: u8 },

    #[error("old-style float field could not be parsed")]
    InvalidFloat,

    #[error("bit-binary declares {bits} used bits in its last byte")]
    InvalidBitCount { bits: u8 },

    #[error("a reference carries {count} id words, at most 3 are allowed")]
    TooManyRefIds { count: usize },

    #[error("compressed terms nest deeper than {limit} levels")]
    CompressionTooDeep { limit: usize },

    #[error("unknown control operation {op}")]
    UnknownControlOp { op: i32 },

    #[error("compressed term declares {expected} bytes but inflates to {actual}")]
    CompressedSizeMismatch { expected: u32, actual: usize },

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    pub(crate) fn unexpected_type(value: Term, expected: &str) -> Self {
        Self::UnexpectedType {
            value,
            expected: expected.to_owned(),
        }
    }
}

/// Errors that can occur while encoding a term.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EncodeError {
    #[error("atom length must be at most 255 bytes, but got {length}")]
    TooLongAtomName { length: usize },

    #[error("atom name {name:?} contains non ISO-8859-1 characters")]
    NonLatin1AtomName { name: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Term {
    /// Decodes a term from `reader`.
    ///
    /// The stream must begin with the version byte `131`; compressed
    /// wrappers are inflated transparently (bounded by
    /// [`COMPRESSION_DEPTH_LIMIT`]).
    pub fn decode<R: Read>(reader: R) -> Result<Self, DecodeError> {
        Decoder::new(reader).decode()
    }

    /// Encodes this term into `writer`, prefixed with the version byte.
    ///
    /// Encoding is deterministic: the same term always produces the same
    /// byte sequence.
    pub fn encode<W: Write>(&self, writer: W) -> Result<(), EncodeError> {
        Encoder::new(writer).encode(self)
    }

    /// Encodes this term wrapped in a compressed (deflated) envelope.
    pub fn encode_compressed<W: Write>(&self, writer: W) -> Result<(), EncodeError> {
        Encoder::new(writer).encode_compressed(self)
    }
}

/// Streaming term decoder.
#[derive(Debug)]
pub struct Decoder<R> {
    reader: R,
    depth: usize,
}

impl<R: Read> Decoder<R> {
    /// Makes a new decoder that reads from `reader`.
    pub fn new(reader: R) -> Self {
        Self { reader, depth: 0 }
    }

    /// Decodes one versioned term.
    pub fn decode(mut self) -> Result<Term, DecodeError> {
        let version = self.reader.read_u8()?;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion { version });
        }
        self.decode_term()
    }

    fn decode_term(&mut self) -> Result<Term, DecodeError> {
        let tag = self.reader.read_u8()?;
        match tag {
            tag::SMALL_INTEGER => {
                let v = self.reader.read_u8()?;
                Ok(Term::from(i64::from(v)))
            }
            tag::INTEGER => {
                let v = self.reader.read_i32::<BigEndian>()?;
                Ok(Term::from(i64::from(v)))
            }
            tag::FLOAT => self.decode_old_float(),
            tag::NEW_FLOAT => {
                let v = self.reader.read_f64::<BigEndian>()?;
                Ok(Term::from(v))
            }
            tag::ATOM => Ok(Term::Atom(self.decode_atom_body()?)),
            tag::REFERENCE => {
                let node = self.decode_atom_field()?;
                let id = self.reader.read_u32::<BigEndian>()? & REF_ID_MASK;
                let creation = self.reader.read_u8()? & CREATION_MASK;
                Ok(Term::Reference(Reference {
                    node,
                    creation,
                    ids: vec![id],
                }))
            }
            tag::NEW_REFERENCE => {
                let count = usize::from(self.reader.read_u16::<BigEndian>()?);
                if count > 3 {
                    return Err(DecodeError::TooManyRefIds { count });
                }
                let node = self.decode_atom_field()?;
                let creation = self.reader.read_u8()? & CREATION_MASK;
                let mut ids = Vec::with_capacity(count);
                for i in 0..count {
                    let mut id = self.reader.read_u32::<BigEndian>()?;
                    if i == 0 {
                        id &= REF_ID_MASK;
                    }
                    ids.push(id);
                }
                Ok(Term::Reference(Reference {
                    node,
                    creation,
                    ids,
                }))
            }
            tag::PORT => {
                let node = self.decode_atom_field()?;
                let id = self.reader.read_u32::<BigEndian>()? & PORT_ID_MASK;
                let creation = self.reader.read_u8()? & CREATION_MASK;
                Ok(Term::Port(Port { node, id, creation }))
            }
            tag::PID => {
                let node = self.decode_atom_field()?;
                let id = self.reader.read_u32::<BigEndian>()? & PID_ID_MASK;
                let serial = self.reader.read_u32::<BigEndian>()? & PID_SERIAL_MASK;
                let creation = self.reader.read_u8()? & CREATION_MASK;
                Ok(Term::Pid(Pid {
                    node,
                    id,
                    serial,
                    creation,
                }))
            }
            tag::SMALL_TUPLE => {
                let arity = usize::from(self.reader.read_u8()?);
                self.decode_tuple_body(arity)
            }
            tag::LARGE_TUPLE => {
                let arity = self.reader.read_u32::<BigEndian>()? as usize;
                self.decode_tuple_body(arity)
            }
            tag::NIL => Ok(Term::List(List::nil())),
            tag::STRING => {
                let len = usize::from(self.reader.read_u16::<BigEndian>()?);
                let bytes = self.read_bytes(len)?;
                Ok(Term::Str(Str::from(latin1_to_string(&bytes))))
            }
            tag::LIST => {
                let arity = self.reader.read_u32::<BigEndian>()? as usize;
                let mut elements = Vec::with_capacity(arity.min(4096));
                for _ in 0..arity {
                    elements.push(self.decode_term()?);
                }
                let tail = self.decode_term()?;
                match tail {
                    Term::List(l) if l.is_nil() => Ok(Term::List(List::from(elements))),
                    last => Ok(Term::ImproperList(ImproperList {
                        elements,
                        last: Box::new(last),
                    })),
                }
            }
            tag::BINARY => {
                let len = self.reader.read_u32::<BigEndian>()? as usize;
                let bytes = self.read_bytes(len)?;
                Ok(Term::Binary(Binary::from(bytes)))
            }
            tag::BIT_BINARY => self.decode_bit_binary(),
            tag::SMALL_BIG => {
                let len = usize::from(self.reader.read_u8()?);
                self.decode_big_body(len)
            }
            tag::LARGE_BIG => {
                let len = self.reader.read_u32::<BigEndian>()? as usize;
                self.decode_big_body(len)
            }
            tag::FUN => self.decode_old_fun(),
            tag::NEW_FUN => self.decode_new_fun(),
            tag::EXTERNAL_FUN => {
                let module = self.decode_atom_field()?;
                let function = self.decode_atom_field()?;
                let arity = self.decode_integer_field()?.to_i64()?;
                let arity = u8::try_from(arity).map_err(|_| RangeError {
                    value: BigInt::from(arity),
                })?;
                Ok(Term::ExternalFun(ExternalFun {
                    module,
                    function,
                    arity,
                }))
            }
            tag::COMPRESSED => self.decode_compressed(),
            tag => Err(DecodeError::UnknownTag { tag }),
        }
    }

    fn decode_tuple_body(&mut self, arity: usize) -> Result<Term, DecodeError> {
        let mut elements = Vec::with_capacity(arity.min(4096));
        for _ in 0..arity {
            elements.push(self.decode_term()?);
        }
        Ok(Term::Tuple(Tuple::from(elements)))
    }

    // Old textual float: 31 bytes of `%.20e` output, NUL padded.
    fn decode_old_float(&mut self) -> Result<Term, DecodeError> {
        let bytes = self.read_bytes(31)?;
        let text: String = bytes
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| char::from(b))
            .collect();
        let value: f64 = text.trim().parse().map_err(|_| DecodeError::InvalidFloat)?;
        Ok(Term::from(value))
    }

    fn decode_bit_binary(&mut self) -> Result<Term, DecodeError> {
        let len = self.reader.read_u32::<BigEndian>()? as usize;
        let bits = self.reader.read_u8()?;
        let bytes = self.read_bytes(len)?;
        if len == 0 {
            return if bits == 0 {
                Ok(Term::Binary(Binary::from(bytes)))
            } else {
                Err(DecodeError::InvalidBitCount { bits })
            };
        }
        match bits {
            8 => Ok(Term::Binary(Binary::from(bytes))),
            1..=7 => {
                let bitstring = BitString::new(bytes, 8 - bits)
                    .map_err(|_| DecodeError::InvalidBitCount { bits })?;
                Ok(Term::BitString(bitstring))
            }
            _ => Err(DecodeError::InvalidBitCount { bits }),
        }
    }

    fn decode_big_body(&mut self, len: usize) -> Result<Term, DecodeError> {
        let sign = match self.reader.read_u8()? {
            0 => Sign::Plus,
            1 => Sign::Minus,
            sign => return Err(DecodeError::InvalidSign { sign }),
        };
        let magnitude = self.read_bytes(len)?;
        Ok(Term::from(BigInt::from_bytes_le(sign, &magnitude)))
    }

    fn decode_old_fun(&mut self) -> Result<Term, DecodeError> {
        let num_free = self.reader.read_u32::<BigEndian>()? as usize;
        let pid = self.decode_pid_field()?;
        let module = self.decode_atom_field()?;
        let index = self.decode_integer_field()?.to_i32()?;
        let uniq = self.decode_integer_field()?.to_i32()?;
        let mut free_vars = Vec::with_capacity(num_free.min(4096));
        for _ in 0..num_free {
            free_vars.push(self.decode_term()?);
        }
        Ok(Term::InternalFun(InternalFun::Old {
            module,
            pid,
            free_vars,
            index,
            uniq,
        }))
    }

    fn decode_new_fun(&mut self) -> Result<Term, DecodeError> {
        let _size = self.reader.read_u32::<BigEndian>()?;
        let arity = self.reader.read_u8()?;
        let mut uniq = [0; 16];
        self.reader.read_exact(&mut uniq)?;
        let index = self.reader.read_u32::<BigEndian>()?;
        let num_free = self.reader.read_u32::<BigEndian>()? as usize;
        let module = self.decode_atom_field()?;
        let old_index = self.decode_integer_field()?.to_u32()?;
        let old_uniq = self.decode_integer_field()?.to_u32()?;
        let pid = self.decode_pid_field()?;
        let mut free_vars = Vec::with_capacity(num_free.min(4096));
        for _ in 0..num_free {
            free_vars.push(self.decode_term()?);
        }
        Ok(Term::InternalFun(InternalFun::New {
            module,
            arity,
            pid,
            free_vars,
            index,
            uniq,
            old_index,
            old_uniq,
        }))
    }

    // The deflated payload is the remainder of the stream, holding exactly
    // one unversioned term.
    fn decode_compressed(&mut self) -> Result<Term, DecodeError> {
        if self.depth >= COMPRESSION_DEPTH_LIMIT {
            return Err(DecodeError::CompressionTooDeep {
                limit: COMPRESSION_DEPTH_LIMIT,
            });
        }
        let expected = self.reader.read_u32::<BigEndian>()?;
        let mut inflated = Vec::new();
        ZlibDecoder::new(&mut self.reader).read_to_end(&mut inflated)?;
        if inflated.len() != expected as usize {
            return Err(DecodeError::CompressedSizeMismatch {
                expected,
                actual: inflated.len(),
            });
        }
        let mut inner = Decoder {
            reader: &inflated[..],
            depth: self.depth + 1,
        };
        inner.decode_term()
    }

    fn decode_atom_body(&mut self) -> Result<Atom, DecodeError> {
        let length = usize::from(self.reader.read_u16::<BigEndian>()?);
        if length > 255 {
            return Err(DecodeError::TooLongAtomName { length });
        }
        let bytes = self.read_bytes(length)?;
        Ok(Atom::from(latin1_to_string(&bytes)))
    }

    fn decode_atom_field(&mut self) -> Result<Atom, DecodeError> {
        let term = self.decode_term()?;
        Atom::try_from(term).map_err(|value| DecodeError::unexpected_type(value, "atom"))
    }

    fn decode_pid_field(&mut self) -> Result<Pid, DecodeError> {
        let term = self.decode_term()?;
        Pid::try_from(term).map_err(|value| DecodeError::unexpected_type(value, "pid"))
    }

    fn decode_integer_field(&mut self) -> Result<Integer, DecodeError> {
        let term = self.decode_term()?;
        Integer::try_from(term).map_err(|value| DecodeError::unexpected_type(value, "integer"))
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        let mut buf = vec![0; len];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Streaming term encoder.
#[derive(Debug)]
pub struct Encoder<W> {
    writer: W,
}

impl<W: Write> Encoder<W> {
    /// Makes a new encoder that writes into `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encodes one versioned term.
    pub fn encode(&mut self, term: &Term) -> Result<(), EncodeError> {
        self.writer.write_u8(VERSION)?;
        self.encode_term(term)
    }

    /// Encodes one versioned term inside a compressed wrapper.
    pub fn encode_compressed(&mut self, term: &Term) -> Result<(), EncodeError> {
        let mut body = Vec::new();
        Encoder::new(&mut body).encode_term(term)?;

        self.writer.write_u8(VERSION)?;
        self.writer.write_u8(tag::COMPRESSED)?;
        self.writer.write_u32::<BigEndian>(body.len() as u32)?;
        let mut deflater = ZlibEncoder::new(&mut self.writer, Compression::default());
        deflater.write_all(&body)?;
        deflater.finish()?;
        Ok(())
    }

    fn encode_term(&mut self, term: &Term) -> Result<(), EncodeError> {
        match term {
            Term::Integer(x) => self.encode_integer(x),
            Term::Float(x) => {
                self.writer.write_u8(tag::NEW_FLOAT)?;
                self.writer.write_f64::<BigEndian>(x.value)?;
                Ok(())
            }
            Term::Atom(x) => self.encode_atom(x),
            Term::Str(x) => self.encode_str(x),
            Term::Binary(x) => self.encode_binary(&x.bytes),
            Term::BitString(x) => self.encode_bit_string(x),
            Term::Tuple(x) => self.encode_tuple(x),
            Term::List(x) => self.encode_list(&x.elements, None),
            Term::ImproperList(x) => self.encode_list(&x.elements, Some(&x.last)),
            Term::Pid(x) => self.encode_pid(x),
            Term::Port(x) => self.encode_port(x),
            Term::Reference(x) => self.encode_reference(x),
            Term::InternalFun(x) => self.encode_internal_fun(x),
            Term::ExternalFun(x) => self.encode_external_fun(x),
        }
    }

    fn encode_integer(&mut self, value: &Integer) -> Result<(), EncodeError> {
        if let Ok(v) = value.to_i64() {
            if (0..=255).contains(&v) {
                self.writer.write_u8(tag::SMALL_INTEGER)?;
                self.writer.write_u8(v as u8)?;
                return Ok(());
            }
            if (ERL_INT_MIN..=ERL_INT_MAX).contains(&v) {
                self.writer.write_u8(tag::INTEGER)?;
                self.writer.write_i32::<BigEndian>(v as i32)?;
                return Ok(());
            }
        }
        self.encode_big(&value.to_bigint())
    }

    fn encode_big(&mut self, value: &BigInt) -> Result<(), EncodeError> {
        let (sign, magnitude) = value.to_bytes_le();
        if magnitude.len() <= 255 {
            self.writer.write_u8(tag::SMALL_BIG)?;
            self.writer.write_u8(magnitude.len() as u8)?;
        } else {
            self.writer.write_u8(tag::LARGE_BIG)?;
            self.writer.write_u32::<BigEndian>(magnitude.len() as u32)?;
        }
        self.writer.write_u8(u8::from(sign == Sign::Minus))?;
        self.writer.write_all(&magnitude)?;
        Ok(())
    }

    fn encode_atom(&mut self, atom: &Atom) -> Result<(), EncodeError> {
        let bytes = string_to_latin1(&atom.name).ok_or_else(|| EncodeError::NonLatin1AtomName {
            name: atom.name.clone(),
        })?;
        if bytes.len() > 255 {
            return Err(EncodeError::TooLongAtomName {
                length: bytes.len(),
            });
        }
        self.writer.write_u8(tag::ATOM)?;
        self.writer.write_u16::<BigEndian>(bytes.len() as u16)?;
        self.writer.write_all(&bytes)?;
        Ok(())
    }

    // Byte-string form when the text fits, list-of-integers form
    // otherwise; the empty string is bare nil.
    fn encode_str(&mut self, s: &Str) -> Result<(), EncodeError> {
        if s.value.is_empty() {
            self.writer.write_u8(tag::NIL)?;
            return Ok(());
        }
        let code_points: Vec<u32> = s.value.chars().map(|c| c as u32).collect();
        if code_points.len() <= 65535 && code_points.iter().all(|&c| c <= 255) {
            self.writer.write_u8(tag::STRING)?;
            self.writer.write_u16::<BigEndian>(code_points.len() as u16)?;
            let bytes: Vec<u8> = code_points.iter().map(|&c| c as u8).collect();
            self.writer.write_all(&bytes)?;
            return Ok(());
        }
        self.writer.write_u8(tag::LIST)?;
        self.writer.write_u32::<BigEndian>(code_points.len() as u32)?;
        for c in code_points {
            self.encode_integer(&Integer::from(c))?;
        }
        self.writer.write_u8(tag::NIL)?;
        Ok(())
    }

    fn encode_binary(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        self.writer.write_u8(tag::BINARY)?;
        self.writer.write_u32::<BigEndian>(bytes.len() as u32)?;
        self.writer.write_all(bytes)?;
        Ok(())
    }

    fn encode_bit_string(&mut self, bits: &BitString) -> Result<(), EncodeError> {
        if bits.pad_bits() == 0 {
            // Byte-aligned bitstrings canonicalize to plain binaries.
            return self.encode_binary(bits.bytes());
        }
        self.writer.write_u8(tag::BIT_BINARY)?;
        self.writer
            .write_u32::<BigEndian>(bits.bytes().len() as u32)?;
        self.writer.write_u8(8 - bits.pad_bits())?;
        self.writer.write_all(bits.bytes())?;
        Ok(())
    }

    fn encode_tuple(&mut self, tuple: &Tuple) -> Result<(), EncodeError> {
        if tuple.elements.len() < 255 {
            self.writer.write_u8(tag::SMALL_TUPLE)?;
            self.writer.write_u8(tuple.elements.len() as u8)?;
        } else {
            self.writer.write_u8(tag::LARGE_TUPLE)?;
            self.writer
                .write_u32::<BigEndian>(tuple.elements.len() as u32)?;
        }
        for e in &tuple.elements {
            self.encode_term(e)?;
        }
        Ok(())
    }

    fn encode_list(&mut self, elements: &[Term], last: Option<&Term>) -> Result<(), EncodeError> {
        if elements.is_empty() && last.is_none() {
            self.writer.write_u8(tag::NIL)?;
            return Ok(());
        }
        self.writer.write_u8(tag::LIST)?;
        self.writer.write_u32::<BigEndian>(elements.len() as u32)?;
        for e in elements {
            self.encode_term(e)?;
        }
        match last {
            Some(tail) => self.encode_term(tail)?,
            None => self.writer.write_u8(tag::NIL)?,
        }
        Ok(())
    }

    fn encode_pid(&mut self, pid: &Pid) -> Result<(), EncodeError> {
        self.writer.write_u8(tag::PID)?;
        self.encode_atom(&pid.node)?;
        self.writer.write_u32::<BigEndian>(pid.id & PID_ID_MASK)?;
        self.writer
            .write_u32::<BigEndian>(pid.serial & PID_SERIAL_MASK)?;
        self.writer.write_u8(pid.creation & CREATION_MASK)?;
        Ok(())
    }

    fn encode_port(&mut self, port: &Port) -> Result<(), EncodeError> {
        self.writer.write_u8(tag::PORT)?;
        self.encode_atom(&port.node)?;
        self.writer.write_u32::<BigEndian>(port.id & PORT_ID_MASK)?;
        self.writer.write_u8(port.creation & CREATION_MASK)?;
        Ok(())
    }

    // Always the new-style encoding; at most three id words go out.
    fn encode_reference(&mut self, reference: &Reference) -> Result<(), EncodeError> {
        let ids = &reference.ids[..reference.ids.len().min(3)];
        self.writer.write_u8(tag::NEW_REFERENCE)?;
        self.writer.write_u16::<BigEndian>(ids.len() as u16)?;
        self.encode_atom(&reference.node)?;
        self.writer.write_u8(reference.creation & CREATION_MASK)?;
        for (i, &id) in ids.iter().enumerate() {
            let id = if i == 0 { id & REF_ID_MASK } else { id };
            self.writer.write_u32::<BigEndian>(id)?;
        }
        Ok(())
    }

    fn encode_internal_fun(&mut self, fun: &InternalFun) -> Result<(), EncodeError> {
        match fun {
            InternalFun::Old {
                module,
                pid,
                free_vars,
                index,
                uniq,
            } => {
                self.writer.write_u8(tag::FUN)?;
                self.writer.write_u32::<BigEndian>(free_vars.len() as u32)?;
                self.encode_pid(pid)?;
                self.encode_atom(module)?;
                self.encode_integer(&Integer::from(*index))?;
                self.encode_integer(&Integer::from(*uniq))?;
                for v in free_vars {
                    self.encode_term(v)?;
                }
                Ok(())
            }
            InternalFun::New {
                module,
                arity,
                pid,
                free_vars,
                index,
                uniq,
                old_index,
                old_uniq,
            } => {
                // The size field counts itself plus everything after it,
                // so the body goes through a scratch buffer first.
                let mut body = Vec::new();
                {
                    let mut inner = Encoder::new(&mut body);
                    inner.writer.write_u8(*arity)?;
                    inner.writer.write_all(uniq)?;
                    inner.writer.write_u32::<BigEndian>(*index)?;
                    inner
                        .writer
                        .write_u32::<BigEndian>(free_vars.len() as u32)?;
                    inner.encode_atom(module)?;
                    inner.encode_integer(&Integer::from(*old_index))?;
                    inner.encode_integer(&Integer::from(*old_uniq))?;
                    inner.encode_pid(pid)?;
                    for v in free_vars {
                        inner.encode_term(v)?;
                    }
                }
                self.writer.write_u8(tag::NEW_FUN)?;
                self.writer.write_u32::<BigEndian>(body.len() as u32 + 4)?;
                self.writer.write_all(&body)?;
                Ok(())
            }
        }
    }

    fn encode_external_fun(&mut self, fun: &ExternalFun) -> Result<(), EncodeError> {
        self.writer.write_u8(tag::EXTERNAL_FUN)?;
        self.encode_atom(&fun.module)?;
        self.encode_atom(&fun.function)?;
        self.encode_integer(&Integer::from(fun.arity))?;
        Ok(())
    }
}

fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn string_to_latin1(s: &str) -> Option<Vec<u8>> {
    s.chars()
        .map(|c| u8::try_from(c as u32).ok())
        .collect::<Option<Vec<u8>>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(term: &Term) -> Vec<u8> {
        let mut buf = Vec::new();
        term.encode(&mut buf).expect("encode failed");
        assert_eq!(buf[0], VERSION);
        buf
    }

    fn inner(term: &Term) -> Vec<u8> {
        encode(term)[1..].to_vec()
    }

    fn round_trip(term: Term) {
        let buf = encode(&term);
        let decoded = Term::decode(&buf[..]).expect("decode failed");
        assert_eq!(decoded, term);
        // Determinism.
        assert_eq!(buf, encode(&term));
    }

    fn atom(name: &str) -> Term {
        Term::Atom(Atom::from(name))
    }

    #[test]
    fn known_vectors() {
        assert_eq!(inner(&Term::from(0)), [97, 0]);
        assert_eq!(inner(&Term::from(1000)), [98, 0, 0, 3, 232]);
        assert_eq!(inner(&atom("ok")), [100, 0, 2, 111, 107]);
        assert_eq!(inner(&Term::Str(Str::from("hi"))), [107, 0, 2, 104, 105]);
        assert_eq!(inner(&Term::Str(Str::from(""))), [106]);
        assert_eq!(
            inner(&Term::Tuple(Tuple::from(vec![atom("a"), Term::from(1)]))),
            [104, 2, 100, 0, 1, 97, 97, 1]
        );
    }

    #[test]
    fn integer_canonicalization() {
        assert_eq!(inner(&Term::from(255))[0], 97);
        assert_eq!(inner(&Term::from(256))[0], 98);
        assert_eq!(inner(&Term::from(-1))[0], 98);
        assert_eq!(inner(&Term::from((1i64 << 27) - 1))[0], 98);
        assert_eq!(inner(&Term::from(-(1i64 << 27)))[0], 98);
        // Just outside the 28-bit window the bignum form takes over even
        // though the value still fits 32 bits.
        assert_eq!(
            inner(&Term::from(1i64 << 27)),
            [110, 4, 0, 0, 0, 0, 8]
        );
        assert_eq!(inner(&Term::from(-(1i64 << 27) - 1))[0], 110);
    }

    #[test]
    fn integer_round_trips() {
        for v in [
            0i64,
            1,
            255,
            256,
            -1,
            -256,
            (1 << 27) - 1,
            1 << 27,
            -(1 << 27),
            -(1 << 27) - 1,
            i64::MAX,
            i64::MIN,
        ] {
            round_trip(Term::from(v));
        }
        round_trip(Term::from(BigInt::from(u64::MAX) * BigInt::from(u64::MAX)));
        round_trip(Term::from(-(BigInt::from(u64::MAX) * BigInt::from(3))));
    }

    #[test]
    fn large_bignum_uses_large_big_tag() {
        let huge = BigInt::from(1i32) << (8usize * 300);
        let bytes = inner(&Term::from(huge.clone()));
        assert_eq!(bytes[0], 111);
        round_trip(Term::from(huge));
    }

    #[test]
    fn float_round_trips() {
        round_trip(Term::from(0.0));
        round_trip(Term::from(-1.5));
        round_trip(Term::from(std::f64::consts::PI));
    }

    #[test]
    fn old_float_decodes() {
        let mut buf = vec![VERSION, 99];
        let mut text = format!("{:.20e}", 2.5f64).into_bytes();
        text.resize(31, 0);
        buf.extend_from_slice(&text);
        assert_eq!(Term::decode(&buf[..]).unwrap(), Term::from(2.5));
    }

    #[test]
    fn atom_round_trips_latin1() {
        round_trip(atom("ok"));
        round_trip(atom("björn"));
        round_trip(atom(""));
    }

    #[test]
    fn atom_limits() {
        let long = "a".repeat(256);
        assert!(matches!(
            Term::Atom(Atom::from(long.as_str())).encode(&mut Vec::new()),
            Err(EncodeError::TooLongAtomName { length: 256 })
        ));
        assert!(matches!(
            atom("日本語").encode(&mut Vec::new()),
            Err(EncodeError::NonLatin1AtomName { .. })
        ));
    }

    #[test]
    fn string_prefers_byte_form() {
        // Latin-1, short: byte-string form.
        assert_eq!(inner(&Term::Str(Str::from("hi")))[0], 107);

        // Non-Latin-1 code points: list form, decoding yields the list.
        let s = Term::Str(Str::from("日本"));
        let buf = encode(&s);
        assert_eq!(buf[1], 108);
        let decoded = Term::decode(&buf[..]).unwrap();
        assert_eq!(
            decoded,
            Term::List(List::from(vec![
                Term::from(0x65e5u32),
                Term::from(0x672cu32)
            ]))
        );

        // Over-long Latin-1 strings also fall back to the list form.
        let long = Term::Str(Str::from("x".repeat(65536)));
        assert_eq!(encode(&long)[1], 108);
    }

    #[test]
    fn list_round_trips() {
        round_trip(Term::List(List::nil()));
        round_trip(Term::List(List::from(vec![
            Term::from(1),
            atom("two"),
            Term::from(3.0),
        ])));
        round_trip(Term::ImproperList(ImproperList {
            elements: vec![Term::from(1), Term::from(2)],
            last: Box::new(atom("tail")),
        }));
    }

    #[test]
    fn properness_survives_round_trip() {
        let proper = Term::List(List::from(vec![Term::from(1)]));
        let improper = Term::ImproperList(ImproperList {
            elements: vec![Term::from(1)],
            last: Box::new(Term::from(2)),
        });
        assert!(matches!(
            Term::decode(&encode(&proper)[..]).unwrap(),
            Term::List(_)
        ));
        assert!(matches!(
            Term::decode(&encode(&improper)[..]).unwrap(),
            Term::ImproperList(_)
        ));
    }

    #[test]
    fn tuple_arity_boundary() {
        let small = Term::Tuple(Tuple::from(vec![Term::from(0); 254]));
        assert_eq!(encode(&small)[1], 104);
        let large = Term::Tuple(Tuple::from(vec![Term::from(0); 255]));
        assert_eq!(encode(&large)[1], 105);
        round_trip(small);
        round_trip(large);
    }

    #[test]
    fn binary_and_bitstring_round_trips() {
        round_trip(Term::Binary(Binary::from(vec![])));
        round_trip(Term::Binary(Binary::from(vec![1, 2, 3, 255])));
        for pad in 1..=7u8 {
            round_trip(Term::BitString(
                BitString::new(vec![0xab, 0xcd], pad).unwrap(),
            ));
        }
        // A byte-aligned bitstring canonicalizes to a binary.
        let aligned = Term::BitString(BitString::new(vec![1, 2], 0).unwrap());
        assert_eq!(
            Term::decode(&encode(&aligned)[..]).unwrap(),
            Term::Binary(Binary::from(vec![1, 2]))
        );
    }

    #[test]
    fn pid_port_ref_round_trip_and_mask() {
        round_trip(Term::Pid(Pid {
            node: Atom::from("foo@host"),
            id: 0x7fff,
            serial: 0x1fff,
            creation: 3,
        }));
        round_trip(Term::Port(Port {
            node: Atom::from("foo@host"),
            id: 0x0fff_ffff,
            creation: 1,
        }));
        round_trip(Term::Reference(Reference {
            node: Atom::from("foo@host"),
            creation: 2,
            ids: vec![0x3ffff, u32::MAX, 17],
        }));

        // Out-of-width fields are masked on the wire.
        let pid = Term::Pid(Pid {
            node: Atom::from("n@h"),
            id: 0xffff_ffff,
            serial: 0xffff_ffff,
            creation: 0xff,
        });
        let decoded = Pid::try_from(Term::decode(&encode(&pid)[..]).unwrap()).unwrap();
        assert_eq!(decoded.id, 0x7fff);
        assert_eq!(decoded.serial, 0x1fff);
        assert_eq!(decoded.creation, 3);
    }

    #[test]
    fn fun_round_trips() {
        let pid = Pid {
            node: Atom::from("n@h"),
            id: 1,
            serial: 0,
            creation: 0,
        };
        round_trip(Term::InternalFun(InternalFun::Old {
            module: Atom::from("m"),
            pid: pid.clone(),
            free_vars: vec![Term::from(1), atom("x")],
            index: 3,
            uniq: 77,
        }));
        round_trip(Term::InternalFun(InternalFun::New {
            module: Atom::from("m"),
            arity: 2,
            pid,
            free_vars: vec![Term::from(9)],
            index: 1,
            uniq: [7; 16],
            old_index: 1,
            old_uniq: 12345,
        }));
        round_trip(Term::ExternalFun(ExternalFun {
            module: Atom::from("lists"),
            function: Atom::from("map"),
            arity: 2,
        }));
    }

    #[test]
    fn new_fun_size_field_is_back_patched() {
        let fun = Term::InternalFun(InternalFun::New {
            module: Atom::from("m"),
            arity: 0,
            pid: Pid {
                node: Atom::from("n@h"),
                id: 1,
                serial: 0,
                creation: 0,
            },
            free_vars: vec![],
            index: 0,
            uniq: [0; 16],
            old_index: 0,
            old_uniq: 0,
        });
        let buf = encode(&fun);
        assert_eq!(buf[1], 112);
        let size = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        // Size spans from the size field to the end of the fun.
        assert_eq!(size, buf.len() - 2);
    }

    #[test]
    fn compressed_round_trips() {
        let term = Term::List(List::from(vec![Term::from(7); 1000]));
        let mut buf = Vec::new();
        term.encode_compressed(&mut buf).unwrap();
        assert_eq!(buf[1], 80);
        assert_eq!(Term::decode(&buf[..]).unwrap(), term);
    }

    #[test]
    fn compression_nesting_is_bounded() {
        let mut payload = Vec::new();
        Encoder::new(&mut payload).encode_term(&atom("ok")).unwrap();
        for _ in 0..(COMPRESSION_DEPTH_LIMIT + 1) {
            let mut wrapped = vec![tag::COMPRESSED];
            wrapped.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            let mut deflater = ZlibEncoder::new(&mut wrapped, Compression::default());
            deflater.write_all(&payload).unwrap();
            deflater.finish().unwrap();
            payload = wrapped;
        }
        let mut buf = vec![VERSION];
        buf.extend_from_slice(&payload);
        assert!(matches!(
            Term::decode(&buf[..]),
            Err(DecodeError::CompressionTooDeep { .. })
        ));
    }

    #[test]
    fn decode_failures() {
        assert!(matches!(
            Term::decode(&[130u8, 97, 0][..]),
            Err(DecodeError::UnsupportedVersion { version: 130 })
        ));
        assert!(matches!(
            Term::decode(&[VERSION, 42][..]),
            Err(DecodeError::UnknownTag { tag: 42 })
        ));
        // Length runs past the buffer.
        assert!(matches!(
            Term::decode(&[VERSION, 107, 0, 5, 104][..]),
            Err(DecodeError::Io(_))
        ));
        // Atom longer than 255 bytes on the wire.
        let mut buf = vec![VERSION, 100, 1, 0];
        buf.extend_from_slice(&[b'a'; 256]);
        assert!(matches!(
            Term::decode(&buf[..]),
            Err(DecodeError::TooLongAtomName { length: 256 })
        ));
    }

    #[test]
    fn foreign_tags_are_rejected() {
        // Tag 0x6E belongs to the handshake layer, not the term format.
        assert!(matches!(
            Term::decode(&[VERSION, 0x6e][..]),
            Err(DecodeError::UnknownTag { tag: 0x6e })
        ));
    }

    #[test]
    fn old_style_reference_decodes_with_one_id() {
        // REFERENCE_EXT: tag 101, node atom, id u32, creation u8.
        let mut buf = vec![VERSION, 101];
        buf.extend_from_slice(&[100, 0, 3, b'n', b'@', b'h']);
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.push(1);
        let decoded = Reference::try_from(Term::decode(&buf[..]).unwrap()).unwrap();
        assert_eq!(decoded.ids, vec![7]);
        assert_eq!(decoded.creation, 1);

        // Re-encoding upgrades it to the new style with the same
        // identity, so it still compares equal.
        let mut reencoded = Vec::new();
        Term::Reference(decoded.clone())
            .encode(&mut reencoded)
            .unwrap();
        assert_eq!(reencoded[1], 114);
        let round = Reference::try_from(Term::decode(&reencoded[..]).unwrap()).unwrap();
        assert_eq!(round, decoded);
    }

    #[test]
    fn negative_bignum_wire_bytes() {
        // -(2^32) = sign byte 1, little-endian magnitude 00 00 00 00 01.
        assert_eq!(
            inner(&Term::from(-(1i64 << 32))),
            [110, 5, 1, 0, 0, 0, 0, 1]
        );
    }

    #[test]
    fn string_tag_decodes_to_string_not_list() {
        let buf = [VERSION, 107, 0, 2, 104, 105];
        assert_eq!(
            Term::decode(&buf[..]).unwrap(),
            Term::Str(Str::from("hi"))
        );
    }

    #[test]
    fn two_roots_share_one_buffer() {
        // A distribution frame carries the control tuple and the payload
        // as two versioned root terms back to back.
        let control = Term::Tuple(Tuple::from(vec![Term::from(2), atom("ok")]));
        let payload = Term::from(17);
        let mut buf = Vec::new();
        control.encode(&mut buf).unwrap();
        payload.encode(&mut buf).unwrap();

        let mut reader = &buf[..];
        assert_eq!(Term::decode(&mut reader).unwrap(), control);
        assert_eq!(Term::decode(&mut reader).unwrap(), payload);
        assert!(reader.is_empty());
    }

    #[test]
    fn list_with_explicit_nil_tail_decodes_proper() {
        // LIST arity 1, element 97 0, tail NIL: a proper singleton.
        let buf = [VERSION, 108, 0, 0, 0, 1, 97, 0, 106];
        assert_eq!(
            Term::decode(&buf[..]).unwrap(),
            Term::List(List::from(vec![Term::from(0)]))
        );

        // Same shape with an integer tail: improper.
        let buf = [VERSION, 108, 0, 0, 0, 1, 97, 0, 97, 9];
        assert!(matches!(
            Term::decode(&buf[..]).unwrap(),
            Term::ImproperList(_)
        ));
    }
}
