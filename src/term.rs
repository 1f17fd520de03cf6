//! Erlang terms.
//!
//! [`Term`] is a closed sum over every value that can travel between
//! distributed Erlang nodes. Each variant wraps a payload struct so that
//! control-message code can convert with `TryFrom`/`From` instead of
//! matching on the enum everywhere.
use num_bigint::BigInt;
use num_traits::ToPrimitive as _;

/// An Erlang term.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Term {
    Integer(Integer),
    Float(Float),
    Atom(Atom),
    Str(Str),
    Binary(Binary),
    BitString(BitString),
    Tuple(Tuple),
    List(List),
    ImproperList(ImproperList),
    Pid(Pid),
    Port(Port),
    Reference(Reference),
    InternalFun(InternalFun),
    ExternalFun(ExternalFun),
}

impl Term {
    /// Returns the boolean value if this term is the atom `true` or `false`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Atom(a) if a.name == "true" => Some(true),
            Self::Atom(a) if a.name == "false" => Some(false),
            _ => None,
        }
    }

    /// Computes a hash of this term.
    ///
    /// The hash is consistent with `==` and does not depend on process or
    /// host state, so it can be compared across runs. Structurally
    /// identical values of different variants hash differently (each
    /// variant seeds the mixer with its own constant).
    pub fn hash(&self) -> u32 {
        let mut mix = Mix::new(self.variant_seed());
        self.hash_into(&mut mix);
        mix.finish()
    }

    fn variant_seed(&self) -> u32 {
        match self {
            Self::Integer(_) => 1,
            Self::Float(_) => 2,
            Self::Atom(_) => 3,
            Self::Str(_) => 4,
            Self::Binary(_) => 5,
            Self::BitString(_) => 6,
            Self::Tuple(_) => 7,
            Self::List(_) => 8,
            Self::ImproperList(_) => 9,
            Self::Pid(_) => 10,
            Self::Port(_) => 11,
            Self::Reference(_) => 12,
            Self::InternalFun(_) => 13,
            Self::ExternalFun(_) => 14,
        }
    }

    fn hash_into(&self, mix: &mut Mix) {
        match self {
            Self::Integer(x) => match &x.0 {
                IntegerRepr::Small(v) => mix.update(&v.to_le_bytes()),
                IntegerRepr::Big(v) => mix.update(&v.to_signed_bytes_le()),
            },
            Self::Float(x) => mix.update(&x.value.to_bits().to_le_bytes()),
            Self::Atom(x) => mix.update(x.name.as_bytes()),
            Self::Str(x) => {
                for c in x.value.chars() {
                    mix.update(&(c as u32).to_le_bytes());
                }
            }
            Self::Binary(x) => mix.update(&x.bytes),
            Self::BitString(x) => {
                mix.update(x.bytes());
                mix.update(&[x.pad_bits()]);
            }
            Self::Tuple(x) => {
                for e in &x.elements {
                    mix.update(&e.hash().to_le_bytes());
                }
            }
            Self::List(x) => {
                for e in &x.elements {
                    mix.update(&e.hash().to_le_bytes());
                }
            }
            Self::ImproperList(x) => {
                for e in &x.elements {
                    mix.update(&e.hash().to_le_bytes());
                }
                mix.update(&x.last.hash().to_le_bytes());
            }
            Self::Pid(x) => {
                mix.update(x.node.name.as_bytes());
                mix.update(&x.id.to_le_bytes());
                mix.update(&x.serial.to_le_bytes());
                mix.update(&[x.creation]);
            }
            Self::Port(x) => {
                mix.update(x.node.name.as_bytes());
                mix.update(&x.id.to_le_bytes());
                mix.update(&[x.creation]);
            }
            Self::Reference(x) => {
                // Only the first id word participates so that the hash
                // stays consistent with the old/new cross-style equality.
                mix.update(x.node.name.as_bytes());
                mix.update(&[x.creation]);
                if let Some(id) = x.ids.first() {
                    mix.update(&id.to_le_bytes());
                }
            }
            Self::InternalFun(x) => match x {
                InternalFun::Old {
                    module,
                    pid,
                    index,
                    uniq,
                    ..
                } => {
                    mix.update(module.name.as_bytes());
                    mix.update(pid.node.name.as_bytes());
                    mix.update(&index.to_le_bytes());
                    mix.update(&uniq.to_le_bytes());
                }
                InternalFun::New {
                    module,
                    arity,
                    index,
                    uniq,
                    ..
                } => {
                    mix.update(module.name.as_bytes());
                    mix.update(&[*arity]);
                    mix.update(&index.to_le_bytes());
                    mix.update(uniq);
                }
            },
            Self::ExternalFun(x) => {
                mix.update(x.module.name.as_bytes());
                mix.update(x.function.name.as_bytes());
                mix.update(&[x.arity]);
            }
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Integer(x) => x.fmt(f),
            Self::Float(x) => x.fmt(f),
            Self::Atom(x) => x.fmt(f),
            Self::Str(x) => x.fmt(f),
            Self::Binary(x) => x.fmt(f),
            Self::BitString(x) => x.fmt(f),
            Self::Tuple(x) => x.fmt(f),
            Self::List(x) => x.fmt(f),
            Self::ImproperList(x) => x.fmt(f),
            Self::Pid(x) => x.fmt(f),
            Self::Port(x) => x.fmt(f),
            Self::Reference(x) => x.fmt(f),
            Self::InternalFun(x) => x.fmt(f),
            Self::ExternalFun(x) => x.fmt(f),
        }
    }
}

// Three-word Bob Jenkins style mixer.
struct Mix {
    a: u32,
    b: u32,
    c: u32,
    queued: Vec<u8>,
}

impl Mix {
    const GOLDEN: u32 = 0x9e37_79b9;

    fn new(seed: u32) -> Self {
        Self {
            a: Self::GOLDEN,
            b: Self::GOLDEN,
            c: seed,
            queued: Vec::new(),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        self.queued.extend_from_slice(bytes);
        while self.queued.len() >= 12 {
            let block: Vec<u8> = self.queued.drain(..12).collect();
            self.absorb(&block);
            self.scramble();
        }
    }

    fn absorb(&mut self, block: &[u8]) {
        self.a = self
            .a
            .wrapping_add(u32::from_le_bytes([block[0], block[1], block[2], block[3]]));
        self.b = self
            .b
            .wrapping_add(u32::from_le_bytes([block[4], block[5], block[6], block[7]]));
        self.c = self.c.wrapping_add(u32::from_le_bytes([
            block[8], block[9], block[10], block[11],
        ]));
    }

    fn scramble(&mut self) {
        self.a = self.a.wrapping_sub(self.b).wrapping_sub(self.c) ^ (self.c >> 13);
        self.b = self.b.wrapping_sub(self.c).wrapping_sub(self.a) ^ (self.a << 8);
        self.c = self.c.wrapping_sub(self.a).wrapping_sub(self.b) ^ (self.b >> 13);
        self.a = self.a.wrapping_sub(self.b).wrapping_sub(self.c) ^ (self.c >> 12);
        self.b = self.b.wrapping_sub(self.c).wrapping_sub(self.a) ^ (self.a << 16);
        self.c = self.c.wrapping_sub(self.a).wrapping_sub(self.b) ^ (self.b >> 5);
        self.a = self.a.wrapping_sub(self.b).wrapping_sub(self.c) ^ (self.c >> 3);
        self.b = self.b.wrapping_sub(self.c).wrapping_sub(self.a) ^ (self.a << 10);
        self.c = self.c.wrapping_sub(self.a).wrapping_sub(self.b) ^ (self.b >> 15);
    }

    fn finish(mut self) -> u32 {
        let mut tail = std::mem::take(&mut self.queued);
        let len = tail.len() as u32;
        tail.resize(12, 0);
        self.absorb(&tail);
        self.c = self.c.wrapping_add(len);
        self.scramble();
        self.c
    }
}

/// Error raised when an integer term does not fit the requested width.
#[derive(Debug, Clone, thiserror::Error)]
#[error("integer {value} is out of range for the requested type")]
pub struct RangeError {
    /// The offending value.
    pub value: BigInt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum IntegerRepr {
    Small(i64),
    Big(BigInt),
}

/// Signed arbitrary-precision integer.
///
/// Values that fit 64 bits are kept unboxed; construction normalizes, so
/// equality is structural regardless of how a value was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integer(IntegerRepr);

impl Integer {
    /// `true` if the value currently fits a signed 64-bit word.
    pub fn fits_i64(&self) -> bool {
        matches!(self.0, IntegerRepr::Small(_))
    }

    /// Converts to `i64`.
    pub fn to_i64(&self) -> Result<i64, RangeError> {
        match &self.0 {
            IntegerRepr::Small(v) => Ok(*v),
            IntegerRepr::Big(v) => v.to_i64().ok_or_else(|| RangeError { value: v.clone() }),
        }
    }

    /// Converts to `i32`.
    pub fn to_i32(&self) -> Result<i32, RangeError> {
        let v = self.to_i64()?;
        i32::try_from(v).map_err(|_| RangeError {
            value: BigInt::from(v),
        })
    }

    /// Converts to `u32`.
    pub fn to_u32(&self) -> Result<u32, RangeError> {
        let v = self.to_i64()?;
        u32::try_from(v).map_err(|_| RangeError {
            value: BigInt::from(v),
        })
    }

    /// Converts to `u64`.
    pub fn to_u64(&self) -> Result<u64, RangeError> {
        match &self.0 {
            IntegerRepr::Small(v) => u64::try_from(*v).map_err(|_| RangeError {
                value: BigInt::from(*v),
            }),
            IntegerRepr::Big(v) => v.to_u64().ok_or_else(|| RangeError { value: v.clone() }),
        }
    }

    /// The value widened to a bignum.
    pub fn to_bigint(&self) -> BigInt {
        match &self.0 {
            IntegerRepr::Small(v) => BigInt::from(*v),
            IntegerRepr::Big(v) => v.clone(),
        }
    }
}

impl From<i64> for Integer {
    fn from(v: i64) -> Self {
        Self(IntegerRepr::Small(v))
    }
}

impl From<i32> for Integer {
    fn from(v: i32) -> Self {
        Self::from(i64::from(v))
    }
}

impl From<u8> for Integer {
    fn from(v: u8) -> Self {
        Self::from(i64::from(v))
    }
}

impl From<u32> for Integer {
    fn from(v: u32) -> Self {
        Self::from(i64::from(v))
    }
}

impl From<u64> for Integer {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(v) => Self::from(v),
            Err(_) => Self(IntegerRepr::Big(BigInt::from(v))),
        }
    }
}

impl From<BigInt> for Integer {
    fn from(v: BigInt) -> Self {
        match v.to_i64() {
            Some(small) => Self(IntegerRepr::Small(small)),
            None => Self(IntegerRepr::Big(v)),
        }
    }
}

impl std::fmt::Display for Integer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.0 {
            IntegerRepr::Small(v) => write!(f, "{}", v),
            IntegerRepr::Big(v) => write!(f, "{}", v),
        }
    }
}

/// IEEE-754 double precision float.
#[derive(Debug, Clone, PartialEq)]
pub struct Float {
    /// The value.
    pub value: f64,
}

impl From<f64> for Float {
    fn from(value: f64) -> Self {
        Self { value }
    }
}

impl std::fmt::Display for Float {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Symbolic constant.
///
/// The codec restricts atoms to ISO-8859-1 with at most 255 characters;
/// longer or non-Latin-1 names are rejected at encode time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Atom {
    /// The name.
    pub name: String,
}

impl From<&str> for Atom {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

impl From<String> for Atom {
    fn from(name: String) -> Self {
        Self { name }
    }
}

impl From<bool> for Atom {
    fn from(v: bool) -> Self {
        if v {
            Self::from("true")
        } else {
            Self::from("false")
        }
    }
}

impl std::fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "'{}'", self.name)
    }
}

/// Unicode string.
///
/// Distinct from a list of integers: equality never crosses the two even
/// when they spell the same text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Str {
    /// The code points.
    pub value: String,
}

impl From<&str> for Str {
    fn from(value: &str) -> Self {
        Self {
            value: value.to_owned(),
        }
    }
}

impl From<String> for Str {
    fn from(value: String) -> Self {
        Self { value }
    }
}

impl std::fmt::Display for Str {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

/// Byte sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binary {
    /// The bytes.
    pub bytes: Vec<u8>,
}

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl From<&[u8]> for Binary {
    fn from(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }
}

impl std::fmt::Display for Binary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "<<{} bytes>>", self.bytes.len())
    }
}

/// Error raised by [`BitString::new`].
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum BitStringError {
    #[error("pad_bits must be in 0..=7, but got {pad_bits}")]
    PadBitsOutOfRange { pad_bits: u8 },

    #[error("a bitstring with pad bits cannot be empty")]
    EmptyWithPadding,
}

/// Byte sequence whose last byte has `pad_bits` unused low-order bits.
///
/// Unused bits are always zero; the constructor masks them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BitString {
    bytes: Vec<u8>,
    pad_bits: u8,
}

impl BitString {
    /// Makes a new [`BitString`].
    pub fn new(mut bytes: Vec<u8>, pad_bits: u8) -> Result<Self, BitStringError> {
        if pad_bits > 7 {
            return Err(BitStringError::PadBitsOutOfRange { pad_bits });
        }
        if pad_bits != 0 && bytes.is_empty() {
            return Err(BitStringError::EmptyWithPadding);
        }
        if pad_bits != 0 {
            if let Some(last) = bytes.last_mut() {
                *last &= 0xffu8 << pad_bits;
            }
        }
        Ok(Self { bytes, pad_bits })
    }

    /// The bytes, including the padded last byte.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of unused low-order bits in the last byte.
    pub fn pad_bits(&self) -> u8 {
        self.pad_bits
    }

    /// Total number of valid bits.
    pub fn bit_len(&self) -> usize {
        self.bytes.len() * 8 - usize::from(self.pad_bits)
    }
}

impl std::fmt::Display for BitString {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "<<{} bits>>", self.bit_len())
    }
}

/// Fixed-arity ordered sequence of terms.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    /// The elements.
    pub elements: Vec<Term>,
}

impl Tuple {
    /// Makes a zero-arity tuple.
    pub fn nil() -> Self {
        Self {
            elements: Vec::new(),
        }
    }
}

impl From<Vec<Term>> for Tuple {
    fn from(elements: Vec<Term>) -> Self {
        Self { elements }
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, e) in self.elements.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, "}}")
    }
}

/// Proper list (the tail is always nil).
#[derive(Debug, Clone, PartialEq)]
pub struct List {
    /// The elements.
    pub elements: Vec<Term>,
}

impl List {
    /// Makes an empty list.
    pub fn nil() -> Self {
        Self {
            elements: Vec::new(),
        }
    }

    /// `true` if this is the empty list.
    pub fn is_nil(&self) -> bool {
        self.elements.is_empty()
    }

    /// A borrowed view of the list after dropping the first `n` elements.
    ///
    /// Returns `None` when `n` exceeds the length. `nth_tail(len)` is the
    /// empty view, matching the nil tail of a proper list.
    pub fn nth_tail(&self, n: usize) -> Option<&[Term]> {
        self.elements.get(n..)
    }
}

impl From<Vec<Term>> for List {
    fn from(elements: Vec<Term>) -> Self {
        Self { elements }
    }
}

impl std::fmt::Display for List {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, e) in self.elements.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, "]")
    }
}

/// Improper list: at least one element and a non-nil tail.
#[derive(Debug, Clone, PartialEq)]
pub struct ImproperList {
    /// The elements before the tail.
    pub elements: Vec<Term>,

    /// The tail term.
    pub last: Box<Term>,
}

impl std::fmt::Display for ImproperList {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, e) in self.elements.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, "|{}]", self.last)
    }
}

/// Process identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pid {
    /// Name of the owning node.
    pub node: Atom,

    /// Process number (15 bits on the wire).
    pub id: u32,

    /// Overflow counter for `id` (13 bits on the wire).
    pub serial: u32,

    /// Node incarnation (2 bits on the wire).
    pub creation: u8,
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#Pid<{}.{}.{}>", self.node.name, self.id, self.serial)
    }
}

/// Port identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Port {
    /// Name of the owning node.
    pub node: Atom,

    /// Port number (28 bits on the wire).
    pub id: u32,

    /// Node incarnation (2 bits on the wire).
    pub creation: u8,
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#Port<{}.{}>", self.node.name, self.id)
    }
}

/// Unique token scoped to a node.
///
/// Old-style references carry one id word, new-style ones carry three.
/// The first id word is limited to 18 bits on the wire.
#[derive(Debug, Clone)]
pub struct Reference {
    /// Name of the owning node.
    pub node: Atom,

    /// Node incarnation (2 bits on the wire).
    pub creation: u8,

    /// One to three id words.
    pub ids: Vec<u32>,
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        if self.node != other.node || self.creation != other.creation {
            return false;
        }
        // A new-style ref compares all id words against another new-style
        // ref; against an old-style ref only the first word counts.
        if self.ids.len() > 1 && other.ids.len() > 1 {
            self.ids == other.ids
        } else {
            self.ids.first() == other.ids.first()
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#Ref<{}", self.node.name)?;
        for id in &self.ids {
            write!(f, ".{}", id)?;
        }
        write!(f, ">")
    }
}

/// Fun defined inside a node.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum InternalFun {
    /// Old-style fun.
    Old {
        module: Atom,
        pid: Pid,
        free_vars: Vec<Term>,
        index: i32,
        uniq: i32,
    },

    /// New-style fun carrying arity and an MD5 of the significant parts.
    New {
        module: Atom,
        arity: u8,
        pid: Pid,
        free_vars: Vec<Term>,
        index: u32,
        uniq: [u8; 16],
        old_index: u32,
        old_uniq: u32,
    },
}

impl std::fmt::Display for InternalFun {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Old { module, index, .. } => write!(f, "#Fun<{}.{}>", module.name, index),
            Self::New {
                module,
                index,
                arity,
                ..
            } => write!(f, "#Fun<{}.{}.{}>", module.name, index, arity),
        }
    }
}

/// `fun M:F/A`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalFun {
    /// Module name.
    pub module: Atom,

    /// Function name.
    pub function: Atom,

    /// Arity.
    pub arity: u8,
}

impl std::fmt::Display for ExternalFun {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "fun {}:{}/{}",
            self.module.name, self.function.name, self.arity
        )
    }
}

macro_rules! impl_term_conv {
    ($variant:ident) => {
        impl From<$variant> for Term {
            fn from(v: $variant) -> Self {
                Term::$variant(v)
            }
        }

        impl TryFrom<Term> for $variant {
            type Error = Term;

            fn try_from(term: Term) -> Result<Self, Self::Error> {
                if let Term::$variant(v) = term {
                    Ok(v)
                } else {
                    Err(term)
                }
            }
        }
    };
}

impl_term_conv!(Integer);
impl_term_conv!(Float);
impl_term_conv!(Atom);
impl_term_conv!(Str);
impl_term_conv!(Binary);
impl_term_conv!(BitString);
impl_term_conv!(Tuple);
impl_term_conv!(List);
impl_term_conv!(ImproperList);
impl_term_conv!(Pid);
impl_term_conv!(Port);
impl_term_conv!(Reference);
impl_term_conv!(InternalFun);
impl_term_conv!(ExternalFun);

impl From<i64> for Term {
    fn from(v: i64) -> Self {
        Self::Integer(Integer::from(v))
    }
}

impl From<i32> for Term {
    fn from(v: i32) -> Self {
        Self::Integer(Integer::from(v))
    }
}

impl From<u32> for Term {
    fn from(v: u32) -> Self {
        Self::Integer(Integer::from(v))
    }
}

impl From<BigInt> for Term {
    fn from(v: BigInt) -> Self {
        Self::Integer(Integer::from(v))
    }
}

impl From<f64> for Term {
    fn from(v: f64) -> Self {
        Self::Float(Float::from(v))
    }
}

impl From<bool> for Term {
    fn from(v: bool) -> Self {
        Self::Atom(Atom::from(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Term {
        Term::from(v)
    }

    #[test]
    fn integer_normalizes_across_constructors() {
        let small = Integer::from(42i64);
        let via_big = Integer::from(BigInt::from(42));
        assert_eq!(small, via_big);
        assert!(via_big.fits_i64());

        let big = Integer::from(BigInt::from(u64::MAX) * 4u8);
        assert!(!big.fits_i64());
        assert!(big.to_i64().is_err());
    }

    #[test]
    fn string_never_equals_list_of_code_points() {
        let s = Term::Str(Str::from("hi"));
        let l = Term::List(List::from(vec![int(104), int(105)]));
        assert_ne!(s, l);
        assert_ne!(s.hash(), l.hash());
    }

    #[test]
    fn ref_equality_crosses_styles_on_first_id() {
        let node = Atom::from("n@h");
        let old = Reference {
            node: node.clone(),
            creation: 1,
            ids: vec![7],
        };
        let new_a = Reference {
            node: node.clone(),
            creation: 1,
            ids: vec![7, 8, 9],
        };
        let new_b = Reference {
            node: node.clone(),
            creation: 1,
            ids: vec![7, 0, 0],
        };
        assert_eq!(old, new_a);
        assert_eq!(old, new_b);
        assert_ne!(new_a, new_b);
        assert_eq!(Term::Reference(old).hash(), Term::Reference(new_a).hash());
    }

    #[test]
    fn bitstring_masks_unused_bits() {
        let b = BitString::new(vec![0xff, 0xff], 3).unwrap();
        assert_eq!(b.bytes(), &[0xff, 0xf8]);
        assert_eq!(b.bit_len(), 13);

        assert!(matches!(
            BitString::new(vec![], 1),
            Err(BitStringError::EmptyWithPadding)
        ));
        assert!(matches!(
            BitString::new(vec![1], 8),
            Err(BitStringError::PadBitsOutOfRange { pad_bits: 8 })
        ));
    }

    #[test]
    fn nth_tail_is_a_view() {
        let l = List::from(vec![int(1), int(2), int(3)]);
        assert_eq!(l.nth_tail(0).unwrap().len(), 3);
        assert_eq!(l.nth_tail(2).unwrap(), &[int(3)][..]);
        assert_eq!(l.nth_tail(3).unwrap(), &[][..]);
        assert!(l.nth_tail(4).is_none());
    }

    #[test]
    fn variant_seeds_separate_hashes() {
        let bin = Term::Binary(Binary::from(vec![1, 2, 3]));
        let bits = Term::BitString(BitString::new(vec![1, 2, 3], 0).unwrap());
        assert_ne!(bin.hash(), bits.hash());

        // Same term hashes identically on every call.
        assert_eq!(bin.hash(), bin.hash());
    }

    #[test]
    fn bool_atoms() {
        assert_eq!(Term::from(true).as_bool(), Some(true));
        assert_eq!(Term::from(false).as_bool(), Some(false));
        assert_eq!(Term::Atom(Atom::from("ok")).as_bool(), None);
    }
}
