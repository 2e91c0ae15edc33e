/*!
Streaming CBOR decoder over a borrowed byte slice.

Two entry points:

- [`parse`] / [`FromCbor`] turn a byte slice directly into a typed value,
  returning the number of bytes consumed so callers can decode CBOR
  sequences item by item.
- [`parse_value`] / [`parse_array`] hand a borrowed [`Value`] (or a stateful
  [`Array`] reader) to a closure, which avoids copying strings and byte
  strings out of the input.

Truncated input is reported as [`Error::NeedMoreData`] rather than a hard
failure, so a caller feeding data incrementally can distinguish "malformed"
from "keep reading". Nothing in this module panics on wire input.
*/

use core::{ops::Range, str::Utf8Error};
use half::f16;
use thiserror::Error;

const MAX_RECURSION: usize = 16;

#[derive(Error, Debug)]
pub enum Error {
    /// An encoded item requires more memory than is addressable.
    #[error("An encoded item requires more memory than available")]
    TooBig,

    /// More bytes are needed to decode the current item.
    #[error("Need at least {0} more bytes to decode value")]
    NeedMoreData(usize),

    /// A sequence has unread items where none were expected.
    #[error("Additional unread items in sequence")]
    AdditionalItems,

    /// An attempt was made to read past the end of a sequence.
    #[error("No more items in sequence")]
    NoMoreItems,

    /// Reserved minor-type value for the item's major type.
    #[error("Invalid minor-type value {0}")]
    InvalidMinorValue(u8),

    /// The item's type does not match what the caller expected.
    #[error("Incorrect type, expecting {0}, found {1}")]
    IncorrectType(String, String),

    /// An indefinite-length string contains a chunk of the wrong type.
    #[error("Chunked string contains an invalid chunk")]
    InvalidChunk,

    /// Unassigned or reserved simple value.
    #[error("Invalid simple type {0}")]
    InvalidSimpleType(u8),

    /// An indefinite-length map ends with a key but no value.
    #[error("Map has key but no value")]
    PartialMap,

    /// Nesting deeper than the decoder is willing to follow.
    #[error("Maximum recursion depth reached")]
    MaxRecursion,

    #[error(transparent)]
    InvalidUtf8(#[from] Utf8Error),

    #[error(transparent)]
    TryFromIntError(#[from] core::num::TryFromIntError),
}

/// A type decodable from the front of a CBOR byte slice.
///
/// On success returns the value and the number of bytes consumed.
pub trait FromCbor: Sized {
    type Error;

    fn from_cbor(data: &[u8]) -> Result<(Self, usize), Self::Error>;
}

/// A single decoded CBOR item, borrowing from the input.
pub enum Value<'a, 'b: 'a> {
    UnsignedInteger(u64),
    NegativeInteger(u64),
    Bytes(Range<usize>),
    ByteStream(Vec<Range<usize>>),
    Text(&'b str),
    TextStream(Vec<&'b str>),
    Array(&'a mut Array<'b>),
    Map(&'a mut Map<'b>),
    False,
    True,
    Null,
    Undefined,
    Simple(u8),
    Float(f64),
}

impl<'a, 'b: 'a> Value<'a, 'b> {
    /// Human-readable type name for error messages.
    pub fn type_name(&self) -> String {
        match self {
            Value::UnsignedInteger(_) => "Unsigned Integer".to_string(),
            Value::NegativeInteger(_) => "Negative Integer".to_string(),
            Value::Bytes(_) => "Byte String".to_string(),
            Value::ByteStream(_) => "Indefinite-length Byte String".to_string(),
            Value::Text(_) => "Text String".to_string(),
            Value::TextStream(_) => "Indefinite-length Text String".to_string(),
            Value::Array(_) => "Array".to_string(),
            Value::Map(_) => "Map".to_string(),
            Value::False => "False".to_string(),
            Value::True => "True".to_string(),
            Value::Null => "Null".to_string(),
            Value::Undefined => "Undefined".to_string(),
            Value::Simple(v) => format!("Simple Value {v}"),
            Value::Float(_) => "Float".to_string(),
        }
    }

    /// Consumes any content nested inside the value.
    pub fn skip(&mut self, max_recursion: usize) -> Result<(), Error> {
        match self {
            Value::Array(a) => {
                if max_recursion == 0 {
                    return Err(Error::MaxRecursion);
                }
                a.skip_to_end(max_recursion - 1)
            }
            Value::Map(m) => {
                if max_recursion == 0 {
                    return Err(Error::MaxRecursion);
                }
                m.0.skip_to_end(max_recursion - 1)
            }
            _ => Ok(()),
        }
    }
}

fn to_array<const N: usize>(data: &[u8]) -> Result<[u8; N], Error> {
    if data.len() < N {
        Err(Error::NeedMoreData(N - data.len()))
    } else {
        Ok(data[..N].try_into().unwrap())
    }
}

fn parse_uint_minor(minor: u8, data: &[u8]) -> Result<(u64, usize), Error> {
    match minor {
        val if val < 24 => Ok((val as u64, 0)),
        24 => match data.first() {
            Some(val) => Ok((*val as u64, 1)),
            None => Err(Error::NeedMoreData(1)),
        },
        25 => Ok((u16::from_be_bytes(to_array(data)?) as u64, 2)),
        26 => Ok((u32::from_be_bytes(to_array(data)?) as u64, 4)),
        27 => Ok((u64::from_be_bytes(to_array(data)?), 8)),
        _ => Err(Error::InvalidMinorValue(minor)),
    }
}

/// Parses a definite-length string header, returning the content range
/// relative to `data` and the total bytes consumed.
fn parse_data_minor(minor: u8, data: &[u8]) -> Result<(Range<usize>, usize), Error> {
    let (data_len, header_len) = parse_uint_minor(minor, data)?;
    let total = data_len
        .checked_add(header_len as u64)
        .filter(|total| *total <= usize::MAX as u64)
        .ok_or(Error::TooBig)? as usize;

    if total > data.len() {
        Err(Error::NeedMoreData(total - data.len()))
    } else {
        Ok((header_len..total, total))
    }
}

fn parse_data_chunked(major: u8, data: &[u8]) -> Result<(Vec<Range<usize>>, usize), Error> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while let Some(v) = data.get(offset) {
        offset += 1;

        if *v == 0xFF {
            return Ok((chunks, offset));
        }

        if v >> 5 != major || v & 0x1F == 31 {
            return Err(Error::InvalidChunk);
        }

        let (chunk, chunk_len) = parse_data_minor(v & 0x1F, &data[offset..])?;
        chunks.push(chunk.start + offset..chunk.end + offset);
        offset += chunk_len;
    }
    Err(Error::NeedMoreData(1))
}

fn parse_tags(data: &[u8]) -> Result<(Vec<u64>, usize), Error> {
    let mut tags = Vec::new();
    let mut offset = 0;
    while let Some(marker) = data.get(offset) {
        if marker >> 5 != 6 {
            break;
        }
        let (tag, len) = parse_uint_minor(marker & 0x1F, &data[offset + 1..])?;
        tags.push(tag);
        offset += 1 + len;
    }
    Ok((tags, offset))
}

/// Parses a single CBOR item from the front of `data`, passing it to `f`
/// along with any preceding semantic tags. Returns the closure's result and
/// the total bytes consumed.
pub fn parse_value<T, F, E>(data: &[u8], f: F) -> Result<(T, usize), E>
where
    F: FnOnce(Value, &[u64]) -> Result<T, E>,
    E: From<Error>,
{
    let (tags, mut offset) = parse_tags(data)?;
    let Some(marker) = data.get(offset) else {
        return Err(Error::NeedMoreData(1).into());
    };
    offset += 1;

    match (marker >> 5, marker & 0x1F) {
        (0, minor) => {
            let (v, len) = parse_uint_minor(minor, &data[offset..])?;
            offset += len;
            f(Value::UnsignedInteger(v), &tags)
        }
        (1, minor) => {
            let (v, len) = parse_uint_minor(minor, &data[offset..])?;
            offset += len;
            f(Value::NegativeInteger(v), &tags)
        }
        (2, 31) => {
            let (mut v, len) = parse_data_chunked(2, &data[offset..])?;
            for r in &mut v {
                r.start += offset;
                r.end += offset;
            }
            offset += len;
            f(Value::ByteStream(v), &tags)
        }
        (2, minor) => {
            let (r, len) = parse_data_minor(minor, &data[offset..])?;
            let r = r.start + offset..r.end + offset;
            offset += len;
            f(Value::Bytes(r), &tags)
        }
        (3, 31) => {
            let (v, len) = parse_data_chunked(3, &data[offset..])?;
            let mut texts = Vec::with_capacity(v.len());
            for r in v {
                texts.push(
                    core::str::from_utf8(&data[r.start + offset..r.end + offset])
                        .map_err(Error::from)?,
                );
            }
            offset += len;
            f(Value::TextStream(texts), &tags)
        }
        (3, minor) => {
            let (r, len) = parse_data_minor(minor, &data[offset..])?;
            let s = core::str::from_utf8(&data[r.start + offset..r.end + offset])
                .map_err(Error::from)?;
            offset += len;
            f(Value::Text(s), &tags)
        }
        (4, 31) => {
            let mut a = Array::new(data, None, offset);
            let r = f(Value::Array(&mut a), &tags)?;
            a.skip_to_end(MAX_RECURSION)?;
            offset = a.offset;
            Ok(r)
        }
        (4, minor) => {
            let (count, len) = parse_uint_minor(minor, &data[offset..])?;
            offset += len;
            let count = usize::try_from(count).map_err(|_| Error::TooBig)?;
            let mut a = Array::new(data, Some(count), offset);
            let r = f(Value::Array(&mut a), &tags)?;
            a.skip_to_end(MAX_RECURSION)?;
            offset = a.offset;
            Ok(r)
        }
        (5, 31) => {
            let mut m = Map(Array::new(data, None, offset));
            let r = f(Value::Map(&mut m), &tags)?;
            m.0.skip_to_end(MAX_RECURSION)?;
            offset = m.0.offset;
            Ok(r)
        }
        (5, minor) => {
            let (count, len) = parse_uint_minor(minor, &data[offset..])?;
            offset += len;
            let count = count
                .checked_mul(2)
                .and_then(|c| usize::try_from(c).ok())
                .ok_or(Error::TooBig)?;
            let mut m = Map(Array::new(data, Some(count), offset));
            let r = f(Value::Map(&mut m), &tags)?;
            m.0.skip_to_end(MAX_RECURSION)?;
            offset = m.0.offset;
            Ok(r)
        }
        (7, 20) => f(Value::False, &tags),
        (7, 21) => f(Value::True, &tags),
        (7, 22) => f(Value::Null, &tags),
        (7, 23) => f(Value::Undefined, &tags),
        (7, minor @ 0..=19) => f(Value::Simple(minor), &tags),
        (7, 24) => match data.get(offset) {
            Some(v) if *v > 31 => {
                offset += 1;
                f(Value::Simple(*v), &tags)
            }
            Some(v) => Err(Error::InvalidSimpleType(*v).into()),
            None => Err(Error::NeedMoreData(1).into()),
        },
        (7, 25) => {
            let v = f16::from_be_bytes(to_array(&data[offset..])?);
            offset += 2;
            f(Value::Float(v.into()), &tags)
        }
        (7, 26) => {
            let v = f32::from_be_bytes(to_array(&data[offset..])?);
            offset += 4;
            f(Value::Float(v as f64), &tags)
        }
        (7, 27) => {
            let v = f64::from_be_bytes(to_array(&data[offset..])?);
            offset += 8;
            f(Value::Float(v), &tags)
        }
        (7, minor) => Err(Error::InvalidSimpleType(minor).into()),
        _ => unreachable!(),
    }
    .map(|r| (r, offset))
}

/// A stateful reader over the items of a CBOR array (or, doubled, the
/// key/value items of a map).
pub struct Array<'a> {
    data: &'a [u8],
    count: Option<usize>,
    parsed: usize,
    offset: usize,
    /// For indefinite-length sequences: the break byte has been consumed.
    done: bool,
}

/// A map reader; items alternate key, value.
pub struct Map<'a>(Array<'a>);

impl<'a> Map<'a> {
    /// Number of key/value pairs, if the map is definite-length.
    pub fn count(&self) -> Option<usize> {
        self.0.count.map(|c| c / 2)
    }

    pub fn parse_value<T, F, E>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(Value, &[u64]) -> Result<T, E>,
        E: From<Error>,
    {
        self.0.parse_value(f)
    }

    pub fn at_end(&mut self) -> Result<bool, Error> {
        self.0.at_end()
    }
}

impl<'a> Array<'a> {
    fn new(data: &'a [u8], count: Option<usize>, offset: usize) -> Self {
        Self {
            data,
            count,
            parsed: 0,
            offset,
            done: false,
        }
    }

    /// `true` for a definite-length array.
    pub fn is_definite(&self) -> bool {
        self.count.is_some()
    }

    /// The declared item count, if definite-length.
    pub fn count(&self) -> Option<usize> {
        self.count
    }

    /// Offset of the next unparsed byte, relative to the slice the
    /// enclosing [`parse_value`] was given.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// `true` once every item has been read.
    pub fn at_end(&mut self) -> Result<bool, Error> {
        match self.count {
            Some(count) => Ok(self.parsed >= count),
            None if self.done => Ok(true),
            None => match self.data.get(self.offset) {
                Some(0xFF) => Ok(true),
                Some(_) => Ok(false),
                None => Err(Error::NeedMoreData(1)),
            },
        }
    }

    /// Parses the next item with a closure, like the top-level
    /// [`parse_value`].
    pub fn parse_value<T, F, E>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(Value, &[u64]) -> Result<T, E>,
        E: From<Error>,
    {
        if self.at_end()? {
            return Err(Error::NoMoreItems.into());
        }
        let (r, len) = parse_value(&self.data[self.offset..], f)?;
        self.offset += len;
        self.parsed += 1;
        Ok(r)
    }

    /// Parses the next item into a [`FromCbor`] type.
    pub fn parse<T>(&mut self) -> Result<T, T::Error>
    where
        T: FromCbor,
        T::Error: From<Error>,
    {
        if self.at_end().map_err(Into::<T::Error>::into)? {
            return Err(Error::NoMoreItems.into());
        }
        let (v, len) = T::from_cbor(&self.data[self.offset..])?;
        self.offset += len;
        self.parsed += 1;
        Ok(v)
    }

    /// Skips the next item, including any nested content.
    pub fn skip_value(&mut self) -> Result<(), Error> {
        self.parse_value(|mut value, _| value.skip(MAX_RECURSION))
    }

    /// Skips every remaining item (and the break byte of an
    /// indefinite-length array).
    pub fn skip_to_end(&mut self, max_recursion: usize) -> Result<(), Error> {
        match self.count {
            Some(count) => {
                while self.parsed < count {
                    self.parse_value(|mut value, _| value.skip(max_recursion))?;
                }
            }
            None => {
                while !self.done {
                    match self.data.get(self.offset) {
                        Some(0xFF) => {
                            self.offset += 1;
                            self.done = true;
                        }
                        Some(_) => {
                            self.parse_value(|mut value, _| value.skip(max_recursion))?;
                        }
                        None => return Err(Error::NeedMoreData(1)),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parses an array from the front of `data`, passing an [`Array`] reader to
/// `f`. Unread items are skipped after the closure returns; the result and
/// total bytes consumed (through the end of the array) are returned.
pub fn parse_array<T, F, E>(data: &[u8], f: F) -> Result<(T, usize), E>
where
    F: FnOnce(&mut Array, &[u64]) -> Result<T, E>,
    E: From<Error>,
{
    parse_value(data, |value, tags| match value {
        Value::Array(a) => f(a, tags),
        value => Err(Error::IncorrectType("Array".to_string(), value.type_name()).into()),
    })
}

/// Parses a single typed value from the front of `data`.
pub fn parse<T>(data: &[u8]) -> Result<(T, usize), T::Error>
where
    T: FromCbor,
{
    T::from_cbor(data)
}

/// Decodes a definite-length byte-string header, returning the declared
/// content length and the header size in bytes. The content itself need
/// not be present; this is how a streaming caller sizes a byte string
/// before deciding how to read its body.
pub fn parse_bytes_header(data: &[u8]) -> Result<(u64, usize), Error> {
    let Some(marker) = data.first() else {
        return Err(Error::NeedMoreData(1));
    };
    if marker >> 5 != 2 || marker & 0x1F == 31 {
        return Err(Error::IncorrectType(
            "Definite-length Byte String".to_string(),
            format!("major type {}", marker >> 5),
        ));
    }
    let (len, n) = parse_uint_minor(marker & 0x1F, &data[1..])?;
    Ok((len, 1 + n))
}

impl FromCbor for u64 {
    type Error = Error;

    fn from_cbor(data: &[u8]) -> Result<(Self, usize), Self::Error> {
        parse_value(data, |value, _| match value {
            Value::UnsignedInteger(v) => Ok(v),
            value => Err(Error::IncorrectType(
                "Unsigned Integer".to_string(),
                value.type_name(),
            )),
        })
    }
}

impl FromCbor for u32 {
    type Error = Error;

    fn from_cbor(data: &[u8]) -> Result<(Self, usize), Self::Error> {
        let (v, len) = u64::from_cbor(data)?;
        Ok((u32::try_from(v)?, len))
    }
}

impl FromCbor for u16 {
    type Error = Error;

    fn from_cbor(data: &[u8]) -> Result<(Self, usize), Self::Error> {
        let (v, len) = u64::from_cbor(data)?;
        Ok((u16::try_from(v)?, len))
    }
}

impl FromCbor for u8 {
    type Error = Error;

    fn from_cbor(data: &[u8]) -> Result<(Self, usize), Self::Error> {
        let (v, len) = u64::from_cbor(data)?;
        Ok((u8::try_from(v)?, len))
    }
}

impl FromCbor for usize {
    type Error = Error;

    fn from_cbor(data: &[u8]) -> Result<(Self, usize), Self::Error> {
        let (v, len) = u64::from_cbor(data)?;
        Ok((usize::try_from(v)?, len))
    }
}

impl FromCbor for bool {
    type Error = Error;

    fn from_cbor(data: &[u8]) -> Result<(Self, usize), Self::Error> {
        parse_value(data, |value, _| match value {
            Value::True => Ok(true),
            Value::False => Ok(false),
            value => Err(Error::IncorrectType(
                "Boolean".to_string(),
                value.type_name(),
            )),
        })
    }
}

impl FromCbor for String {
    type Error = Error;

    fn from_cbor(data: &[u8]) -> Result<(Self, usize), Self::Error> {
        parse_value(data, |value, _| match value {
            Value::Text(s) => Ok(s.to_string()),
            Value::TextStream(v) => Ok(v.concat()),
            value => Err(Error::IncorrectType(
                "Text String".to_string(),
                value.type_name(),
            )),
        })
    }
}

impl FromCbor for Box<[u8]> {
    type Error = Error;

    fn from_cbor(data: &[u8]) -> Result<(Self, usize), Self::Error> {
        parse_value(data, |value, _| match value {
            Value::Bytes(r) => Ok(data[r].into()),
            Value::ByteStream(v) => Ok(v
                .into_iter()
                .fold(Vec::new(), |mut acc, r| {
                    acc.extend_from_slice(&data[r]);
                    acc
                })
                .into()),
            value => Err(Error::IncorrectType(
                "Byte String".to_string(),
                value.type_name(),
            )),
        })
    }
}
