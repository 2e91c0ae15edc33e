/*!
CBOR encoder emitting the shortest-form representation of every item, as
required for canonical output by RFC 8949 section 4.2.

The [`Encoder`] builds a byte stream procedurally; the [`ToCbor`] trait makes
a type directly encodable so callers can write `encoder.emit(&value)` or use
the top-level [`emit`] helper.
*/

use core::ops::Range;

/// A type that can be written into an [`Encoder`].
pub trait ToCbor {
    fn to_cbor(&self, encoder: &mut Encoder);
}

/// Stateful CBOR stream builder.
#[derive(Default)]
pub struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the encoder and returns the encoded bytes.
    pub fn build(self) -> Vec<u8> {
        self.data
    }

    /// Current length of the encoded stream.
    #[inline]
    pub fn offset(&self) -> usize {
        self.data.len()
    }

    fn emit_uint_minor(&mut self, major: u8, val: u64) {
        if val < 24 {
            self.data.push((major << 5) | (val as u8));
        } else if val <= u8::MAX as u64 {
            self.data.push((major << 5) | 24);
            self.data.push(val as u8);
        } else if val <= u16::MAX as u64 {
            self.data.push((major << 5) | 25);
            self.data.extend((val as u16).to_be_bytes());
        } else if val <= u32::MAX as u64 {
            self.data.push((major << 5) | 26);
            self.data.extend((val as u32).to_be_bytes());
        } else {
            self.data.push((major << 5) | 27);
            self.data.extend(val.to_be_bytes());
        }
    }

    /// Encodes a value implementing [`ToCbor`].
    pub fn emit<T: ToCbor + ?Sized>(&mut self, value: &T) {
        value.to_cbor(self)
    }

    /// Emits a semantic tag that applies to the next item.
    pub fn emit_tag(&mut self, tag: u64) {
        self.emit_uint_minor(6, tag);
    }

    /// Emits a definite-length byte string, returning the range of the
    /// string's content bytes within the stream.
    pub fn emit_bytes<V: AsRef<[u8]> + ?Sized>(&mut self, value: &V) -> Range<usize> {
        let value = value.as_ref();
        self.emit_uint_minor(2, value.len() as u64);
        let start = self.offset();
        self.data.extend_from_slice(value);
        start..self.offset()
    }

    /// Emits a definite-length text string.
    pub fn emit_str<V: AsRef<str> + ?Sized>(&mut self, value: &V) {
        let value = value.as_ref().as_bytes();
        self.emit_uint_minor(3, value.len() as u64);
        self.data.extend_from_slice(value);
    }

    /// Appends pre-encoded CBOR verbatim, returning its range in the stream.
    pub fn emit_raw<V: AsRef<[u8]> + ?Sized>(&mut self, data: &V) -> Range<usize> {
        let start = self.offset();
        self.data.extend_from_slice(data.as_ref());
        start..self.offset()
    }

    /// Emits an array. `Some(n)` produces a definite-length array of `n`
    /// items; `None` an indefinite-length array terminated by a break byte.
    pub fn emit_array<F>(&mut self, count: Option<usize>, f: F)
    where
        F: FnOnce(&mut Encoder),
    {
        match count {
            Some(n) => {
                self.emit_uint_minor(4, n as u64);
                f(self);
            }
            None => {
                self.data.push(0x9F);
                f(self);
                self.data.push(0xFF);
            }
        }
    }

    /// Fallible variant of [`Encoder::emit_array`].
    pub fn try_emit_array<F, E>(&mut self, count: Option<usize>, f: F) -> Result<(), E>
    where
        F: FnOnce(&mut Encoder) -> Result<(), E>,
    {
        match count {
            Some(n) => {
                self.emit_uint_minor(4, n as u64);
                f(self)
            }
            None => {
                self.data.push(0x9F);
                f(self)?;
                self.data.push(0xFF);
                Ok(())
            }
        }
    }

    /// Emits a map of `n` key/value pairs; the closure must emit `2 * n`
    /// items in key, value order.
    pub fn emit_map<F>(&mut self, count: usize, f: F)
    where
        F: FnOnce(&mut Encoder),
    {
        self.emit_uint_minor(5, count as u64);
        f(self);
    }
}

/// Encodes a single value to a byte vector.
pub fn emit<T: ToCbor + ?Sized>(value: &T) -> Vec<u8> {
    let mut e = Encoder::new();
    e.emit(value);
    e.build()
}

/// Encodes an array built by the closure to a byte vector.
pub fn emit_array<F>(count: Option<usize>, f: F) -> Vec<u8>
where
    F: FnOnce(&mut Encoder),
{
    let mut e = Encoder::new();
    e.emit_array(count, f);
    e.build()
}

/// Wrapper that encodes the wrapped slice as a CBOR byte string.
pub struct Bytes<'a>(pub &'a [u8]);

impl ToCbor for Bytes<'_> {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_bytes(self.0);
    }
}

/// Wrapper that splices pre-encoded CBOR into the stream unmodified.
pub struct Raw<'a>(pub &'a [u8]);

impl ToCbor for Raw<'_> {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_raw(self.0);
    }
}

impl ToCbor for u64 {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_uint_minor(0, *self)
    }
}

impl ToCbor for u32 {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_uint_minor(0, *self as u64)
    }
}

impl ToCbor for u16 {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_uint_minor(0, *self as u64)
    }
}

impl ToCbor for u8 {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_uint_minor(0, *self as u64)
    }
}

impl ToCbor for usize {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_uint_minor(0, *self as u64)
    }
}

impl ToCbor for i64 {
    fn to_cbor(&self, encoder: &mut Encoder) {
        if *self >= 0 {
            encoder.emit_uint_minor(0, *self as u64)
        } else {
            encoder.emit_uint_minor(1, !(*self) as u64)
        }
    }
}

impl ToCbor for i32 {
    fn to_cbor(&self, encoder: &mut Encoder) {
        (*self as i64).to_cbor(encoder)
    }
}

impl ToCbor for bool {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.data.push(if *self { 0xF5 } else { 0xF4 });
    }
}

impl ToCbor for str {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_str(self)
    }
}

impl ToCbor for String {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_str(self)
    }
}

impl<T: ToCbor> ToCbor for Option<T> {
    fn to_cbor(&self, encoder: &mut Encoder) {
        match self {
            Some(value) => value.to_cbor(encoder),
            None => encoder.data.push(0xF6),
        }
    }
}

impl<T: ToCbor + ?Sized> ToCbor for &T {
    fn to_cbor(&self, encoder: &mut Encoder) {
        (*self).to_cbor(encoder)
    }
}

impl<T: ToCbor> ToCbor for [T] {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_array(Some(self.len()), |a| {
            for item in self {
                a.emit(item);
            }
        })
    }
}

impl<T: ToCbor> ToCbor for Vec<T> {
    fn to_cbor(&self, encoder: &mut Encoder) {
        self.as_slice().to_cbor(encoder)
    }
}

impl<A: ToCbor, B: ToCbor> ToCbor for (A, B) {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_array(Some(2), |a| {
            a.emit(&self.0);
            a.emit(&self.1);
        })
    }
}

impl<A: ToCbor, B: ToCbor, C: ToCbor> ToCbor for (A, B, C) {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_array(Some(3), |a| {
            a.emit(&self.0);
            a.emit(&self.1);
            a.emit(&self.2);
        })
    }
}

impl<A: ToCbor, B: ToCbor, C: ToCbor, D: ToCbor> ToCbor for (A, B, C, D) {
    fn to_cbor(&self, encoder: &mut Encoder) {
        encoder.emit_array(Some(4), |a| {
            a.emit(&self.0);
            a.emit(&self.1);
            a.emit(&self.2);
            a.emit(&self.3);
        })
    }
}
