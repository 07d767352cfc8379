use std::{
    any::Any,
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    hash::{BuildHasher, Hash},
    sync::Arc,
};

use crate::error::{Error, ErrorKind, Result};

/// Opaque context object threaded through every [`Writer`] and [`Reader`] a
/// connection creates.
///
/// The codec never touches the state; it exists as a side channel for
/// hand-written [`Encode`]/[`Decode`] impls that need contextual information
/// (an interning table, a handle registry). Hooks reach it through
/// [`Writer::state`] / [`Reader::state`] and downcast to their concrete type.
pub type SerializerState = Arc<dyn Any + Send + Sync>;

/// Serialization into the wire format.
///
/// Implementing this trait by hand is the extensibility hook: the impl may
/// use any of the writer's stream operations and consult the attached state,
/// and must stay symmetric with the type's [`Decode`] impl (same bytes, same
/// order).
pub trait Encode {
    fn encode(&self, w: &mut Writer);
}

/// Deserialization from the wire format.
///
/// Every read is fallible: short input, invalid tags and malformed payloads
/// surface as [`ErrorKind::DecodeFailed`] rather than panicking.
pub trait Decode: Sized {
    /// # Errors
    fn decode(r: &mut Reader<'_>) -> Result<Self>;
}

/// Byte sink for the wire format, wrapping a growable buffer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
    state: Option<SerializerState>,
}

impl Writer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_state(state: Option<SerializerState>) -> Self {
        Self { buf: Vec::new(), state }
    }

    /// Downcasts the attached serializer state, if any.
    #[must_use]
    pub fn state<S: 'static>(&self) -> Option<&S> {
        self.state.as_ref().and_then(|s| s.as_ref().downcast_ref())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Stream-style write, chainable: `w.write(&a).write(&b)`.
    pub fn write<T: Encode + ?Sized>(&mut self, val: &T) -> &mut Self {
        val.encode(self);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.buf
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").field("len", &self.buf.len()).finish()
    }
}

/// Byte-range cursor over a received payload.
pub struct Reader<'a> {
    rest: &'a [u8],
    state: Option<&'a SerializerState>,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { rest: data, state: None }
    }

    #[must_use]
    pub fn with_state(data: &'a [u8], state: Option<&'a SerializerState>) -> Self {
        Self { rest: data, state }
    }

    /// Downcasts the attached serializer state, if any. The reference is
    /// independent of the reader, so a hook may hold it across reads.
    #[must_use]
    pub fn state<S: 'static>(&self) -> Option<&'a S> {
        self.state.and_then(|s| s.as_ref().downcast_ref())
    }

    /// Consumes exactly `count` bytes.
    ///
    /// # Errors
    pub fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.rest.len() {
            return Err(Error::new(
                ErrorKind::DecodeFailed,
                format!("input too short: need {count} bytes, {} left", self.rest.len()),
            ));
        }
        let (head, tail) = self.rest.split_at(count);
        self.rest = tail;
        Ok(head)
    }

    /// # Errors
    pub fn read<T: Decode>(&mut self) -> Result<T> {
        T::decode(self)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}

impl std::fmt::Debug for Reader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader").field("remaining", &self.rest.len()).finish()
    }
}

fn read_len(r: &mut Reader<'_>) -> Result<usize> {
    Ok(u32::decode(r)? as usize)
}

fn write_len(w: &mut Writer, len: usize) {
    debug_assert!(len <= u32::MAX as usize);
    (len as u32).encode(w);
}

// Fixed-width integers and floats are plain little-endian byte copies.
macro_rules! impl_scalar {
    ($($t:ty),* $(,)?) => {$(
        impl Encode for $t {
            fn encode(&self, w: &mut Writer) {
                w.put_bytes(&self.to_le_bytes());
            }
        }

        impl Decode for $t {
            fn decode(r: &mut Reader<'_>) -> Result<Self> {
                let bytes = r.take(size_of::<$t>())?;
                Ok(<$t>::from_le_bytes(bytes.try_into().unwrap()))
            }
        }
    )*};
}

impl_scalar!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl Encode for bool {
    fn encode(&self, w: &mut Writer) {
        w.put_bytes(&[u8::from(*self)]);
    }
}

impl Decode for bool {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        match u8::decode(r)? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(Error::new(ErrorKind::DecodeFailed, format!("invalid bool byte: {v}"))),
        }
    }
}

impl Encode for char {
    fn encode(&self, w: &mut Writer) {
        (*self as u32).encode(w);
    }
}

impl Decode for char {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let v = u32::decode(r)?;
        char::from_u32(v)
            .ok_or_else(|| Error::new(ErrorKind::DecodeFailed, format!("invalid char scalar: {v}")))
    }
}

impl Encode for str {
    fn encode(&self, w: &mut Writer) {
        write_len(w, self.len());
        w.put_bytes(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(&self, w: &mut Writer) {
        self.as_str().encode(w);
    }
}

impl Decode for String {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let len = read_len(r)?;
        let bytes = r.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::new(ErrorKind::DecodeFailed, e.to_string()))
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, w: &mut Writer) {
        (**self).encode(w);
    }
}

impl<T: Encode> Encode for Box<T> {
    fn encode(&self, w: &mut Writer) {
        (**self).encode(w);
    }
}

impl<T: Decode> Decode for Box<T> {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Box::new(T::decode(r)?))
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, w: &mut Writer) {
        write_len(w, self.len());
        for item in self {
            item.encode(w);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, w: &mut Writer) {
        write_len(w, self.len());
        for item in self {
            item.encode(w);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let count = read_len(r)?;
        // A corrupt count must not drive preallocation past the input size.
        let mut out = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for VecDeque<T> {
    fn encode(&self, w: &mut Writer) {
        write_len(w, self.len());
        for item in self {
            item.encode(w);
        }
    }
}

impl<T: Decode> Decode for VecDeque<T> {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Vec::<T>::decode(r)?.into())
    }
}

impl<T: Encode, const N: usize> Encode for [T; N] {
    fn encode(&self, w: &mut Writer) {
        for item in self {
            item.encode(w);
        }
    }
}

impl<T: Decode, const N: usize> Decode for [T; N] {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let mut out = Vec::with_capacity(N);
        for _ in 0..N {
            out.push(T::decode(r)?);
        }
        out.try_into()
            .map_err(|_| Error::kind(ErrorKind::DecodeFailed))
    }
}

impl<K: Encode, V: Encode, S> Encode for HashMap<K, V, S> {
    fn encode(&self, w: &mut Writer) {
        write_len(w, self.len());
        for (k, v) in self {
            k.encode(w);
            v.encode(w);
        }
    }
}

impl<K, V, S> Decode for HashMap<K, V, S>
where
    K: Decode + Eq + Hash,
    V: Decode,
    S: BuildHasher + Default,
{
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let count = read_len(r)?;
        let mut out = Self::with_capacity_and_hasher(count.min(r.remaining()), S::default());
        for _ in 0..count {
            let k = K::decode(r)?;
            let v = V::decode(r)?;
            out.insert(k, v);
        }
        Ok(out)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(&self, w: &mut Writer) {
        write_len(w, self.len());
        for (k, v) in self {
            k.encode(w);
            v.encode(w);
        }
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let count = read_len(r)?;
        let mut out = Self::new();
        for _ in 0..count {
            let k = K::decode(r)?;
            let v = V::decode(r)?;
            out.insert(k, v);
        }
        Ok(out)
    }
}

impl<T: Encode, S> Encode for HashSet<T, S> {
    fn encode(&self, w: &mut Writer) {
        write_len(w, self.len());
        for item in self {
            item.encode(w);
        }
    }
}

impl<T, S> Decode for HashSet<T, S>
where
    T: Decode + Eq + Hash,
    S: BuildHasher + Default,
{
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let count = read_len(r)?;
        let mut out = Self::with_capacity_and_hasher(count.min(r.remaining()), S::default());
        for _ in 0..count {
            out.insert(T::decode(r)?);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for BTreeSet<T> {
    fn encode(&self, w: &mut Writer) {
        write_len(w, self.len());
        for item in self {
            item.encode(w);
        }
    }
}

impl<T: Decode + Ord> Decode for BTreeSet<T> {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let count = read_len(r)?;
        let mut out = Self::new();
        for _ in 0..count {
            out.insert(T::decode(r)?);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, w: &mut Writer) {
        match self {
            Some(val) => {
                true.encode(w);
                val.encode(w);
            }
            None => false.encode(w),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        if bool::decode(r)? {
            Ok(Some(T::decode(r)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Encode, E: Encode> Encode for std::result::Result<T, E> {
    fn encode(&self, w: &mut Writer) {
        match self {
            Ok(val) => {
                true.encode(w);
                val.encode(w);
            }
            Err(err) => {
                false.encode(w);
                err.encode(w);
            }
        }
    }
}

impl<T: Decode, E: Decode> Decode for std::result::Result<T, E> {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        if bool::decode(r)? {
            Ok(Ok(T::decode(r)?))
        } else {
            Ok(Err(E::decode(r)?))
        }
    }
}

impl Encode for () {
    fn encode(&self, _w: &mut Writer) {}
}

impl Decode for () {
    fn decode(_r: &mut Reader<'_>) -> Result<Self> {
        Ok(())
    }
}

// Tuples encode their fields in declaration order, up to the interface
// parameter limit.
macro_rules! impl_tuple {
    ($(($($t:ident . $idx:tt),+))*) => {$(
        impl<$($t: Encode),+> Encode for ($($t,)+) {
            fn encode(&self, w: &mut Writer) {
                $(self.$idx.encode(w);)+
            }
        }

        impl<$($t: Decode),+> Decode for ($($t,)+) {
            fn decode(r: &mut Reader<'_>) -> Result<Self> {
                Ok(($($t::decode(r)?,)+))
            }
        }
    )*};
}

impl_tuple! {
    (A.0)
    (A.0, B.1)
    (A.0, B.1, C.2)
    (A.0, B.1, C.2, D.3)
    (A.0, B.1, C.2, D.3, E.4)
    (A.0, B.1, C.2, D.3, E.4, F.5)
    (A.0, B.1, C.2, D.3, E.4, F.5, G.6)
    (A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7)
    (A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, I.8)
    (A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, I.8, J.9)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Encode + Decode + PartialEq + std::fmt::Debug>(val: T) {
        let mut w = Writer::new();
        val.encode(&mut w);
        let payload = w.into_payload();
        let mut r = Reader::new(&payload);
        assert_eq!(T::decode(&mut r).unwrap(), val);
        assert_eq!(r.remaining(), 0, "trailing bytes after {val:?}");
    }

    #[test]
    fn test_scalars_round_trip() {
        round_trip(0u8);
        round_trip(u8::MAX);
        round_trip(-1i8);
        round_trip(0x1234u16);
        round_trip(-956i32);
        round_trip(u32::MAX);
        round_trip(i64::MIN);
        round_trip(u128::MAX);
        round_trip(3.5f32);
        round_trip(-0.125f64);
        round_trip(true);
        round_trip(false);
        round_trip('δ');
    }

    #[test]
    fn test_scalars_are_little_endian() {
        let mut w = Writer::new();
        0x0102_0304u32.encode(&mut w);
        assert_eq!(w.into_payload(), [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_strings_round_trip() {
        round_trip(String::new());
        round_trip("Hello World!".to_string());
        round_trip("δ ε ζ".to_string());

        // Borrowed views encode identically to their owned form.
        let mut w = Writer::new();
        "abc".encode(&mut w);
        let payload = w.into_payload();
        assert_eq!(payload, [3, 0, 0, 0, b'a', b'b', b'c']);
        let mut r = Reader::new(&payload);
        assert_eq!(String::decode(&mut r).unwrap(), "abc");
    }

    #[test]
    fn test_sequences_round_trip() {
        round_trip(Vec::<i32>::new());
        round_trip(vec![17i32, 42, 33, -956]);
        round_trip(vec!["a".to_string(), String::new()]);
        round_trip(VecDeque::from([1u16, 2, 3]));
        round_trip([7i64, 8, 9]);
    }

    #[test]
    fn test_associative_round_trip() {
        let mut map = HashMap::new();
        map.insert("one".to_string(), 1i32);
        map.insert("two".to_string(), 2);
        round_trip(map);

        round_trip(BTreeMap::from([(1u8, "x".to_string()), (2, "y".to_string())]));
        round_trip(HashSet::from([1u64, 2, 3]));
        round_trip(BTreeSet::from(["a".to_string(), "b".to_string()]));
        round_trip(HashMap::<String, u32>::new());
    }

    #[test]
    fn test_sum_types_round_trip() {
        round_trip(Option::<i32>::None);
        round_trip(Some(42i32));
        round_trip(std::result::Result::<i32, String>::Ok(7));
        round_trip(std::result::Result::<i32, String>::Err("nope".to_string()));
    }

    #[test]
    fn test_tuples_round_trip() {
        round_trip((1u8,));
        round_trip((17i32, 42i32));
        round_trip((1u8, "pair".to_string()));
        round_trip((1u8, 2u16, 3u32, 4u64, 5i8, 6i16, 7i32, 8i64, 9.0f32, true));
        round_trip(());
    }

    #[test]
    fn test_short_input_is_an_error() {
        let mut r = Reader::new(&[1, 2]);
        assert_eq!(u32::decode(&mut r).unwrap_err().kind, ErrorKind::DecodeFailed);

        // Length prefix promising more than the input holds.
        let mut w = Writer::new();
        1000u32.encode(&mut w);
        w.put_bytes(&[1, 2, 3]);
        let payload = w.into_payload();
        let mut r = Reader::new(&payload);
        assert_eq!(Vec::<u8>::decode(&mut r).unwrap_err().kind, ErrorKind::DecodeFailed);
    }

    #[test]
    fn test_invalid_bytes_are_errors() {
        let mut r = Reader::new(&[2]);
        assert_eq!(bool::decode(&mut r).unwrap_err().kind, ErrorKind::DecodeFailed);

        let mut w = Writer::new();
        0xD800u32.encode(&mut w); // surrogate, not a char
        let payload = w.into_payload();
        let mut r = Reader::new(&payload);
        assert_eq!(char::decode(&mut r).unwrap_err().kind, ErrorKind::DecodeFailed);
    }

    struct Interner {
        names: Vec<&'static str>,
    }

    struct Tag(&'static str);

    impl Encode for Tag {
        fn encode(&self, w: &mut Writer) {
            let interner = w.state::<Interner>().expect("interner state");
            let index = interner.names.iter().position(|n| *n == self.0).unwrap();
            (index as u32).encode(w);
        }
    }

    impl Decode for Tag {
        fn decode(r: &mut Reader<'_>) -> Result<Self> {
            let interner = r.state::<Interner>().expect("interner state");
            let index = u32::decode(r)? as usize;
            interner
                .names
                .get(index)
                .map(|n| Tag(n))
                .ok_or_else(|| Error::kind(ErrorKind::DecodeFailed))
        }
    }

    #[test]
    fn test_state_threading() {
        let state: SerializerState = Arc::new(Interner { names: vec!["alpha", "beta"] });

        let mut w = Writer::with_state(Some(state.clone()));
        Tag("beta").encode(&mut w);
        let payload = w.into_payload();
        assert_eq!(payload, 1u32.to_le_bytes());

        let mut r = Reader::with_state(&payload, Some(&state));
        assert_eq!(Tag::decode(&mut r).unwrap().0, "beta");
    }

    #[test]
    fn test_stateless_codec_has_no_state() {
        let w = Writer::new();
        assert!(w.state::<Interner>().is_none());
    }
}
