//! Round-trip coverage for the `Encode`/`Decode` derive macros.

use std::collections::{BTreeSet, HashMap};

use duorpc::{Decode, Encode, ErrorKind, Reader, Writer};

fn round_trip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
    let mut w = Writer::new();
    value.encode(&mut w);
    let payload = w.into_payload();
    let mut r = Reader::new(&payload);
    assert_eq!(T::decode(&mut r).unwrap(), value);
    assert_eq!(r.remaining(), 0, "trailing bytes after {value:?}");
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct Plain {
    id: u64,
    name: String,
    score: f64,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct Wrapper(u32, String);

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct Marker;

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct Nested {
    plain: Plain,
    pairs: HashMap<String, Wrapper>,
    tags: BTreeSet<u16>,
    optional: Option<Plain>,
    fallible: Result<u8, String>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
enum Shape {
    Point,
    Circle { radius: f64 },
    Rect(f64, f64),
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct Holder<T> {
    inner: Vec<T>,
    label: String,
}

#[test]
fn test_struct_round_trips() {
    round_trip(Plain {
        id: 7,
        name: "seven".to_string(),
        score: -0.5,
    });
    round_trip(Wrapper(9, String::new()));
    round_trip(Marker);
}

#[test]
fn test_nested_round_trips() {
    let mut pairs = HashMap::new();
    pairs.insert("a".to_string(), Wrapper(1, "one".to_string()));
    pairs.insert("b".to_string(), Wrapper(2, "two".to_string()));

    round_trip(Nested {
        plain: Plain {
            id: 1,
            name: "x".to_string(),
            score: 2.0,
        },
        pairs,
        tags: BTreeSet::from([3, 1, 2]),
        optional: None,
        fallible: Err("broken".to_string()),
    });
}

#[test]
fn test_enum_round_trips() {
    round_trip(Shape::Point);
    round_trip(Shape::Circle { radius: 1.5 });
    round_trip(Shape::Rect(2.0, 4.0));
}

#[test]
fn test_enum_tag_layout() {
    // Tag index is a u16 in declaration order, then the variant fields.
    let mut w = Writer::new();
    Shape::Circle { radius: 0.0 }.encode(&mut w);
    let payload = w.into_payload();
    assert_eq!(payload.len(), 2 + 8);
    assert_eq!(&payload[..2], &1u16.to_le_bytes());
}

#[test]
fn test_enum_rejects_out_of_range_tag() {
    let mut w = Writer::new();
    99u16.encode(&mut w);
    let payload = w.into_payload();
    let mut r = Reader::new(&payload);
    let err = Shape::decode(&mut r).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DecodeFailed);
    assert!(err.msg.contains("invalid tag 99"), "msg was {:?}", err.msg);
}

#[test]
fn test_generic_round_trips() {
    round_trip(Holder {
        inner: vec![Shape::Point, Shape::Rect(1.0, 2.0)],
        label: "shapes".to_string(),
    });
}

#[test]
fn test_struct_fields_encode_in_declaration_order() {
    let mut w = Writer::new();
    Wrapper(0x01020304, "z".to_string()).encode(&mut w);
    let payload = w.into_payload();
    assert_eq!(&payload[..4], &0x01020304u32.to_le_bytes());
    assert_eq!(&payload[4..8], &1u32.to_le_bytes());
    assert_eq!(payload[8], b'z');
}
