use crate::decode::{self, Error, Value};
use hex_literal::hex;

#[test]
fn uints() {
    for (bytes, expected) in [
        (&hex!("00") as &[u8], 0u64),
        (&hex!("17"), 23),
        (&hex!("1818"), 24),
        (&hex!("1903e8"), 1000),
        (&hex!("1a000f4240"), 1000000),
        (&hex!("1b000000e8d4a51000"), 1000000000000),
    ] {
        let (v, len) = decode::parse::<u64>(bytes).unwrap();
        assert_eq!(v, expected);
        assert_eq!(len, bytes.len());
    }
}

#[test]
fn need_more_data() {
    // Truncated u16-width uint
    assert!(matches!(
        decode::parse::<u64>(&hex!("1903")),
        Err(Error::NeedMoreData(1))
    ));

    // Byte string header declares 4 bytes, only 2 present
    assert!(matches!(
        decode::parse::<Box<[u8]>>(&hex!("440102")),
        Err(Error::NeedMoreData(2))
    ));

    // Empty input
    assert!(matches!(
        decode::parse::<u64>(&[]),
        Err(Error::NeedMoreData(1))
    ));
}

#[test]
fn byte_strings() {
    let (v, len) = decode::parse::<Box<[u8]>>(&hex!("4401020304")).unwrap();
    assert_eq!(v.as_ref(), &hex!("01020304"));
    assert_eq!(len, 5);

    // Indefinite-length stream of two chunks
    let (v, len) = decode::parse::<Box<[u8]>>(&hex!("5f42010243030405ff")).unwrap();
    assert_eq!(v.as_ref(), &hex!("0102030405"));
    assert_eq!(len, 9);
}

#[test]
fn arrays() {
    let ((a, b, c), len) = decode::parse_array(&hex!("83010203"), |arr, _| {
        let a: u64 = arr.parse()?;
        let b: u64 = arr.parse()?;
        let c: u64 = arr.parse()?;
        assert!(arr.at_end()?);
        Ok::<_, Error>((a, b, c))
    })
    .unwrap();
    assert_eq!((a, b, c), (1, 2, 3));
    assert_eq!(len, 4);
}

#[test]
fn nested_arrays() {
    let (v, len) = decode::parse_array(&hex!("8201820203"), |arr, _| {
        let first: u64 = arr.parse()?;
        let inner = decode::parse_array(&hex!("820203"), |inner, _| {
            let a: u64 = inner.parse()?;
            let b: u64 = inner.parse()?;
            Ok::<_, Error>((a, b))
        })?
        .0;
        arr.skip_value()?;
        Ok::<_, Error>((first, inner))
    })
    .unwrap();
    assert_eq!(v, (1, (2, 3)));
    assert_eq!(len, 5);
}

#[test]
fn unread_items_are_skipped() {
    // The closure reads one item of three; parse_array still reports the
    // full array extent.
    let (v, len) = decode::parse_array(&hex!("83010203"), |arr, _| {
        let v: u64 = arr.parse()?;
        Ok::<_, Error>(v)
    })
    .unwrap();
    assert_eq!(v, 1);
    assert_eq!(len, 4);
}

#[test]
fn indefinite_array() {
    let (v, len) = decode::parse_array(&hex!("9f0102ff"), |arr, _| {
        assert!(!arr.is_definite());
        let a: u64 = arr.parse()?;
        let b: u64 = arr.parse()?;
        assert!(arr.at_end()?);
        Ok::<_, Error>(a + b)
    })
    .unwrap();
    assert_eq!(v, 3);
    assert_eq!(len, 4);
}

#[test]
fn tags_are_reported() {
    let ((), len) = decode::parse_value(&hex!("d8184568656c6c6f"), |value, tags| {
        assert_eq!(tags, &[24]);
        assert!(matches!(value, Value::Bytes(_)));
        Ok::<_, Error>(())
    })
    .unwrap();
    assert_eq!(len, 8);
}

#[test]
fn wrong_type() {
    assert!(matches!(
        decode::parse::<u64>(&hex!("4401020304")),
        Err(Error::IncorrectType(..))
    ));
    assert!(matches!(
        decode::parse_array(&hex!("00"), |_, _| Ok::<_, Error>(())),
        Err(Error::IncorrectType(..))
    ));
}

#[test]
fn simple_values() {
    assert!(decode::parse::<bool>(&hex!("f5")).unwrap().0);
    assert!(!decode::parse::<bool>(&hex!("f4")).unwrap().0);
}

#[test]
fn text() {
    let (s, _) = decode::parse::<String>(&hex!("6449455446")).unwrap();
    assert_eq!(s, "IETF");
}

#[test]
fn floats() {
    let ((), _) = decode::parse_value(&hex!("f93c00"), |value, _| {
        assert!(matches!(value, Value::Float(v) if v == 1.0));
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn maps_can_be_skipped() {
    // {1: 2, 3: [4, 5]} followed by a trailing uint
    let data = hex!("a2010203820405 06");
    let ((), len) = decode::parse_value(&data, |mut value, _| value.skip(16).map_err(Error::from))
        .unwrap();
    assert_eq!(len, 7);
    assert_eq!(decode::parse::<u64>(&data[len..]).unwrap().0, 6);
}
