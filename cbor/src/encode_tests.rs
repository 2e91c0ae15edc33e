use crate::encode::{self, Bytes, Raw};
use hex_literal::hex;

#[test]
fn uints() {
    assert_eq!(encode::emit(&0u64), hex!("00"));
    assert_eq!(encode::emit(&10u64), hex!("0a"));
    assert_eq!(encode::emit(&23u64), hex!("17"));
    assert_eq!(encode::emit(&24u64), hex!("1818"));
    assert_eq!(encode::emit(&100u64), hex!("1864"));
    assert_eq!(encode::emit(&1000u64), hex!("1903e8"));
    assert_eq!(encode::emit(&1000000u64), hex!("1a000f4240"));
    assert_eq!(
        encode::emit(&1000000000000u64),
        hex!("1b000000e8d4a51000")
    );
    assert_eq!(
        encode::emit(&18446744073709551615u64),
        hex!("1bffffffffffffffff")
    );
}

#[test]
fn negative_ints() {
    assert_eq!(encode::emit(&-1i64), hex!("20"));
    assert_eq!(encode::emit(&-10i64), hex!("29"));
    assert_eq!(encode::emit(&-100i64), hex!("3863"));
    assert_eq!(encode::emit(&-1000i64), hex!("3903e7"));
}

#[test]
fn strings() {
    assert_eq!(encode::emit(""), hex!("60"));
    assert_eq!(encode::emit("a"), hex!("6161"));
    assert_eq!(encode::emit("IETF"), hex!("6449455446"));
    assert_eq!(encode::emit(&Bytes(&hex!("01020304"))), hex!("4401020304"));
}

#[test]
fn arrays() {
    assert_eq!(encode::emit(&[] as &[u64]), hex!("80"));
    assert_eq!(
        encode::emit(&[1u64, 2, 3] as &[u64]),
        hex!("83010203")
    );
    assert_eq!(encode::emit(&(1u64, (2u64, 3u64))), hex!("8201820203"));

    let data = encode::emit_array(None, |a| {
        a.emit(&1u64);
        a.emit(&2u64);
    });
    assert_eq!(data, hex!("9f0102ff"));
}

#[test]
fn simple_values() {
    assert_eq!(encode::emit(&false), hex!("f4"));
    assert_eq!(encode::emit(&true), hex!("f5"));
    assert_eq!(encode::emit(&None::<u64>), hex!("f6"));
    assert_eq!(encode::emit(&Some(1u64)), hex!("01"));
}

#[test]
fn raw_splice() {
    let mut e = encode::Encoder::new();
    e.emit_array(Some(2), |a| {
        a.emit(&1u64);
        a.emit(&Raw(&hex!("4401020304")));
    });
    assert_eq!(e.build(), hex!("82014401020304"));
}

#[test]
fn tagged() {
    let mut e = encode::Encoder::new();
    e.emit_tag(24);
    e.emit(&Bytes(b"hello"));
    assert_eq!(e.build(), hex!("d8184568656c6c6f"));
}
