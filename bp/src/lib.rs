/*!
Bundle format library for the store-and-forward bundle protocol.

This crate owns the wire representation of a bundle: the RFC 5050 (BPv6)
SDNV encoding with its dictionary-referenced endpoint identifiers, the
RFC 9171 (BPv7) CBOR encoding, and the block-processor pipeline shared by
both. Parsing is fully streaming ([`protocol::consume`] accepts arbitrary
chunk boundaries and reports how much it ate), so multi-megabyte bundles
never need to be resident in one buffer.

The processing agent built on top of this lives in `aloft-bpa`.
*/

pub mod admin;
pub mod block;
pub mod bundle;
pub mod creation_timestamp;
pub mod dictionary;
pub mod eid;
pub mod error;
pub mod processor;
pub mod processors;
pub mod protocol;
pub mod sdnv;
pub mod status_report;

mod v7;

pub use error::Error;
