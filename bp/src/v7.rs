/*!
The BPv7 (RFC 9171) CBOR encoding.

A BPv7 bundle is an indefinite-length CBOR array of blocks: the primary
block, any canonical blocks, and the payload block (type 1, number 1) last.
Consumed bundles land in the same [`Bundle`] model the BPv6 path produces,
with raw block bytes preserved so forwarding re-emits them bit-exact.

The consume path buffers arriving chunks and re-attempts a full parse; the
decoder's `NeedMoreData` distinguishes "incomplete" from "malformed".
*/

use crate::{
    block::{flags, BlockInfo, BlockType},
    bundle::{Bundle, BundleFlags, FragmentInfo, HopInfo, Version},
    creation_timestamp::CreationTimestamp,
    eid::EndpointId,
    error::{CaptureFieldErr, Error},
};
use aloft_cbor::decode::{self, Value};

/// CBOR header byte of an indefinite-length array; every BPv7 bundle
/// starts with one.
pub const INDEFINITE_ARRAY: u8 = 0x9F;
const BREAK: u8 = 0xFF;

const CRC_16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);
const CRC_32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Appends a chunk to the bundle's accumulation buffer and re-attempts a
/// parse. Semantics match the BPv6 consume: returns bytes consumed and a
/// completion flag.
pub fn consume(bundle: &mut Bundle, data: &[u8]) -> Result<(usize, bool), Error> {
    if !bundle.recv_blocks.is_empty() {
        // Already complete; nothing past the end belongs to this bundle.
        return Ok((0, true));
    }

    let buffered = bundle.v7_raw.len();
    bundle.v7_raw.extend_from_slice(data);

    match try_parse(&bundle.v7_raw) {
        Ok((parsed, total_len)) => {
            let consumed = total_len - buffered;
            bundle.v7_raw = Vec::new();
            commit(bundle, parsed);
            Ok((consumed, true))
        }
        Err(e) if is_need_more(&e) => Ok((data.len(), false)),
        Err(e) => Err(e),
    }
}

fn is_need_more(e: &Error) -> bool {
    match e {
        Error::InvalidCbor(decode::Error::NeedMoreData(_)) => true,
        Error::InvalidField { source, .. } => {
            if let Some(e) = source.downcast_ref::<decode::Error>() {
                matches!(e, decode::Error::NeedMoreData(_))
            } else if let Some(e) = source.downcast_ref::<Error>() {
                is_need_more(e)
            } else {
                false
            }
        }
        _ => false,
    }
}

struct ParsedBundle {
    flags: BundleFlags,
    dest: EndpointId,
    source: EndpointId,
    replyto: EndpointId,
    timestamp: CreationTimestamp,
    lifetime_ms: u64,
    fragment: Option<FragmentInfo>,
    prevhop: Option<EndpointId>,
    age_ms: Option<u64>,
    hop_info: Option<HopInfo>,
    blocks: Vec<BlockInfo>,
    payload: Vec<u8>,
}

fn commit(bundle: &mut Bundle, parsed: ParsedBundle) {
    bundle.version = Version::V7;
    bundle.flags = parsed.flags;
    bundle.dest = parsed.dest;
    bundle.source = parsed.source;
    bundle.replyto = parsed.replyto;
    bundle.custodian = EndpointId::null();
    bundle.timestamp = parsed.timestamp;
    // Lifetime is milliseconds on the BPv7 wire, seconds in the model.
    bundle.lifetime = parsed.lifetime_ms.div_ceil(1000);
    bundle.fragment = parsed.fragment;
    if let Some(prevhop) = parsed.prevhop {
        bundle.prevhop = prevhop;
    }
    bundle.age = parsed.age_ms;
    bundle.hop_info = parsed.hop_info;
    bundle.payload = crate::bundle::Payload::Memory(parsed.payload);
    for block in parsed.blocks {
        bundle.recv_blocks.push(block);
    }
}

fn parse_eid(value: Value, _tags: &[u64]) -> Result<EndpointId, Error> {
    match value {
        Value::Array(a) => {
            let scheme: u64 = a.parse().map_field_err("eid scheme code")?;
            match scheme {
                1 => a.parse_value(|value, _| match value {
                    Value::UnsignedInteger(0) => Ok(EndpointId::null()),
                    Value::Text(s) => Ok(EndpointId::new("dtn", s)),
                    value => Err(Error::InvalidField {
                        field: "dtn eid ssp",
                        source: format!("unexpected {}", value.type_name()).into(),
                    }),
                }),
                2 => a.parse_value(|value, _| match value {
                    Value::Array(parts) => {
                        let node: u64 = parts.parse().map_field_err("ipn node number")?;
                        let service: u64 = parts.parse().map_field_err("ipn service number")?;
                        Ok(EndpointId::new("ipn", &format!("{node}.{service}")))
                    }
                    value => Err(Error::InvalidField {
                        field: "ipn eid ssp",
                        source: format!("unexpected {}", value.type_name()).into(),
                    }),
                }),
                code => Err(Error::InvalidField {
                    field: "eid scheme code",
                    source: format!("unsupported scheme {code}").into(),
                }),
            }
        }
        value => Err(Error::InvalidField {
            field: "eid",
            source: format!("expected array, found {}", value.type_name()).into(),
        }),
    }
}

/// Verifies a block CRC without copying the block: the CRC content bytes
/// are fed to the digest as zeros.
fn check_crc(
    block_data: &[u8],
    block_len: usize,
    crc_type: u64,
    crc_range: Option<core::ops::Range<usize>>,
) -> Result<(), Error> {
    let Some(crc_range) = crc_range else {
        return if crc_type == 0 {
            Ok(())
        } else {
            Err(Error::BadCrc)
        };
    };

    match crc_type {
        1 => {
            if crc_range.len() != 2 {
                return Err(Error::BadCrc);
            }
            let stored = u16::from_be_bytes(block_data[crc_range.clone()].try_into().unwrap());
            let mut digest = CRC_16.digest();
            digest.update(&block_data[..crc_range.start]);
            digest.update(&[0, 0]);
            digest.update(&block_data[crc_range.end..block_len]);
            if digest.finalize() != stored {
                return Err(Error::BadCrc);
            }
            Ok(())
        }
        2 => {
            if crc_range.len() != 4 {
                return Err(Error::BadCrc);
            }
            let stored = u32::from_be_bytes(block_data[crc_range.clone()].try_into().unwrap());
            let mut digest = CRC_32.digest();
            digest.update(&block_data[..crc_range.start]);
            digest.update(&[0, 0, 0, 0]);
            digest.update(&block_data[crc_range.end..block_len]);
            if digest.finalize() != stored {
                return Err(Error::BadCrc);
            }
            Ok(())
        }
        t => Err(Error::InvalidCrcType(t)),
    }
}

struct PrimaryFields {
    flags: BundleFlags,
    dest: EndpointId,
    source: EndpointId,
    replyto: EndpointId,
    timestamp: CreationTimestamp,
    lifetime_ms: u64,
    fragment: Option<FragmentInfo>,
}

fn parse_primary(data: &[u8]) -> Result<(PrimaryFields, usize), Error> {
    decode::parse_array(data, |a, _| {
        let version: u64 = a.parse().map_field_err("version")?;
        if version != 7 {
            return Err(Error::InvalidVersion(version.min(u8::MAX as u64) as u8));
        }
        let raw_flags: u64 = a.parse().map_field_err("bundle processing flags")?;
        let crc_type: u64 = a.parse().map_field_err("CRC type")?;
        let dest = a.parse_value(parse_eid).map_field_err("destination")?;
        let source = a.parse_value(parse_eid).map_field_err("source")?;
        let replyto = a.parse_value(parse_eid).map_field_err("report-to")?;
        let (ts_ms, sequence) = a
            .parse_value(|value, _| match value {
                Value::Array(ts) => {
                    let ms: u64 = ts.parse().map_field_err("creation time")?;
                    let seq: u64 = ts.parse().map_field_err("sequence number")?;
                    Ok((ms, seq))
                }
                value => Err(Error::InvalidField {
                    field: "creation timestamp",
                    source: format!("expected array, found {}", value.type_name()).into(),
                }),
            })?;
        let lifetime_ms: u64 = a.parse().map_field_err("lifetime")?;

        let flags = v7_bundle_flags(raw_flags);
        let fragment = if flags.is_fragment {
            let offset: u64 = a.parse().map_field_err("fragment offset")?;
            let total_adu_length: u64 = a.parse().map_field_err("total ADU length")?;
            Some(FragmentInfo {
                offset,
                total_adu_length,
            })
        } else {
            None
        };

        let crc_range = if crc_type != 0 {
            let start = a.offset();
            Some(a.parse_value(|value, _| match value {
                Value::Bytes(r) => Ok(start + r.start..start + r.end),
                value => Err(Error::InvalidField {
                    field: "CRC",
                    source: format!("expected byte string, found {}", value.type_name()).into(),
                }),
            })?)
        } else {
            None
        };

        Ok((
            PrimaryFields {
                flags,
                dest,
                source,
                replyto,
                timestamp: CreationTimestamp::new(ts_ms / 1000, sequence),
                lifetime_ms,
                fragment,
            },
            crc_type,
            crc_range,
        ))
    })
    .and_then(|((fields, crc_type, crc_range), len)| {
        check_crc(data, len, crc_type, crc_range)?;
        Ok((fields, len))
    })
}

fn v7_bundle_flags(raw: u64) -> BundleFlags {
    const KNOWN: u64 =
        (1 << 0) | (1 << 1) | (1 << 2) | (1 << 5) | (1 << 14) | (1 << 16) | (1 << 17) | (1 << 18);
    BundleFlags {
        is_fragment: raw & (1 << 0) != 0,
        is_admin: raw & (1 << 1) != 0,
        do_not_fragment: raw & (1 << 2) != 0,
        app_ack_requested: raw & (1 << 5) != 0,
        receive_receipt: raw & (1 << 14) != 0,
        forward_receipt: raw & (1 << 16) != 0,
        delivery_receipt: raw & (1 << 17) != 0,
        deletion_receipt: raw & (1 << 18) != 0,
        unrecognised: raw & !KNOWN,
        ..Default::default()
    }
}

/// Maps BPv7 block processing flags onto the internal (BPv6) constants.
fn v7_block_flags(raw: u64) -> u64 {
    let mut out = 0;
    if raw & (1 << 0) != 0 {
        out |= flags::REPLICATE;
    }
    if raw & (1 << 1) != 0 {
        out |= flags::REPORT_ONERROR;
    }
    if raw & (1 << 2) != 0 {
        out |= flags::DISCARD_BUNDLE_ONERROR;
    }
    if raw & (1 << 4) != 0 {
        out |= flags::DISCARD_BLOCK_ONERROR;
    }
    out
}

struct CanonicalBlock {
    type_code: u64,
    number: u64,
    flags: u64,
    data_range: core::ops::Range<usize>,
    len: usize,
}

fn parse_canonical(data: &[u8]) -> Result<CanonicalBlock, Error> {
    decode::parse_array(data, |a, _| {
        let type_code: u64 = a.parse().map_field_err("block type code")?;
        let number: u64 = a.parse().map_field_err("block number")?;
        let raw_flags: u64 = a.parse().map_field_err("block processing flags")?;
        let crc_type: u64 = a.parse().map_field_err("CRC type")?;

        let data_start = a.offset();
        let data_range = a.parse_value(|value, _| match value {
            Value::Bytes(r) => Ok(data_start + r.start..data_start + r.end),
            value => Err(Error::InvalidField {
                field: "block data",
                source: format!("expected byte string, found {}", value.type_name()).into(),
            }),
        })?;

        let crc_range = if crc_type != 0 {
            let start = a.offset();
            Some(a.parse_value(|value, _| match value {
                Value::Bytes(r) => Ok(start + r.start..start + r.end),
                value => Err(Error::InvalidField {
                    field: "CRC",
                    source: format!("expected byte string, found {}", value.type_name()).into(),
                }),
            })?)
        } else {
            None
        };

        Ok((type_code, number, raw_flags, crc_type, data_range, crc_range))
    })
    .and_then(
        |((type_code, number, raw_flags, crc_type, data_range, crc_range), len)| {
            check_crc(data, len, crc_type, crc_range)?;
            Ok(CanonicalBlock {
                type_code,
                number,
                flags: v7_block_flags(raw_flags),
                data_range,
                len,
            })
        },
    )
}

fn try_parse(data: &[u8]) -> Result<(ParsedBundle, usize), Error> {
    match data.first() {
        None => return Err(decode::Error::NeedMoreData(1).into()),
        Some(&INDEFINITE_ARRAY) => {}
        Some(&v) => return Err(Error::InvalidVersion(v)),
    }
    let mut offset = 1;

    let (primary, primary_len) = parse_primary(&data[offset..])?;

    let mut blocks = Vec::new();
    let mut primary_block = BlockInfo::new(BlockType::Primary);
    primary_block.contents = data[..offset + primary_len].to_vec();
    primary_block.data_offset = 1;
    primary_block.data_length = primary_len;
    primary_block.complete = true;
    blocks.push(primary_block);
    offset += primary_len;

    let mut parsed = ParsedBundle {
        flags: primary.flags,
        dest: primary.dest,
        source: primary.source,
        replyto: primary.replyto,
        timestamp: primary.timestamp,
        lifetime_ms: primary.lifetime_ms,
        fragment: primary.fragment,
        prevhop: None,
        age_ms: None,
        hop_info: None,
        blocks: Vec::new(),
        payload: Vec::new(),
    };

    let mut seen_numbers = Vec::new();
    loop {
        match data.get(offset) {
            None => return Err(decode::Error::NeedMoreData(1).into()),
            Some(&BREAK) => {
                // The payload block must close the bundle.
                return Err(Error::MissingPayload);
            }
            Some(_) => {}
        }

        let block = parse_canonical(&data[offset..])?;
        let block_data = &data[offset..offset + block.len];

        if seen_numbers.contains(&block.number) {
            return Err(Error::DuplicateBlockNumber(block.number));
        }
        seen_numbers.push(block.number);

        match (block.number, block.type_code) {
            (1, 1) => {}
            (0, _) | (1, _) | (_, 0) | (_, 1) => {
                return Err(Error::InvalidBlockNumber(
                    block.number,
                    block.type_code.min(u8::MAX as u64) as u8,
                ));
            }
            _ => {}
        }

        let body = &block_data[block.data_range.clone()];
        let owner = match block.type_code {
            1 => BlockType::Payload,
            6 => BlockType::PreviousHop,
            7 => BlockType::BundleAge,
            10 => BlockType::Unknown(10), // hop count handled below, carried opaque
            code => BlockType::Unknown(code.min(u8::MAX as u64) as u8),
        };

        match block.type_code {
            6 => {
                parsed.prevhop = Some(
                    decode::parse_value(body, parse_eid)
                        .map(|(eid, _)| eid)
                        .map_field_err("previous node")?,
                );
            }
            7 => {
                parsed.age_ms = Some(
                    decode::parse::<u64>(body)
                        .map(|(age, _)| age)
                        .map_field_err("bundle age")?,
                );
            }
            10 => {
                parsed.hop_info = Some(
                    decode::parse_array(body, |a, _| {
                        let limit: u64 = a.parse().map_field_err("hop limit")?;
                        let count: u64 = a.parse().map_field_err("hop count")?;
                        Ok::<_, Error>(HopInfo { limit, count })
                    })
                    .map(|(info, _)| info)?,
                );
            }
            _ => {}
        }

        let mut info = BlockInfo::new(owner);
        info.type_code = block.type_code.min(u8::MAX as u64) as u8;
        info.flags = block.flags;
        info.complete = true;

        if block.type_code == 1 {
            // Bytes after this block must be exactly the closing break.
            match data.get(offset + block.len) {
                None => return Err(decode::Error::NeedMoreData(1).into()),
                Some(&BREAK) => {}
                Some(_) => return Err(Error::LastBlockNotLast),
            }

            parsed.payload = body.to_vec();
            info.flags |= flags::LAST_BLOCK;
            // Contents hold the head and tail around the externalized
            // body, with the closing break folded into the tail.
            let mut contents = block_data[..block.data_range.start].to_vec();
            info.data_offset = contents.len();
            info.data_length = block.data_range.len();
            contents.extend_from_slice(&block_data[block.data_range.end..]);
            contents.push(BREAK);
            info.tail_length = contents.len() - info.data_offset;
            info.contents = contents;
            parsed.blocks.push(info);

            let total = offset + block.len + 1;
            let mut all = blocks;
            all.append(&mut parsed.blocks);
            parsed.blocks = all;
            return Ok((parsed, total));
        }

        info.contents = block_data.to_vec();
        info.data_offset = block.data_range.start;
        info.data_length = block.data_range.len();
        info.tail_length = block.len - block.data_range.end;
        parsed.blocks.push(info);
        offset += block.len;
    }
}
