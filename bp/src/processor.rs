/*!
The block-processor pipeline.

Every block type code maps to a [`BlockProcessor`] through a
[`ProcessorRegistry`]; codes with no registered handler fall back to the
unknown-block processor, which carries the block opaque. The registry is a
plain value wired up once at startup and passed explicitly; tests build
their own.

The shared preamble logic lives here: [`consume_body`] implements the
default streaming `consume` over the standard preamble
(type byte, SDNV flags, optional EID-reference list, SDNV length), and
[`generate_preamble`] is its inverse.
*/

use crate::{
    admin::ReasonCode,
    block::{flags, BlockInfo, BlockInfoVec, BlockType},
    bundle::Bundle,
    dictionary::Dictionary,
    eid::EndpointId,
    error::Error,
    sdnv::{self, SdnvError},
};
use std::collections::HashMap;

/// Which block list a `prepare` call is drawing from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOwner {
    /// Blocks parsed off the wire.
    Received,
    /// Locally generated blocks.
    Api,
    /// The outbound list under construction.
    Xmit,
}

/// Context for forming an outbound block list.
pub struct XmitContext<'a> {
    /// The EID this node writes into hop-scoped blocks (Previous Hop).
    pub local_eid: &'a EndpointId,
    /// Name of the outbound link, when known.
    pub link: Option<&'a str>,
}

/// Per-block-type encode/decode/validate logic.
///
/// Handlers must be thread-safe: `consume` and `generate` run concurrently
/// for different bundles.
pub trait BlockProcessor: Send + Sync {
    /// The block type this processor owns.
    fn block_type(&self) -> BlockType;

    /// Parses a chunk of wire bytes into `block`, accumulating
    /// `block.contents` until the preamble is decoded and the body is
    /// complete. May be called repeatedly across arbitrary chunk
    /// boundaries; returns the number of bytes consumed from `data`.
    fn consume(
        &self,
        bundle: &mut Bundle,
        block: &mut BlockInfo,
        data: &[u8],
    ) -> Result<usize, Error> {
        let consumed = consume_body(&bundle.recv_blocks.dict, block, data)?;
        if block.complete {
            self.block_complete(bundle, block)?;
        }
        Ok(consumed)
    }

    /// Hook invoked once by the default `consume` when the block body is
    /// fully present. Processors lift semantic state onto the bundle here.
    fn block_complete(&self, _bundle: &mut Bundle, _block: &BlockInfo) -> Result<(), Error> {
        Ok(())
    }

    /// Called when forming the outbound block list. The default carries
    /// the received block forward unchanged and interns its EID
    /// references into the outbound dictionary.
    fn prepare(
        &self,
        _bundle: &Bundle,
        xmit_blocks: &mut BlockInfoVec,
        source: Option<&BlockInfo>,
        _ctx: &XmitContext,
        _list: ListOwner,
    ) -> Result<(), Error> {
        if let Some(source) = source {
            for eid in &source.eid_refs {
                xmit_blocks.dict.intern_eid(eid);
            }
            xmit_blocks.push(source.clone());
        }
        Ok(())
    }

    /// Writes the outbound bytes for `block` into `block.contents`,
    /// setting the last-block flag iff `last`.
    fn generate(
        &self,
        bundle: &Bundle,
        dict: &Dictionary,
        block: &mut BlockInfo,
        ctx: &XmitContext,
        last: bool,
    ) -> Result<(), Error>;

    /// Consistency check over a complete received block. On failure fills
    /// `deletion_reason` and returns `false`; may fill `reception_reason`
    /// and still pass.
    fn validate(
        &self,
        _bundle: &Bundle,
        _block: &BlockInfo,
        _reception_reason: &mut Option<ReasonCode>,
        _deletion_reason: &mut Option<ReasonCode>,
    ) -> bool {
        true
    }

    /// Human-readable tag for logs.
    fn format(&self) -> &'static str;
}

/// Registry mapping wire type codes to processors.
pub struct ProcessorRegistry {
    processors: HashMap<u8, Box<dyn BlockProcessor>>,
    unknown: Box<dyn BlockProcessor>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        use crate::processors::*;
        let mut r = Self {
            processors: HashMap::new(),
            unknown: Box::new(unknown::UnknownBlockProcessor),
        };
        r.register(Box::new(primary::PrimaryBlockProcessor));
        r.register(Box::new(payload::PayloadBlockProcessor));
        r.register(Box::new(previous_hop::PreviousHopBlockProcessor));
        r.register(Box::new(cteb::CtebBlockProcessor));
        r.register(Box::new(bundle_age::BundleAgeBlockProcessor));
        r.register(Box::new(ecos::EcosBlockProcessor));
        r
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor for its block type code, replacing any
    /// previous handler for that code.
    pub fn register(&mut self, processor: Box<dyn BlockProcessor>) {
        self.processors
            .insert(processor.block_type().code(), processor);
    }

    /// The processor for a wire type code; unregistered codes get the
    /// unknown-block processor.
    pub fn find(&self, type_code: u8) -> &dyn BlockProcessor {
        self.processors
            .get(&type_code)
            .map(|p| p.as_ref())
            .unwrap_or(self.unknown.as_ref())
    }

    /// The processor owning a parsed block.
    pub fn find_owner(&self, block: &BlockInfo) -> &dyn BlockProcessor {
        match block.owner {
            BlockType::Unknown(_) => self.unknown.as_ref(),
            owner => self.find(owner.code()),
        }
    }

    /// The fallback processor for unregistered type codes.
    pub fn unknown(&self) -> &dyn BlockProcessor {
        self.unknown.as_ref()
    }
}

/// A decoded block preamble.
struct Preamble {
    flags: u64,
    eid_offsets: Vec<(u64, u64)>,
    data_length: u64,
    len: usize,
}

/// Attempts to decode the standard preamble from the front of `contents`.
/// Returns `Ok(None)` when more bytes are needed.
fn try_parse_preamble(contents: &[u8]) -> Result<Option<Preamble>, Error> {
    fn decode(data: &[u8], offset: &mut usize) -> Result<Option<u64>, Error> {
        match sdnv::decode(&data[*offset..]) {
            Ok((value, len)) => {
                *offset += len;
                Ok(Some(value))
            }
            Err(SdnvError::Truncated) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    if contents.is_empty() {
        return Ok(None);
    }
    let mut offset = 1; // type byte

    let Some(block_flags) = decode(contents, &mut offset)? else {
        return Ok(None);
    };

    let mut eid_offsets = Vec::new();
    if block_flags & flags::EID_REFS != 0 {
        let Some(count) = decode(contents, &mut offset)? else {
            return Ok(None);
        };
        for _ in 0..count {
            let Some(scheme) = decode(contents, &mut offset)? else {
                return Ok(None);
            };
            let Some(ssp) = decode(contents, &mut offset)? else {
                return Ok(None);
            };
            eid_offsets.push((scheme, ssp));
        }
    }

    let Some(data_length) = decode(contents, &mut offset)? else {
        return Ok(None);
    };

    Ok(Some(Preamble {
        flags: block_flags,
        eid_offsets,
        data_length,
        len: offset,
    }))
}

/// Streaming consume of the standard preamble only. The preamble length
/// isn't knowable up front, so bytes are taken one at a time until it
/// decodes; once it has, `block.data_offset` is non-zero. Returns the
/// bytes consumed from `data`.
pub fn consume_preamble(
    dict: &Dictionary,
    block: &mut BlockInfo,
    data: &[u8],
) -> Result<usize, Error> {
    let mut consumed = 0;
    while block.data_offset == 0 {
        let Some(byte) = data.get(consumed) else {
            return Ok(consumed);
        };
        block.contents.push(*byte);
        consumed += 1;

        if let Some(preamble) = try_parse_preamble(&block.contents)? {
            block.type_code = block.contents[0];
            block.flags = preamble.flags;
            block.data_offset = preamble.len;
            block.data_length =
                usize::try_from(preamble.data_length).map_err(|_| Error::LengthMismatch {
                    declared: preamble.data_length,
                    found: 0,
                })?;
            block.eid_refs = preamble
                .eid_offsets
                .iter()
                .map(|(scheme, ssp)| dict.eid(*scheme, *ssp))
                .collect::<Result<_, _>>()?;
            break;
        }
    }
    Ok(consumed)
}

/// The default streaming consume over the standard preamble. Body bytes
/// accumulate in `block.contents`; `block.complete` is set when the whole
/// declared length is present.
pub fn consume_body(dict: &Dictionary, block: &mut BlockInfo, data: &[u8]) -> Result<usize, Error> {
    let mut consumed = consume_preamble(dict, block, data)?;
    if block.data_offset == 0 {
        return Ok(consumed);
    }

    let have = block.contents.len();
    let want = block.data_offset + block.data_length;
    let take = (want - have).min(data.len() - consumed);
    block
        .contents
        .extend_from_slice(&data[consumed..consumed + take]);
    consumed += take;

    if block.contents.len() == want {
        block.complete = true;
    }
    Ok(consumed)
}

/// Emits a complete block: the standard preamble followed by `body`, with
/// the last-block flag set iff `last`.
pub fn generate_with_body(
    dict: &Dictionary,
    block: &mut BlockInfo,
    type_code: u8,
    block_flags: u64,
    eid_refs: &[EndpointId],
    body: &[u8],
    last: bool,
) -> Result<(), Error> {
    let block_flags = if last {
        block_flags | flags::LAST_BLOCK
    } else {
        block_flags & !flags::LAST_BLOCK
    };
    generate_preamble(dict, block, type_code, block_flags, eid_refs, body.len())?;
    block.contents.extend_from_slice(body);
    block.complete = true;
    Ok(())
}

/// Emits the standard preamble into `block.contents` (replacing them) and
/// sets the data window. The caller appends the body afterwards.
///
/// Every EID reference must already be interned in `dict`; a missing entry
/// is a programming error in a `prepare` implementation.
pub fn generate_preamble(
    dict: &Dictionary,
    block: &mut BlockInfo,
    type_code: u8,
    mut block_flags: u64,
    eid_refs: &[EndpointId],
    data_length: usize,
) -> Result<(), Error> {
    if eid_refs.is_empty() {
        block_flags &= !flags::EID_REFS;
    } else {
        block_flags |= flags::EID_REFS;
    }

    let mut contents = vec![type_code];
    contents.extend_from_slice(&sdnv::encode(block_flags));
    if !eid_refs.is_empty() {
        contents.extend_from_slice(&sdnv::encode(eid_refs.len() as u64));
        for eid in eid_refs {
            let scheme = dict
                .offset_of(eid.scheme())
                .ok_or_else(|| missing_dict_entry(eid))?;
            let ssp = dict
                .offset_of(eid.ssp())
                .ok_or_else(|| missing_dict_entry(eid))?;
            contents.extend_from_slice(&sdnv::encode(scheme));
            contents.extend_from_slice(&sdnv::encode(ssp));
        }
    }
    contents.extend_from_slice(&sdnv::encode(data_length as u64));

    block.type_code = type_code;
    block.flags = block_flags;
    block.eid_refs = eid_refs.to_vec();
    block.data_offset = contents.len();
    block.data_length = data_length;
    block.tail_length = 0;
    block.contents = contents;
    Ok(())
}

fn missing_dict_entry(eid: &EndpointId) -> Error {
    Error::InvalidField {
        field: "eid reference",
        source: format!("EID {eid} not interned in outbound dictionary").into(),
    }
}
