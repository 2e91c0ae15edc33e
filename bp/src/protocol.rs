/*!
Bundle-level codec orchestration.

[`consume`] routes arriving bytes to the block being parsed, dispatching to
the per-type [`crate::processor::BlockProcessor`] via the registry; the
version byte of the first chunk selects the BPv6 SDNV path or the BPv7
CBOR path. [`produce`] streams a formatted bundle back out from any offset
without materializing it, reading payload bytes from the payload handle on
demand.
*/

use crate::{
    admin::ReasonCode,
    block::{BlockInfo, BlockInfoVec, BlockType},
    bundle::{Bundle, Version},
    error::Error,
    processor::{ListOwner, ProcessorRegistry, XmitContext},
    v7,
};

/// Parses a chunk of arriving data, appending to the bundle's received
/// block list. Returns the number of bytes consumed (which may be less
/// than `data.len()` once the bundle completes) and whether the bundle is
/// now complete.
pub fn consume(
    registry: &ProcessorRegistry,
    bundle: &mut Bundle,
    data: &[u8],
) -> Result<(usize, bool), Error> {
    if bundle.version == Version::Unknown {
        let Some(first) = data.first() else {
            return Ok((0, false));
        };
        match *first {
            crate::processors::primary::BPV6_VERSION => bundle.version = Version::V6,
            v7::INDEFINITE_ARRAY => bundle.version = Version::V7,
            v => return Err(Error::InvalidVersion(v)),
        }
    }

    match bundle.version {
        Version::V6 => consume_v6(registry, bundle, data),
        Version::V7 => v7::consume(bundle, data),
        Version::Unknown => unreachable!(),
    }
}

fn v6_complete(bundle: &Bundle) -> bool {
    bundle
        .recv_blocks
        .last()
        .map(|b| b.complete && b.last_block())
        .unwrap_or(false)
}

fn consume_v6(
    registry: &ProcessorRegistry,
    bundle: &mut Bundle,
    data: &[u8],
) -> Result<(usize, bool), Error> {
    let mut consumed = 0;
    loop {
        if v6_complete(bundle) {
            return Ok((consumed, true));
        }
        if consumed == data.len() {
            return Ok((consumed, false));
        }

        // Resume the block in progress, or start the next one. The
        // primary block is always first; after that the type byte of the
        // upcoming block selects the processor.
        let resume = matches!(bundle.recv_blocks.last(), Some(b) if !b.complete);
        let mut block = if resume {
            bundle.recv_blocks.pop().expect("resume checked non-empty")
        } else if bundle.recv_blocks.is_empty() {
            BlockInfo::new(BlockType::Primary)
        } else {
            let code = data[consumed];
            match registry.find(code).block_type() {
                BlockType::Unknown(_) => BlockInfo::new(BlockType::Unknown(code)),
                owner => BlockInfo::new(owner),
            }
        };

        let processor = registry.find_owner(&block);
        let n = processor.consume(bundle, &mut block, &data[consumed..])?;
        consumed += n;
        bundle.recv_blocks.push(block);
    }
}

/// Total formatted length of a block list.
pub fn total_length(blocks: &BlockInfoVec) -> usize {
    blocks.iter().map(BlockInfo::full_length).sum()
}

/// Copies up to `buf.len()` bytes of the formatted bundle starting at the
/// given bundle-wide `offset` into `buf`. Returns the bytes written and
/// whether the end of the bundle was reached.
pub fn produce(
    bundle: &Bundle,
    blocks: &BlockInfoVec,
    buf: &mut [u8],
    offset: usize,
) -> Result<(usize, bool), Error> {
    fn copy_mem(buf: &mut [u8], offset: usize, pos: &mut usize, written: &mut usize, seg: &[u8]) {
        let seg_start = *pos;
        *pos += seg.len();
        if *written == buf.len() {
            return;
        }
        let want = offset + *written;
        if want >= *pos || want + (buf.len() - *written) <= seg_start {
            return;
        }
        let from = want.max(seg_start) - seg_start;
        let take = (seg.len() - from).min(buf.len() - *written);
        buf[*written..*written + take].copy_from_slice(&seg[from..from + take]);
        *written += take;
    }

    let total = total_length(blocks);
    let mut written = 0;
    let mut pos = 0;

    for block in blocks {
        let external_body =
            block.owner == BlockType::Payload && block.contents.len() < block.full_length();
        if !external_body {
            copy_mem(buf, offset, &mut pos, &mut written, &block.contents);
            continue;
        }

        // Head, payload body read on demand, then any stored tail.
        copy_mem(
            buf,
            offset,
            &mut pos,
            &mut written,
            &block.contents[..block.data_offset],
        );

        let seg_start = pos;
        pos += block.data_length;
        if written < buf.len() {
            let want = offset + written;
            if want < pos && want + (buf.len() - written) > seg_start {
                let from = want - seg_start;
                let take = (block.data_length - from).min(buf.len() - written);
                let n = bundle
                    .payload
                    .read_into(from as u64, &mut buf[written..written + take])
                    .map_err(|e| Error::InvalidField {
                        field: "payload",
                        source: e.into(),
                    })?;
                if n != take {
                    return Err(Error::LengthMismatch {
                        declared: block.data_length as u64,
                        found: bundle.payload.len(),
                    });
                }
                written += take;
            }
        }

        copy_mem(
            buf,
            offset,
            &mut pos,
            &mut written,
            &block.contents[block.data_offset..],
        );
    }

    Ok((written, offset + written >= total))
}

/// Validates a complete received bundle, invoking each block's processor.
///
/// Returns `Ok(reception_reason)` when the bundle is acceptable (the
/// reason, if any, should go into a reception status report) or
/// `Err(deletion_reason)` when the bundle must be dropped.
pub fn validate(
    registry: &ProcessorRegistry,
    bundle: &Bundle,
) -> Result<Option<ReasonCode>, ReasonCode> {
    if bundle.recv_blocks.find_block(BlockType::Payload).is_none() {
        return Err(ReasonCode::BlockUnintelligible);
    }

    // Structural invariants: every block complete and internally
    // consistent, with the last-block flag on exactly the final block.
    let mut last_flags = 0;
    for (i, block) in bundle.recv_blocks.iter().enumerate() {
        if !block.complete {
            return Err(ReasonCode::BlockUnintelligible);
        }
        let external_body =
            block.owner == BlockType::Payload && block.contents.len() < block.full_length();
        if !external_body && block.full_length() != block.contents.len() {
            return Err(ReasonCode::BlockUnintelligible);
        }
        if block.last_block() {
            last_flags += 1;
            if i + 1 != bundle.recv_blocks.len() {
                return Err(ReasonCode::BlockUnintelligible);
            }
        }
    }
    if bundle.version == Version::V6 && last_flags != 1 {
        return Err(ReasonCode::BlockUnintelligible);
    }

    let mut reception_reason = None;
    let mut deletion_reason = None;
    for block in &bundle.recv_blocks {
        let processor = registry.find_owner(block);
        if !processor.validate(bundle, block, &mut reception_reason, &mut deletion_reason) {
            tracing::warn!("{} block failed validation", processor.format());
            return Err(deletion_reason.unwrap_or(ReasonCode::BlockUnintelligible));
        }
    }
    Ok(reception_reason)
}

/// Options controlling which locally generated blocks join the outbound
/// list.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmitOptions {
    /// Generate a Previous Hop block naming this node.
    pub include_previous_hop: bool,
    /// Generate a Bundle Age block when the bundle carries an age.
    pub include_age: bool,
}

/// Forms the outbound block list for a link: primary first, then every
/// surviving received block, locally generated blocks, and the payload
/// block last.
pub fn prepare_blocks(
    registry: &ProcessorRegistry,
    bundle: &Bundle,
    ctx: &XmitContext,
    options: XmitOptions,
) -> Result<BlockInfoVec, Error> {
    let mut xmit = BlockInfoVec::new();

    registry.find(BlockType::Primary.code()).prepare(
        bundle,
        &mut xmit,
        bundle.recv_blocks.find_block(BlockType::Primary),
        ctx,
        ListOwner::Received,
    )?;

    let mut has_previous_hop = false;
    let mut has_age = false;
    for block in &bundle.recv_blocks {
        match block.owner {
            BlockType::Primary | BlockType::Payload => continue,
            BlockType::PreviousHop => has_previous_hop = true,
            BlockType::BundleAge => has_age = true,
            _ => {}
        }
        registry
            .find_owner(block)
            .prepare(bundle, &mut xmit, Some(block), ctx, ListOwner::Received)?;
    }

    for block in &bundle.api_blocks {
        registry
            .find_owner(block)
            .prepare(bundle, &mut xmit, Some(block), ctx, ListOwner::Api)?;
    }

    if options.include_previous_hop && !has_previous_hop {
        registry
            .find(BlockType::PreviousHop.code())
            .prepare(bundle, &mut xmit, None, ctx, ListOwner::Xmit)?;
    }
    if options.include_age && !has_age && bundle.age.is_some() {
        registry
            .find(BlockType::BundleAge.code())
            .prepare(bundle, &mut xmit, None, ctx, ListOwner::Xmit)?;
    }

    registry.find(BlockType::Payload.code()).prepare(
        bundle,
        &mut xmit,
        bundle.recv_blocks.find_block(BlockType::Payload),
        ctx,
        ListOwner::Received,
    )?;

    Ok(xmit)
}

/// Generates the wire bytes for a prepared block list, setting the
/// last-block flag on the final block. Returns the total formatted length.
pub fn generate_blocks(
    registry: &ProcessorRegistry,
    bundle: &Bundle,
    xmit_blocks: &mut BlockInfoVec,
    ctx: &XmitContext,
) -> Result<usize, Error> {
    let dict = xmit_blocks.dict.clone();
    let count = xmit_blocks.len();
    for i in 0..count {
        let processor = match xmit_blocks[i].owner {
            BlockType::Unknown(_) => registry.unknown(),
            owner => registry.find(owner.code()),
        };
        processor.generate(bundle, &dict, &mut xmit_blocks[i], ctx, i + 1 == count)?;
    }
    Ok(total_length(xmit_blocks))
}
