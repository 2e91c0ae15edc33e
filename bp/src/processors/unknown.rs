/*!
The fallback processor for unregistered block types.

Blocks are carried opaque. A block asking for per-block discard is dropped
from the outbound list during `prepare`; one asking for bundle discard
fails validation with `BlockUnintelligible`. Everything that survives is
re-emitted with the forwarded-unprocessed flag set.
*/

use tracing::warn;

use crate::{
    admin::ReasonCode,
    block::{flags, BlockInfo, BlockInfoVec, BlockType},
    bundle::Bundle,
    dictionary::Dictionary,
    error::Error,
    processor::{self, BlockProcessor, ListOwner, XmitContext},
};

pub struct UnknownBlockProcessor;

impl BlockProcessor for UnknownBlockProcessor {
    fn block_type(&self) -> BlockType {
        // The wire code comes from the block itself; this processor owns
        // every code without a registered handler.
        BlockType::Unknown(0xff)
    }

    fn prepare(
        &self,
        _bundle: &Bundle,
        xmit_blocks: &mut BlockInfoVec,
        source: Option<&BlockInfo>,
        _ctx: &XmitContext,
        _list: ListOwner,
    ) -> Result<(), Error> {
        let Some(source) = source else {
            return Ok(());
        };
        // Outgoing discard of the block happens here.
        if source.flags & flags::DISCARD_BLOCK_ONERROR != 0 {
            return Ok(());
        }
        for eid in &source.eid_refs {
            xmit_blocks.dict.intern_eid(eid);
        }
        xmit_blocks.push(source.clone());
        Ok(())
    }

    fn generate(
        &self,
        _bundle: &Bundle,
        dict: &Dictionary,
        block: &mut BlockInfo,
        _ctx: &XmitContext,
        last: bool,
    ) -> Result<(), Error> {
        let body = block.data().to_vec();
        let eid_refs = block.eid_refs.clone();
        let block_flags = block.flags | flags::FORWARDED_UNPROCESSED;
        let type_code = block.type_code;
        processor::generate_with_body(
            dict,
            block,
            type_code,
            block_flags,
            &eid_refs,
            &body,
            last,
        )
    }

    fn validate(
        &self,
        _bundle: &Bundle,
        block: &BlockInfo,
        reception_reason: &mut Option<ReasonCode>,
        deletion_reason: &mut Option<ReasonCode>,
    ) -> bool {
        // Extension blocks of unknown type are by definition unintelligible.
        if block.flags & flags::REPORT_ONERROR != 0 {
            *reception_reason = Some(ReasonCode::BlockUnintelligible);
        }

        if block.flags & flags::DISCARD_BUNDLE_ONERROR != 0 {
            warn!(
                "discarding bundle on unintelligible block type 0x{:02x}",
                block.type_code
            );
            *deletion_reason = Some(ReasonCode::BlockUnintelligible);
            return false;
        }
        true
    }

    fn format(&self) -> &'static str {
        "Unknown"
    }
}
