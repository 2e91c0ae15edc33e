/*!
The Bundle Age block.

Tracks how long a bundle has been in the network for nodes without a
synchronized clock. Kept internally in milliseconds; the BPv6 body is a
single SDNV of whole seconds. The block must replicate into every
fragment.
*/

use crate::{
    block::{flags, BlockInfo, BlockInfoVec, BlockType},
    bundle::Bundle,
    dictionary::Dictionary,
    error::{CaptureFieldErr, Error},
    processor::{self, BlockProcessor, ListOwner, XmitContext},
    sdnv,
};

pub struct BundleAgeBlockProcessor;

impl BlockProcessor for BundleAgeBlockProcessor {
    fn block_type(&self) -> BlockType {
        BlockType::BundleAge
    }

    fn block_complete(&self, bundle: &mut Bundle, block: &BlockInfo) -> Result<(), Error> {
        let (seconds, _) = sdnv::decode(block.data()).map_field_err("bundle age")?;
        bundle.age = Some(seconds.saturating_mul(1000));
        Ok(())
    }

    fn prepare(
        &self,
        bundle: &Bundle,
        xmit_blocks: &mut BlockInfoVec,
        _source: Option<&BlockInfo>,
        _ctx: &XmitContext,
        _list: ListOwner,
    ) -> Result<(), Error> {
        if bundle.age.is_some() {
            xmit_blocks.push(BlockInfo::new(BlockType::BundleAge));
        }
        Ok(())
    }

    fn generate(
        &self,
        bundle: &Bundle,
        dict: &Dictionary,
        block: &mut BlockInfo,
        _ctx: &XmitContext,
        last: bool,
    ) -> Result<(), Error> {
        let body = sdnv::encode(bundle.age.unwrap_or(0) / 1000);
        processor::generate_with_body(
            dict,
            block,
            BlockType::BundleAge.code(),
            flags::REPLICATE,
            &[],
            &body,
            last,
        )
    }

    fn format(&self) -> &'static str {
        "BundleAge"
    }
}
