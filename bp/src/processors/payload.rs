/*!
The payload block.

The payload body never lands in `contents`; it is streamed into the
bundle's payload handle as it arrives, and streamed back out by
`protocol::produce`. The block's `contents` hold only the preamble, with
`data_length` tracking the declared payload size.
*/

use crate::{
    block::{BlockInfo, BlockInfoVec, BlockType},
    bundle::Bundle,
    dictionary::Dictionary,
    error::Error,
    processor::{self, BlockProcessor, ListOwner, XmitContext},
};

pub struct PayloadBlockProcessor;

impl BlockProcessor for PayloadBlockProcessor {
    fn block_type(&self) -> BlockType {
        BlockType::Payload
    }

    fn consume(
        &self,
        bundle: &mut Bundle,
        block: &mut BlockInfo,
        data: &[u8],
    ) -> Result<usize, Error> {
        let mut consumed = processor::consume_preamble(&bundle.recv_blocks.dict, block, data)?;
        if block.data_offset == 0 {
            return Ok(consumed);
        }

        let have = usize::try_from(bundle.payload.len()).unwrap_or(usize::MAX);
        let take = (block.data_length - have).min(data.len() - consumed);
        bundle
            .payload
            .append(&data[consumed..consumed + take])
            .map_err(|e| Error::InvalidField {
                field: "payload",
                source: e.into(),
            })?;
        consumed += take;

        if bundle.payload.len() == block.data_length as u64 {
            block.complete = true;
        }
        Ok(consumed)
    }

    fn prepare(
        &self,
        _bundle: &Bundle,
        xmit_blocks: &mut BlockInfoVec,
        _source: Option<&BlockInfo>,
        _ctx: &XmitContext,
        _list: ListOwner,
    ) -> Result<(), Error> {
        xmit_blocks.push(BlockInfo::new(BlockType::Payload));
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
        let flags = if last { crate::block::flags::LAST_BLOCK } else { 0 };
        processor::generate_preamble(
            dict,
            block,
            BlockType::Payload.code(),
            flags,
            &[],
            usize::try_from(bundle.payload.len()).map_err(|_| Error::LengthMismatch {
                declared: bundle.payload.len(),
                found: 0,
            })?,
        )?;
        block.complete = true;
        Ok(())
    }

    fn format(&self) -> &'static str {
        "Payload"
    }
}
