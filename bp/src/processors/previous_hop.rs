/*!
The Previous Hop Insertion block (RFC 6259).

The body is the EID of the node the bundle most recently arrived from, as
a NUL-terminated scheme name followed by a NUL-terminated scheme-specific
part. Inbound, it fills `bundle.prevhop`; outbound, a fresh block naming
this node is generated per hop.
*/

use crate::{
    block::{flags, BlockInfo, BlockInfoVec, BlockType},
    bundle::Bundle,
    dictionary::Dictionary,
    eid::EndpointId,
    error::Error,
    processor::{self, BlockProcessor, ListOwner, XmitContext},
};

pub struct PreviousHopBlockProcessor;

impl BlockProcessor for PreviousHopBlockProcessor {
    fn block_type(&self) -> BlockType {
        BlockType::PreviousHop
    }

    fn block_complete(&self, bundle: &mut Bundle, block: &BlockInfo) -> Result<(), Error> {
        let body = block.data();
        let mut parts = body.split(|b| *b == 0);
        let scheme = parts.next().unwrap_or(&[]);
        let ssp = parts.next().unwrap_or(&[]);
        if scheme.is_empty() || ssp.is_empty() {
            return Err(Error::InvalidField {
                field: "previous hop",
                source: "previous hop block body is not two NUL-terminated strings".into(),
            });
        }
        bundle.prevhop = EndpointId::new(
            core::str::from_utf8(scheme).map_err(|e| Error::InvalidField {
                field: "previous hop scheme",
                source: e.into(),
            })?,
            core::str::from_utf8(ssp).map_err(|e| Error::InvalidField {
                field: "previous hop ssp",
                source: e.into(),
            })?,
        );
        Ok(())
    }

    fn prepare(
        &self,
        _bundle: &Bundle,
        xmit_blocks: &mut BlockInfoVec,
        _source: Option<&BlockInfo>,
        _ctx: &XmitContext,
        _list: ListOwner,
    ) -> Result<(), Error> {
        // The inbound block is never carried forward; each hop generates
        // its own.
        xmit_blocks.push(BlockInfo::new(BlockType::PreviousHop));
        Ok(())
    }

    fn generate(
        &self,
        _bundle: &Bundle,
        dict: &Dictionary,
        block: &mut BlockInfo,
        ctx: &XmitContext,
        last: bool,
    ) -> Result<(), Error> {
        let mut body = Vec::new();
        body.extend_from_slice(ctx.local_eid.scheme().as_bytes());
        body.push(0);
        body.extend_from_slice(ctx.local_eid.ssp().as_bytes());
        body.push(0);
        processor::generate_with_body(
            dict,
            block,
            BlockType::PreviousHop.code(),
            flags::DISCARD_BLOCK_ONERROR,
            &[],
            &body,
            last,
        )
    }

    fn format(&self) -> &'static str {
        "PreviousHop"
    }
}
