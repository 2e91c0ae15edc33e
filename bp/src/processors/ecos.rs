/*!
The Extended Class of Service block.

One flags byte, one ordinal byte, and an optional SDNV flow label when
flag bit 2 is set. The engine does not act on it beyond carrying it intact
between hops.
*/

use crate::{
    block::{BlockInfo, BlockInfoVec, BlockType},
    bundle::{Bundle, EcosInfo},
    dictionary::Dictionary,
    error::{CaptureFieldErr, Error},
    processor::{self, BlockProcessor, ListOwner, XmitContext},
    sdnv,
};

const ECOS_FLAG_FLOW_LABEL: u8 = 1 << 2;

pub struct EcosBlockProcessor;

impl BlockProcessor for EcosBlockProcessor {
    fn block_type(&self) -> BlockType {
        BlockType::Ecos
    }

    fn block_complete(&self, bundle: &mut Bundle, block: &BlockInfo) -> Result<(), Error> {
        let body = block.data();
        let (&ecos_flags, rest) = body.split_first().ok_or(Error::InvalidField {
            field: "ECOS flags",
            source: "empty ECOS block body".into(),
        })?;
        let (&ordinal, rest) = rest.split_first().ok_or(Error::InvalidField {
            field: "ECOS ordinal",
            source: "truncated ECOS block body".into(),
        })?;
        let flow_label = if ecos_flags & ECOS_FLAG_FLOW_LABEL != 0 {
            Some(sdnv::decode(rest).map_field_err("ECOS flow label")?.0)
        } else {
            None
        };
        bundle.ecos = Some(EcosInfo {
            flags: ecos_flags,
            ordinal,
            flow_label,
        });
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
        if bundle.ecos.is_some() {
            xmit_blocks.push(BlockInfo::new(BlockType::Ecos));
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
        let Some(ecos) = &bundle.ecos else {
            return Err(Error::InvalidField {
                field: "ECOS",
                source: "generate called without ECOS state on the bundle".into(),
            });
        };
        let mut body = vec![ecos.flags, ecos.ordinal];
        if let Some(flow_label) = ecos.flow_label {
            body.extend_from_slice(&sdnv::encode(flow_label));
        }
        processor::generate_with_body(
            dict,
            block,
            BlockType::Ecos.code(),
            0,
            &[],
            &body,
            last,
        )
    }

    fn format(&self) -> &'static str {
        "Ecos"
    }
}
