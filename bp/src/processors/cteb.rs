/*!
The Custody Transfer Enhancement block.

Carries the custody id the current custodian assigned to the bundle,
followed by the custodian's EID as plain text. Aggregate custody signals
acknowledge by this id instead of echoing full bundle identification.
*/

use crate::{
    block::{flags, BlockInfo, BlockInfoVec, BlockType},
    bundle::{Bundle, CtebInfo},
    dictionary::Dictionary,
    error::{CaptureFieldErr, Error},
    processor::{self, BlockProcessor, ListOwner, XmitContext},
    sdnv,
};

pub struct CtebBlockProcessor;

impl BlockProcessor for CtebBlockProcessor {
    fn block_type(&self) -> BlockType {
        BlockType::Cteb
    }

    fn block_complete(&self, bundle: &mut Bundle, block: &BlockInfo) -> Result<(), Error> {
        let body = block.data();
        let (custody_id, len) = sdnv::decode(body).map_field_err("CTEB custody id")?;
        let custodian = core::str::from_utf8(&body[len..])
            .map_field_err("CTEB custodian eid")?
            .parse()
            .map_field_err("CTEB custodian eid")?;
        bundle.cteb = Some(CtebInfo {
            custody_id,
            custodian,
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
        if bundle.cteb.is_some() {
            xmit_blocks.push(BlockInfo::new(BlockType::Cteb));
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
        let Some(cteb) = &bundle.cteb else {
            return Err(Error::InvalidField {
                field: "CTEB",
                source: "generate called without CTEB state on the bundle".into(),
            });
        };
        let mut body = Vec::new();
        body.extend_from_slice(&sdnv::encode(cteb.custody_id));
        body.extend_from_slice(cteb.custodian.uri().as_bytes());
        processor::generate_with_body(
            dict,
            block,
            BlockType::Cteb.code(),
            flags::REPLICATE,
            &[],
            &body,
            last,
        )
    }

    fn format(&self) -> &'static str {
        "Cteb"
    }
}
