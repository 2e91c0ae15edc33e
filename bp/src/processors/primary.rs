/*!
The BPv6 primary block.

Wire layout (RFC 5050 section 4.5): version byte, SDNV processing flags,
SDNV block length, then the block body: eight SDNV dictionary offsets
(destination, source, report-to, custodian, scheme/ssp each), creation
timestamp seconds and sequence number, lifetime, the dictionary, and the
fragment fields when the fragment flag is set.
*/

use crate::{
    admin::ReasonCode,
    block::{BlockInfo, BlockInfoVec, BlockType},
    bundle::{Bundle, BundleFlags, FragmentInfo, Version},
    dictionary::Dictionary,
    error::{CaptureFieldErr, Error},
    processor::{BlockProcessor, ListOwner, XmitContext},
    sdnv::{self, SdnvError},
};

pub const BPV6_VERSION: u8 = 0x06;

pub struct PrimaryBlockProcessor;

impl PrimaryBlockProcessor {
    /// Attempts to decode the primary-block header (version, flags,
    /// length) from the accumulated bytes. `None` means more bytes are
    /// needed.
    fn try_parse_header(contents: &[u8]) -> Result<Option<(u64, u64, usize)>, Error> {
        let Some(version) = contents.first() else {
            return Ok(None);
        };
        if *version != BPV6_VERSION {
            return Err(Error::InvalidVersion(*version));
        }

        let mut offset = 1;
        let flags = match sdnv::decode(&contents[offset..]) {
            Ok((value, len)) => {
                offset += len;
                value
            }
            Err(SdnvError::Truncated) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let block_length = match sdnv::decode(&contents[offset..]) {
            Ok((value, len)) => {
                offset += len;
                value
            }
            Err(SdnvError::Truncated) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some((flags, block_length, offset)))
    }

    /// Decodes the complete block body into the bundle's primary fields.
    fn parse_fields(bundle: &mut Bundle, block: &BlockInfo, flags: u64) -> Result<(), Error> {
        fn next(body: &[u8], offset: &mut usize, field: &'static str) -> Result<u64, Error> {
            let (value, len) = sdnv::decode(&body[*offset..]).map_field_err(field)?;
            *offset += len;
            Ok(value)
        }

        let body = block.data();
        let mut offset = 0;

        let dest_scheme = next(body, &mut offset, "destination scheme offset")?;
        let dest_ssp = next(body, &mut offset, "destination ssp offset")?;
        let source_scheme = next(body, &mut offset, "source scheme offset")?;
        let source_ssp = next(body, &mut offset, "source ssp offset")?;
        let replyto_scheme = next(body, &mut offset, "report-to scheme offset")?;
        let replyto_ssp = next(body, &mut offset, "report-to ssp offset")?;
        let custodian_scheme = next(body, &mut offset, "custodian scheme offset")?;
        let custodian_ssp = next(body, &mut offset, "custodian ssp offset")?;
        let ts_seconds = next(body, &mut offset, "creation timestamp seconds")?;
        let ts_sequence = next(body, &mut offset, "creation timestamp sequence number")?;
        let lifetime = next(body, &mut offset, "lifetime")?;
        let dict_length = next(body, &mut offset, "dictionary length")?;

        let dict_start = offset;
        let dict_end = dict_start
            .checked_add(usize::try_from(dict_length).map_field_err("dictionary length")?)
            .filter(|end| *end <= body.len())
            .ok_or(Error::LengthMismatch {
                declared: dict_length,
                found: (body.len() - dict_start) as u64,
            })?;
        let dict = Dictionary::from_bytes(&body[dict_start..dict_end]);
        offset = dict_end;

        bundle.flags = BundleFlags::from(flags);
        if bundle.flags.is_fragment {
            let frag_offset = next(body, &mut offset, "fragment offset")?;
            let total_adu_length =
                next(body, &mut offset, "total application data unit length")?;
            bundle.fragment = Some(FragmentInfo {
                offset: frag_offset,
                total_adu_length,
            });
        }

        bundle.version = Version::V6;
        bundle.dest = dict.eid(dest_scheme, dest_ssp)?;
        bundle.source = dict.eid(source_scheme, source_ssp)?;
        bundle.replyto = dict.eid(replyto_scheme, replyto_ssp)?;
        bundle.custodian = dict.eid(custodian_scheme, custodian_ssp)?;
        bundle.timestamp = crate::creation_timestamp::CreationTimestamp::new(ts_seconds, ts_sequence);
        bundle.lifetime = lifetime;
        bundle.recv_blocks.dict = dict;
        Ok(())
    }
}

impl BlockProcessor for PrimaryBlockProcessor {
    fn block_type(&self) -> BlockType {
        BlockType::Primary
    }

    fn consume(
        &self,
        bundle: &mut Bundle,
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

            if let Some((_, block_length, header_len)) =
                Self::try_parse_header(&block.contents)?
            {
                block.data_offset = header_len;
                block.data_length =
                    usize::try_from(block_length).map_err(|_| Error::LengthMismatch {
                        declared: block_length,
                        found: 0,
                    })?;
            }
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
            let (flags, _, _) = Self::try_parse_header(&block.contents)?
                .expect("header was parsed before the body");
            Self::parse_fields(bundle, block, flags)?;
        }
        Ok(consumed)
    }

    fn prepare(
        &self,
        bundle: &Bundle,
        xmit_blocks: &mut BlockInfoVec,
        _source: Option<&BlockInfo>,
        _ctx: &XmitContext,
        _list: ListOwner,
    ) -> Result<(), Error> {
        // Dictionary order follows the offset order of the primary block.
        xmit_blocks.dict.intern_eid(&bundle.dest);
        xmit_blocks.dict.intern_eid(&bundle.source);
        xmit_blocks.dict.intern_eid(&bundle.replyto);
        xmit_blocks.dict.intern_eid(&bundle.custodian);
        xmit_blocks.push(BlockInfo::new(BlockType::Primary));
        Ok(())
    }

    fn generate(
        &self,
        bundle: &Bundle,
        dict: &Dictionary,
        block: &mut BlockInfo,
        _ctx: &XmitContext,
        _last: bool,
    ) -> Result<(), Error> {
        let offsets_of = |eid: &crate::eid::EndpointId| -> Result<(u64, u64), Error> {
            match (dict.offset_of(eid.scheme()), dict.offset_of(eid.ssp())) {
                (Some(scheme), Some(ssp)) => Ok((scheme, ssp)),
                _ => Err(Error::InvalidField {
                    field: "primary block eid",
                    source: format!("EID {eid} not interned in outbound dictionary").into(),
                }),
            }
        };

        let mut body = Vec::new();
        for eid in [&bundle.dest, &bundle.source, &bundle.replyto, &bundle.custodian] {
            let (scheme, ssp) = offsets_of(eid)?;
            body.extend_from_slice(&sdnv::encode(scheme));
            body.extend_from_slice(&sdnv::encode(ssp));
        }
        body.extend_from_slice(&sdnv::encode(bundle.timestamp.seconds));
        body.extend_from_slice(&sdnv::encode(bundle.timestamp.sequence));
        body.extend_from_slice(&sdnv::encode(bundle.lifetime));
        body.extend_from_slice(&sdnv::encode(dict.len() as u64));
        body.extend_from_slice(dict.as_bytes());
        if let Some(fragment) = &bundle.fragment {
            body.extend_from_slice(&sdnv::encode(fragment.offset));
            body.extend_from_slice(&sdnv::encode(fragment.total_adu_length));
        }

        let mut contents = vec![BPV6_VERSION];
        contents.extend_from_slice(&sdnv::encode(u64::from(&bundle.flags)));
        contents.extend_from_slice(&sdnv::encode(body.len() as u64));
        block.data_offset = contents.len();
        block.data_length = body.len();
        contents.extend_from_slice(&body);
        block.contents = contents;
        block.flags = 0;
        block.complete = true;
        Ok(())
    }

    fn validate(
        &self,
        _bundle: &Bundle,
        _block: &BlockInfo,
        _reception_reason: &mut Option<ReasonCode>,
        _deletion_reason: &mut Option<ReasonCode>,
    ) -> bool {
        true
    }

    fn format(&self) -> &'static str {
        "Primary"
    }
}
