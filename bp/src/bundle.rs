/*!
The in-memory bundle model shared by the BPv6 and BPv7 codecs.

A [`Bundle`] is built incrementally by [`crate::protocol::consume`] and read
back out by [`crate::protocol::produce`]. Extension-block state that the
engine acts on (age, hop counts, custody-transfer-enhancement, class of
service) is lifted onto the bundle by the owning block processor when the
block completes; the raw blocks stay in `recv_blocks` for re-emission.
*/

use crate::{
    block::BlockInfoVec,
    creation_timestamp::CreationTimestamp,
    eid::EndpointId,
};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// Bundle protocol version of a parsed bundle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Not yet known: nothing has been parsed.
    #[default]
    Unknown,
    /// RFC 5050.
    V6,
    /// RFC 9171.
    V7,
}

/// The bundle processing flags of RFC 5050 section 4.2.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BundleFlags {
    pub is_fragment: bool,
    pub is_admin: bool,
    pub do_not_fragment: bool,
    pub custody_requested: bool,
    pub singleton_dest: bool,
    /// Application acknowledgement requested.
    pub app_ack_requested: bool,
    /// Class of service, 0 (bulk) to 3.
    pub priority: u8,
    pub receive_receipt: bool,
    pub custody_receipt: bool,
    pub forward_receipt: bool,
    pub delivery_receipt: bool,
    pub deletion_receipt: bool,
    /// Any flag bits this implementation does not recognise, preserved for
    /// re-emission.
    pub unrecognised: u64,
}

impl From<&BundleFlags> for u64 {
    fn from(value: &BundleFlags) -> Self {
        let mut flags = value.unrecognised;
        if value.is_fragment {
            flags |= 1 << 0;
        }
        if value.is_admin {
            flags |= 1 << 1;
        }
        if value.do_not_fragment {
            flags |= 1 << 2;
        }
        if value.custody_requested {
            flags |= 1 << 3;
        }
        if value.singleton_dest {
            flags |= 1 << 4;
        }
        if value.app_ack_requested {
            flags |= 1 << 5;
        }
        flags |= ((value.priority & 0x03) as u64) << 7;
        if value.receive_receipt {
            flags |= 1 << 14;
        }
        if value.custody_receipt {
            flags |= 1 << 15;
        }
        if value.forward_receipt {
            flags |= 1 << 16;
        }
        if value.delivery_receipt {
            flags |= 1 << 17;
        }
        if value.deletion_receipt {
            flags |= 1 << 18;
        }
        flags
    }
}

impl From<u64> for BundleFlags {
    fn from(value: u64) -> Self {
        const KNOWN: u64 =
            (1 << 0) | (1 << 1) | (1 << 2) | (1 << 3) | (1 << 4) | (1 << 5) | (0x03 << 7)
                | (1 << 14) | (1 << 15) | (1 << 16) | (1 << 17) | (1 << 18);
        Self {
            is_fragment: value & (1 << 0) != 0,
            is_admin: value & (1 << 1) != 0,
            do_not_fragment: value & (1 << 2) != 0,
            custody_requested: value & (1 << 3) != 0,
            singleton_dest: value & (1 << 4) != 0,
            app_ack_requested: value & (1 << 5) != 0,
            priority: ((value >> 7) & 0x03) as u8,
            receive_receipt: value & (1 << 14) != 0,
            custody_receipt: value & (1 << 15) != 0,
            forward_receipt: value & (1 << 16) != 0,
            delivery_receipt: value & (1 << 17) != 0,
            deletion_receipt: value & (1 << 18) != 0,
            unrecognised: value & !KNOWN,
        }
    }
}

/// Fragment fields from the primary block, present when `is_fragment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Offset of this fragment's payload within the original ADU.
    pub offset: u64,
    /// Total length of the original application data unit.
    pub total_adu_length: u64,
}

/// Hop count state (BPv7 Hop Count block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopInfo {
    pub limit: u64,
    pub count: u64,
}

/// Custody Transfer Enhancement block state: the custody id assigned by the
/// current custodian, used to acknowledge by transmission id in aggregate
/// custody signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtebInfo {
    pub custody_id: u64,
    pub custodian: EndpointId,
}

/// Extended class of service block state, carried opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcosInfo {
    pub flags: u8,
    pub ordinal: u8,
    pub flow_label: Option<u64>,
}

/// The payload of a bundle: in memory, or spilled to a file and streamed.
#[derive(Debug, Clone)]
pub enum Payload {
    Memory(Vec<u8>),
    File { path: PathBuf, len: u64 },
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Memory(Vec::new())
    }
}

impl Payload {
    pub fn len(&self) -> u64 {
        match self {
            Payload::Memory(data) => data.len() as u64,
            Payload::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends bytes arriving off the wire.
    pub fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Payload::Memory(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Payload::File { path, len } => {
                use std::io::Write;
                let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
                file.write_all(data)?;
                *len += data.len() as u64;
                Ok(())
            }
        }
    }

    /// Reads up to `buf.len()` payload bytes starting at `offset`.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Payload::Memory(data) => {
                let start = (offset as usize).min(data.len());
                let end = (start + buf.len()).min(data.len());
                buf[..end - start].copy_from_slice(&data[start..end]);
                Ok(end - start)
            }
            Payload::File { path, .. } => {
                let mut file = std::fs::File::open(path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut read = 0;
                while read < buf.len() {
                    let n = file.read(&mut buf[read..])?;
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
                Ok(read)
            }
        }
    }

    /// Truncates the payload to `len` bytes.
    pub fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        match self {
            Payload::Memory(data) => {
                data.truncate(len as usize);
                Ok(())
            }
            Payload::File { path, len: flen } => {
                let file = std::fs::OpenOptions::new().write(true).open(path)?;
                file.set_len(len)?;
                *flen = len;
                Ok(())
            }
        }
    }
}

/// A bundle: primary-block fields, payload, and the parsed block sequences.
#[derive(Debug, Default, Clone)]
pub struct Bundle {
    pub version: Version,
    pub source: EndpointId,
    pub dest: EndpointId,
    pub replyto: EndpointId,
    pub custodian: EndpointId,
    /// EID of the node this bundle most recently arrived from, from the
    /// Previous Hop block (not serialized in the primary block).
    pub prevhop: EndpointId,
    pub timestamp: CreationTimestamp,
    /// Lifetime in seconds from the creation timestamp.
    pub lifetime: u64,
    pub flags: BundleFlags,
    pub fragment: Option<FragmentInfo>,
    /// Bundle age in milliseconds, from a Bundle Age block.
    pub age: Option<u64>,
    pub hop_info: Option<HopInfo>,
    pub cteb: Option<CtebInfo>,
    pub ecos: Option<EcosInfo>,
    pub payload: Payload,
    /// Blocks as parsed off the wire, in order.
    pub recv_blocks: BlockInfoVec,
    /// Locally generated blocks to be appended on transmit.
    pub api_blocks: BlockInfoVec,
    /// Accumulation buffer for the BPv7 consume path; drained into
    /// `recv_blocks` when the bundle completes.
    pub(crate) v7_raw: Vec<u8>,
}

impl Bundle {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            source: EndpointId::null(),
            dest: EndpointId::null(),
            replyto: EndpointId::null(),
            custodian: EndpointId::null(),
            prevhop: EndpointId::null(),
            ..Default::default()
        }
    }

    pub fn is_admin(&self) -> bool {
        self.flags.is_admin
    }

    pub fn is_fragment(&self) -> bool {
        self.flags.is_fragment
    }

    /// Lifetime in seconds; the expiration deadline is
    /// `timestamp.seconds + expiration()` on the DTN epoch clock.
    pub fn expiration(&self) -> u64 {
        self.lifetime
    }
}
