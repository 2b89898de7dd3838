use binrw::io::{Read, Seek, Write};
use binrw::{binrw, BinRead, BinResult, BinWrite, Endian};
use derive_more::Display;
use std::str::FromStr;
use uuid::Uuid;

mod rpc;
pub use self::rpc::*;

/// Identity of a node
///
/// Assigned in the configuration and stable for the whole lifetime
/// of the node. Candidates put it in `RequestVote`, and followers
/// remember it as the target of their vote.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[binrw]
#[brw(big)]
pub struct NodeId(
    #[br(map = Uuid::from_bytes)]
    #[bw(map = |id: &Uuid| *id.as_bytes())]
    pub Uuid,
);

impl NodeId {
    pub const BYTE_SIZE: usize = 16;

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Raft term (election id)
#[derive(
    Copy, Clone, Debug, Default, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Hash, Display,
)]
#[br(big)]
#[bw(big)]
pub struct TermId(pub u32);

impl TermId {
    pub const BYTE_SIZE: usize = 4;

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Position of an entry in the replicated log, as sent over the wire
#[derive(
    Copy, Clone, Debug, Default, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Display,
)]
#[br(big)]
#[bw(big)]
pub struct LogIndex(pub u32);

impl LogIndex {
    pub const BYTE_SIZE: usize = 4;
}

/// Single entry of the replicated log
///
/// The payload is opaque to the consensus layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct LogEntry {
    /// Term in which the leader received the entry
    pub term: TermId,
    #[br(parse_with = parse_vec)]
    #[bw(write_with = write_vec)]
    pub payload: Vec<u8>,
}

/// Read a `u32` element count followed by that many elements
pub fn parse_vec<T, R>(reader: &mut R, endian: Endian, _: ()) -> BinResult<Vec<T>>
where
    R: Read + Seek,
    T: for<'a> BinRead<Args<'a> = ()>,
{
    let count = u32::read_options(reader, endian, ())?;
    (0..count)
        .map(|_| T::read_options(reader, endian, ()))
        .collect()
}

/// Counterpart of [`parse_vec`]
#[allow(clippy::ptr_arg)]
pub fn write_vec<T, W>(items: &Vec<T>, writer: &mut W, endian: Endian, _: ()) -> BinResult<()>
where
    W: Write + Seek,
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let count = match u32::try_from(items.len()) {
        Ok(count) => count,
        Err(_) => {
            return Err(binrw::Error::AssertFail {
                pos: writer.stream_position()?,
                message: format!("too many elements: {}", items.len()),
            })
        }
    };
    count.write_options(writer, endian, ())?;
    for item in items {
        item.write_options(writer, endian, ())?;
    }
    Ok(())
}

#[test]
fn node_id_parses_and_serializes_as_raw_bytes() {
    use std::io::Cursor;

    let id: NodeId = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
    let mut buf = vec![];
    id.write(&mut Cursor::new(&mut buf)).unwrap();

    assert_eq!(buf.len(), NodeId::BYTE_SIZE);
    assert_eq!(&buf[..4], &[0x67, 0xe5, 0x50, 0x44]);
    assert_eq!(id, NodeId::read(&mut Cursor::new(&buf)).unwrap());
    assert!("not-a-uuid".parse::<NodeId>().is_err());
}

#[test]
fn log_entry_payload_is_length_prefixed() {
    use std::io::Cursor;

    let entry = LogEntry {
        term: TermId(0x0102_0304),
        payload: vec![9, 8, 7],
    };
    let mut buf = vec![];
    entry.write(&mut Cursor::new(&mut buf)).unwrap();

    assert_eq!(buf, [1, 2, 3, 4, 0, 0, 0, 3, 9, 8, 7]);
    assert_eq!(entry, LogEntry::read(&mut Cursor::new(&buf)).unwrap());
}
