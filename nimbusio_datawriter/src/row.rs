use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use nimbusio_nodedb::NodeId;
use std::io::{Cursor, Read};
use trackable::error::ErrorKindExt;

use crate::types::{Md5Digest, SegmentEntry, Timestamp, MD5_DIGEST_LEN};
use crate::{Error, ErrorKind, Result};

const ROW_FORMAT_VERSION: u8 = 1;

/// セグメントの状態。
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentState {
    Created = 0,
    Writing = 1,
    Finalized = 2,
    Aborted = 3,
    Incomplete = 4,
}
impl SegmentState {
    /// チャンクの追記や確定を受け付ける状態かどうかを判定する。
    pub fn is_writable(self) -> bool {
        match self {
            SegmentState::Created | SegmentState::Writing => true,
            _ => false,
        }
    }

    /// 同じ識別子を持つ新しいセグメントの作成を妨げる状態かどうかを判定する。
    ///
    /// `Aborted`と`Incomplete`のセグメントは、新しいセグメントによって置き換えられる。
    pub fn blocks_duplicates(self) -> bool {
        self.is_writable() || self == SegmentState::Finalized
    }

    fn from_u8(n: u8) -> Result<Self> {
        Ok(match n {
            0 => SegmentState::Created,
            1 => SegmentState::Writing,
            2 => SegmentState::Finalized,
            3 => SegmentState::Aborted,
            4 => SegmentState::Incomplete,
            _ => track_panic!(ErrorKind::Corrupted, "Unknown segment state: {}", n),
        })
    }
}

/// 永続化されるセグメントの記録。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRow {
    /// セグメントの識別情報。
    pub entry: SegmentEntry,

    /// 現在の状態。
    pub state: SegmentState,

    /// 宣言されたセグメントサイズ。
    ///
    /// 最初のチャンクを受理するまでは`0`。
    pub segment_size: u64,

    /// 確定時に検証されたセグメント全体のMD5。
    ///
    /// 確定前は全て`0`。
    pub md5_digest: Md5Digest,
}
impl SegmentRow {
    /// 作成直後のセグメントの記録を生成する。
    pub fn new(entry: SegmentEntry) -> Self {
        SegmentRow {
            entry,
            state: SegmentState::Created,
            segment_size: 0,
            md5_digest: [0; MD5_DIGEST_LEN],
        }
    }

    /// バイト列に変換する。
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let key = self.entry.key.as_bytes();
        track_assert!(
            key.len() <= u16::max_value() as usize,
            ErrorKind::Invalid,
            "Too long key: {} bytes",
            key.len()
        );

        let mut buf = Vec::with_capacity(60 + key.len());
        track!(buf.write_u8(ROW_FORMAT_VERSION).map_err(Error::from))?;
        track!(buf.write_u8(self.state as u8).map_err(Error::from))?;
        track!(buf
            .write_u32::<BigEndian>(self.entry.collection_id)
            .map_err(Error::from))?;
        track!(buf
            .write_u64::<BigEndian>(self.entry.unified_id)
            .map_err(Error::from))?;
        track!(buf
            .write_u64::<BigEndian>(self.entry.timestamp.as_micros())
            .map_err(Error::from))?;
        track!(buf
            .write_u32::<BigEndian>(self.entry.conjoined_part)
            .map_err(Error::from))?;
        track!(buf.write_u8(self.entry.segment_num).map_err(Error::from))?;
        track!(buf
            .write_u32::<BigEndian>(self.entry.source_node_id.0)
            .map_err(Error::from))?;
        let handoff = self.entry.handoff_node_id.map_or(0, |n| n.0);
        track!(buf.write_u32::<BigEndian>(handoff).map_err(Error::from))?;
        track!(buf
            .write_u64::<BigEndian>(self.segment_size)
            .map_err(Error::from))?;
        buf.extend_from_slice(&self.md5_digest);
        let mut len = [0; 2];
        BigEndian::write_u16(&mut len, key.len() as u16);
        buf.extend_from_slice(&len);
        buf.extend_from_slice(key);
        Ok(buf)
    }

    /// バイト列から復元する。
    ///
    /// 未知のバージョンや途中で切れたバイト列の場合には`ErrorKind::Corrupted`が返される。
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        track!(Self::decode(bytes).map_err(|e| Error::from(ErrorKind::Corrupted.takes_over(e))))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(bytes);
        let version = track!(reader.read_u8().map_err(Error::from))?;
        track_assert_eq!(version, ROW_FORMAT_VERSION, ErrorKind::Corrupted);

        let state = track!(SegmentState::from_u8(track!(reader
            .read_u8()
            .map_err(Error::from))?))?;
        let collection_id = track!(reader.read_u32::<BigEndian>().map_err(Error::from))?;
        let unified_id = track!(reader.read_u64::<BigEndian>().map_err(Error::from))?;
        let timestamp = track!(reader.read_u64::<BigEndian>().map_err(Error::from))?;
        let conjoined_part = track!(reader.read_u32::<BigEndian>().map_err(Error::from))?;
        let segment_num = track!(reader.read_u8().map_err(Error::from))?;
        let source = track!(reader.read_u32::<BigEndian>().map_err(Error::from))?;
        let handoff = track!(reader.read_u32::<BigEndian>().map_err(Error::from))?;
        let segment_size = track!(reader.read_u64::<BigEndian>().map_err(Error::from))?;
        let mut md5_digest = [0; MD5_DIGEST_LEN];
        track!(reader.read_exact(&mut md5_digest).map_err(Error::from))?;
        let key_len = track!(reader.read_u16::<BigEndian>().map_err(Error::from))?;
        let mut key = vec![0; key_len as usize];
        track!(reader.read_exact(&mut key).map_err(Error::from))?;
        let key = track!(String::from_utf8(key).map_err(|e| ErrorKind::Corrupted.cause(e)))?;
        track_assert_eq!(
            reader.position(),
            bytes.len() as u64,
            ErrorKind::Corrupted,
            "Trailing bytes"
        );

        let entry = SegmentEntry {
            collection_id,
            key,
            unified_id,
            timestamp: Timestamp::from_micros(timestamp),
            conjoined_part,
            segment_num,
            source_node_id: NodeId(source),
            handoff_node_id: if handoff == 0 {
                None
            } else {
                Some(NodeId(handoff))
            },
        };
        Ok(SegmentRow {
            entry,
            state,
            segment_size,
            md5_digest,
        })
    }
}
