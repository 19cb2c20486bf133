use byteorder::{BigEndian, ByteOrder};
use cannyls::lump::{LumpData, LumpId};
use cannyls::nvm::{FileNvm, MemoryNvm, NonVolatileMemory};
use cannyls::storage::{Storage, StorageBuilder};
use prometrics::metrics::MetricBuilder;
use std::fmt;
use std::ops::Range;
use std::path::Path;

use crate::row::SegmentRow;
use crate::types::SegmentId;
use crate::{ErrorKind, Result};

const LUMP_NAMESPACE_ROW: u8 = 1;
const LUMP_NAMESPACE_SEQUENCE: u8 = 2;
const LUMP_NAMESPACE_META: u8 = 3;

/// セグメントの記録とチャンクを永続化するためのインタフェース。
///
/// 各操作は単体でアトミックであることが期待される。
/// 失敗は全て`ErrorKind::Storage`として報告される。
pub trait SegmentStore: Send {
    /// セグメントの記録を保存(上書き)する。
    fn put_row(&mut self, segment_id: SegmentId, row: &SegmentRow) -> Result<()>;

    /// セグメントの記録を削除する。
    fn delete_row(&mut self, segment_id: SegmentId) -> Result<()>;

    /// チャンクのペイロードを保存する。
    fn put_sequence(&mut self, segment_id: SegmentId, sequence_num: u32, payload: &[u8])
        -> Result<()>;

    /// チャンクのペイロードを取得する。
    fn get_sequence(&mut self, segment_id: SegmentId, sequence_num: u32)
        -> Result<Option<Vec<u8>>>;

    /// セグメントに属する全てのチャンクを削除し、削除した数を返す。
    fn delete_sequences(&mut self, segment_id: SegmentId) -> Result<usize>;

    /// 保存されている全てのセグメントの記録を返す。
    fn load_rows(&mut self) -> Result<Vec<(SegmentId, SegmentRow)>>;

    /// 次に払い出すセグメントIDを保存する。
    ///
    /// 記録が削除された後も、そのIDが再利用されないようにするために用いられる。
    fn put_next_segment_id(&mut self, next: SegmentId) -> Result<()>;

    /// 保存されている次のセグメントIDを返す。
    fn load_next_segment_id(&mut self) -> Result<Option<SegmentId>>;
}

/// `cannyls`のストレージを用いた`SegmentStore`の実装。
pub struct LumpStore<N: NonVolatileMemory> {
    storage: Storage<N>,
}
impl<N: NonVolatileMemory> fmt::Debug for LumpStore<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LumpStore {{ .. }}")
    }
}
impl LumpStore<MemoryNvm> {
    /// メモリ上に`capacity`バイトのストレージを作成する。
    pub fn memory(capacity: u64) -> Result<Self> {
        let nvm = MemoryNvm::new(vec![0; capacity as usize]);
        let storage = track!(builder("memory").create(nvm))?;
        Ok(LumpStore { storage })
    }
}
impl LumpStore<FileNvm> {
    /// `path`のファイルをストレージとして開く。
    ///
    /// ファイルが存在しない場合には`capacity`バイトのストレージが新規に作成される。
    pub fn open_file<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        let (nvm, created) = track!(FileNvm::create_if_absent(path.as_ref(), capacity))?;
        let builder = builder("file");
        let storage = if created {
            track!(builder.create(nvm))?
        } else {
            track!(builder.open(nvm))?
        };
        Ok(LumpStore { storage })
    }
}
impl<N> SegmentStore for LumpStore<N>
where
    N: NonVolatileMemory + Send,
{
    fn put_row(&mut self, segment_id: SegmentId, row: &SegmentRow) -> Result<()> {
        let bytes = track!(row.to_bytes())?;
        let data = track!(LumpData::new_embedded(bytes))?;
        track!(self.storage.put(&make_row_lump_id(segment_id), &data))?;
        Ok(())
    }

    fn delete_row(&mut self, segment_id: SegmentId) -> Result<()> {
        track!(self.storage.delete(&make_row_lump_id(segment_id)))?;
        Ok(())
    }

    fn put_sequence(
        &mut self,
        segment_id: SegmentId,
        sequence_num: u32,
        payload: &[u8],
    ) -> Result<()> {
        let data = track!(LumpData::new(payload.to_owned()))?;
        let lump_id = make_sequence_lump_id(segment_id, sequence_num);
        track!(self.storage.put(&lump_id, &data))?;
        Ok(())
    }

    fn get_sequence(
        &mut self,
        segment_id: SegmentId,
        sequence_num: u32,
    ) -> Result<Option<Vec<u8>>> {
        let lump_id = make_sequence_lump_id(segment_id, sequence_num);
        let data = track!(self.storage.get(&lump_id))?;
        Ok(data.map(|d| d.as_bytes().to_owned()))
    }

    fn delete_sequences(&mut self, segment_id: SegmentId) -> Result<usize> {
        let deleted = track!(self.storage.delete_range(sequence_lump_id_range(segment_id)))?;
        Ok(deleted.len())
    }

    fn load_rows(&mut self) -> Result<Vec<(SegmentId, SegmentRow)>> {
        let mut rows = Vec::new();
        for lump_id in self.storage.list_range(row_lump_id_range()) {
            let segment_id = get_segment_id_from_lump_id(lump_id);
            if let Some(data) = track!(self.storage.get(&lump_id))? {
                let row = track!(
                    SegmentRow::from_bytes(data.as_bytes()),
                    "segment_id={}",
                    segment_id
                )?;
                rows.push((segment_id, row));
            }
        }
        Ok(rows)
    }

    fn put_next_segment_id(&mut self, next: SegmentId) -> Result<()> {
        let mut bytes = vec![0; 8];
        BigEndian::write_u64(&mut bytes, next);
        let data = track!(LumpData::new_embedded(bytes))?;
        track!(self.storage.put(&next_segment_id_lump_id(), &data))?;
        Ok(())
    }

    fn load_next_segment_id(&mut self) -> Result<Option<SegmentId>> {
        let data = track!(self.storage.get(&next_segment_id_lump_id()))?;
        if let Some(data) = data {
            let bytes = data.as_bytes();
            track_assert_eq!(bytes.len(), 8, ErrorKind::Storage);
            Ok(Some(BigEndian::read_u64(bytes)))
        } else {
            Ok(None)
        }
    }
}

fn builder(device: &str) -> StorageBuilder {
    let mut builder = StorageBuilder::new();
    builder.journal_region_ratio(0.05).metrics(
        MetricBuilder::new()
            .label("device", device)
            .clone(),
    );
    builder
}

/// `id[0]`は名前空間、`id[4..12]`はセグメントID、`id[12..16]`はシーケンス番号。
fn make_lump_id(namespace: u8, segment_id: SegmentId, sequence_num: u32) -> LumpId {
    let mut id = [0; 16];
    id[0] = namespace;
    BigEndian::write_u64(&mut id[4..12], segment_id);
    BigEndian::write_u32(&mut id[12..], sequence_num);
    LumpId::new(BigEndian::read_u128(&id[..]))
}

fn make_row_lump_id(segment_id: SegmentId) -> LumpId {
    make_lump_id(LUMP_NAMESPACE_ROW, segment_id, 0)
}

fn make_sequence_lump_id(segment_id: SegmentId, sequence_num: u32) -> LumpId {
    make_lump_id(LUMP_NAMESPACE_SEQUENCE, segment_id, sequence_num)
}

fn next_segment_id_lump_id() -> LumpId {
    make_lump_id(LUMP_NAMESPACE_META, 0, 0)
}

fn get_segment_id_from_lump_id(lump_id: LumpId) -> SegmentId {
    let mut id = [0; 16];
    BigEndian::write_u128(&mut id, lump_id.as_u128());
    BigEndian::read_u64(&id[4..12])
}

fn row_lump_id_range() -> Range<LumpId> {
    let start = make_row_lump_id(0);
    let end = make_lump_id(LUMP_NAMESPACE_ROW + 1, 0, 0);
    start..end
}

fn sequence_lump_id_range(segment_id: SegmentId) -> Range<LumpId> {
    let start = make_sequence_lump_id(segment_id, 0);
    let end = LumpId::new(start.as_u128() + (1 << 32));
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbusio_nodedb::NodeId;
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use crate::row::SegmentState;
    use crate::types::{SegmentEntry, Timestamp};

    fn row(segment_num: u8) -> SegmentRow {
        SegmentRow::new(SegmentEntry {
            collection_id: 1,
            key: "foo".to_owned(),
            unified_id: 10,
            timestamp: Timestamp::from_micros(100),
            conjoined_part: 0,
            segment_num,
            source_node_id: NodeId(1),
            handoff_node_id: None,
        })
    }

    #[test]
    fn lump_id_layout_works() {
        let lump_id = make_sequence_lump_id(0x0102_0304_0506_0708, 9);
        assert_eq!(
            lump_id.as_u128(),
            0x0200_0000_0102_0304_0506_0708_0000_0009
        );
        assert_eq!(get_segment_id_from_lump_id(lump_id), 0x0102_0304_0506_0708);

        let range = sequence_lump_id_range(3);
        assert!(range.start <= make_sequence_lump_id(3, u32::max_value()));
        assert!(make_sequence_lump_id(3, u32::max_value()) < range.end);
        assert!(!(make_sequence_lump_id(4, 0) < range.end));
    }

    #[test]
    fn sequences_are_deleted_per_segment() -> TestResult {
        let mut store = track!(LumpStore::memory(1024 * 1024))?;
        for seq in 0..3 {
            track!(store.put_sequence(1, seq, b"one"))?;
            track!(store.put_sequence(2, seq, b"two"))?;
        }
        assert_eq!(track!(store.get_sequence(1, 2))?, Some(b"one".to_vec()));
        assert_eq!(track!(store.get_sequence(1, 3))?, None);

        assert_eq!(track!(store.delete_sequences(1))?, 3);
        assert_eq!(track!(store.get_sequence(1, 0))?, None);
        assert_eq!(track!(store.get_sequence(2, 0))?, Some(b"two".to_vec()));
        Ok(())
    }

    #[test]
    fn rows_are_listed() -> TestResult {
        let mut store = track!(LumpStore::memory(1024 * 1024))?;
        track!(store.put_row(1, &row(1)))?;
        track!(store.put_row(2, &row(2)))?;
        track!(store.put_sequence(1, 0, b"payload"))?;

        let mut updated = row(2);
        updated.state = SegmentState::Writing;
        track!(store.put_row(2, &updated))?;
        track!(store.delete_row(1))?;

        let rows = track!(store.load_rows())?;
        assert_eq!(rows, vec![(2, updated)]);
        Ok(())
    }

    #[test]
    fn next_segment_id_is_kept_apart_from_rows() -> TestResult {
        let mut store = track!(LumpStore::memory(1024 * 1024))?;
        assert_eq!(track!(store.load_next_segment_id())?, None);

        track!(store.put_row(1, &row(1)))?;
        track!(store.put_next_segment_id(2))?;
        track!(store.put_next_segment_id(5))?;
        assert_eq!(track!(store.load_next_segment_id())?, Some(5));
        assert_eq!(track!(store.load_rows())?, vec![(1, row(1))]);
        Ok(())
    }

    #[test]
    fn file_store_survives_reopen() -> TestResult {
        let dir = track_any_err!(TempDir::new("nimbusio_datawriter"))?;
        let path = dir.path().join("segments.lusf");
        {
            let mut store = track!(LumpStore::open_file(&path, 1024 * 1024))?;
            track!(store.put_row(7, &row(1)))?;
            track!(store.put_sequence(7, 0, b"hello"))?;
            track!(store.put_next_segment_id(8))?;
        }
        let mut store = track!(LumpStore::open_file(&path, 1024 * 1024))?;
        assert_eq!(track!(store.load_rows())?, vec![(7, row(1))]);
        assert_eq!(track!(store.get_sequence(7, 0))?, Some(b"hello".to_vec()));
        assert_eq!(track!(store.load_next_segment_id())?, Some(8));
        Ok(())
    }
}
