use md5::{Digest, Md5};
use nimbusio_nodedb::NodeId;
use slog::Logger;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use trackable::error::ErrorKindExt;

use crate::metrics::WriterMetrics;
use crate::row::{SegmentRow, SegmentState};
use crate::store::SegmentStore;
use crate::types::{
    adler32_of, finalize_md5, Md5Digest, SegmentEntry, SegmentId, SegmentIdentity, SequenceEntry,
    SEQUENCE_BASE,
};
use crate::{Error, ErrorKind, Result};

/// 一つのノード上のセグメントの永続的なライフサイクルを管理する。
///
/// 全ての操作は内部の単一のロックで直列化されるため、同一の識別子を持つセグメントが
/// 同時に二つ書き込み中になることはない。
/// 同じノードの全てのセグメント処理タスクから`Arc`経由で共有される。
///
/// 状態遷移:
///
/// ```text
/// Created --> Writing --> Finalized
///    |           |
///    +-----------+------> Aborted | Incomplete
/// ```
///
/// `Finalized`のセグメントも(クォーラム不成立時のロールバックのために)`Aborted`に遷移可能。
pub struct SegmentWriter {
    node_id: NodeId,
    inner: Mutex<Inner>,
}
impl SegmentWriter {
    /// `store`に保存されている記録を読み込んで、新しい`SegmentWriter`インスタンスを生成する。
    ///
    /// 前回のプロセスが書き込み途中(`Created`ないし`Writing`)のまま残したセグメントは`Incomplete`として扱われる。
    /// 削除が完了していない`Aborted`のセグメントは、ここで削除される。
    pub fn open<S>(logger: Logger, node_id: NodeId, store: S) -> Result<Self>
    where
        S: SegmentStore + 'static,
    {
        let logger = logger.new(o!("node" => node_id.to_string()));
        let metrics = track!(WriterMetrics::new(node_id))?;
        let mut inner = Inner {
            logger,
            metrics,
            store: Box::new(store),
            segments: HashMap::new(),
            identities: HashMap::new(),
            next_segment_id: 1,
        };
        track!(inner.recover())?;
        Ok(SegmentWriter {
            node_id,
            inner: Mutex::new(inner),
        })
    }

    /// このライタが属するノードのIDを返す。
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// 新しいセグメントを作成する。
    ///
    /// 同じ識別子を持つセグメントが書き込み中ないし確定済みの場合には`ErrorKind::DuplicateSegment`が返される。
    pub fn new_segment(&self, entry: SegmentEntry) -> Result<SegmentId> {
        let mut inner = track!(self.inner.lock().map_err(Error::from))?;
        track!(inner.new_segment(entry))
    }

    /// セグメントに一つのチャンクを追記する。
    pub fn write_sequence(
        &self,
        segment_id: SegmentId,
        sequence: &SequenceEntry,
        payload: &[u8],
    ) -> Result<()> {
        let mut inner = track!(self.inner.lock().map_err(Error::from))?;
        let result = inner.write_sequence(segment_id, sequence, payload);
        if result.is_err() {
            inner.metrics.rejected_sequences_total.increment();
        }
        track!(result)
    }

    /// セグメントを確定する。
    ///
    /// サイズないしMD5の検証に失敗した場合、セグメントは`Incomplete`となる(データは削除されない)。
    pub fn finalize_segment(&self, segment_id: SegmentId) -> Result<()> {
        let mut inner = track!(self.inner.lock().map_err(Error::from))?;
        track!(inner.finalize_segment(segment_id))
    }

    /// セグメントを破棄し、その記録と全てのチャンクを削除する。
    ///
    /// 何度呼び出しても良い。
    pub fn abort_segment(&self, segment_id: SegmentId) -> Result<()> {
        let mut inner = track!(self.inner.lock().map_err(Error::from))?;
        track!(inner.abort_segment(segment_id))
    }

    /// セグメントのハンドオフ先を設定する。
    ///
    /// 設定できるのは、チャンクを一つも受理していない間の一度だけ。
    pub fn set_handoff(&self, segment_id: SegmentId, handoff_node_id: NodeId) -> Result<()> {
        let mut inner = track!(self.inner.lock().map_err(Error::from))?;
        track!(inner.set_handoff(segment_id, handoff_node_id))
    }

    /// セグメントの現在の状態を返す。
    pub fn segment_state(&self, segment_id: SegmentId) -> Result<SegmentState> {
        let inner = track!(self.inner.lock().map_err(Error::from))?;
        if let Some(segment) = inner.segments.get(&segment_id) {
            Ok(segment.row.state)
        } else if inner.is_issued(segment_id) {
            Ok(SegmentState::Aborted)
        } else {
            track_panic!(ErrorKind::UnknownSegment, "segment_id={}", segment_id)
        }
    }

    /// セグメントの識別情報を返す。
    pub fn segment_entry(&self, segment_id: SegmentId) -> Result<SegmentEntry> {
        let inner = track!(self.inner.lock().map_err(Error::from))?;
        let segment = track!(inner.get(segment_id))?;
        Ok(segment.row.entry.clone())
    }

    /// 保存済みのチャンクのペイロードを返す。
    pub fn read_sequence(
        &self,
        segment_id: SegmentId,
        sequence_num: u32,
    ) -> Result<Option<Vec<u8>>> {
        let mut inner = track!(self.inner.lock().map_err(Error::from))?;
        let state = inner.segments.get(&segment_id).map(|s| s.row.state);
        if state.map_or(true, |s| s == SegmentState::Aborted) {
            track_assert!(
                inner.is_issued(segment_id),
                ErrorKind::UnknownSegment,
                "segment_id={}",
                segment_id
            );
            return Ok(None);
        }
        track!(inner.store.get_sequence(segment_id, sequence_num))
    }
}
impl fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SegmentWriter {{ node_id: {:?}, .. }}", self.node_id)
    }
}

struct Progress {
    next_sequence_num: u32,
    segment_size: Option<u64>,
    unpadded_bytes: u64,
    md5: Md5,
    last_md5_digest: Option<Md5Digest>,
}
impl Progress {
    fn new() -> Self {
        Progress {
            next_sequence_num: SEQUENCE_BASE,
            segment_size: None,
            unpadded_bytes: 0,
            md5: Md5::new(),
            last_md5_digest: None,
        }
    }
}

struct Segment {
    row: SegmentRow,

    // 書き込み可能な間だけ`Some`
    progress: Option<Progress>,
}

struct Inner {
    logger: Logger,
    metrics: WriterMetrics,
    store: Box<dyn SegmentStore>,
    segments: HashMap<SegmentId, Segment>,
    identities: HashMap<SegmentIdentity, SegmentId>,
    next_segment_id: SegmentId,
}
impl Inner {
    fn recover(&mut self) -> Result<()> {
        if let Some(next) = track!(self.store.load_next_segment_id())? {
            self.next_segment_id = self.next_segment_id.max(next);
        }
        let rows = track!(self.store.load_rows())?;
        for (segment_id, mut row) in rows {
            self.next_segment_id = self.next_segment_id.max(segment_id + 1);
            if row.state == SegmentState::Aborted {
                // 削除の途中で停止したセグメント
                if let Err(e) = self.delete_segment_data(segment_id) {
                    warn!(
                        self.logger,
                        "Cannot delete the aborted segment: segment_id={}, reason={}",
                        segment_id,
                        e
                    );
                    self.segments.insert(
                        segment_id,
                        Segment {
                            row,
                            progress: None,
                        },
                    );
                }
                continue;
            }
            if row.state.is_writable() {
                warn!(
                    self.logger,
                    "Unfinished segment is marked incomplete: segment_id={}, entry={}",
                    segment_id,
                    row.entry
                );
                row.state = SegmentState::Incomplete;
                track!(self.store.put_row(segment_id, &row))?;
            }
            if row.state.blocks_duplicates() {
                self.identities.insert(row.entry.identity(), segment_id);
            }
            self.segments.insert(
                segment_id,
                Segment {
                    row,
                    progress: None,
                },
            );
        }
        info!(
            self.logger,
            "Segment writer opened: segments={}, next_segment_id={}",
            self.segments.len(),
            self.next_segment_id
        );
        Ok(())
    }

    fn new_segment(&mut self, entry: SegmentEntry) -> Result<SegmentId> {
        track_assert_ne!(entry.segment_num, 0, ErrorKind::Invalid);
        track_assert!(
            !entry.source_node_id.is_reserved(),
            ErrorKind::Invalid,
            "entry={}",
            entry
        );
        let identity = entry.identity();
        if let Some(&existing) = self.identities.get(&identity) {
            let state = self.segments.get(&existing).map(|s| s.row.state);
            track_assert!(
                !state.map_or(false, SegmentState::blocks_duplicates),
                ErrorKind::DuplicateSegment,
                "entry={}, existing_segment_id={}, state={:?}",
                entry,
                existing,
                state
            );
        }

        let segment_id = self.next_segment_id;
        let row = SegmentRow::new(entry);
        track!(self.store.put_next_segment_id(segment_id + 1))?;
        self.next_segment_id += 1;
        track!(self.store.put_row(segment_id, &row))?;
        debug!(
            self.logger,
            "New segment: segment_id={}, entry={}", segment_id, row.entry
        );
        self.identities.insert(identity, segment_id);
        self.segments.insert(
            segment_id,
            Segment {
                row,
                progress: Some(Progress::new()),
            },
        );
        self.metrics.created_segments_total.increment();
        Ok(segment_id)
    }

    fn write_sequence(
        &mut self,
        segment_id: SegmentId,
        sequence: &SequenceEntry,
        payload: &[u8],
    ) -> Result<()> {
        let unpadded_bytes = {
            let segment = track!(self.get_writable(segment_id))?;
            let progress = track_assert_some!(segment.progress.as_ref(), ErrorKind::Other);
            track_assert_eq!(
                sequence.sequence_num,
                progress.next_sequence_num,
                ErrorKind::SequenceOrder,
                "segment_id={}",
                segment_id
            );
            let adler32 = adler32_of(payload);
            track_assert_eq!(
                sequence.adler32,
                adler32,
                ErrorKind::ChecksumMismatch,
                "segment_id={}, sequence_num={}",
                segment_id,
                sequence.sequence_num
            );
            if let Some(segment_size) = progress.segment_size {
                track_assert_eq!(
                    sequence.segment_size,
                    segment_size,
                    ErrorKind::SizeMismatch,
                    "Segment size changed: segment_id={}",
                    segment_id
                );
            }
            let padding = u64::from(sequence.zfec_padding_size);
            track_assert!(
                padding <= payload.len() as u64,
                ErrorKind::SizeMismatch,
                "Padding exceeds payload: padding={}, payload={}",
                padding,
                payload.len()
            );
            let unpadded_bytes = progress.unpadded_bytes + payload.len() as u64 - padding;
            track_assert!(
                unpadded_bytes <= sequence.segment_size,
                ErrorKind::SizeMismatch,
                "Segment overrun: segment_id={}, segment_size={}, written={}",
                segment_id,
                sequence.segment_size,
                unpadded_bytes
            );
            unpadded_bytes
        };

        if let Err(e) = self
            .store
            .put_sequence(segment_id, sequence.sequence_num, payload)
        {
            return Err(track!(self.abort_on_failure(segment_id, e)));
        }

        let first = {
            let segment = track!(self.get_mut(segment_id))?;
            let progress = track_assert_some!(segment.progress.as_mut(), ErrorKind::Other);
            progress.next_sequence_num += 1;
            progress.segment_size = Some(sequence.segment_size);
            progress.unpadded_bytes = unpadded_bytes;
            progress.md5.update(payload);
            progress.last_md5_digest = Some(sequence.md5_digest);
            if segment.row.state == SegmentState::Created {
                segment.row.state = SegmentState::Writing;
                segment.row.segment_size = sequence.segment_size;
                Some(segment.row.clone())
            } else {
                None
            }
        };
        if let Some(row) = first {
            if let Err(e) = self.store.put_row(segment_id, &row) {
                return Err(track!(self.abort_on_failure(segment_id, e)));
            }
        }
        self.metrics
            .written_bytes_total
            .add_u64(payload.len() as u64);
        Ok(())
    }

    fn finalize_segment(&mut self, segment_id: SegmentId) -> Result<()> {
        let (row, failure) = {
            let segment = track!(self.get_writable(segment_id))?;
            let progress = track_assert_some!(segment.progress.take(), ErrorKind::Other);
            let digest = finalize_md5(progress.md5);
            let mut row = segment.row.clone();
            let failure: Option<Error> = match (progress.segment_size, progress.last_md5_digest) {
                (Some(size), Some(declared)) => {
                    if progress.unpadded_bytes != size {
                        Some(track!(Error::from(ErrorKind::SizeMismatch.cause(format!(
                            "segment_id={}, segment_size={}, written={}",
                            segment_id, size, progress.unpadded_bytes
                        )))))
                    } else if digest != declared {
                        Some(track!(Error::from(ErrorKind::ChecksumMismatch.cause(
                            format!("MD5 mismatch: segment_id={}", segment_id)
                        ))))
                    } else {
                        None
                    }
                }
                _ => Some(track!(Error::from(ErrorKind::SizeMismatch.cause(format!(
                    "No sequence has been written: segment_id={}",
                    segment_id
                ))))),
            };
            if failure.is_some() {
                row.state = SegmentState::Incomplete;
            } else {
                row.state = SegmentState::Finalized;
                row.md5_digest = digest;
            }
            segment.row = row.clone();
            (row, failure)
        };

        if let Err(e) = self.store.put_row(segment_id, &row) {
            return Err(track!(self.abort_on_failure(segment_id, e)));
        }
        if let Some(e) = failure {
            warn!(
                self.logger,
                "Segment is incomplete: segment_id={}, entry={}, reason={}",
                segment_id,
                row.entry,
                e
            );
            self.metrics.incomplete_segments_total.increment();
            return Err(e);
        }
        debug!(
            self.logger,
            "Segment finalized: segment_id={}, entry={}", segment_id, row.entry
        );
        self.metrics.finalized_segments_total.increment();
        Ok(())
    }

    fn abort_segment(&mut self, segment_id: SegmentId) -> Result<()> {
        let issued = self.is_issued(segment_id);
        let row = match self.segments.get_mut(&segment_id) {
            None => {
                track_assert!(
                    issued,
                    ErrorKind::UnknownSegment,
                    "segment_id={}",
                    segment_id
                );
                return Ok(());
            }
            Some(segment) => {
                if segment.row.state != SegmentState::Aborted {
                    segment.row.state = SegmentState::Aborted;
                    segment.progress = None;
                    self.metrics.aborted_segments_total.increment();
                    info!(
                        self.logger,
                        "Segment aborted: segment_id={}, entry={}", segment_id, segment.row.entry
                    );
                }
                segment.row.clone()
            }
        };
        let identity = row.entry.identity();
        if self.identities.get(&identity) == Some(&segment_id) {
            self.identities.remove(&identity);
        }

        // 失敗した場合には`Aborted`状態のまま残し、次回の呼び出しないし再起動時に再試行する
        track!(self.store.put_row(segment_id, &row))?;
        track!(self.delete_segment_data(segment_id))?;
        self.segments.remove(&segment_id);
        Ok(())
    }

    /// チャンクを削除した後に記録を削除する。
    fn delete_segment_data(&mut self, segment_id: SegmentId) -> Result<()> {
        let deleted = track!(self.store.delete_sequences(segment_id))?;
        track!(self.store.delete_row(segment_id))?;
        debug!(
            self.logger,
            "Segment deleted: segment_id={}, sequences={}", segment_id, deleted
        );
        Ok(())
    }

    fn set_handoff(&mut self, segment_id: SegmentId, handoff_node_id: NodeId) -> Result<()> {
        track_assert!(
            !handoff_node_id.is_reserved(),
            ErrorKind::Invalid,
            "segment_id={}",
            segment_id
        );
        let mut row = {
            let segment = track!(self.get(segment_id))?;
            track_assert_eq!(
                segment.row.state,
                SegmentState::Created,
                ErrorKind::HandoffImmutable,
                "segment_id={}",
                segment_id
            );
            track_assert!(
                segment.row.entry.handoff_node_id.is_none(),
                ErrorKind::HandoffImmutable,
                "segment_id={}, handoff={:?}",
                segment_id,
                segment.row.entry.handoff_node_id
            );
            segment.row.clone()
        };
        row.entry.handoff_node_id = Some(handoff_node_id);
        track!(self.store.put_row(segment_id, &row))?;
        track!(self.get_mut(segment_id))?.row = row;
        Ok(())
    }

    fn abort_on_failure(&mut self, segment_id: SegmentId, e: Error) -> Error {
        error!(
            self.logger,
            "Storage failure; the segment will be aborted: segment_id={}, reason={}", segment_id, e
        );
        if let Err(abort_error) = self.abort_segment(segment_id) {
            warn!(
                self.logger,
                "Cannot delete the aborted segment: segment_id={}, reason={}",
                segment_id,
                abort_error
            );
        }
        track!(e)
    }

    fn is_issued(&self, segment_id: SegmentId) -> bool {
        0 < segment_id && segment_id < self.next_segment_id
    }

    fn get(&self, segment_id: SegmentId) -> Result<&Segment> {
        if let Some(segment) = self.segments.get(&segment_id) {
            Ok(segment)
        } else if self.is_issued(segment_id) {
            track_panic!(ErrorKind::SegmentClosed, "Aborted: segment_id={}", segment_id)
        } else {
            track_panic!(ErrorKind::UnknownSegment, "segment_id={}", segment_id)
        }
    }

    fn get_mut(&mut self, segment_id: SegmentId) -> Result<&mut Segment> {
        let issued = self.is_issued(segment_id);
        if let Some(segment) = self.segments.get_mut(&segment_id) {
            Ok(segment)
        } else if issued {
            track_panic!(ErrorKind::SegmentClosed, "Aborted: segment_id={}", segment_id)
        } else {
            track_panic!(ErrorKind::UnknownSegment, "segment_id={}", segment_id)
        }
    }

    fn get_writable(&mut self, segment_id: SegmentId) -> Result<&mut Segment> {
        let segment = track!(self.get_mut(segment_id))?;
        track_assert!(
            segment.row.state.is_writable(),
            ErrorKind::SegmentClosed,
            "segment_id={}, state={:?}",
            segment_id,
            segment.row.state
        );
        Ok(segment)
    }
}
