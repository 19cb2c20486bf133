use cannyls::nvm::MemoryNvm;
use futures::{future, Future};
use nimbusio_nodedb::NodeId;
use slog::{Discard, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::client::SegmentSink;
use crate::row::SegmentRow;
use crate::store::{LumpStore, SegmentStore};
use crate::types::{SegmentEntry, SegmentId, SequenceBuilder, SequenceEntry, Timestamp};
use crate::util::BoxFuture;
use crate::writer::SegmentWriter;
use crate::{Error, ErrorKind, Result};

/// `NodeId(1)`のメモリ上のライタを生成する。
pub fn memory_writer() -> Result<SegmentWriter> {
    let store = track!(LumpStore::memory(4 * 1024 * 1024))?;
    track!(SegmentWriter::open(
        Logger::root(Discard, o!()),
        NodeId(1),
        store
    ))
}

pub fn entry(key: &str, segment_num: u8) -> SegmentEntry {
    SegmentEntry {
        collection_id: 1,
        key: key.to_owned(),
        unified_id: 2,
        timestamp: Timestamp::now(),
        conjoined_part: 0,
        segment_num,
        source_node_id: NodeId(5),
        handoff_node_id: None,
    }
}

/// `data`を`chunk_len`バイト毎のチャンクに分割する。
///
/// 最後のチャンクには`padding`バイトのゼロが付与される。
pub fn chunks(data: &[u8], chunk_len: usize, padding: u32) -> Vec<(SequenceEntry, Vec<u8>)> {
    let mut builder = SequenceBuilder::new(data.len() as u64);
    let pieces = data.chunks(chunk_len).collect::<Vec<_>>();
    let last = pieces.len() - 1;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            let mut payload = piece.to_owned();
            let padding = if i == last { padding } else { 0 };
            payload.resize(payload.len() + padding as usize, 0);
            (builder.next_sequence(&payload, padding), payload)
        })
        .collect()
}

/// 全てのチャンクを送信した後に`finish`を呼び出す。
pub fn send_all(sink: SegmentSink, chunks: Vec<(SequenceEntry, Vec<u8>)>) -> BoxFuture<()> {
    let future = future::loop_fn((sink, chunks.into_iter()), |(sink, mut chunks)| {
        match chunks.next() {
            None => future::Either::A(sink.finish().map(future::Loop::Break)),
            Some((sequence, payload)) => future::Either::B(
                sink.send_sequence(sequence, payload)
                    .map(move |sink| future::Loop::Continue((sink, chunks))),
            ),
        }
    });
    Box::new(future)
}

/// 失敗を注入可能な`SegmentStore`。
#[derive(Clone)]
pub struct FlakyStore {
    inner: Arc<Mutex<LumpStore<MemoryNvm>>>,
    switch: FailureSwitch,
}
impl FlakyStore {
    pub fn new(inner: LumpStore<MemoryNvm>) -> Self {
        FlakyStore {
            inner: Arc::new(Mutex::new(inner)),
            switch: FailureSwitch::default(),
        }
    }

    pub fn switch(&self) -> FailureSwitch {
        self.switch.clone()
    }

    fn with_inner<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut LumpStore<MemoryNvm>) -> Result<T>,
    {
        let mut inner = track!(self.inner.lock().map_err(Error::from))?;
        f(&mut inner)
    }
}
impl SegmentStore for FlakyStore {
    fn put_row(&mut self, segment_id: SegmentId, row: &SegmentRow) -> Result<()> {
        if self.switch.rows.load(Ordering::SeqCst) {
            track_panic!(ErrorKind::Storage, "Injected failure");
        }
        self.with_inner(|s| s.put_row(segment_id, row))
    }

    fn delete_row(&mut self, segment_id: SegmentId) -> Result<()> {
        if self.switch.deletes.load(Ordering::SeqCst) {
            track_panic!(ErrorKind::Storage, "Injected failure");
        }
        self.with_inner(|s| s.delete_row(segment_id))
    }

    fn put_sequence(
        &mut self,
        segment_id: SegmentId,
        sequence_num: u32,
        payload: &[u8],
    ) -> Result<()> {
        if self.switch.sequences.load(Ordering::SeqCst) {
            track_panic!(ErrorKind::Storage, "Injected failure");
        }
        self.with_inner(|s| s.put_sequence(segment_id, sequence_num, payload))
    }

    fn get_sequence(
        &mut self,
        segment_id: SegmentId,
        sequence_num: u32,
    ) -> Result<Option<Vec<u8>>> {
        self.with_inner(|s| s.get_sequence(segment_id, sequence_num))
    }

    fn delete_sequences(&mut self, segment_id: SegmentId) -> Result<usize> {
        self.with_inner(|s| s.delete_sequences(segment_id))
    }

    fn load_rows(&mut self) -> Result<Vec<(SegmentId, SegmentRow)>> {
        self.with_inner(|s| s.load_rows())
    }

    fn put_next_segment_id(&mut self, next: SegmentId) -> Result<()> {
        if self.switch.rows.load(Ordering::SeqCst) {
            track_panic!(ErrorKind::Storage, "Injected failure");
        }
        self.with_inner(|s| s.put_next_segment_id(next))
    }

    fn load_next_segment_id(&mut self) -> Result<Option<SegmentId>> {
        self.with_inner(|s| s.load_next_segment_id())
    }
}

#[derive(Clone, Default)]
pub struct FailureSwitch {
    rows: Arc<AtomicBool>,
    sequences: Arc<AtomicBool>,
    deletes: Arc<AtomicBool>,
}
impl FailureSwitch {
    pub fn fail_rows(&self, fail: bool) {
        self.rows.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sequences(&self, fail: bool) {
        self.sequences.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.deletes.store(fail, Ordering::SeqCst);
    }
}
