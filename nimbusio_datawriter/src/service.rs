use fibers::sync::mpsc;
use fibers::sync::oneshot::Monitored;
use fibers::Spawn;
use fibers_tasque::{AsyncCall, DefaultCpuTaskQueue, TaskQueueExt};
use futures::{Async, Future, Poll, Stream};
use prometrics::metrics::Histogram;
use slog::Logger;
use std::sync::Arc;
use std::time::Instant;

use crate::client::{ChunkReceiver, DataWriterClientChan, SegmentMessage, SegmentOutcome};
use crate::metrics::ServiceMetrics;
use crate::types::{SegmentEntry, SegmentId};
use crate::writer::SegmentWriter;
use crate::{Error, ErrorKind, Result};

type Reply<T> = Monitored<T, Error>;

#[derive(Debug)]
pub(crate) enum Command {
    Submit(SegmentEntry, ChunkReceiver, Reply<SegmentOutcome>),
    Abort(SegmentId, Reply<()>),
    Stop,
}

/// 一つのノードのデータライタ。
///
/// `DataWriterClientChan`経由で受け付けたセグメント毎に処理用のタスクを起動し、
/// チャンクを受信順に`SegmentWriter`へ書き込む。
///
/// `Future`として実行され、`DataWriterClientChan::stop`が呼ばれると完了する。
/// 既に起動済みのセグメント処理タスクは、停止後もそれぞれ完了まで実行される。
pub struct DataWriterService<S> {
    logger: Logger,
    spawner: S,
    writer: Arc<SegmentWriter>,
    metrics: ServiceMetrics,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
}
impl<S> DataWriterService<S>
where
    S: Spawn + Send + Clone + 'static,
{
    /// 新しい`DataWriterService`インスタンスを生成する。
    pub fn new(logger: Logger, spawner: S, writer: SegmentWriter) -> Result<Self> {
        let logger = logger.new(o!("node" => writer.node_id().to_string()));
        let metrics = track!(ServiceMetrics::new(writer.node_id()))?;
        let (command_tx, command_rx) = mpsc::channel();
        Ok(DataWriterService {
            logger,
            spawner,
            writer: Arc::new(writer),
            metrics,
            command_tx,
            command_rx,
        })
    }

    /// サービスに書き込み要求を発行するためのクライアントを返す。
    pub fn handle(&self) -> DataWriterClientChan {
        DataWriterClientChan::new(self.writer.node_id(), self.command_tx.clone())
    }

    /// サービスが使用している`SegmentWriter`を返す。
    pub fn writer(&self) -> &Arc<SegmentWriter> {
        &self.writer
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Submit(entry, chunks, reply) => {
                let segment_id = match track!(self.writer.new_segment(entry.clone())) {
                    Err(e) => {
                        warn!(
                            self.logger,
                            "Cannot create a segment: entry={}, reason={}", entry, e
                        );
                        reply.exit(Err(e));
                        return true;
                    }
                    Ok(segment_id) => segment_id,
                };
                let task = SegmentTask {
                    logger: self.logger.new(o!("segment_id" => segment_id)),
                    writer: Arc::clone(&self.writer),
                    segment_id,
                    entry,
                    chunks,
                    finalizing: None,
                    sequences: 0,
                    bytes: 0,
                };
                let logger = task.logger.clone();
                let writer = Arc::clone(&self.writer);
                let metrics = self.metrics.clone();
                let started_at = Instant::now();
                let future = task.then(move |result| {
                    observe(&metrics.segment_duration_seconds, started_at);
                    if let Err(ref e) = result {
                        if *e.kind() == ErrorKind::Canceled {
                            metrics.canceled_segments_total.increment();
                        }
                        abort_if_writable(&logger, &writer, segment_id, e);
                    }
                    reply.exit(result);
                    Ok(())
                });
                self.spawner.spawn(future);
            }
            Command::Abort(segment_id, reply) => {
                let result = track!(self.writer.abort_segment(segment_id));
                reply.exit(result);
            }
            Command::Stop => {
                info!(self.logger, "Data writer service is stopping");
                return false;
            }
        }
        true
    }
}
impl<S> Future for DataWriterService<S>
where
    S: Spawn + Send + Clone + 'static,
{
    type Item = ();
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        while let Async::Ready(command) = self.command_rx.poll().expect("Never fails") {
            // `self.command_tx`を保持しているので、`None`が返ることはない
            if let Some(command) = command {
                if !self.handle_command(command) {
                    return Ok(Async::Ready(()));
                }
            }
        }
        Ok(Async::NotReady)
    }
}

/// 一つのセグメントのチャンクを受信順に書き込み、最後に確定するタスク。
struct SegmentTask {
    logger: Logger,
    writer: Arc<SegmentWriter>,
    segment_id: SegmentId,
    entry: SegmentEntry,
    chunks: ChunkReceiver,
    finalizing: Option<AsyncCall<Result<()>>>,
    sequences: u32,
    bytes: u64,
}
impl SegmentTask {
    fn outcome(&self) -> SegmentOutcome {
        SegmentOutcome {
            node_id: self.writer.node_id(),
            segment_id: self.segment_id,
            entry: self.entry.clone(),
            sequences: self.sequences,
            bytes: self.bytes,
        }
    }
}
impl Future for SegmentTask {
    type Item = SegmentOutcome;
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        loop {
            if let Some(ref mut finalizing) = self.finalizing {
                if let Async::Ready(result) = track!(finalizing.poll().map_err(Error::from))? {
                    track!(result)?;
                    debug!(
                        self.logger,
                        "Segment finalized: sequences={}, bytes={}", self.sequences, self.bytes
                    );
                    return Ok(Async::Ready(self.outcome()));
                }
                return Ok(Async::NotReady);
            }

            let message = match self.chunks.poll() {
                Err(()) => track_panic!(ErrorKind::Other, "Chunk stream failed"),
                Ok(Async::NotReady) => return Ok(Async::NotReady),
                Ok(Async::Ready(message)) => message,
            };
            match message {
                None => track_panic!(
                    ErrorKind::Canceled,
                    "Chunk stream closed before finish: entry={}",
                    self.entry
                ),
                Some(SegmentMessage::Sequence(sequence, payload)) => {
                    track!(self
                        .writer
                        .write_sequence(self.segment_id, &sequence, &payload))?;
                    self.sequences += 1;
                    self.bytes += payload.len() as u64;
                }
                Some(SegmentMessage::Finish) => {
                    self.chunks.close();
                    let writer = Arc::clone(&self.writer);
                    let segment_id = self.segment_id;
                    let future = DefaultCpuTaskQueue
                        .async_call(move || track!(writer.finalize_segment(segment_id)));
                    self.finalizing = Some(future);
                }
            }
        }
    }
}

fn abort_if_writable(logger: &Logger, writer: &SegmentWriter, segment_id: SegmentId, e: &Error) {
    // 確定処理で失敗したセグメントは`Incomplete`のまま残す
    let writable = writer
        .segment_state(segment_id)
        .map(|s| s.is_writable())
        .unwrap_or(false);
    if !writable {
        return;
    }
    warn!(logger, "Segment write failed; aborting: reason={}", e);
    if let Err(e) = writer.abort_segment(segment_id) {
        error!(logger, "Cannot abort the segment: reason={}", e);
    }
}

fn observe(histogram: &Histogram, started_at: Instant) {
    let elapsed = started_at.elapsed();
    let seconds = elapsed.as_secs() as f64 + f64::from(elapsed.subsec_nanos()) / 1_000_000_000.0;
    histogram.observe(seconds);
}

#[cfg(test)]
mod tests {
    use nimbusio_nodedb::NodeId;
    use trackable::result::TestResult;

    use super::*;
    use crate::client::{segment_channel, DataWriterClient};
    use crate::row::SegmentState;
    use crate::test_util::{chunks, entry, memory_writer, send_all};

    fn service() -> Result<(DataWriterClientChan, Arc<SegmentWriter>)> {
        let writer = track!(memory_writer())?;
        let service = track!(DataWriterService::new(
            Logger::root(slog::Discard, o!()),
            fibers_global::handle(),
            writer
        ))?;
        let client = service.handle();
        let writer = Arc::clone(service.writer());
        fibers_global::spawn(service.map_err(|e| panic!("{}", e)));
        Ok((client, writer))
    }

    #[test]
    fn segment_is_written_and_finalized() -> TestResult {
        let (client, writer) = track!(service())?;
        assert_eq!(client.node_id(), NodeId(1));

        let (sink, rx) = segment_channel(2);
        let submitted = client.submit(entry("foo", 1), rx);
        let sent = send_all(sink, chunks(b"abcdefghij", 3, 0));
        let (outcome, ()) = track!(fibers_global::execute(submitted.join(sent)))?;

        assert_eq!(outcome.sequences, 4);
        assert_eq!(outcome.bytes, 10);
        assert_eq!(outcome.node_id, NodeId(1));
        assert_eq!(
            track!(writer.segment_state(outcome.segment_id))?,
            SegmentState::Finalized
        );

        track!(fibers_global::execute(client.abort(outcome.segment_id)))?;
        assert_eq!(
            track!(writer.segment_state(outcome.segment_id))?,
            SegmentState::Aborted
        );
        Ok(())
    }

    #[test]
    fn dropped_sink_cancels_segment() -> TestResult {
        let (client, writer) = track!(service())?;

        let (sink, rx) = segment_channel(2);
        let chunks = chunks(b"abcdefghij", 3, 0);
        let (sequence, payload) = chunks[0].clone();
        let submitted = client.submit(entry("foo", 1), rx);
        let sent = sink.send_sequence(sequence, payload).map(|sink| drop(sink));
        let (result, _) = track!(fibers_global::execute(submitted.then(Ok).join(sent)))?;

        let e = result.err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::Canceled);
        let segment_id = 1;
        assert_eq!(
            track!(writer.segment_state(segment_id))?,
            SegmentState::Aborted
        );
        Ok(())
    }

    #[test]
    fn rejected_chunk_aborts_segment() -> TestResult {
        let (client, writer) = track!(service())?;

        let (sink, rx) = segment_channel(8);
        let mut chunks = chunks(b"abcdefghij", 3, 0);
        chunks.remove(1);
        let submitted = client.submit(entry("foo", 1), rx);
        let sent = send_all(sink, chunks).then(|_| Ok::<(), Error>(()));
        let (result, ()) = track!(fibers_global::execute(submitted.then(Ok).join(sent)))?;

        let e = result.err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::SequenceOrder);
        assert_eq!(track!(writer.segment_state(1))?, SegmentState::Aborted);
        Ok(())
    }

    #[test]
    fn digest_failure_leaves_incomplete_segment() -> TestResult {
        let (client, writer) = track!(service())?;

        let (sink, rx) = segment_channel(8);
        let mut chunks = chunks(b"abcdefghij", 5, 0);
        chunks[1].0.md5_digest = [1; 16];
        let submitted = client.submit(entry("foo", 1), rx);
        let sent = send_all(sink, chunks);
        let (result, ()) = track!(fibers_global::execute(submitted.then(Ok).join(sent)))?;

        let e = result.err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::ChecksumMismatch);
        assert_eq!(track!(writer.segment_state(1))?, SegmentState::Incomplete);
        Ok(())
    }

    #[test]
    fn duplicate_submission_fails() -> TestResult {
        let (client, _writer) = track!(service())?;

        let (_sink0, rx0) = segment_channel(1);
        let (_sink1, rx1) = segment_channel(1);
        let first = client.submit(entry("foo", 1), rx0);
        let second = client.submit(entry("foo", 1), rx1);
        let result = fibers_global::execute(second);
        let e = result.err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::DuplicateSegment);
        drop(first);
        Ok(())
    }

    #[test]
    fn stopped_service_rejects_requests() -> TestResult {
        let writer = track!(memory_writer())?;
        let service = track!(DataWriterService::new(
            Logger::root(slog::Discard, o!()),
            fibers_global::handle(),
            writer
        ))?;
        let client = service.handle();
        client.stop();
        track!(fibers_global::execute(service))?;

        let (_sink, rx) = segment_channel(1);
        let e = fibers_global::execute(client.submit(entry("foo", 1), rx))
            .err()
            .unwrap();
        assert_eq!(*e.kind(), ErrorKind::Canceled);
        Ok(())
    }
}
