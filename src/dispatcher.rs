//! オブジェクトの書き込み要求を、各シェアを保持するノードのデータライタに振り分ける。
use fibers::executor::ThreadPoolExecutorHandle;
use fibers::Spawn;
use futures::future::{self, SelectAll};
use futures::{stream, Async, Future, Poll, Stream};
use nimbusio_core::tracer::{SpanExt, ThreadLocalTracer};
use nimbusio_datawriter::types::{SegmentEntry, SequenceEntry, Timestamp};
use nimbusio_datawriter::{
    segment_channel, ChunkReceiver, DataWriterClient, ReplyCode, SegmentOutcome, SegmentSink,
};
use nimbusio_nodedb::{self, NodeId, NodeRegistry};
use prometrics::metrics::Counter;
use rustracing::tag::{StdTag, Tag};
use rustracing_jaeger::span::SpanHandle;
use slog::Logger;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use trackable::error::ErrorKindExt;

use crate::metrics::DispatcherMetrics;
use crate::util::{BoxFuture, Phase};
use crate::{Error, ErrorKind, Result};

/// 一つのオブジェクト(あるいは結合オブジェクトの一部)の書き込み要求。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    /// 書き込み先のコレクションのID。
    pub collection_id: u32,

    /// オブジェクトのキー。
    pub key: String,

    /// オブジェクトのバージョンを識別するID。
    ///
    /// `None`の場合には、書き込み前に`UnifiedIdSource`から割り当てる必要がある。
    #[serde(default)]
    pub unified_id: Option<u64>,

    /// 結合オブジェクト内での位置。結合オブジェクトでなければ`0`。
    #[serde(default)]
    pub conjoined_part: u32,

    /// イレイジャーコーディングのシェア数(N)。
    pub segment_count: usize,

    /// 復元に最低限必要なシェア数。
    pub min_segments: usize,

    /// コレクションのノードマップ。
    ///
    /// `segment_num`番目のシェアは`node_map[segment_num - 1]`に割り当てられる。
    pub node_map: Vec<NodeId>,
}
impl ArchiveRequest {
    fn validate(&self) -> Result<u64> {
        track_assert!(!self.key.is_empty(), ErrorKind::InvalidInput, "Empty key");
        let unified_id = track_assert_some!(
            self.unified_id,
            ErrorKind::InvalidInput,
            "No unified ID is assigned: key={:?}",
            self.key
        );
        track_assert!(
            0 < self.segment_count && self.segment_count <= usize::from(u8::max_value()),
            ErrorKind::InvalidInput,
            "segment_count={}",
            self.segment_count
        );
        track_assert!(
            0 < self.min_segments && self.min_segments <= self.segment_count,
            ErrorKind::InvalidInput,
            "min_segments={}, segment_count={}",
            self.min_segments,
            self.segment_count
        );
        track_assert!(
            self.segment_count <= self.node_map.len(),
            ErrorKind::InvalidInput,
            "The node map is too short: segment_count={}, node_map.len={}",
            self.segment_count,
            self.node_map.len()
        );
        Ok(unified_id)
    }
}

/// あるシェアの書き込み先。
#[derive(Clone)]
pub struct Placement {
    /// シェアのセグメント情報。
    ///
    /// ハンドオフ先に迂回された場合には`handoff_node_id`が設定されている。
    pub entry: SegmentEntry,

    /// 書き込み先ノードのクライアント。
    pub client: Arc<dyn DataWriterClient>,
}
impl fmt::Debug for Placement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Placement")
            .field("entry", &self.entry)
            .field("node_id", &self.client.node_id())
            .finish()
    }
}

/// 書き込みに成功したオブジェクトの情報。
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    /// オブジェクトのバージョンを識別するID。
    pub unified_id: u64,

    /// 各セグメントに記録された作成時刻。
    pub timestamp: Timestamp,

    /// 確定したシェア(`segment_num`順)。
    pub shares: Vec<SegmentOutcome>,

    /// 配置できなかった、あるいは確定に失敗したシェアの数。
    pub failed_shares: usize,
}

/// 書き込み要求をストレージノード群に振り分けるディスパッチャ。
#[derive(Clone)]
pub struct WriteDispatcher {
    logger: Logger,
    spawner: ThreadPoolExecutorHandle,
    registry: NodeRegistry,
    clients: HashMap<NodeId, Arc<dyn DataWriterClient>>,
    tracer: ThreadLocalTracer,
    metrics: DispatcherMetrics,
    queue_len: usize,
}
impl WriteDispatcher {
    /// 新しい`WriteDispatcher`インスタンスを生成する。
    ///
    /// `queue_len`は、シェア毎のチャンク送信用のキューの長さ。
    /// 完了前に破棄された書き込みのロールバックは`spawner`上で実行される。
    pub fn new(
        logger: Logger,
        spawner: ThreadPoolExecutorHandle,
        registry: NodeRegistry,
        tracer: ThreadLocalTracer,
        queue_len: usize,
    ) -> Result<Self> {
        let metrics = track!(DispatcherMetrics::new())?;
        Ok(WriteDispatcher {
            logger,
            spawner,
            registry,
            clients: HashMap::new(),
            tracer,
            metrics,
            queue_len,
        })
    }

    /// ノードのデータライタに対するクライアントを登録する。
    ///
    /// 同じノードのクライアントが既に登録されている場合には置き換えられる。
    pub fn add_client(&mut self, client: Arc<dyn DataWriterClient>) {
        self.clients.insert(client.node_id(), client);
    }

    /// ディスパッチャが使用しているノードレジストリを返す。
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// 各シェアの書き込み先を決定する。
    ///
    /// 割り当てられたノードが未登録・到達不能・クライアント未登録の場合には、
    /// ハンドオフ先が選ばれる。
    /// ハンドオフ先も無いシェアは配置されず、配置できたシェアの数が`min_segments`に満たない場合には
    /// `ErrorKind::InsufficientNodes`が返される。
    pub fn place(&self, request: &ArchiveRequest) -> Result<Vec<Placement>> {
        let unified_id = track!(request.validate())?;
        let timestamp = Timestamp::now();
        let mut placements = Vec::with_capacity(request.segment_count);
        for (i, &source) in request.node_map[..request.segment_count].iter().enumerate() {
            let segment_num = (i + 1) as u8;
            let (client, handoff) = match self.select_target(source) {
                Err(e) => {
                    if *e.kind() == nimbusio_nodedb::ErrorKind::Initialization {
                        return Err(track!(Error::from(e)));
                    }
                    warn!(
                        self.logger,
                        "Cannot place a share: key={:?}, segment_num={}, node={}, reason={}",
                        request.key,
                        segment_num,
                        source,
                        e
                    );
                    self.metrics.lost_shares_total.increment();
                    continue;
                }
                Ok(target) => target,
            };
            if let Some(handoff) = handoff {
                info!(
                    self.logger,
                    "Share is handed off: key={:?}, segment_num={}, source={}, handoff={}",
                    request.key,
                    segment_num,
                    source,
                    handoff
                );
                self.metrics.handoffs_total.increment();
            }
            let entry = SegmentEntry {
                collection_id: request.collection_id,
                key: request.key.clone(),
                unified_id,
                timestamp,
                conjoined_part: request.conjoined_part,
                segment_num,
                source_node_id: source,
                handoff_node_id: handoff,
            };
            placements.push(Placement { entry, client });
        }
        track_assert!(
            placements.len() >= request.min_segments,
            ErrorKind::InsufficientNodes,
            "key={:?}, placed={}, required={}",
            request.key,
            placements.len(),
            request.min_segments
        );
        Ok(placements)
    }

    /// 書き込みを開始する。
    ///
    /// 配置された全てのシェアの書き込みが、各ノードに対して同時に開始される。
    /// チャンクの送信には`ObjectWrite::take_sinks`で得られる送信口を使用する。
    pub fn dispatch(&self, request: &ArchiveRequest, parent: SpanHandle) -> Result<ObjectWrite> {
        let placements = track!(self.place(request))?;
        self.metrics.writes_total.increment();

        let unplaced = request.segment_count - placements.len();
        let mut entries = Vec::with_capacity(placements.len());
        let mut sinks = Vec::with_capacity(placements.len());
        let mut submissions = Vec::with_capacity(placements.len());
        for placement in placements {
            let (sink, chunks) = segment_channel(self.queue_len);
            entries.push(placement.entry.clone());
            sinks.push(sink);
            submissions.push(self.submit(placement, chunks, &parent));
        }
        let timestamp = entries
            .first()
            .map_or_else(Timestamp::now, |entry| entry.timestamp);
        let completion = WriteCompletion {
            logger: self.logger.new(o!("key" => request.key.clone())),
            spawner: self.spawner.clone(),
            metrics: self.metrics.clone(),
            unified_id: entries.first().map_or(0, |entry| entry.unified_id),
            timestamp,
            min_segments: request.min_segments,
            unplaced,
            phase: Phase::A(CollectShares::new(
                submissions,
                self.metrics.lost_shares_total.clone(),
            )),
            quorum_error: None,
            finished: false,
        };
        Ok(ObjectWrite {
            entries,
            sinks,
            completion,
        })
    }

    /// メモリ上にあるエンコード済みのシェア群を書き込む。
    ///
    /// `shares[i]`は`segment_num = i + 1`のシェアのチャンク列。
    pub fn archive(
        &self,
        request: &ArchiveRequest,
        shares: Vec<Vec<(SequenceEntry, Vec<u8>)>>,
    ) -> BoxFuture<ArchiveSummary> {
        match track!(self.start_archive(request, shares)) {
            Err(e) => Box::new(future::failed(e)),
            Ok(future) => future,
        }
    }

    fn start_archive(
        &self,
        request: &ArchiveRequest,
        shares: Vec<Vec<(SequenceEntry, Vec<u8>)>>,
    ) -> Result<BoxFuture<ArchiveSummary>> {
        track_assert_eq!(
            shares.len(),
            request.segment_count,
            ErrorKind::InvalidInput
        );
        let mut span = self.tracer.span(|t| {
            t.span("archive")
                .tag(StdTag::component(module_path!()))
                .tag(Tag::new("collection.id", i64::from(request.collection_id)))
                .tag(Tag::new("key", request.key.clone()))
                .tag(Tag::new("segment.count", request.segment_count as i64))
                .start()
        });
        let mut write = match track!(self.dispatch(request, span.handle())) {
            Err(e) => {
                span.log_error(&e);
                return Err(e);
            }
            Ok(write) => write,
        };

        let mut shares = shares.into_iter().map(Some).collect::<Vec<_>>();
        let sinks = write.take_sinks();
        let feeds = write
            .entries()
            .iter()
            .zip(sinks)
            .map(|(entry, sink)| {
                let index = usize::from(entry.segment_num) - 1;
                let chunks = shares[index].take().unwrap_or_default();
                feed_share(self.logger.clone(), entry.segment_num, sink, chunks)
            })
            .collect::<Vec<_>>();
        let future = future::join_all(feeds)
            .join(write.completion())
            .map(|(_, summary)| summary)
            .then(move |result| {
                if let Err(ref e) = result {
                    span.log_error(e);
                }
                result
            });
        Ok(Box::new(future))
    }

    fn select_target(
        &self,
        source: NodeId,
    ) -> nimbusio_nodedb::Result<(Arc<dyn DataWriterClient>, Option<NodeId>)> {
        match self.registry.resolve_node(source) {
            Err(ref e) if *e.kind() == nimbusio_nodedb::ErrorKind::Initialization => {
                return Err(track!(e.clone()));
            }
            Ok(ref node) if node.is_reachable() => {
                if let Some(client) = self.clients.get(&source) {
                    return Ok((Arc::clone(client), None));
                }
            }
            _ => {}
        }

        let handoff = track!(self
            .registry
            .select_handoff_by(source, |candidate| self.clients.contains_key(&candidate)))?;
        let client = track_assert_some!(
            self.clients.get(&handoff),
            nimbusio_nodedb::ErrorKind::NoHandoffAvailable,
            "primary={}, handoff={}",
            source,
            handoff
        );
        Ok((Arc::clone(client), Some(handoff)))
    }

    fn submit(
        &self,
        placement: Placement,
        chunks: ChunkReceiver,
        parent: &SpanHandle,
    ) -> BoxFuture<FinalizedShare> {
        let Placement { entry, client } = placement;
        let mut span = parent.child("submit_segment", |span| {
            span.tag(StdTag::component(module_path!()))
                .tag(StdTag::span_kind("client"))
                .tag(Tag::new("node", client.node_id().to_string()))
                .tag(Tag::new("segment.num", i64::from(entry.segment_num)))
                .start()
        });
        let logger = self.logger.clone();
        let description = entry.to_string();
        let node_id = client.node_id();
        let future = client.submit(entry, chunks).then(move |result| {
            let code = ReplyCode::from_result(&result);
            match result {
                Ok(outcome) => {
                    debug!(
                        logger,
                        "Share finalized: {}; node={}, segment_id={}, code={}",
                        description,
                        node_id,
                        outcome.segment_id,
                        code.as_u8()
                    );
                    Ok(FinalizedShare { client, outcome })
                }
                Err(e) => {
                    span.log_error(&e);
                    warn!(
                        logger,
                        "Share failed: {}; node={}, code={}, reason={}",
                        description,
                        node_id,
                        code.as_u8(),
                        e
                    );
                    Err(track!(Error::from(e)))
                }
            }
        });
        Box::new(future)
    }
}
impl fmt::Debug for WriteDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut nodes = self.clients.keys().collect::<Vec<_>>();
        nodes.sort();
        f.debug_struct("WriteDispatcher")
            .field("registry", &self.registry)
            .field("nodes", &nodes)
            .field("queue_len", &self.queue_len)
            .finish()
    }
}

/// 進行中のオブジェクトの書き込み。
pub struct ObjectWrite {
    entries: Vec<SegmentEntry>,
    sinks: Vec<SegmentSink>,
    completion: WriteCompletion,
}
impl ObjectWrite {
    /// 配置されたシェアのセグメント情報を返す。
    pub fn entries(&self) -> &[SegmentEntry] {
        &self.entries
    }

    /// 各シェアのチャンクの送信口を取り出す。
    ///
    /// 返り値の並びは`entries`と一致する。二回目以降の呼び出しでは空の`Vec`が返される。
    pub fn take_sinks(&mut self) -> Vec<SegmentSink> {
        mem::replace(&mut self.sinks, Vec::new())
    }

    /// 書き込みの完了を待機する`Future`を返す。
    ///
    /// 取り出されていない送信口は破棄され、対応するシェアの書き込みは取り消される。
    pub fn completion(self) -> WriteCompletion {
        self.completion
    }

    /// 書き込みを取り消す。
    ///
    /// 全てのシェアの書き込みの終了を待ち、既に確定していたシェアを破棄する。
    /// `take_sinks`で取り出した送信口は、呼び出し側で破棄すること。
    pub fn abort(self) -> BoxFuture<()> {
        let ObjectWrite {
            sinks, completion, ..
        } = self;
        mem::drop(sinks);
        completion.abort()
    }
}
impl fmt::Debug for ObjectWrite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ObjectWrite")
            .field("entries", &self.entries)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// オブジェクトの書き込み結果を集約する`Future`。
///
/// 全てのシェアの結果が揃った時点で、確定したシェアの数が`min_segments`以上なら成功となる。
/// そうでなければ、確定済みのシェアを全て破棄した後に`ErrorKind::WriteQuorum`で失敗する。
///
/// 完了前にドロップされた場合には、残りのシェアの終了を待って確定済みのものを破棄する処理が
/// バックグラウンドで実行される。
pub struct WriteCompletion {
    logger: Logger,
    spawner: ThreadPoolExecutorHandle,
    metrics: DispatcherMetrics,
    unified_id: u64,
    timestamp: Timestamp,
    min_segments: usize,
    unplaced: usize,
    phase: Phase<CollectShares, BoxFuture<()>>,
    quorum_error: Option<Error>,
    finished: bool,
}
impl WriteCompletion {
    /// 書き込みを取り消す。
    ///
    /// 結果の集約前であれば全てのシェアの終了を待ち、確定していたシェアを破棄する。
    pub fn abort(mut self) -> BoxFuture<()> {
        self.finished = true;
        self.take_rollback()
    }

    fn take_rollback(&mut self) -> BoxFuture<()> {
        let logger = self.logger.clone();
        let metrics = self.metrics.clone();
        let done: BoxFuture<()> = Box::new(future::ok(()));
        match mem::replace(&mut self.phase, Phase::B(done)) {
            Phase::A(collect) => {
                Box::new(collect.and_then(move |c| rollback(logger, metrics, c.finalized)))
            }
            Phase::B(rollback) => rollback,
        }
    }

    fn poll_phase(&mut self) -> Poll<ArchiveSummary, Error> {
        while let Async::Ready(phase) = track!(self.phase.poll())? {
            let next = match phase {
                Phase::A(mut collected) => {
                    let failed_shares = self.unplaced + collected.failures;
                    if collected.finalized.len() >= self.min_segments {
                        collected
                            .finalized
                            .sort_by_key(|share| share.outcome.entry.segment_num);
                        let summary = ArchiveSummary {
                            unified_id: self.unified_id,
                            timestamp: self.timestamp,
                            shares: collected
                                .finalized
                                .into_iter()
                                .map(|share| share.outcome)
                                .collect(),
                            failed_shares,
                        };
                        info!(
                            self.logger,
                            "Object archived: unified_id={}, shares={}, failed_shares={}",
                            summary.unified_id,
                            summary.shares.len(),
                            failed_shares
                        );
                        return Ok(Async::Ready(summary));
                    }

                    self.metrics.failures_total.increment();
                    warn!(
                        self.logger,
                        "Write quorum is not satisfied: unified_id={}, finalized={}, required={}",
                        self.unified_id,
                        collected.finalized.len(),
                        self.min_segments
                    );
                    let e = ErrorKind::WriteQuorum.cause(format!(
                        "finalized={}, required={}, failed={}",
                        collected.finalized.len(),
                        self.min_segments,
                        failed_shares
                    ));
                    self.quorum_error = Some(track!(Error::from(e)));
                    Phase::B(rollback(
                        self.logger.clone(),
                        self.metrics.clone(),
                        collected.finalized,
                    ))
                }
                Phase::B(()) => {
                    let e = self
                        .quorum_error
                        .take()
                        .unwrap_or_else(|| ErrorKind::WriteQuorum.error().into());
                    return Err(track!(e));
                }
            };
            self.phase = next;
        }
        Ok(Async::NotReady)
    }
}
impl Future for WriteCompletion {
    type Item = ArchiveSummary;
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        let result = self.poll_phase();
        match result {
            Ok(Async::NotReady) => {}
            _ => self.finished = true,
        }
        result
    }
}
impl Drop for WriteCompletion {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            self.logger,
            "Write is dropped before completion; finalized shares will be rolled back: unified_id={}",
            self.unified_id
        );
        let rollback = self.take_rollback();
        self.spawner.spawn(rollback.map_err(|_| ()));
    }
}
impl fmt::Debug for WriteCompletion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WriteCompletion")
            .field("unified_id", &self.unified_id)
            .field("min_segments", &self.min_segments)
            .field("unplaced", &self.unplaced)
            .finish()
    }
}

struct FinalizedShare {
    client: Arc<dyn DataWriterClient>,
    outcome: SegmentOutcome,
}

struct CollectedShares {
    finalized: Vec<FinalizedShare>,
    failures: usize,
}

/// 全てのシェアの書き込み結果を集める。失敗したシェアは数えるだけで、この`Future`自体は失敗しない。
struct CollectShares {
    future: Option<SelectAll<BoxFuture<FinalizedShare>>>,
    finalized: Vec<FinalizedShare>,
    failures: usize,
    lost_shares_total: Counter,
}
impl CollectShares {
    fn new(submissions: Vec<BoxFuture<FinalizedShare>>, lost_shares_total: Counter) -> Self {
        let future = if submissions.is_empty() {
            None
        } else {
            Some(future::select_all(submissions))
        };
        CollectShares {
            future,
            finalized: Vec::new(),
            failures: 0,
            lost_shares_total,
        }
    }
}
impl Future for CollectShares {
    type Item = CollectedShares;
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        while let Some(future) = self.future.as_mut() {
            let remainings = match future.poll() {
                Err((_, _, remainings)) => {
                    self.failures += 1;
                    self.lost_shares_total.increment();
                    remainings
                }
                Ok(Async::Ready((share, _, remainings))) => {
                    self.finalized.push(share);
                    remainings
                }
                Ok(Async::NotReady) => return Ok(Async::NotReady),
            };
            self.future = if remainings.is_empty() {
                None
            } else {
                Some(future::select_all(remainings))
            };
        }
        Ok(Async::Ready(CollectedShares {
            finalized: mem::replace(&mut self.finalized, Vec::new()),
            failures: self.failures,
        }))
    }
}

fn rollback(
    logger: Logger,
    metrics: DispatcherMetrics,
    shares: Vec<FinalizedShare>,
) -> BoxFuture<()> {
    let aborts = shares
        .into_iter()
        .map(move |share| {
            let logger = logger.clone();
            let rolled_back_shares_total = metrics.rolled_back_shares_total.clone();
            let node_id = share.outcome.node_id;
            let segment_id = share.outcome.segment_id;
            share.client.abort(segment_id).then(move |result| {
                match result {
                    Ok(()) => rolled_back_shares_total.increment(),
                    Err(e) => warn!(
                        logger,
                        "Cannot abort a share: node={}, segment_id={}, reason={}",
                        node_id,
                        segment_id,
                        e
                    ),
                }
                Ok::<(), Error>(())
            })
        })
        .collect::<Vec<_>>();
    Box::new(future::join_all(aborts).map(|_| ()))
}

fn feed_share(
    logger: Logger,
    segment_num: u8,
    sink: SegmentSink,
    chunks: Vec<(SequenceEntry, Vec<u8>)>,
) -> BoxFuture<()> {
    let future = stream::iter_ok::<_, nimbusio_datawriter::Error>(chunks)
        .fold(sink, |sink, (sequence, payload)| {
            sink.send_sequence(sequence, payload)
        })
        .and_then(|sink| sink.finish())
        .then(move |result| {
            if let Err(e) = result {
                debug!(
                    logger,
                    "Stopped feeding a share: segment_num={}, reason={}", segment_num, e
                );
            }
            Ok::<(), Error>(())
        });
    Box::new(future)
}
