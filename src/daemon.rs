//! nimbusio プロセスを起動したり操作するための機能を提供するモジュール。
use fibers::executor::ThreadPoolExecutorHandle;
use fibers::sync::mpsc;
use fibers::sync::oneshot;
use fibers::time::timer::{self, Timeout};
use fibers::{Executor, Spawn, ThreadPoolExecutor};
use futures::{future, Async, Future, Poll, Stream};
use nimbusio_core::tracer::make_tracer;
use nimbusio_datawriter::types::SequenceEntry;
use nimbusio_datawriter::{DataWriterService, LumpStore, SegmentWriter};
use nimbusio_nodedb::{NodeId, NodeInfo, NodeRegistry, YamlNodeSource};
use num_cpus;
use prometrics;
use prometrics::metrics::{Counter, CounterBuilder, GaugeBuilder, ProcessMetricsCollector};
use rustracing_jaeger::reporter::JaegerCompactReporter;
use rustracing_jaeger::span::SpanReceiver;
use slog::{self, Drain, Level, Logger};
use std::fs;
use std::mem;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use trackable::error::ErrorKindExt;

use crate::build_information::{BUILD_PROFILE, BUILD_RUSTC_VERSION};
use crate::config::NimbusioConfig;
use crate::dispatcher::{ArchiveSummary, WriteDispatcher};
use crate::request::RequestKind;
use crate::unified_id::{LocalUnifiedIdGenerator, UnifiedIdSource};
use crate::util::BoxFuture;
use crate::{Error, ErrorKind, Result};

/// デーモンのビルダ。
pub struct NimbusioDaemonBuilder {
    logger: Logger,

    /// 実行スレッド数。
    pub executor_threads: usize,

    /// Jaegerのトレースのサンプリング確率。
    pub sampling_rate: f64,
}
impl NimbusioDaemonBuilder {
    /// 新しい`NimbusioDaemonBuilder`インスタンスを生成する。
    pub fn new(logger: Logger) -> Self {
        NimbusioDaemonBuilder {
            logger,
            executor_threads: num_cpus::get(),
            sampling_rate: 0.001,
        }
    }

    /// デーモンを起動する。
    pub fn finish(&self, config: NimbusioConfig) -> Result<NimbusioDaemon> {
        NimbusioDaemon::new(self, config)
    }
}

/// ローカルノード群のデータライタと、書き込みのディスパッチャを保持するデーモン。
pub struct NimbusioDaemon {
    logger: Logger,
    config: NimbusioConfig,
    registry: NodeRegistry,
    services: Vec<DataWriterService<ThreadPoolExecutorHandle>>,
    handle: NimbusioDaemonHandle,
    executor: ThreadPoolExecutor,
    command_rx: mpsc::Receiver<DaemonCommand>,
}
impl NimbusioDaemon {
    fn new(builder: &NimbusioDaemonBuilder, config: NimbusioConfig) -> Result<Self> {
        let logger = Logger::root(
            slog::Duplicate::new(builder.logger.clone(), track!(LogMetrics::new())?).fuse(),
            o!(),
        );

        let registry = NodeRegistry::new(logger.clone());
        track!(registry.initialize(&YamlNodeSource::new(&config.node_file)))?;

        let executor = track!(
            ThreadPoolExecutor::with_thread_count(builder.executor_threads).map_err(Error::from)
        )?;

        let (tracer, span_rx) = track!(make_tracer(builder.sampling_rate)
            .map_err(|e| ErrorKind::InvalidInput.takes_over(e)))?;
        track!(spawn_report_spans_thread(span_rx))?;

        let mut dispatcher = track!(WriteDispatcher::new(
            logger.clone(),
            executor.handle(),
            registry.clone(),
            tracer,
            config.chunk_queue_len
        ))?;

        let local_nodes = if config.local_nodes.is_empty() {
            track!(registry.nodes())?
                .into_iter()
                .map(|node| node.id)
                .collect()
        } else {
            config.local_nodes.clone()
        };
        track!(fs::create_dir_all(&config.data_dir).map_err(Error::from))?;

        let mut services = Vec::with_capacity(local_nodes.len());
        for node_id in local_nodes {
            track!(registry.resolve_node(node_id))?;
            let path = config.store_path(node_id);
            let store = track!(LumpStore::open_file(&path, config.store_capacity))?;
            let writer = track!(SegmentWriter::open(logger.clone(), node_id, store))?;
            let service = track!(DataWriterService::new(
                logger.clone(),
                executor.handle(),
                writer
            ))?;
            info!(
                logger,
                "Data writer is ready: node={}, path={:?}", node_id, path
            );
            dispatcher.add_client(Arc::new(service.handle()));
            services.push(service);
        }

        let (command_tx, command_rx) = mpsc::channel();
        let handle = NimbusioDaemonHandle {
            command_tx,
            dispatcher,
            unified_ids: Arc::new(LocalUnifiedIdGenerator::new(config.shard_id)),
        };
        Ok(NimbusioDaemon {
            logger,
            config,
            registry,
            services,
            handle,
            executor,
            command_rx,
        })
    }

    /// デーモンを操作するためのハンドルを返す。
    pub fn handle(&self) -> NimbusioDaemonHandle {
        self.handle.clone()
    }

    fn register_prometheus_metrics(&self) -> Result<()> {
        prometrics::default_registry().register(ProcessMetricsCollector::new());
        let version = track!(GaugeBuilder::new("build")
            .namespace("nimbusio")
            .label("version", env!("CARGO_PKG_VERSION"))
            .label("profile", BUILD_PROFILE)
            .label("rustc", BUILD_RUSTC_VERSION)
            .initial_value(1.0)
            .default_registry()
            .finish())?;
        // 登録したゲージはプロセスの終了まで残す
        mem::forget(version);
        Ok(())
    }

    /// データライタ群を起動して、停止要求が来るまで処理を実行する。
    ///
    /// この呼び出しはブロッキングするので注意。
    pub fn run(mut self) -> Result<()> {
        track!(self.register_prometheus_metrics())?;

        let runner = DaemonRunner {
            logger: self.logger.clone(),
            config: self.config,
            registry: self.registry,
            services: self.services,
            command_rx: self.command_rx,
            stop_notifications: Vec::new(),
            stop_timer: None,
        };
        let monitor = self.executor.handle().spawn_monitor(runner);
        let result = track!(self.executor.run_fiber(monitor).map_err(Error::from))?;
        track!(result.map_err(Error::from))
    }
}

struct DaemonRunner {
    logger: Logger,
    config: NimbusioConfig,
    registry: NodeRegistry,
    services: Vec<DataWriterService<ThreadPoolExecutorHandle>>,
    command_rx: mpsc::Receiver<DaemonCommand>,
    stop_notifications: Vec<oneshot::Monitored<(), Error>>,
    stop_timer: Option<Timeout>,
}
impl DaemonRunner {
    fn handle_command(&mut self, command: DaemonCommand) {
        match command {
            DaemonCommand::StopDaemon { reply } => {
                if self.stop_timer.is_none() {
                    info!(
                        self.logger,
                        "Stops data writers and waits for a while({:?})",
                        self.config.stop_waiting_time
                    );
                    for service in &self.services {
                        service.handle().stop();
                    }
                    self.stop_timer = Some(timer::timeout(self.config.stop_waiting_time));
                }
                self.stop_notifications.push(reply);
            }
        }
    }

    fn poll_services(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.services.len() {
            if track!(self.services[i].poll())?.is_ready() {
                self.services.swap_remove(i);
            } else {
                i += 1;
            }
        }
        Ok(())
    }
}
impl Future for DaemonRunner {
    type Item = ();
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        while let Async::Ready(Some(command)) = self.command_rx.poll().expect("Never fails") {
            self.handle_command(command);
        }
        track!(self.poll_services())?;

        let stopped = match self.stop_timer {
            None => false,
            Some(ref mut timer) => {
                self.services.is_empty() && timer.poll().expect("Broken timer").is_ready()
            }
        };
        if stopped {
            self.registry.close();
            info!(self.logger, "The nimbusio daemon has stopped");
            for reply in self.stop_notifications.drain(..) {
                reply.exit(Ok(()));
            }
            return Ok(Async::Ready(()));
        }
        Ok(Async::NotReady)
    }
}

/// デーモンを操作するためのハンドル。
#[derive(Clone)]
pub struct NimbusioDaemonHandle {
    command_tx: mpsc::Sender<DaemonCommand>,
    dispatcher: WriteDispatcher,
    unified_ids: Arc<dyn UnifiedIdSource>,
}
impl NimbusioDaemonHandle {
    /// デーモンが使用しているディスパッチャを返す。
    pub fn dispatcher(&self) -> &WriteDispatcher {
        &self.dispatcher
    }

    /// リクエストを処理する。
    ///
    /// 扱えるのは`RequestKind::Archive`のみ。
    /// `shares[i]`は`segment_num = i + 1`のシェアのチャンク列。
    pub fn handle_request(
        &self,
        request: RequestKind,
        shares: Vec<Vec<(SequenceEntry, Vec<u8>)>>,
    ) -> BoxFuture<ArchiveSummary> {
        match track!(request.into_archive(&*self.unified_ids)) {
            Err(e) => Box::new(future::failed(e)),
            Ok(request) => self.dispatcher.archive(&request, shares),
        }
    }

    /// 停止する。
    pub fn stop(&self) -> impl Future<Item = (), Error = Error> {
        let (reply_tx, reply_rx) = oneshot::monitor();
        let command = DaemonCommand::StopDaemon { reply: reply_tx };
        let _ = self.command_tx.send(command);
        reply_rx.map_err(Error::from)
    }
}
impl std::fmt::Debug for NimbusioDaemonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NimbusioDaemonHandle")
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

#[derive(Debug)]
enum DaemonCommand {
    StopDaemon {
        reply: oneshot::Monitored<(), Error>,
    },
}

fn spawn_report_spans_thread(rx: SpanReceiver) -> Result<()> {
    let reporter = track!(JaegerCompactReporter::new("nimbusio")
        .map_err(|e| ErrorKind::Other.takes_over(e)))?;
    thread::spawn(move || {
        while let Ok(span) = rx.recv() {
            let _ = reporter.report(&[span]);
        }
    });
    Ok(())
}

/// ログの出力件数をレベル毎に数える`Drain`。
struct LogMetrics {
    counters: Vec<(Level, Counter)>,
}
impl LogMetrics {
    fn new() -> Result<Self> {
        let levels = [
            Level::Debug,
            Level::Info,
            Level::Warning,
            Level::Error,
            Level::Critical,
        ];
        let mut counters = Vec::with_capacity(levels.len());
        for &level in &levels {
            let counter = track!(CounterBuilder::new("records_total")
                .namespace("nimbusio")
                .subsystem("log")
                .label("level", &level.as_str().to_lowercase())
                .default_registry()
                .finish())?;
            counters.push((level, counter));
        }
        Ok(LogMetrics { counters })
    }
}
impl Drain for LogMetrics {
    type Ok = ();
    type Err = ();
    fn log(
        &self,
        record: &slog::Record,
        _values: &slog::OwnedKVList,
    ) -> ::std::result::Result<Self::Ok, Self::Err> {
        if let Some((_, counter)) = self.counters.iter().find(|(l, _)| *l == record.level()) {
            counter.increment();
        }
        Ok(())
    }
}

/// ノード一覧を読み込み、各ノードの到達可能性とハンドオフ先を返す。
///
/// 結果の各要素は、ノードの情報と、そのノードが到達不能な場合に選ばれるハンドオフ先(無ければ`None`)。
pub fn check_nodes<P: AsRef<Path>>(
    logger: &Logger,
    node_file: P,
) -> Result<Vec<(NodeInfo, Option<NodeId>)>> {
    let registry = NodeRegistry::new(logger.clone());
    track!(registry.initialize(&YamlNodeSource::new(node_file)))?;
    let nodes = track!(registry.nodes())?;
    let result = nodes
        .into_iter()
        .map(|node| {
            let handoff = registry.select_handoff(node.id).ok();
            (node, handoff)
        })
        .collect();
    registry.close();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use nimbusio_datawriter::types::SequenceBuilder;
    use slog::Discard;
    use std::io::Write;
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;
    use crate::dispatcher::ArchiveRequest;

    const NODES: &str = "
- id: 1
  name: node-1
  addr: \"127.0.0.1:8101\"
  handoff: [3]
- id: 2
  name: node-2
  addr: \"127.0.0.1:8102\"
  handoff: [3, 1]
- id: 3
  name: node-3
  addr: \"127.0.0.1:8103\"
  reachable: false
";

    fn write_node_file(dir: &TempDir) -> Result<std::path::PathBuf> {
        let path = dir.path().join("nodes.yml");
        let mut file = track!(fs::File::create(&path).map_err(Error::from))?;
        track!(file.write_all(NODES.as_bytes()).map_err(Error::from))?;
        Ok(path)
    }

    #[test]
    fn check_nodes_reports_handoffs() -> TestResult {
        let dir = track_any_err!(TempDir::new("nimbusio_daemon"))?;
        let node_file = track!(write_node_file(&dir))?;
        let logger = Logger::root(Discard, o!());

        let nodes = track!(check_nodes(&logger, &node_file))?;
        let summary = nodes
            .iter()
            .map(|(node, handoff)| (node.id, node.reachable, *handoff))
            .collect::<Vec<_>>();
        // node-3 は到達不能なので、ハンドオフ先として選ばれない
        assert_eq!(
            summary,
            vec![
                (NodeId(1), true, None),
                (NodeId(2), true, Some(NodeId(1))),
                (NodeId(3), false, None),
            ]
        );
        Ok(())
    }

    #[test]
    fn daemon_archives_and_stops() -> TestResult {
        let dir = track_any_err!(TempDir::new("nimbusio_daemon"))?;
        let node_file = track!(write_node_file(&dir))?;
        let config = NimbusioConfig {
            node_file,
            local_nodes: vec![NodeId(1), NodeId(2)],
            data_dir: dir.path().join("data"),
            store_capacity: 8 * 1024 * 1024,
            ..NimbusioConfig::default()
        };
        let mut builder = NimbusioDaemonBuilder::new(Logger::root(Discard, o!()));
        builder.executor_threads = 2;
        let daemon = track!(builder.finish(config))?;
        let handle = daemon.handle();
        let running = thread::spawn(move || daemon.run());

        let request = RequestKind::Archive(ArchiveRequest {
            collection_id: 1,
            key: "daemon key".to_owned(),
            unified_id: None,
            conjoined_part: 0,
            segment_count: 2,
            min_segments: 2,
            node_map: vec![NodeId(1), NodeId(2)],
        });
        let shares = (0..2)
            .map(|i| {
                let data = format!("share #{} of the object", i).into_bytes();
                let mut builder = SequenceBuilder::new(data.len() as u64);
                data.chunks(5)
                    .map(|piece| (builder.next_sequence(piece, 0), piece.to_owned()))
                    .collect()
            })
            .collect();
        let summary = track!(fibers_global::execute(
            handle.handle_request(request, shares)
        ))?;
        assert_eq!(summary.shares.len(), 2);
        assert_eq!(summary.failed_shares, 0);
        assert_ne!(summary.unified_id, 0);

        track!(fibers_global::execute(handle.stop()))?;
        let result = running.join().expect("daemon thread panicked");
        track!(result)?;
        assert!(dir.path().join("data").join("node-1.lusf").exists());
        Ok(())
    }
}
