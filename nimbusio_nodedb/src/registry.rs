use atomic_immut::AtomicImmut;
use slog::Logger;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use trackable::error::ErrorKindExt;

use crate::node::{NodeId, NodeInfo, NodeRecord};
use crate::source::NodeSource;
use crate::{Error, ErrorKind, Result};

#[derive(Debug)]
struct NodeEntry {
    record: NodeRecord,
    reachable: AtomicBool,
}
impl NodeEntry {
    fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.record.id,
            name: self.record.name.clone(),
            addr: self.record.addr,
            reachable: self.reachable.load(Ordering::SeqCst),
        }
    }
}

type Directory = HashMap<NodeId, Arc<NodeEntry>>;

/// ストレージノードのディレクトリ。
///
/// 参照系の操作(`resolve_node`等)はロック無しで任意の数のスレッドから同時に呼び出せる。
/// `initialize`と`close`はプロセス全体で一つのライフサイクルを構成し、互いに重ならないように直列化される。
///
/// `close`の後は、次に`initialize`が成功するまで、全ての参照系の操作が`ErrorKind::Initialization`で失敗する。
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    logger: Logger,
    directory: Arc<AtomicImmut<Option<Directory>>>,
    lifecycle: Arc<Mutex<()>>,
}
impl NodeRegistry {
    /// 未初期化の`NodeRegistry`インスタンスを生成する。
    pub fn new(logger: Logger) -> Self {
        NodeRegistry {
            logger,
            directory: Arc::new(AtomicImmut::new(None)),
            lifecycle: Arc::new(Mutex::new(())),
        }
    }

    /// `source`からノード一覧を読み込み、レジストリを利用可能な状態にする。
    ///
    /// 取得元の読み込みに失敗した場合や、不正なノード情報が含まれていた場合には`ErrorKind::Initialization`が返される。
    pub fn initialize<S: NodeSource>(&self, source: &S) -> Result<()> {
        let _guard = track!(self.lifecycle.lock().map_err(Error::from))?;
        track_assert!(
            self.directory.load().is_none(),
            ErrorKind::Initialization,
            "The registry has already been initialized"
        );

        let records = track!(source
            .load()
            .map_err(|e| Error::from(ErrorKind::Initialization.takes_over(e))))?;
        let directory = track!(build_directory(records))?;
        info!(
            self.logger,
            "Node registry initialized: nodes={}",
            directory.len()
        );
        self.directory.store(Some(directory));
        Ok(())
    }

    /// レジストリが保持している資源を解放する。
    ///
    /// 何度呼び出しても良い。
    pub fn close(&self) {
        let _guard = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if self.directory.load().is_some() {
            self.directory.store(None);
            info!(self.logger, "Node registry closed");
        }
    }

    /// 初期化済み(かつ未クローズ)かどうかを判定する。
    pub fn is_initialized(&self) -> bool {
        self.directory.load().is_some()
    }

    /// ノードの現在のアドレスと到達可能性を返す。
    pub fn resolve_node(&self, node_id: NodeId) -> Result<NodeInfo> {
        self.with_directory(|directory| {
            let entry = track!(lookup(directory, node_id))?;
            Ok(entry.to_info())
        })
    }

    /// `primary`が到達不能な場合に使用するハンドオフ先を返す。
    ///
    /// 設定された候補のうち、登録済みかつ到達可能な最初のノードが選ばれる。
    pub fn select_handoff(&self, primary: NodeId) -> Result<NodeId> {
        track!(self.select_handoff_by(primary, |_| true))
    }

    /// `select_handoff`と同様だが、`accept`が`false`を返す候補は飛ばされる。
    pub fn select_handoff_by<F>(&self, primary: NodeId, accept: F) -> Result<NodeId>
    where
        F: Fn(NodeId) -> bool,
    {
        self.with_directory(|directory| {
            let entry = track!(lookup(directory, primary))?;
            let selected = entry.record.handoff.iter().cloned().find(|&candidate| {
                let reachable = directory
                    .get(&candidate)
                    .map_or(false, |c| c.reachable.load(Ordering::SeqCst));
                reachable && accept(candidate)
            });
            if let Some(handoff) = selected {
                debug!(
                    self.logger,
                    "Handoff selected: primary={}, handoff={}", primary, handoff
                );
                Ok(handoff)
            } else {
                track_panic!(
                    ErrorKind::NoHandoffAvailable,
                    "primary={}, candidates={:?}",
                    primary,
                    entry.record.handoff
                )
            }
        })
    }

    /// ノードを到達可能として扱うようにする。
    pub fn mark_reachable(&self, node_id: NodeId) -> Result<()> {
        track!(self.set_reachable(node_id, true))
    }

    /// ノードを到達不能として扱うようにする。
    pub fn mark_unreachable(&self, node_id: NodeId) -> Result<()> {
        track!(self.set_reachable(node_id, false))
    }

    /// 登録されている全ノードの情報をID順に返す。
    pub fn nodes(&self) -> Result<Vec<NodeInfo>> {
        self.with_directory(|directory| {
            let mut nodes = directory
                .values()
                .map(|entry| entry.to_info())
                .collect::<Vec<_>>();
            nodes.sort_by_key(|n| n.id);
            Ok(nodes)
        })
    }

    fn set_reachable(&self, node_id: NodeId, reachable: bool) -> Result<()> {
        self.with_directory(|directory| {
            let entry = track!(lookup(directory, node_id))?;
            let old = entry.reachable.swap(reachable, Ordering::SeqCst);
            if old != reachable {
                info!(
                    self.logger,
                    "Node reachability changed: node={}, reachable={}", node_id, reachable
                );
            }
            Ok(())
        })
    }

    fn with_directory<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Directory) -> Result<T>,
    {
        let directory = self.directory.load();
        match *directory {
            Some(ref directory) => f(directory),
            None => track_panic!(
                ErrorKind::Initialization,
                "The registry is not initialized"
            ),
        }
    }
}

fn lookup(directory: &Directory, node_id: NodeId) -> Result<&Arc<NodeEntry>> {
    let entry = track_assert_some!(
        directory.get(&node_id),
        ErrorKind::UnknownNode,
        "node={}",
        node_id
    );
    Ok(entry)
}

fn build_directory(records: Vec<NodeRecord>) -> Result<Directory> {
    let mut directory = HashMap::with_capacity(records.len());
    for record in records {
        track_assert!(
            !record.id.is_reserved(),
            ErrorKind::Initialization,
            "Reserved node id: name={:?}",
            record.name
        );
        track_assert!(
            !record.handoff.contains(&record.id),
            ErrorKind::Initialization,
            "A node cannot be its own handoff: node={}",
            record.id
        );
        let id = record.id;
        let entry = NodeEntry {
            reachable: AtomicBool::new(record.reachable),
            record,
        };
        track_assert!(
            directory.insert(id, Arc::new(entry)).is_none(),
            ErrorKind::Initialization,
            "Duplicate node id: {}",
            id
        );
    }
    for entry in directory.values() {
        for handoff in &entry.record.handoff {
            track_assert!(
                directory.contains_key(handoff),
                ErrorKind::Initialization,
                "Unregistered handoff node: node={}, handoff={}",
                entry.record.id,
                handoff
            );
        }
    }
    Ok(directory)
}
