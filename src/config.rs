//! nimbusio プロセスの設定。
use nimbusio_nodedb::NodeId;
use serde_yaml;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// `nimbusio start`の設定。
///
/// YAMLファイルから読み込まれ、省略された項目にはデフォルト値が使われる。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NimbusioConfig {
    /// ノード一覧(`NodeRecord`の列)を記述したYAMLファイルのパス。
    #[serde(default = "default_node_file")]
    pub node_file: PathBuf,

    /// このプロセス内でデータライタを動かすノード。
    ///
    /// 空の場合には、ノード一覧に含まれる全てのノードのデータライタを動かす。
    #[serde(default)]
    pub local_nodes: Vec<NodeId>,

    /// セグメントの保存先ディレクトリ。
    ///
    /// ノード毎に`${data_dir}/node-${id}.lusf`が作成される。
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// ノード毎のストレージの容量(バイト)。
    #[serde(default = "default_store_capacity")]
    pub store_capacity: u64,

    /// シェア毎のチャンク送信キューの長さ。
    #[serde(default = "default_chunk_queue_len")]
    pub chunk_queue_len: usize,

    /// 停止時に、処理中のセグメントの完了を待つ時間。
    #[serde(
        rename = "stop_waiting_time_millis",
        default = "default_stop_waiting_time",
        with = "nimbusio_core::serde_ext::duration_millis"
    )]
    pub stop_waiting_time: Duration,

    /// unified ID に埋め込むシャードID。
    #[serde(default)]
    pub shard_id: u16,
}
impl NimbusioConfig {
    /// YAMLファイルから設定を読み込む。
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = track!(
            File::open(path.as_ref()).map_err(Error::from),
            "path={:?}",
            path.as_ref()
        )?;
        let config = track!(serde_yaml::from_reader(file).map_err(Error::from))?;
        Ok(config)
    }

    /// ノードのストレージファイルのパスを返す。
    pub fn store_path(&self, node_id: NodeId) -> PathBuf {
        self.data_dir.join(format!("node-{}.lusf", node_id))
    }
}
impl Default for NimbusioConfig {
    fn default() -> Self {
        NimbusioConfig {
            node_file: default_node_file(),
            local_nodes: Vec::new(),
            data_dir: default_data_dir(),
            store_capacity: default_store_capacity(),
            chunk_queue_len: default_chunk_queue_len(),
            stop_waiting_time: default_stop_waiting_time(),
            shard_id: 0,
        }
    }
}

fn default_node_file() -> PathBuf {
    PathBuf::from("nodes.yml")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_store_capacity() -> u64 {
    1024 * 1024 * 1024
}

fn default_chunk_queue_len() -> usize {
    16
}

fn default_stop_waiting_time() -> Duration {
    Duration::from_millis(1000)
}
