use std::fs::File;
use std::path::{Path, PathBuf};

use crate::node::NodeRecord;
use crate::{Error, Result};

/// レジストリの元となるノード情報の取得元。
///
/// 実際の永続化の仕組み(データベース等)はこのトレイトの背後に隠蔽される。
pub trait NodeSource {
    /// 登録対象の全ノードを読み込む。
    fn load(&self) -> Result<Vec<NodeRecord>>;
}
impl NodeSource for Vec<NodeRecord> {
    fn load(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.clone())
    }
}
impl<'a, T: NodeSource + ?Sized> NodeSource for &'a T {
    fn load(&self) -> Result<Vec<NodeRecord>> {
        (**self).load()
    }
}

/// YAMLファイルに記述されたノード一覧。
///
/// ```yaml
/// - id: 1
///   name: node-01
///   addr: "127.0.0.1:8100"
///   handoff: [2, 3]
/// ```
#[derive(Debug, Clone)]
pub struct YamlNodeSource {
    path: PathBuf,
}
impl YamlNodeSource {
    /// 新しい`YamlNodeSource`インスタンスを生成する。
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        YamlNodeSource {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// 読み込み対象のファイルパスを返す。
    pub fn path(&self) -> &Path {
        &self.path
    }
}
impl NodeSource for YamlNodeSource {
    fn load(&self) -> Result<Vec<NodeRecord>> {
        let file = track!(
            File::open(&self.path).map_err(Error::from),
            "path={:?}",
            self.path
        )?;
        let nodes: Vec<NodeRecord> = track!(
            serde_yaml::from_reader(file).map_err(Error::from),
            "path={:?}",
            self.path
        )?;
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use crate::ErrorKind;
    use std::io::Write;
    use tempdir::TempDir;
    use trackable::result::TestResult;

    #[test]
    fn yaml_source_reads_node_list() -> TestResult {
        let dir = track_any_err!(TempDir::new("nimbusio_nodedb"))?;
        let path = dir.path().join("nodes.yaml");
        let mut file = track_any_err!(File::create(&path))?;
        track_any_err!(file.write_all(
            br#"
- id: 1
  name: node-01
  addr: "127.0.0.1:8100"
  handoff: [2]
- id: 2
  name: node-02
  addr: "127.0.0.1:8101"
  reachable: false
"#
        ))?;

        let nodes = track!(YamlNodeSource::new(&path).load())?;
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].handoff, vec![NodeId(2)]);
        assert!(nodes[0].reachable);
        assert!(!nodes[1].reachable);
        assert!(nodes[1].handoff.is_empty());
        Ok(())
    }

    #[test]
    fn missing_file_is_an_initialization_error() {
        let e = YamlNodeSource::new("/nonexistent/nimbusio/nodes.yaml")
            .load()
            .err()
            .unwrap();
        assert_eq!(*e.kind(), ErrorKind::Initialization);
    }
}
