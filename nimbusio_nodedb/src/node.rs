use std::fmt;
use std::net::SocketAddr;

/// ストレージノードの識別子。
///
/// `0`は「ノード無し」を表すために予約されており、登録には使用できない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);
impl NodeId {
    /// 予約済みの値(`0`)かどうかを判定する。
    pub fn is_reserved(self) -> bool {
        self.0 == 0
    }
}
impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// レジストリに登録されるノードの情報。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// ノードID。
    pub id: NodeId,

    /// ノード名(ログ出力用)。
    pub name: String,

    /// データライタの待ち受けアドレス。
    pub addr: SocketAddr,

    /// このノードが到達不能な場合のハンドオフ先候補(優先順)。
    #[serde(default)]
    pub handoff: Vec<NodeId>,

    /// 初期状態で到達可能とみなすかどうか。
    #[serde(default = "default_reachable")]
    pub reachable: bool,
}

fn default_reachable() -> bool {
    true
}

/// `NodeRegistry::resolve_node`の結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// ノードID。
    pub id: NodeId,

    /// ノード名。
    pub name: String,

    /// データライタの待ち受けアドレス。
    pub addr: SocketAddr,

    /// 問い合わせ時点での到達可能性。
    pub reachable: bool,
}
impl NodeInfo {
    /// ノードが到達可能かどうか。
    pub fn is_reachable(&self) -> bool {
        self.reachable
    }
}
