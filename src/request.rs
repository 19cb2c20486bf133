//! 解析済みの書き込み系リクエスト。
use crate::dispatcher::ArchiveRequest;
use crate::unified_id::UnifiedIdSource;
use crate::{ErrorKind, Result};

/// 書き込み系リクエストの種類。
///
/// この書き込み経路が扱うのは`Archive`のみで、結合オブジェクトの管理やキーの削除は扱わない。
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    Archive(ArchiveRequest),
    StartConjoined {
        collection_id: u32,
        key: String,
    },
    FinishConjoined {
        collection_id: u32,
        key: String,
        unified_id: u64,
    },
    AbortConjoined {
        collection_id: u32,
        key: String,
        unified_id: u64,
    },
    DestroyKey {
        collection_id: u32,
        key: String,
    },
    ListConjoined {
        collection_id: u32,
    },
}
impl RequestKind {
    /// リクエストの種類名を返す。
    pub fn name(&self) -> &'static str {
        match *self {
            RequestKind::Archive(_) => "archive",
            RequestKind::StartConjoined { .. } => "start_conjoined",
            RequestKind::FinishConjoined { .. } => "finish_conjoined",
            RequestKind::AbortConjoined { .. } => "abort_conjoined",
            RequestKind::DestroyKey { .. } => "destroy_key",
            RequestKind::ListConjoined { .. } => "list_conjoined",
        }
    }

    /// `Archive`リクエストを取り出す。
    ///
    /// unified ID が指定されていない場合には`ids`から割り当てる。
    /// `Archive`以外の種類では`ErrorKind::NotImplemented`が返される。
    pub fn into_archive(self, ids: &dyn UnifiedIdSource) -> Result<ArchiveRequest> {
        match self {
            RequestKind::Archive(mut request) => {
                if request.unified_id.is_none() {
                    request.unified_id = Some(ids.next_id());
                }
                Ok(request)
            }
            other => track_panic!(
                ErrorKind::NotImplemented,
                "{} is not implemented",
                other.name()
            ),
        }
    }
}
