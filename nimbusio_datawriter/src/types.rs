//! セグメントおよびシーケンスを識別するための値型。
use md5::{Digest, Md5};
use nimbusio_nodedb::NodeId;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// `SegmentWriter`が割り当てるセグメントのハンドル。
///
/// 有効な値は常に`0`以外。
pub type SegmentId = u64;

/// セグメント内の最初のシーケンス番号。
pub const SEQUENCE_BASE: u32 = 0;

/// MD5ダイジェストのバイト長。
pub const MD5_DIGEST_LEN: usize = 16;

/// MD5ダイジェスト。
pub type Md5Digest = [u8; MD5_DIGEST_LEN];

/// セグメントの作成時刻(UNIXエポックからのマイクロ秒)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);
impl Timestamp {
    /// 現在時刻を返す。
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(elapsed.as_secs() * 1_000_000 + u64::from(elapsed.subsec_micros()))
    }

    /// マイクロ秒単位の値から`Timestamp`を生成する。
    pub fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// マイクロ秒単位の値を返す。
    pub fn as_micros(self) -> u64 {
        self.0
    }
}
impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// 一つのオブジェクトの一つのセグメント(ECのシェア)を識別する情報。
///
/// 作成後に変更可能なのは`handoff_node_id`のみで、それもチャンクが受理される前に一度だけ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    /// 所有するコレクションのID。
    pub collection_id: u32,

    /// コレクション内でのオブジェクト名。
    pub key: String,

    /// オブジェクトのバージョンを識別するID。
    ///
    /// 同一オブジェクトの全セグメント・全パートで共有される。
    pub unified_id: u64,

    /// 作成時刻。
    pub timestamp: Timestamp,

    /// 結合オブジェクト(conjoined object)内のパート番号。結合オブジェクトではない場合は`0`。
    pub conjoined_part: u32,

    /// ストライプ内でのシェア番号(`1..=N`)。
    pub segment_num: u8,

    /// 本来このセグメントを保持するはずのノード。
    pub source_node_id: NodeId,

    /// `source_node_id`が到達不能だったためにデータを代わりに保持しているノード。
    pub handoff_node_id: Option<NodeId>,
}
impl SegmentEntry {
    /// セグメントを一意に識別する組を返す。
    pub fn identity(&self) -> SegmentIdentity {
        SegmentIdentity {
            collection_id: self.collection_id,
            key: self.key.clone(),
            unified_id: self.unified_id,
            conjoined_part: self.conjoined_part,
            segment_num: self.segment_num,
        }
    }

    /// 実際にデータを保持するノードを返す。
    pub fn holder_node_id(&self) -> NodeId {
        self.handoff_node_id.unwrap_or(self.source_node_id)
    }
}
impl fmt::Display for SegmentEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({}) {} {} {} {} {}",
            self.collection_id,
            self.key,
            self.unified_id,
            self.timestamp,
            self.conjoined_part,
            self.segment_num
        )
    }
}

/// `(collection_id, key, unified_id, conjoined_part, segment_num)`の組。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentIdentity {
    #[allow(missing_docs)]
    pub collection_id: u32,
    #[allow(missing_docs)]
    pub key: String,
    #[allow(missing_docs)]
    pub unified_id: u64,
    #[allow(missing_docs)]
    pub conjoined_part: u32,
    #[allow(missing_docs)]
    pub segment_num: u8,
}

/// セグメントのバイト列中の一つのチャンクを識別する情報。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceEntry {
    /// セグメント内でのシーケンス番号(`SEQUENCE_BASE`から連番)。
    pub sequence_num: u32,

    /// 親セグメントの(パディングを除いた)宣言サイズ。
    ///
    /// 同一セグメントの全チャンクで同じ値が繰り返される。
    pub segment_size: u64,

    /// このチャンクのペイロードに含まれるEC由来のパディングのバイト数。
    pub zfec_padding_size: u32,

    /// セグメントの先頭からこのチャンクまでの累積MD5。
    ///
    /// 最後のチャンクの値がセグメント全体のダイジェストとなる。
    pub md5_digest: Md5Digest,

    /// このチャンクのペイロードのAdler-32。
    pub adler32: u32,
}
impl fmt::Display for SequenceEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.sequence_num,
            self.segment_size,
            self.zfec_padding_size,
            to_hex(&self.md5_digest),
            self.adler32
        )
    }
}

/// 順に与えられたペイロードから`SequenceEntry`を組み立てる。
///
/// チャンク毎のAdler-32と、累積のMD5を計算する。
pub struct SequenceBuilder {
    segment_size: u64,
    next_sequence_num: u32,
    md5: Md5,
}
impl SequenceBuilder {
    /// 新しい`SequenceBuilder`インスタンスを生成する。
    pub fn new(segment_size: u64) -> Self {
        SequenceBuilder {
            segment_size,
            next_sequence_num: SEQUENCE_BASE,
            md5: Md5::new(),
        }
    }

    /// 次のチャンクの`SequenceEntry`を返す。
    pub fn next_sequence(&mut self, payload: &[u8], zfec_padding_size: u32) -> SequenceEntry {
        self.md5.update(payload);
        let entry = SequenceEntry {
            sequence_num: self.next_sequence_num,
            segment_size: self.segment_size,
            zfec_padding_size,
            md5_digest: finalize_md5(self.md5.clone()),
            adler32: adler32_of(payload),
        };
        self.next_sequence_num += 1;
        entry
    }
}
impl fmt::Debug for SequenceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SequenceBuilder")
            .field("segment_size", &self.segment_size)
            .field("next_sequence_num", &self.next_sequence_num)
            .finish()
    }
}

/// ペイロードのAdler-32を計算する。
pub fn adler32_of(payload: &[u8]) -> u32 {
    adler32::RollingAdler32::from_buffer(payload).hash()
}

pub(crate) fn finalize_md5(md5: Md5) -> Md5Digest {
    let mut digest = [0; MD5_DIGEST_LEN];
    digest.copy_from_slice(&md5.finalize()[..]);
    digest
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> SegmentEntry {
        SegmentEntry {
            collection_id: 1,
            key: "test key".to_owned(),
            unified_id: 2,
            timestamp: Timestamp::from_micros(1_500_000_000_000_042),
            conjoined_part: 0,
            segment_num: 1,
            source_node_id: NodeId(5),
            handoff_node_id: None,
        }
    }

    #[test]
    fn segment_entry_renders_as_one_line() {
        assert_eq!(
            entry().to_string(),
            "(1) test key 2 1500000000.000042 0 1"
        );
    }

    #[test]
    fn sequence_entry_renders_digest_as_hex() {
        let mut builder = SequenceBuilder::new(3);
        let sequence = builder.next_sequence(b"abc", 0);
        assert_eq!(
            sequence.to_string(),
            format!(
                "0 3 0 900150983cd24fb0d6963f7d28e17f72 {}",
                adler32_of(b"abc")
            )
        );
    }

    #[test]
    fn identity_ignores_placement() {
        let mut handed_off = entry();
        handed_off.handoff_node_id = Some(NodeId(9));
        handed_off.timestamp = Timestamp::now();
        assert_eq!(entry().identity(), handed_off.identity());
        assert_eq!(handed_off.holder_node_id(), NodeId(9));
        assert_eq!(entry().holder_node_id(), NodeId(5));

        let mut other_share = entry();
        other_share.segment_num = 2;
        assert_ne!(entry().identity(), other_share.identity());
    }

    #[test]
    fn builder_digest_is_cumulative() {
        let mut builder = SequenceBuilder::new(6);
        let first = builder.next_sequence(b"abc", 0);
        let second = builder.next_sequence(b"def", 0);
        assert_eq!(first.sequence_num, SEQUENCE_BASE);
        assert_eq!(second.sequence_num, SEQUENCE_BASE + 1);
        assert_eq!(first.adler32, adler32_of(b"abc"));
        assert_eq!(second.adler32, adler32_of(b"def"));

        let mut whole = SequenceBuilder::new(6);
        assert_eq!(second.md5_digest, whole.next_sequence(b"abcdef", 0).md5_digest);
    }

    #[test]
    fn adler32_matches_known_value() {
        assert_eq!(adler32_of(b"Wikipedia"), 0x11E6_0398);
    }
}
