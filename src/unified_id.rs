//! オブジェクトのバージョンを識別するID(unified ID)の割り当て。
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// unified ID の供給元。
///
/// 割り当ては常に成功し、返されるIDはプロセス内で単調増加する。
pub trait UnifiedIdSource: Send + Sync {
    /// 新しいIDを割り当てる。
    fn next_id(&self) -> u64;
}

const SHARD_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// 時刻・シャードID・連番から unified ID を生成する。
///
/// 上位ビットから順に、ミリ秒単位のUNIX時刻(42ビット)、シャードID(10ビット)、
/// 同一ミリ秒内の連番(12ビット)で構成される。
/// 一ミリ秒の間に連番を使い切った場合や時刻が巻き戻った場合には、
/// 直前に発行したIDの時刻部分を進めて単調性を保つ。
#[derive(Debug)]
pub struct LocalUnifiedIdGenerator {
    shard_id: u64,
    last: Mutex<(u64, u64)>,
}
impl LocalUnifiedIdGenerator {
    /// シャードIDの最大値。
    pub const MAX_SHARD_ID: u16 = (1 << SHARD_BITS) - 1;

    /// 新しい`LocalUnifiedIdGenerator`インスタンスを生成する。
    ///
    /// `shard_id`の下位10ビットのみが使用される。
    pub fn new(shard_id: u16) -> Self {
        LocalUnifiedIdGenerator {
            shard_id: u64::from(shard_id & Self::MAX_SHARD_ID),
            last: Mutex::new((0, 0)),
        }
    }

    /// IDに含まれるシャードIDを返す。
    pub fn shard_id_of(id: u64) -> u16 {
        ((id >> SEQUENCE_BITS) & u64::from(Self::MAX_SHARD_ID)) as u16
    }

    /// IDに含まれる時刻(ミリ秒単位のUNIX時刻)を返す。
    pub fn millis_of(id: u64) -> u64 {
        id >> (SHARD_BITS + SEQUENCE_BITS)
    }

    fn next_id_at(&self, now_millis: u64) -> u64 {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let (last_millis, last_sequence) = *last;
        let (millis, sequence) = if now_millis > last_millis {
            (now_millis, 0)
        } else if last_sequence < MAX_SEQUENCE {
            (last_millis, last_sequence + 1)
        } else {
            (last_millis + 1, 0)
        };
        *last = (millis, sequence);
        (millis << (SHARD_BITS + SEQUENCE_BITS)) | (self.shard_id << SEQUENCE_BITS) | sequence
    }
}
impl UnifiedIdSource for LocalUnifiedIdGenerator {
    fn next_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let millis = now.as_secs() * 1000 + u64::from(now.subsec_millis());
        self.next_id_at(millis)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn ids_carry_time_and_shard() {
        let generator = LocalUnifiedIdGenerator::new(7);
        let id = generator.next_id_at(1_500_000_000_000);
        assert_eq!(LocalUnifiedIdGenerator::millis_of(id), 1_500_000_000_000);
        assert_eq!(LocalUnifiedIdGenerator::shard_id_of(id), 7);
        assert_eq!(id & MAX_SEQUENCE, 0);
    }

    #[test]
    fn ids_are_monotonic_even_if_clock_goes_back() {
        let generator = LocalUnifiedIdGenerator::new(1);
        let a = generator.next_id_at(1000);
        let b = generator.next_id_at(1000);
        let c = generator.next_id_at(999);
        let d = generator.next_id_at(1001);
        assert!(a < b && b < c && c < d, "{} {} {} {}", a, b, c, d);
        assert_eq!(LocalUnifiedIdGenerator::millis_of(c), 1000);
    }

    #[test]
    fn exhausted_sequence_advances_millis() {
        let generator = LocalUnifiedIdGenerator::new(1);
        let mut last = 0;
        for _ in 0..=MAX_SEQUENCE + 1 {
            let id = generator.next_id_at(5000);
            assert!(id > last);
            last = id;
        }
        assert_eq!(LocalUnifiedIdGenerator::millis_of(last), 5001);
        assert_eq!(LocalUnifiedIdGenerator::shard_id_of(last), 1);
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let generator = Arc::new(LocalUnifiedIdGenerator::new(3));
        let handles = (0..4)
            .map(|_| {
                let generator = Arc::clone(&generator);
                thread::spawn(move || (0..1000).map(|_| generator.next_id()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();
        let mut ids = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect::<Vec<_>>();
        let len = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), len);
    }
}
