//! 分散トレーシング(Jaeger)関連の補助機能。
use rustracing::sampler::{NullSampler, PassiveSampler, ProbabilisticSampler, Sampler};
use rustracing::tag::StdTag;
use rustracing_jaeger::span::{SpanContextState, SpanReceiver};
use rustracing_jaeger::{Span, Tracer};
use std::cell::RefCell;
use std::sync::{Arc, Mutex};
use trackable::error::{ErrorKind, TrackableError};

thread_local! {
    static LOCAL_TRACER: RefCell<Option<Tracer>> = RefCell::new(None);
}

/// スレッド毎に`Tracer`の複製を保持するトレーサ。
///
/// 共有されている`Tracer`はロックの下にあるため、各スレッドは初回利用時に一度だけ複製を取得する。
#[derive(Debug, Clone)]
pub struct ThreadLocalTracer {
    shared: Arc<Mutex<Tracer>>,
}
impl ThreadLocalTracer {
    /// 新しい`ThreadLocalTracer`インスタンスを生成する。
    pub fn new(tracer: Tracer) -> Self {
        ThreadLocalTracer {
            shared: Arc::new(Mutex::new(tracer)),
        }
    }

    /// `f`を使ってスパンを開始する。
    ///
    /// トレーサの取得に失敗した場合には、非活性のスパンが返される。
    pub fn span<F>(&self, f: F) -> Span
    where
        F: FnOnce(&Tracer) -> Span,
    {
        LOCAL_TRACER.with(|local| {
            if local.borrow().is_none() {
                if let Ok(shared) = self.shared.try_lock() {
                    *local.borrow_mut() = Some(shared.clone());
                }
            }
            match *local.borrow() {
                Some(ref tracer) => f(tracer),
                None => Span::inactive(),
            }
        })
    }
}

/// `Span`の拡張。
pub trait SpanExt {
    /// エラーをスパンに記録する。
    fn log_error<K: ErrorKind>(&mut self, e: &TrackableError<K>);
}
impl SpanExt for Span {
    fn log_error<K: ErrorKind>(&mut self, e: &TrackableError<K>) {
        self.set_tag(StdTag::error);
        self.log(|log| {
            log.error()
                .kind(format!("{:?}", e.kind()))
                .message(e.to_string());
        })
    }
}

/// 何もサンプリングしないトレーサを返す。
pub fn make_null_tracer() -> ThreadLocalTracer {
    let (tracer, _) = Tracer::new(NullSampler);
    ThreadLocalTracer::new(tracer)
}

/// 指定の確率でサンプリングを行うトレーサと、完了したスパンの受信口を返す。
///
/// 呼び出し元から伝播されたサンプリング判断は常に尊重される。
pub fn make_tracer(sampling_rate: f64) -> rustracing::Result<(ThreadLocalTracer, SpanReceiver)> {
    let sampler = Sampler::<SpanContextState>::or(
        PassiveSampler,
        ProbabilisticSampler::new(sampling_rate)?,
    );
    let (tracer, span_rx) = Tracer::new(sampler);
    Ok((ThreadLocalTracer::new(tracer), span_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_tracer_yields_unsampled_spans() {
        let tracer = make_null_tracer();
        let span = tracer.span(|t| t.span("dispatch").start());
        assert!(span.context().is_none());
    }

    #[test]
    fn invalid_sampling_rate_is_rejected() {
        assert!(make_tracer(1.5).is_err());
        assert!(make_tracer(0.5).is_ok());
    }
}
