use fibers::sync::{mpsc, oneshot};
use futures::{Async, Future, Poll, Stream};
use nimbusio_nodedb::NodeId;
use std::cmp;
use trackable::error::ErrorKindExt;

use crate::service::Command;
use crate::types::{SegmentEntry, SegmentId, SequenceEntry};
use crate::util::BoxFuture;
use crate::{Error, ErrorKind};

macro_rules! future_try {
    ($e:expr) => {
        match $e {
            Err(e) => return Box::new(::futures::failed(track!(Error::from(e)))),
            Ok(v) => v,
        }
    };
}

/// データライタに送られるセグメントのメッセージ。
#[derive(Debug)]
pub enum SegmentMessage {
    /// 次のチャンク。
    Sequence(SequenceEntry, Vec<u8>),

    /// 全てのチャンクを送り終えたことを示す。
    ///
    /// これを受け取らずにストリームが終端した場合、セグメントは破棄される。
    Finish,
}

/// 容量が`queue_len`のセグメント用のチャネルを生成する。
///
/// 受信側(データライタ)の処理が追いつかない場合には、送信側の`Future`の完了が遅延する。
///
/// 未読のチャンク数は送信側が保持するクレジットで制限される。
/// 受信側はチャンクを一つ取り出す度に、クレジットを一つ送信側に返す。
pub fn segment_channel(queue_len: usize) -> (SegmentSink, ChunkReceiver) {
    let (tx, rx) = mpsc::channel();
    let (credit_tx, credit_rx) = mpsc::channel();
    let sink = SegmentSink {
        tx,
        credit_rx,
        credits: cmp::max(queue_len, 1),
    };
    let receiver = ChunkReceiver {
        rx,
        credit_tx: Some(credit_tx),
    };
    (sink, receiver)
}

/// データライタがセグメントのチャンクを受け取るためのストリーム。
///
/// 送信側が`finish`を呼ばずにドロップされた場合には、`Finish`を返さずに終端する。
#[derive(Debug)]
pub struct ChunkReceiver {
    rx: mpsc::Receiver<SegmentMessage>,
    credit_tx: Option<mpsc::Sender<()>>,
}
impl ChunkReceiver {
    /// 以降のチャンクを受け付けないようにする。
    ///
    /// クレジットの返却が止まるため、送信待ちの`SegmentSink`はエラーで完了する。
    pub fn close(&mut self) {
        self.credit_tx = None;
    }
}
impl Stream for ChunkReceiver {
    type Item = SegmentMessage;
    type Error = ();

    fn poll(&mut self) -> Poll<Option<Self::Item>, Self::Error> {
        let message = match self.rx.poll()? {
            Async::NotReady => return Ok(Async::NotReady),
            Async::Ready(message) => message,
        };
        if let Some(SegmentMessage::Sequence(..)) = message {
            if let Some(ref credit_tx) = self.credit_tx {
                let _ = credit_tx.send(());
            }
        }
        Ok(Async::Ready(message))
    }
}

/// セグメントのチャンクを順番にデータライタに送るための送信口。
///
/// `finish`を呼ばずにドロップされた場合には、書き込みが取り消されたものとして扱われる。
#[derive(Debug)]
pub struct SegmentSink {
    tx: mpsc::Sender<SegmentMessage>,
    credit_rx: mpsc::Receiver<()>,
    credits: usize,
}
impl SegmentSink {
    /// チャンクを送信する。
    ///
    /// 送信が完了すると、次のチャンクの送信に使う`SegmentSink`が返される。
    pub fn send_sequence(self, sequence: SequenceEntry, payload: Vec<u8>) -> SendSequence {
        SendSequence {
            sink: Some(self),
            message: Some(SegmentMessage::Sequence(sequence, payload)),
        }
    }

    /// 全てのチャンクを送信し終えたことを通知する。
    ///
    /// `Finish`はクレジットを消費しない。
    pub fn finish(self) -> BoxFuture<()> {
        let result = self
            .tx
            .send(SegmentMessage::Finish)
            .map_err(|_| receiver_dropped());
        Box::new(futures::done(result))
    }
}

/// `SegmentSink::send_sequence`が返す`Future`。
#[derive(Debug)]
pub struct SendSequence {
    sink: Option<SegmentSink>,
    message: Option<SegmentMessage>,
}
impl Future for SendSequence {
    type Item = SegmentSink;
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        let mut sink = self.sink.take().expect("Cannot poll SendSequence twice");
        while sink.credits == 0 {
            match sink.credit_rx.poll() {
                Ok(Async::NotReady) => {
                    self.sink = Some(sink);
                    return Ok(Async::NotReady);
                }
                Ok(Async::Ready(Some(()))) => sink.credits += 1,
                Ok(Async::Ready(None)) | Err(()) => return Err(receiver_dropped()),
            }
        }
        let message = self.message.take().expect("Never fails");
        track!(sink.tx.send(message).map_err(|_| receiver_dropped()))?;
        sink.credits -= 1;
        Ok(Async::Ready(sink))
    }
}

fn receiver_dropped() -> Error {
    track!(Error::from(
        ErrorKind::Canceled.cause("Segment receiver dropped")
    ))
}

/// 確定に成功したセグメントの情報。
#[derive(Debug, Clone)]
pub struct SegmentOutcome {
    /// セグメントを保持しているノード。
    pub node_id: NodeId,

    /// 書き込み先のノードが割り当てたセグメントID。
    pub segment_id: SegmentId,

    /// セグメントの識別情報。
    pub entry: SegmentEntry,

    /// 書き込まれたチャンクの数。
    pub sequences: u32,

    /// 書き込まれたバイト数(パディングを含む)。
    pub bytes: u64,
}

/// 一つのノードのデータライタに対するクライアント。
///
/// プロセス内のデータライタには`DataWriterClientChan`を用いる。
/// リモートのノードとやり取りする実装も、このトレイトを実装する。
pub trait DataWriterClient: Send + Sync {
    /// 書き込み先のノードのIDを返す。
    fn node_id(&self) -> NodeId;

    /// セグメントの書き込みを開始する。
    ///
    /// チャンクは`chunks`から順に読み出され、`SegmentMessage::Finish`を受け取った時点でセグメントが確定される。
    /// 返り値の`Future`は、確定に成功した場合にのみ成功で完了する。
    fn submit(&self, entry: SegmentEntry, chunks: ChunkReceiver) -> BoxFuture<SegmentOutcome>;

    /// (確定済みのものを含む)セグメントを破棄する。
    fn abort(&self, segment_id: SegmentId) -> BoxFuture<()>;
}

/// プロセス内の`DataWriterService`に対するクライアント。
#[derive(Debug, Clone)]
pub struct DataWriterClientChan {
    node_id: NodeId,
    command_tx: mpsc::Sender<Command>,
}
impl DataWriterClientChan {
    pub(crate) fn new(node_id: NodeId, command_tx: mpsc::Sender<Command>) -> Self {
        DataWriterClientChan {
            node_id,
            command_tx,
        }
    }

    /// サービスに停止要求を発行する。
    pub fn stop(&self) {
        let _ = self.command_tx.send(Command::Stop);
    }
}
impl DataWriterClient for DataWriterClientChan {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn submit(&self, entry: SegmentEntry, chunks: ChunkReceiver) -> BoxFuture<SegmentOutcome> {
        let (monitored, monitor) = oneshot::monitor();
        let command = Command::Submit(entry, chunks, monitored);
        future_try!(self
            .command_tx
            .send(command)
            .map_err(|_| ErrorKind::Canceled.cause("Data writer service stopped")));
        Box::new(monitor.map_err(|e| track!(Error::from(e))))
    }

    fn abort(&self, segment_id: SegmentId) -> BoxFuture<()> {
        let (monitored, monitor) = oneshot::monitor();
        let command = Command::Abort(segment_id, monitored);
        future_try!(self
            .command_tx
            .send(command)
            .map_err(|_| ErrorKind::Canceled.cause("Data writer service stopped")));
        Box::new(monitor.map_err(|e| track!(Error::from(e))))
    }
}

#[cfg(test)]
mod tests {
    use futures::{Async, Future, Stream};
    use trackable::result::TestResult;

    use super::*;
    use crate::test_util::chunks;

    #[test]
    fn sender_waits_until_receiver_consumes() -> TestResult {
        let (sink, mut rx) = segment_channel(1);
        let mut chunks = chunks(b"abcdef", 3, 0).into_iter();

        let (sequence, payload) = chunks.next().expect("Never fails");
        let mut first = sink.send_sequence(sequence, payload);
        let sink = match track!(first.poll())? {
            Async::Ready(sink) => sink,
            Async::NotReady => panic!("The first chunk should be accepted"),
        };

        let (sequence, payload) = chunks.next().expect("Never fails");
        let mut second = sink.send_sequence(sequence, payload);
        assert!(track!(second.poll())?.is_not_ready());

        match rx.poll() {
            Ok(Async::Ready(Some(SegmentMessage::Sequence(sequence, _)))) => {
                assert_eq!(sequence.sequence_num, 0);
            }
            other => panic!("Unexpected: {:?}", other),
        }
        let sink = match track!(second.poll())? {
            Async::Ready(sink) => sink,
            Async::NotReady => panic!("A credit should have been returned"),
        };

        track!(sink.finish().wait())?;
        let rest = rx.collect().wait().ok().expect("Never fails");
        assert_eq!(rest.len(), 2);
        match rest[1] {
            SegmentMessage::Finish => {}
            ref other => panic!("Unexpected: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn closed_receiver_fails_pending_sender() -> TestResult {
        let (sink, mut rx) = segment_channel(1);
        let mut chunks = chunks(b"abcdef", 3, 0).into_iter();

        let (sequence, payload) = chunks.next().expect("Never fails");
        let sink = track!(sink.send_sequence(sequence, payload).wait())?;
        rx.close();

        let (sequence, payload) = chunks.next().expect("Never fails");
        let e = sink.send_sequence(sequence, payload).wait().err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::Canceled));
        Ok(())
    }

    #[test]
    fn dropped_sink_ends_stream_without_finish() -> TestResult {
        let (sink, rx) = segment_channel(4);
        let (sequence, payload) = chunks(b"abc", 3, 0).remove(0);
        let sink = track!(sink.send_sequence(sequence, payload).wait())?;
        drop(sink);

        let messages = rx.collect().wait().ok().expect("Never fails");
        assert_eq!(messages.len(), 1);
        Ok(())
    }
}
