use fibers::sync::oneshot::MonitorError;
use std::io;
use std::sync::PoisonError;
use trackable::error::TrackableError;
use trackable::error::{ErrorKind as TrackableErrorKind, ErrorKindExt};

/// エラーの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 同一の識別子を持つセグメントが既に書き込み中あるいは確定済み。
    DuplicateSegment,

    /// シーケンス番号が欠番あるいは重複している。
    SequenceOrder,

    /// チャンクのAdler-32、あるいはセグメント全体のMD5が一致しない。
    ChecksumMismatch,

    /// 書き込まれたバイト数が宣言されたセグメントサイズと一致しない。
    SizeMismatch,

    /// 永続化層での失敗。
    ///
    /// 重複保存を避けるため、自動では再試行されない。
    Storage,

    /// 存在しないセグメントIDが指定された。
    UnknownSegment,

    /// 書き込み中ではないセグメントに対して変更が要求された。
    SegmentClosed,

    /// チャンク受理後、あるいは設定済みのハンドオフ先を変更しようとした。
    HandoffImmutable,

    /// 永続化されていたデータが壊れている。
    Corrupted,

    /// 入力値が不正。
    Invalid,

    /// 書き込みが途中で取り消された。
    Canceled,

    /// その他のエラー。
    Other,
}
impl TrackableErrorKind for ErrorKind {}

/// クレート固有の`Error`型。
#[derive(Debug, Clone, TrackableError)]
pub struct Error(TrackableError<ErrorKind>);
impl From<cannyls::Error> for Error {
    fn from(f: cannyls::Error) -> Self {
        ErrorKind::Storage.takes_over(f).into()
    }
}
impl From<io::Error> for Error {
    fn from(f: io::Error) -> Self {
        ErrorKind::Storage.cause(f).into()
    }
}
impl From<prometrics::Error> for Error {
    fn from(f: prometrics::Error) -> Self {
        ErrorKind::Other.takes_over(f).into()
    }
}
impl From<fibers_tasque::AsyncCallError> for Error {
    fn from(f: fibers_tasque::AsyncCallError) -> Self {
        ErrorKind::Other.cause(f).into()
    }
}
impl<T> From<PoisonError<T>> for Error {
    fn from(f: PoisonError<T>) -> Self {
        ErrorKind::Other.cause(f.to_string()).into()
    }
}
impl<E: Into<Error>> From<MonitorError<E>> for Error {
    fn from(f: MonitorError<E>) -> Self {
        match f {
            MonitorError::Aborted => ErrorKind::Canceled
                .cause("Monitor channel disconnected")
                .into(),
            MonitorError::Failed(e) => e.into(),
        }
    }
}

/// データライタの応答コード。
///
/// ノード間でやり取りされる応答メッセージの`result`フィールドに対応する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyCode {
    /// 成功。
    Successful = 0,

    /// 重複したセグメント。
    InvalidDuplicate = 1,

    /// 上記以外の失敗。
    Exception = 2,

    /// シーケンス番号の順序違反。
    OutOfSequence = 3,
}
impl ReplyCode {
    /// 書き込み結果から応答コードを求める。
    pub fn from_result<T>(result: &Result<T, Error>) -> Self {
        match *result {
            Ok(_) => ReplyCode::Successful,
            Err(ref e) => match *e.kind() {
                ErrorKind::DuplicateSegment => ReplyCode::InvalidDuplicate,
                ErrorKind::SequenceOrder => ReplyCode::OutOfSequence,
                _ => ReplyCode::Exception,
            },
        }
    }

    /// 数値表現を返す。
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
