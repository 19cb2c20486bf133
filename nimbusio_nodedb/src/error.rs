use std::io;
use std::sync::PoisonError;
use trackable::error::TrackableError;
use trackable::error::{ErrorKind as TrackableErrorKind, ErrorKindExt};

/// エラーの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// レジストリの初期化に失敗した、あるいは初期化されていない状態で使用された。
    Initialization,

    /// 登録されていないノードIDが指定された。
    UnknownNode,

    /// 利用可能なハンドオフ先が存在しない。
    NoHandoffAvailable,

    /// その他のエラー。
    Other,
}
impl TrackableErrorKind for ErrorKind {}

/// クレート固有の`Error`型。
#[derive(Debug, Clone, TrackableError)]
pub struct Error(TrackableError<ErrorKind>);
impl From<io::Error> for Error {
    fn from(f: io::Error) -> Self {
        ErrorKind::Initialization.cause(f).into()
    }
}
impl From<serde_yaml::Error> for Error {
    fn from(f: serde_yaml::Error) -> Self {
        ErrorKind::Initialization.cause(f).into()
    }
}
impl<T> From<PoisonError<T>> for Error {
    fn from(f: PoisonError<T>) -> Self {
        ErrorKind::Other.cause(f.to_string()).into()
    }
}
