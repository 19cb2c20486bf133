use fibers::sync::oneshot::MonitorError;
use nimbusio_datawriter;
use nimbusio_nodedb;
use prometrics;
use serde_yaml;
use std;
use std::io;
use trackable::error::TrackableError;
use trackable::error::{ErrorKind as TrackableErrorKind, ErrorKindExt};

/// クレート固有の`Error`型。
#[derive(Debug, Clone, TrackableError)]
pub struct Error(TrackableError<ErrorKind>);
impl From<io::Error> for Error {
    fn from(f: io::Error) -> Self {
        ErrorKind::Other.cause(f).into()
    }
}
impl From<nimbusio_nodedb::Error> for Error {
    fn from(f: nimbusio_nodedb::Error) -> Self {
        ErrorKind::Other.takes_over(f).into()
    }
}
impl From<nimbusio_datawriter::Error> for Error {
    fn from(f: nimbusio_datawriter::Error) -> Self {
        let kind = match *f.kind() {
            nimbusio_datawriter::ErrorKind::Storage => ErrorKind::Storage,
            nimbusio_datawriter::ErrorKind::Invalid => ErrorKind::InvalidInput,
            _ => ErrorKind::Other,
        };
        kind.takes_over(f).into()
    }
}
impl From<serde_yaml::Error> for Error {
    fn from(f: serde_yaml::Error) -> Self {
        ErrorKind::InvalidInput.cause(f).into()
    }
}
impl From<prometrics::Error> for Error {
    fn from(f: prometrics::Error) -> Self {
        ErrorKind::Other.takes_over(f).into()
    }
}
impl From<MonitorError<Error>> for Error {
    fn from(f: MonitorError<Error>) -> Self {
        f.unwrap_or_else(|| {
            ErrorKind::Other
                .cause("Monitor channel disconnected")
                .into()
        })
    }
}
impl From<std::num::ParseFloatError> for Error {
    fn from(f: std::num::ParseFloatError) -> Self {
        ErrorKind::InvalidInput.cause(f).into()
    }
}
impl From<std::num::ParseIntError> for Error {
    fn from(f: std::num::ParseIntError) -> Self {
        ErrorKind::InvalidInput.cause(f).into()
    }
}

/// エラーの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 要求の内容が不正。
    InvalidInput,

    /// 復元に必要な数のシェアを配置できるノードが存在しない。
    InsufficientNodes,

    /// 復元に必要な数のシェアの書き込みが確定しなかった。
    WriteQuorum,

    /// 永続化層でのエラー。
    Storage,

    /// この書き込み経路では扱わない種類の要求。
    NotImplemented,

    /// その他のエラー。
    Other,
}
impl TrackableErrorKind for ErrorKind {}
