//! 一つのストレージノード上でセグメントを書き込むための構成要素群。
//!
//! - `types`: セグメントおよびシーケンス(チャンク)を識別するための値型
//! - `SegmentWriter`: セグメントの作成・チャンクの追記・検証・確定・破棄を担当する
//! - `DataWriterService`: ノード毎のワーカ。`DataWriterClient`経由で書き込み要求を受け付ける
#![warn(missing_docs)]
extern crate adler32;
extern crate byteorder;
extern crate cannyls;
extern crate fibers;
extern crate fibers_tasque;
extern crate futures;
extern crate md5;
extern crate nimbusio_nodedb;
extern crate prometrics;
#[macro_use]
extern crate slog;
#[macro_use]
extern crate trackable;

pub use crate::client::{
    segment_channel, ChunkReceiver, DataWriterClient, DataWriterClientChan, SegmentMessage,
    SegmentOutcome, SegmentSink, SendSequence,
};
pub use crate::error::{Error, ErrorKind, ReplyCode};
pub use crate::row::{SegmentRow, SegmentState};
pub use crate::service::DataWriterService;
pub use crate::store::{LumpStore, SegmentStore};
pub use crate::util::BoxFuture;
pub use crate::writer::SegmentWriter;

pub mod types;

mod client;
mod error;
mod metrics;
mod row;
mod service;
mod store;
mod util;
mod writer;

#[cfg(test)]
mod test_util;

/// クレート固有の`Result`型。
pub type Result<T> = ::std::result::Result<T, Error>;
