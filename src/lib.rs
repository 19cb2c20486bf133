//! nimbus.io の書き込み経路。
//!
//! オブジェクトの書き込み要求を受け取り、イレイジャーコーディング済みの各シェア(セグメント)を
//! ノードレジストリで選んだストレージノードのデータライタに並行して送り込む。
//! 到達不能なノード宛てのシェアはハンドオフ先に迂回され、
//! 最低限必要な数のシェアが確定できなかった書き込みはロールバックされる。
#![warn(missing_docs)]
extern crate fibers;
extern crate futures;
extern crate nimbusio_core;
extern crate nimbusio_datawriter;
extern crate nimbusio_nodedb;
extern crate num_cpus;
extern crate prometrics;
extern crate rustracing;
extern crate rustracing_jaeger;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_yaml;
#[macro_use]
extern crate slog;
#[macro_use]
extern crate trackable;

pub use crate::config::NimbusioConfig;
pub use crate::dispatcher::{
    ArchiveRequest, ArchiveSummary, ObjectWrite, Placement, WriteCompletion, WriteDispatcher,
};
pub use crate::error::{Error, ErrorKind};
pub use crate::request::RequestKind;
pub use crate::unified_id::{LocalUnifiedIdGenerator, UnifiedIdSource};

pub mod daemon;

mod config;
mod dispatcher;
mod error;
mod metrics;
mod request;
mod unified_id;
mod util;

/// ビルド時の情報。
pub mod build_information {
    include!(concat!(env!("OUT_DIR"), "/build_information.rs"));
}

/// クレート固有の`Result`型。
pub type Result<T> = ::std::result::Result<T, Error>;
