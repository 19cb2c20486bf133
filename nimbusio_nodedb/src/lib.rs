//! nimbus.io の書き込み経路で使用されるノードレジストリ。
//!
//! ノードIDからアドレスや到達可能性を引くためのディレクトリと、
//! 到達不能なノードの代わりにデータを受け取るハンドオフ先の選択機能を提供する。
//!
//! レジストリはグローバル変数ではなく、明示的に初期化・破棄されるハンドル(`NodeRegistry`)として扱う。
#![warn(missing_docs)]
extern crate atomic_immut;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_yaml;
#[macro_use]
extern crate slog;
#[macro_use]
extern crate trackable;

pub use crate::error::{Error, ErrorKind};
pub use crate::node::{NodeId, NodeInfo, NodeRecord};
pub use crate::registry::NodeRegistry;
pub use crate::source::{NodeSource, YamlNodeSource};

mod error;
mod node;
mod registry;
mod source;

/// クレート固有の`Result`型。
pub type Result<T> = ::std::result::Result<T, Error>;
