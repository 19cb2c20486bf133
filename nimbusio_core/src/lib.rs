//! nimbus.io の各クレートで共有される補助機能群。
#![allow(clippy::new_ret_no_self)]
extern crate rustracing;
extern crate rustracing_jaeger;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[cfg(test)]
extern crate serde_yaml;
extern crate trackable;

pub mod serde_ext;
pub mod tracer;
