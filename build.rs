#[macro_use]
extern crate trackable;

use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

macro_rules! track_any_err_unwrap {
    ($expr:expr) => {
        track_try_unwrap!(track_any_err!($expr))
    };
}

fn main() {
    // `PROFILE`, `RUSTC`, `OUT_DIR` are set by cargo for build scripts.
    let profile = track_any_err_unwrap!(env::var("PROFILE"));
    let rustc = track_any_err_unwrap!(env::var("RUSTC"));
    let output = track_any_err_unwrap!(Command::new(rustc).arg("--version").output());
    let rustc_version = track_any_err_unwrap!(String::from_utf8(output.stdout));

    let out_dir = track_any_err_unwrap!(env::var("OUT_DIR"));
    let dest = Path::new(&out_dir).join("build_information.rs");
    let contents = format!(
        "/// The cargo profile (\"debug\" or \"release\") used to build this binary.
pub static BUILD_PROFILE: &str = {:?};

/// The `rustc --version` output of the compiler used to build this binary.
pub static BUILD_RUSTC_VERSION: &str = {:?};
",
        profile,
        rustc_version.trim()
    );
    track_any_err_unwrap!(fs::write(dest, contents));
}
