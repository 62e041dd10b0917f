//! Main of the layerfs storage daemon and its control client.

mod ctl;
mod daemon;
mod wire;

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::process::exit;

/// Writes an error to stderr, then exits.
pub fn fail<M: fmt::Display>(bin: &str, msg: M) -> ! {
    eprintln!("{bin}: error: {msg}");
    exit(1);
}

fn main() {
    let mut args = env::args_os();
    let bin = args
        .next()
        .map(PathBuf::from)
        .and_then(|p| {
            p.file_name()
                .and_then(|name| name.to_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| {
            fail("layerfs", "missing binary name");
        });
    match bin.as_str() {
        "layerfsd" => daemon::main(args),
        "layerfsctl" => ctl::main(args),
        // Running the binary directly: the first argument picks the tool
        "layerfs" => {
            let mut args = args;
            match args.next().and_then(|s| s.into_string().ok()).as_deref() {
                Some("daemon") => daemon::main(args),
                Some("ctl") => ctl::main(args),
                _ => fail("layerfs", "usage: layerfs <daemon|ctl> ..."),
            }
        }
        _ => fail("layerfs", "invalid binary name"),
    }
}
