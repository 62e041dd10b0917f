//! The `layerfsctl` client: drives the control plane of a running
//! `layerfsd` over its control socket.

use crate::fail;
use crate::wire;
use layerfs::proto;
use layerfs::proto::CtlCmd;
use std::env::ArgsOs;
use std::os::unix::net::UnixStream;
use std::process::exit;

fn usage() {
    eprintln!("usage: layerfsctl <layer-mnt> <command> [args]");
    eprintln!("\tcreate <name> [parent]    - create a read-only layer");
    eprintln!("\tcreate-rw <name> [parent] - create a read-write layer");
    eprintln!("\tremove <name>             - remove a layer");
    eprintln!("\tmount <name>              - mark a layer mounted");
    eprintln!("\tumount <name>             - unmount a layer");
    eprintln!("\tumount-all                - unmount all layers");
    eprintln!("\tcommit <layer> <name>     - commit a layer as a new image");
    eprintln!("\tstats <name|.> [-c]       - display (and clear) stats");
    eprintln!("\tdiff <name>               - list changes against the parent");
    eprintln!("\tsyncer <seconds>          - adjust the syncer interval");
    eprintln!("\tpcache <MB>               - adjust the page cache limit");
    exit(libc::EINVAL);
}

/// Sends one command and prints the reply.
fn send(mnt: &str, cmd: CtlCmd, payload: Vec<u8>) -> ! {
    let path = crate::daemon::ctl_socket_path(std::path::Path::new(mnt));
    let mut stream = UnixStream::connect(&path).unwrap_or_else(|e| {
        fail(
            "layerfsctl",
            format_args!("{}: {e}; is layerfsd running?", path.display()),
        );
    });
    wire::write_request(&mut stream, cmd as u32, &payload).unwrap_or_else(|e| {
        fail("layerfsctl", e);
    });
    let (errno, data) = wire::read_reply(&mut stream).unwrap_or_else(|e| {
        fail("layerfsctl", e);
    });
    if errno != 0 {
        let err = std::io::Error::from_raw_os_error(errno);
        eprintln!("layerfsctl: {err}");
        exit(errno);
    }
    if cmd == CtlCmd::LayerDiff {
        match proto::decode_changes(&data) {
            Ok(changes) => {
                for change in changes {
                    let kind = match change.kind {
                        proto::ChangeKind::Added => "A",
                        proto::ChangeKind::Modified => "M",
                        proto::ChangeKind::Removed => "R",
                    };
                    println!("{kind} {}", change.path);
                }
            }
            Err(e) => fail("layerfsctl", e),
        }
    } else if !data.is_empty() {
        print!("{}", String::from_utf8_lossy(&data));
    }
    exit(0);
}

pub fn main(args: ArgsOs) {
    let args: Vec<String> = args
        .filter_map(|a| a.into_string().ok())
        .collect();
    if args.len() < 2 {
        usage();
    }
    let mnt = &args[0];
    let cmd = args[1].as_str();
    let rest = &args[2..];
    match (cmd, rest) {
        ("create", [name]) => send(mnt, CtlCmd::LayerCreate, proto::encode_ctl_payload(None, name)),
        ("create", [name, parent]) => send(
            mnt,
            CtlCmd::LayerCreate,
            proto::encode_ctl_payload(Some(parent), name),
        ),
        ("create-rw", [name]) => send(
            mnt,
            CtlCmd::LayerCreateRw,
            proto::encode_ctl_payload(None, name),
        ),
        ("create-rw", [name, parent]) => send(
            mnt,
            CtlCmd::LayerCreateRw,
            proto::encode_ctl_payload(Some(parent), name),
        ),
        ("remove", [name]) => send(mnt, CtlCmd::LayerRemove, proto::encode_ctl_payload(None, name)),
        ("mount", [name]) => send(mnt, CtlCmd::LayerMount, proto::encode_ctl_payload(None, name)),
        ("umount", [name]) => send(mnt, CtlCmd::LayerUmount, proto::encode_ctl_payload(None, name)),
        ("umount-all", []) => send(mnt, CtlCmd::UmountAll, proto::encode_ctl_payload(None, "")),
        ("commit", [layer, name]) => send(
            mnt,
            CtlCmd::LayerCommit,
            proto::encode_ctl_payload(Some(layer), name),
        ),
        ("stats", [name]) => send(mnt, CtlCmd::LayerStat, proto::encode_ctl_payload(None, name)),
        ("stats", [name, flag]) if flag == "-c" => send(
            mnt,
            CtlCmd::ClearStat,
            proto::encode_ctl_payload(None, name),
        ),
        ("diff", [name]) => send(mnt, CtlCmd::LayerDiff, proto::encode_ctl_payload(None, name)),
        ("syncer", [secs]) => send(mnt, CtlCmd::SyncerTime, proto::encode_ctl_payload(None, secs)),
        ("pcache", [mb]) => send(mnt, CtlCmd::PcacheMemory, proto::encode_ctl_payload(None, mb)),
        _ => usage(),
    }
}
