//! The `layerfsd` daemon: mounts a device holding layered filesystems and
//! serves its control plane until told to stop.
//!
//! The kernel filesystem transport attaches to the two mount points and
//! drives the operation handlers of `layerfs::fops`; the daemon itself
//! owns the device, the background threads and the control socket the
//! `layerfsctl` client talks to.

use crate::fail;
use crate::wire;
use layerfs::flush;
use layerfs::fops;
use layerfs::layer;
use layerfs::layer::Config;
use layerfs::layer::Gfs;
use std::env::ArgsOs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

/// Set by the signal handler when the daemon must unmount and exit.
static STOPPING: AtomicBool = AtomicBool::new(false);

/// Parsed command line.
#[derive(Default)]
struct Args {
    /// The device or file holding the filesystem.
    device: Option<PathBuf>,
    /// Mount point exposing the base layer.
    base_mount: Option<PathBuf>,
    /// Mount point under which layers appear.
    layer_mount: Option<PathBuf>,
    /// Stay in the foreground.
    foreground: bool,
    /// Filesystem options.
    config: Config,
    /// Print usage.
    help: bool,
}

fn usage() {
    eprintln!(
        "usage: layerfsd <device> <base-mnt> <layer-mnt> [-f] [-c] [-d] [-m] [-r] [-t] [-p] [-s] [-v]"
    );
    eprintln!("\tdevice     - device or file holding image layers");
    eprintln!("\tbase-mnt   - mount point of the base layer");
    eprintln!("\tlayer-mnt  - mount point under which layers appear");
    eprintln!("\t-f         - run in the foreground");
    eprintln!("\t-c         - format the device");
    eprintln!("\t-d         - display debugging info");
    eprintln!("\t-m         - enable memory stats");
    eprintln!("\t-r         - enable request stats");
    eprintln!("\t-t         - enable tracking count of file types");
    eprintln!("\t-p         - enable profiling");
    eprintln!("\t-s         - swap layers when committed");
    eprintln!("\t-v         - enable verbose mode");
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res = Args::default();
    for arg in args {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("-f") => res.foreground = true,
            Some("-c") => res.config.format = true,
            Some("-d") => res.config.debug = true,
            Some("-m") => res.config.memstats = true,
            Some("-r") => res.config.request_stats = true,
            Some("-t") => res.config.ftype_stats = true,
            Some("-p") => res.config.profiling = true,
            Some("-s") => res.config.swap_commit = true,
            Some("-v") => res.config.verbose = true,
            _ => {
                let path = PathBuf::from(arg);
                if res.device.is_none() {
                    res.device = Some(path);
                } else if res.base_mount.is_none() {
                    res.base_mount = Some(path);
                } else if res.layer_mount.is_none() {
                    res.layer_mount = Some(path);
                } else {
                    res.help = true;
                }
            }
        }
    }
    res
}

extern "C" fn stop_handler(_sig: libc::c_int) {
    STOPPING.store(true, Ordering::Release);
}

/// Detaches from the controlling terminal. The parent stays around until
/// the child signals over the pipe that serving started, so mount scripts
/// can rely on the exit code.
fn daemonize() -> io::Result<Option<std::fs::File>> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid > 0 {
        // The parent waits for the child to come up
        unsafe { libc::close(fds[1]) };
        let mut status = [0u8; 1];
        let mut parent_end = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fds[0]) };
        let ok = parent_end.read_exact(&mut status).is_ok() && status[0] == 1;
        exit(if ok { 0 } else { 1 });
    }
    unsafe { libc::close(fds[0]) };
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::chdir(c"/".as_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let nullfd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
    if nullfd >= 0 {
        unsafe {
            libc::dup2(nullfd, 0);
            libc::dup2(nullfd, 1);
            libc::dup2(nullfd, 2);
            if nullfd > 2 {
                libc::close(nullfd);
            }
        }
    }
    Ok(Some(unsafe {
        <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fds[1])
    }))
}

/// Serves one control connection.
fn serve_conn(gfs: &Gfs, stream: &mut std::os::unix::net::UnixStream) -> io::Result<()> {
    loop {
        let (cmd, payload) = match wire::read_request(stream) {
            Ok(req) => req,
            Err(_) => return Ok(()),
        };
        let ino = layer::set_handle(0, gfs.layer_root.load(Ordering::Relaxed));
        let (errno, data) = match fops::ioctl(gfs, ino, cmd, &payload) {
            Ok(data) => (0, data),
            Err(err) => (err.raw_os_error().unwrap_or(libc::EIO), Vec::new()),
        };
        wire::write_reply(stream, errno, &data)?;
    }
}

/// Accept loop of the control socket. Runs until the daemon stops.
fn serve_ctl(gfs: Arc<Gfs>, listener: UnixListener) {
    listener.set_nonblocking(true).ok();
    while !STOPPING.load(Ordering::Acquire) && !gfs.unmounting.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((mut stream, _)) => {
                stream.set_nonblocking(false).ok();
                let _ = serve_conn(&gfs, &mut stream);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(_) => break,
        }
    }
}

pub fn main(args: ArgsOs) {
    let args = parse_args(args);
    if args.help {
        usage();
        exit(libc::EINVAL);
    }
    let (Some(device), Some(base_mount), Some(layer_mount)) =
        (args.device, args.base_mount, args.layer_mount)
    else {
        usage();
        exit(libc::EINVAL);
    };
    if base_mount == layer_mount {
        eprintln!("layerfsd: specify different mount points");
        usage();
        exit(libc::EINVAL);
    }
    for mnt in [&base_mount, &layer_mount] {
        if !mnt.is_dir() {
            fail(
                "layerfsd",
                format_args!("{}: mount point does not exist", mnt.display()),
            );
        }
    }

    let mut notify = None;
    if !args.foreground {
        notify = daemonize().unwrap_or_else(|e| {
            fail("layerfsd", format_args!("failed to daemonize: {e}"));
        });
    }

    let gfs = match layer::mount(&device, args.config) {
        Ok(gfs) => gfs,
        Err(err) => {
            eprintln!("layerfsd: mounting {} failed: {err}", device.display());
            exit(err.raw_os_error().unwrap_or(libc::EIO));
        }
    };
    if args.config.verbose {
        eprintln!(
            "{} mounted at {} and {}",
            device.display(),
            base_mount.display(),
            layer_mount.display()
        );
    }

    unsafe {
        let handler = stop_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    // Background flusher, cleaner and syncer
    let mut threads = Vec::new();
    {
        let gfs = gfs.clone();
        threads.push(thread::spawn(move || flush::syncer(&gfs)));
    }
    {
        let gfs = gfs.clone();
        threads.push(thread::spawn(move || flush::flusher(&gfs)));
    }
    {
        let gfs = gfs.clone();
        threads.push(thread::spawn(move || flush::cleaner(&gfs)));
    }

    // The control socket lives next to the layer mount point
    let ctl_path = ctl_socket_path(&layer_mount);
    let _ = std::fs::remove_file(&ctl_path);
    let listener = UnixListener::bind(&ctl_path).unwrap_or_else(|e| {
        fail(
            "layerfsd",
            format_args!("{}: {e}", ctl_path.display()),
        );
    });
    if let Some(mut pipe) = notify.take() {
        let _ = pipe.write_all(&[1]);
    }
    serve_ctl(gfs.clone(), listener);

    // Ordered shutdown: checkpoint, then stop the threads
    if let Err(err) = flush::unmount(&gfs) {
        eprintln!("layerfsd: unmount failed: {err}");
    }
    for thread in threads {
        let _ = thread.join();
    }
    let _ = std::fs::remove_file(&ctl_path);
    if args.config.verbose {
        eprintln!("{} unmounted", device.display());
    }
}

/// Path of the control socket for a layer mount point.
pub fn ctl_socket_path(layer_mount: &std::path::Path) -> PathBuf {
    let mut path = layer_mount.as_os_str().to_owned();
    path.push(".ctl");
    PathBuf::from(path)
}
