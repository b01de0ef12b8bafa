//! RPC channel tests over a real socket pair with a recording handler.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cellar_common::error::{CellarError, Result};
use cellar_common::types::BindPath;
use cellar_core::loop_device::{LO_FLAGS_AUTOCLEAR, LoopInfo, LoopMode};
use cellar_runtime::engine::native::{ContainerConfig, RootFs, prepare_rootfs};
use cellar_runtime::rpc::{Request, RpcClient, RpcHandler, RpcServer, SyscallHandler, write_frame};
use nix::mount::MsFlags;

type Log = Arc<Mutex<Vec<String>>>;

/// Creates directories for real and only records everything else.
struct Recording {
    log: Log,
}

impl RpcHandler for Recording {
    fn mkdir(&mut self, path: &Path, _mode: u32) -> Result<i64> {
        self.log.lock().unwrap().push(format!("mkdir {}", path.display()));
        if path.is_absolute() && path.starts_with(std::env::temp_dir()) {
            std::fs::create_dir_all(path).map_err(|e| CellarError::io(path, e))?;
        }
        Ok(0)
    }

    fn mount(
        &mut self,
        source: Option<&str>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        _data: Option<&str>,
    ) -> Result<i64> {
        if target.ends_with("deny") {
            return Err(CellarError::PermissionDenied {
                message: "mount refused".into(),
            });
        }
        let remount = if flags.contains(MsFlags::MS_REMOUNT) { " remount" } else { "" };
        self.log.lock().unwrap().push(format!(
            "mount {} {} {}{remount}",
            source.unwrap_or("-"),
            target.display(),
            fstype.unwrap_or("-")
        ));
        Ok(0)
    }

    fn chroot(&mut self, root: &Path) -> Result<i64> {
        self.log.lock().unwrap().push(format!("chroot {}", root.display()));
        Ok(0)
    }

    fn loop_attach(&mut self, image: &Path, mode: LoopMode, _info: &LoopInfo) -> Result<i64> {
        self.log
            .lock()
            .unwrap()
            .push(format!("loop_attach {} {mode:?}", image.display()));
        Ok(7)
    }
}

fn serve() -> (RpcClient<UnixStream>, Log, JoinHandle<Result<()>>) {
    let (client, server) = UnixStream::pair().unwrap();
    let log = Log::default();
    let handler = Box::new(Recording { log: Arc::clone(&log) });
    let handle = std::thread::spawn(move || RpcServer::new(server, handler).serve());
    (RpcClient::new(client), log, handle)
}

#[test]
fn successful_calls_return_values() {
    let (mut client, log, handle) = serve();
    client.mkdir(Path::new("/srv/root/etc"), 0o755).unwrap();
    let device = client
        .loop_attach(Path::new("/images/base.ext4"), LoopMode::ReadOnly, LoopInfo::default())
        .unwrap();
    assert_eq!(device, PathBuf::from("/dev/loop7"));
    drop(client);

    handle.join().unwrap().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        ["mkdir /srv/root/etc", "loop_attach /images/base.ext4 ReadOnly"]
    );
}

#[test]
fn handler_errors_reach_the_caller_and_keep_the_channel() {
    let (mut client, _log, handle) = serve();
    let err = client
        .mount(Some("/data"), Path::new("/srv/deny"), None, MsFlags::MS_BIND, None)
        .unwrap_err();
    assert!(
        matches!(&err, CellarError::Rpc { method: "mount", message } if message.contains("mount refused")),
        "{err}"
    );
    client.chroot(Path::new("/srv/root")).unwrap();
    drop(client);
    handle.join().unwrap().unwrap();
}

#[test]
fn malformed_request_is_answered() {
    let (mut stream, server) = UnixStream::pair().unwrap();
    let log = Log::default();
    let handler = Box::new(Recording { log: Arc::clone(&log) });
    let handle = std::thread::spawn(move || RpcServer::new(server, handler).serve());

    write_frame(&mut stream, br#"{"method":"reboot"}"#).unwrap();
    let frame = cellar_runtime::rpc::read_frame(&mut stream).unwrap().unwrap();
    let response: cellar_runtime::rpc::Response = serde_json::from_slice(&frame).unwrap();
    assert_eq!(response.value, -1);
    assert!(response.error.unwrap().contains("malformed request"));

    let mut client = RpcClient::new(stream);
    client.chroot(Path::new("/srv/root")).unwrap();
    drop(client);
    handle.join().unwrap().unwrap();
    assert_eq!(*log.lock().unwrap(), ["chroot /srv/root"]);
}

#[test]
fn clean_eof_stops_the_server() {
    let (client, log, handle) = serve();
    drop(client);
    handle.join().unwrap().unwrap();
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn truncated_frame_is_a_protocol_error() {
    let (mut stream, server) = UnixStream::pair().unwrap();
    let handler = Box::new(Recording { log: Log::default() });
    let handle = std::thread::spawn(move || RpcServer::new(server, handler).serve());

    stream.write_all(&64u32.to_be_bytes()).unwrap();
    stream.write_all(b"{\"method\"").unwrap();
    drop(stream);
    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, CellarError::Protocol { .. }), "{err}");
}

#[test]
fn rootfs_is_assembled_in_order() {
    let host = tempfile::tempdir_in(std::env::temp_dir()).unwrap();
    let root = host.path().join("root");
    let data = host.path().join("data");
    let conf = host.path().join("app.conf");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(&conf, "key = value\n").unwrap();

    let mut config = ContainerConfig::new(
        "web",
        vec!["/bin/true".into()],
        RootFs::Image {
            image: host.path().join("base.ext4"),
            mount_point: root.clone(),
            fstype: "ext4".into(),
            writable: false,
        },
    );
    config.process.cwd = "/work".into();
    config.binds = vec![
        BindPath::read_write(&data, "/data"),
        BindPath::read_only(&conf, "/etc/app.conf"),
    ];

    let (mut client, log, handle) = serve();
    let assembled = prepare_rootfs(&config, &mut client).unwrap();
    drop(client);
    handle.join().unwrap().unwrap();

    assert_eq!(assembled, root);
    assert!(root.join("etc/app.conf").is_file());
    let d = |p: &Path| p.display().to_string();
    let expected = vec![
        format!("loop_attach {} ReadOnly", d(&host.path().join("base.ext4"))),
        format!("mkdir {}", d(&root)),
        format!("mount /dev/loop7 {} ext4", d(&root)),
        format!("mkdir {}", d(&root.join("data"))),
        format!("mount {} {} -", d(&data), d(&root.join("data"))),
        format!("mkdir {}", d(&root.join("etc"))),
        format!("mount {} {} -", d(&conf), d(&root.join("etc/app.conf"))),
        format!("mount - {} - remount", d(&root.join("etc/app.conf"))),
        format!("chroot {}", d(&root)),
        "mkdir /work".to_string(),
    ];
    assert_eq!(*log.lock().unwrap(), expected);
}

#[test]
fn syscall_handler_holds_autoclear_devices() {
    if !nix::unistd::geteuid().is_root() || !Path::new("/dev/loop-control").exists() {
        return;
    }
    let image = tempfile::NamedTempFile::new().unwrap();
    image.as_file().set_len(1 << 20).unwrap();
    let info = LoopInfo {
        flags: LO_FLAGS_AUTOCLEAR,
        ..LoopInfo::default()
    };

    let mut handler = SyscallHandler::default();
    let number = handler.loop_attach(image.path(), LoopMode::ReadOnly, &info).unwrap();
    assert_eq!(handler.attached().len(), 1);
    let backing = format!("/sys/block/loop{number}/loop/backing_file");
    let bound = std::fs::read_to_string(&backing).unwrap();
    assert_eq!(Path::new(bound.trim()), image.path());
}

#[test]
fn request_method_names_are_stable() {
    let request = Request::Chroot { root: "/srv".into() };
    let json = serde_json::to_value(&request).unwrap();
    assert_eq!(json["method"], "chroot");
    assert_eq!(json["args"]["root"], "/srv");
}
