//! RUN step execution.
//!
//! Commands run against the materialized root filesystem, either confined
//! with `chroot` (Linux, root) or on the host with the working directory and
//! `PATH` pointed into the root filesystem.
//!
//! A chroot gets the host's name resolution files and the standard character
//! devices before anything runs in it. `/proc` is not mounted.
//!
//! Host mode is best effort. The kernel resolves `#!` interpreters on the
//! host, so a rootfs script such as `pip` is started through the rootfs copy
//! of its interpreter. Only the program itself (or the first command of a
//! `sh -c` script) is rewritten; later commands in a compound script run
//! whatever the host resolves.

use crate::builder::executor::{BuildError, BuildResult};
use crate::builder::parser::RunCommand;
use crate::builder::plan::StepRole;
use crate::config::IsolationMode;
use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, info, warn};

/// Output lines kept for failure reports.
const FAILURE_TAIL_LINES: usize = 20;

pub(crate) const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host files copied into a chroot, relative to `/etc`.
const HOST_ETC_FILES: &[&str] = &["resolv.conf", "hosts"];

/// Character devices created in a chroot's `/dev`: name, major, minor.
const DEVICE_NODES: &[(&str, u32, u32)] = &[("null", 1, 3), ("zero", 1, 5), ("random", 1, 8), ("urandom", 1, 9)];

/// Symlink hops followed when resolving a path inside the rootfs.
const MAX_LINK_HOPS: usize = 8;

/// Shared libraries of rootfs interpreters, exposed to host-mode processes.
const HOST_LIBRARY_DIR: &str = "/usr/local/lib";

/// How RUN commands are confined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// `chroot` into the root filesystem
    Chroot,
    /// Run on the host, rooted at the root filesystem by convention only
    Host,
}

impl Isolation {
    pub fn resolve(mode: IsolationMode) -> Self {
        match mode {
            IsolationMode::Chroot => Isolation::Chroot,
            IsolationMode::Host => Isolation::Host,
            IsolationMode::Auto if chroot_available() => Isolation::Chroot,
            IsolationMode::Auto => {
                warn!("chroot unavailable (requires Linux and root); RUN steps execute on the host");
                Isolation::Host
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn chroot_available() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(target_os = "linux"))]
fn chroot_available() -> bool {
    false
}

/// Executes RUN commands for the builder.
#[derive(Debug, Clone)]
pub struct StepRunner {
    isolation: Isolation,
}

impl StepRunner {
    pub fn new(isolation: Isolation) -> Self {
        Self { isolation }
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Run `command` for plan step `step`. `env` is the image environment at
    /// this point of the build plus ARG values.
    pub fn run(
        &self,
        step: usize,
        command: &RunCommand,
        rootfs: &Path,
        workdir: &str,
        env: &[(String, String)],
        role: StepRole,
    ) -> BuildResult<()> {
        let failed = |details: String| BuildError::InstructionFailed {
            step,
            instruction: format!("RUN {}", command),
            details,
        };

        let mut argv = command.to_argv();
        let mut child_env: Vec<(String, String)> = env.to_vec();
        if role == StepRole::DependencyInstall {
            child_env.push(("PIP_NO_CACHE_DIR".into(), "1".into()));
        }
        if self.isolation == Isolation::Host {
            argv = host_argv(rootfs, argv, &child_env);
        }

        let (program, args) = argv.split_first().ok_or_else(|| failed("empty command".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).env_clear();

        match self.isolation {
            Isolation::Chroot => self.confine(&mut cmd, rootfs, workdir).map_err(|e| failed(e.to_string()))?,
            Isolation::Host => {
                let cwd = host_path(rootfs, workdir);
                fs::create_dir_all(&cwd)?;
                cmd.current_dir(&cwd);
                child_env = host_env(rootfs, child_env);
            }
        }

        if !child_env.iter().any(|(k, _)| k == "PATH") {
            child_env.push(("PATH".into(), DEFAULT_PATH.into()));
        }
        cmd.envs(child_env);

        debug!(step, isolation = ?self.isolation, argv = ?argv, "Running step");

        let mut child = cmd.spawn().map_err(|e| failed(format!("failed to start {}: {}", program, e)))?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx.clone()));
        }
        drop(tx);

        let mut tail: VecDeque<String> = VecDeque::with_capacity(FAILURE_TAIL_LINES);
        for line in rx {
            info!(step, "  {}", line);
            if tail.len() == FAILURE_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = child.wait()?;
        if status.success() {
            return Ok(());
        }

        let reason = match status.code() {
            Some(code) => format!("exit code {}", code),
            None => signal_description(&status),
        };
        let mut details = reason;
        if !tail.is_empty() {
            details.push_str("\n--- last output ---\n");
            details.push_str(&tail.into_iter().collect::<Vec<_>>().join("\n"));
        }

        Err(failed(details))
    }

    #[cfg(unix)]
    fn confine(&self, cmd: &mut Command, rootfs: &Path, workdir: &str) -> std::io::Result<()> {
        use std::os::unix::process::CommandExt as _;

        fs::create_dir_all(host_path(rootfs, workdir))?;
        provision_rootfs(rootfs)?;
        let hook = chroot_hook(rootfs, workdir)?;
        unsafe {
            cmd.pre_exec(hook);
        }
        cmd.env("HOME", "/root");
        Ok(())
    }

    #[cfg(not(unix))]
    fn confine(&self, _cmd: &mut Command, _rootfs: &Path, _workdir: &str) -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "chroot isolation requires Linux"))
    }
}

/// `pre_exec` hook entering `rootfs` and changing to `workdir` inside it.
#[cfg(unix)]
pub(crate) fn chroot_hook(
    rootfs: &Path,
    workdir: &str,
) -> std::io::Result<impl FnMut() -> std::io::Result<()> + Send + Sync + 'static> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let root = CString::new(rootfs.as_os_str().as_bytes())?;
    let dir = CString::new(workdir.as_bytes())?;

    Ok(move || {
        // Only async-signal-safe calls between fork and exec
        if unsafe { libc::chroot(root.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::chdir(dir.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    })
}

/// Prepare `rootfs` to be a chroot: copy the host's name resolution files
/// and create the standard character devices.
pub(crate) fn provision_rootfs(rootfs: &Path) -> io::Result<()> {
    provision_from(rootfs, Path::new("/etc"))
}

fn provision_from(rootfs: &Path, host_etc: &Path) -> io::Result<()> {
    let etc = rootfs.join("etc");
    fs::create_dir_all(&etc)?;

    for name in HOST_ETC_FILES {
        let source = host_etc.join(name);
        if !source.is_file() {
            debug!(file = %source.display(), "Host file missing, not copied into rootfs");
            continue;
        }
        // Never write through a link that points back out at the host
        let dest = etc.join(name);
        match fs::symlink_metadata(&dest) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&dest)?,
            Ok(_) => fs::remove_file(&dest)?,
            Err(_) => {}
        }
        fs::copy(&source, &dest)?;
    }

    let created = make_device_nodes(&rootfs.join("dev"))?;
    debug!(rootfs = %rootfs.display(), devices = created.len(), "Root filesystem provisioned");
    Ok(())
}

/// Create the [`DEVICE_NODES`] that do not exist yet. Returns the names it
/// created; a node that cannot be created (no `CAP_MKNOD`) is logged and
/// skipped.
#[cfg(target_os = "linux")]
fn make_device_nodes(dev: &Path) -> io::Result<Vec<&'static str>> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    fs::create_dir_all(dev)?;
    let mut created = Vec::new();

    for &(name, major, minor) in DEVICE_NODES {
        let path = dev.join(name);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_char_device() => continue,
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path)?,
            Ok(_) => fs::remove_file(&path)?,
            Err(_) => {}
        }

        let c_path = CString::new(path.as_os_str().as_bytes())?;
        let rc = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFCHR | 0o666, libc::makedev(major, minor)) };
        if rc != 0 {
            warn!(device = %path.display(), error = %io::Error::last_os_error(), "Could not create device node");
            continue;
        }
        // mknod applies the umask
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666))?;
        created.push(name);
    }

    Ok(created)
}

#[cfg(not(target_os = "linux"))]
fn make_device_nodes(dev: &Path) -> io::Result<Vec<&'static str>> {
    fs::create_dir_all(dev)?;
    Ok(Vec::new())
}

/// True for `sh`-compatible shells that take a script with `-c`.
pub(crate) fn is_shell(program: &str) -> bool {
    matches!(Path::new(program).file_name().and_then(|n| n.to_str()), Some("sh" | "bash" | "dash" | "ash"))
}

/// Host-mode argument vector: a rootfs program with an absolute `#!` line
/// runs through the rootfs interpreter. `env` is the image environment,
/// whose `PATH` is searched inside the rootfs.
pub(crate) fn host_argv(rootfs: &Path, mut argv: Vec<String>, env: &[(String, String)]) -> Vec<String> {
    let search = env.iter().find(|(k, _)| k == "PATH").map_or(DEFAULT_PATH, |(_, v)| v.as_str());

    if argv.len() >= 3 && argv[1] == "-c" && is_shell(&argv[0]) {
        if let Some(script) = rewrite_script(rootfs, &argv[2], search) {
            debug!(script = %script, "Rewrote script to use the rootfs interpreter");
            argv[2] = script;
        }
        return argv;
    }

    let rewritten = argv.first().and_then(|program| interpreter_argv(rootfs, program, search));
    match rewritten {
        Some(mut rewritten) => {
            rewritten.extend(argv.drain(1..));
            debug!(argv = ?rewritten, "Using the rootfs interpreter");
            rewritten
        }
        None => argv,
    }
}

/// `script` with its first command started through the rootfs interpreter.
fn rewrite_script(rootfs: &Path, script: &str, search: &str) -> Option<String> {
    let trimmed = script.trim_start();
    let offset = script.len() - trimmed.len();
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let program = &trimmed[..end];

    if program.is_empty() || !program.chars().all(|c| c.is_ascii_alphanumeric() || "-_./+".contains(c)) {
        return None;
    }

    let prefix: Vec<String> = interpreter_argv(rootfs, program, search)?.iter().map(|a| shell_quote(a)).collect();
    Some(format!("{}{}{}", &script[..offset], prefix.join(" "), &trimmed[end..]))
}

/// `[interpreter, optional-arg, script]` on the host for a rootfs `program`
/// that starts with `#!`. `None` when the program is not in the rootfs, is
/// not a script, or its interpreter is missing from the rootfs.
fn interpreter_argv(rootfs: &Path, program: &str, search: &str) -> Option<Vec<String>> {
    let script = find_in_rootfs(rootfs, program, search)?;
    let (interpreter, arg) = read_shebang(&script)?;

    let (interpreter, arg) = match arg {
        // `#!/usr/bin/env python3` names a program to look up
        Some(name) if Path::new(&interpreter).file_name().is_some_and(|n| n == "env") => {
            (find_in_rootfs(rootfs, &name, search)?, None)
        }
        arg => (resolve_in_rootfs(rootfs, &interpreter)?, arg),
    };

    let mut argv = vec![interpreter.to_string_lossy().into_owned()];
    argv.extend(arg);
    argv.push(script.to_string_lossy().into_owned());
    Some(argv)
}

/// Host path of `program` inside the rootfs: absolute image paths directly,
/// bare names through `search`.
fn find_in_rootfs(rootfs: &Path, program: &str, search: &str) -> Option<PathBuf> {
    if program.starts_with('/') {
        return resolve_in_rootfs(rootfs, program);
    }
    if program.contains('/') {
        return None;
    }
    search
        .split(':')
        .filter(|dir| dir.starts_with('/'))
        .find_map(|dir| resolve_in_rootfs(rootfs, &format!("{}/{}", dir.trim_end_matches('/'), program)))
}

/// Follow symlinks for an image-side path without leaving the rootfs.
fn resolve_in_rootfs(rootfs: &Path, image_path: &str) -> Option<PathBuf> {
    let mut current = image_path.to_string();

    for _ in 0..MAX_LINK_HOPS {
        let host = host_path(rootfs, &current);
        match fs::read_link(&host) {
            Ok(target) => {
                let target = target.to_string_lossy().into_owned();
                current = if target.starts_with('/') {
                    target
                } else {
                    let parent = current.rsplit_once('/').map_or("", |(parent, _)| parent);
                    format!("{}/{}", parent, target)
                };
            }
            Err(_) => return host.is_file().then_some(host),
        }
    }

    None
}

/// Interpreter and optional argument from a `#!` line. Only absolute
/// interpreters count.
fn read_shebang(path: &Path) -> Option<(String, Option<String>)> {
    let mut head = [0u8; 256];
    let read = fs::File::open(path).and_then(|mut f| f.read(&mut head)).ok()?;
    let line = head[..read].strip_prefix(b"#!")?;
    let line = line.split(|&b| b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?.trim();

    let (interpreter, arg) = match line.split_once(char::is_whitespace) {
        Some((interpreter, arg)) => (interpreter, Some(arg.trim().to_string()).filter(|a| !a.is_empty())),
        None => (line, None),
    };
    interpreter.starts_with('/').then(|| (interpreter.to_string(), arg))
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_./+:=@".contains(c)) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// `workdir` (absolute, image side) under `rootfs`.
pub fn host_path(rootfs: &Path, workdir: &str) -> PathBuf {
    rootfs.join(workdir.trim_start_matches('/'))
}

/// Host-mode environment: image `PATH` entries rebased onto the rootfs ahead
/// of the host `PATH`, `HOME` inside the rootfs, the rootfs `/usr/local/lib`
/// for its interpreters' shared libraries, and `SLIPWAY_ROOTFS`.
pub(crate) fn host_env(rootfs: &Path, mut env: Vec<(String, String)>) -> Vec<(String, String)> {
    let image_path = env
        .iter()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| DEFAULT_PATH.to_string());

    let mut entries: Vec<String> = image_path
        .split(':')
        .filter(|p| !p.is_empty())
        .map(|p| host_path(rootfs, p).to_string_lossy().to_string())
        .collect();
    if let Ok(host) = std::env::var("PATH") {
        entries.push(host);
    }

    env.retain(|(k, _)| k != "PATH" && k != "HOME");
    env.push(("PATH".into(), entries.join(":")));
    let libraries = host_path(rootfs, HOST_LIBRARY_DIR);
    if libraries.is_dir() && !env.iter().any(|(k, _)| k == "LD_LIBRARY_PATH") {
        env.push(("LD_LIBRARY_PATH".into(), libraries.to_string_lossy().into_owned()));
    }
    env.push(("HOME".into(), host_path(rootfs, "/root").to_string_lossy().to_string()));
    env.push(("SLIPWAY_ROOTFS".into(), rootfs.to_string_lossy().to_string()));
    env
}

fn spawn_line_reader<R: std::io::Read + Send + 'static>(stream: R, tx: mpsc::Sender<String>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

#[cfg(unix)]
fn signal_description(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("killed by signal {}", sig),
        None => "terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_description(_status: &std::process::ExitStatus) -> String {
    "terminated abnormally".to_string()
}
