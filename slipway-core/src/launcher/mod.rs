//! Container launcher.
//!
//! Runs an image's command as a single foreground process: the image's
//! layers are materialized into a per-run root filesystem, the entry file and
//! serve port are checked, and the process is started with the image's
//! environment and working directory. The process's exit code becomes the
//! launcher's exit code.

pub mod command;
pub mod preflight;
pub mod readiness;

pub use command::LaunchCommand;

use crate::builder::cas::CasStore;
use crate::builder::layer::materialize;
use crate::builder::runner::{host_argv, host_env, host_path, provision_rootfs, Isolation, DEFAULT_PATH};
use crate::config::{Config, IsolationMode};
use crate::error::{Result, SlipwayError};
use crate::image::{ImageRecord, ImageReference, ImageStore};
use crate::paths::StorePaths;
use crate::ports::ServeEndpoint;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

/// Per-launch overrides.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub port: Option<u16>,
    pub address: Option<IpAddr>,
    pub isolation: Option<IsolationMode>,
}

/// How a launched container ended.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub container_id: String,
    pub endpoint: ServeEndpoint,
    /// Exit code of the process, `128 + signal` when it was killed
    pub exit_code: i32,
    /// Time until the endpoint accepted connections, if it did
    pub ready_after: Option<Duration>,
}

/// A materialized, not yet started container. The run directory is removed
/// when this is dropped.
#[derive(Debug)]
pub struct Container {
    pub id: String,
    pub image: ImageRecord,
    pub command: LaunchCommand,
    pub endpoint: ServeEndpoint,
    dir: PathBuf,
    rootfs: PathBuf,
}

impl Container {
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn workdir(&self) -> &str {
        if self.image.config.workdir.is_empty() {
            "/"
        } else {
            &self.image.config.workdir
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != ErrorKind::NotFound {
                warn!(container = %self.id, error = %e, "Failed to remove container directory");
            }
        }
    }
}

/// Starts containers from images in the local store.
#[derive(Debug, Clone)]
pub struct Launcher {
    store: ImageStore,
    cas: CasStore,
    containers_dir: PathBuf,
    isolation: IsolationMode,
    default_endpoint: ServeEndpoint,
    startup_timeout: Duration,
}

impl Launcher {
    pub fn new(config: &Config, paths: &StorePaths) -> Result<Self> {
        let cas = CasStore::new(&paths.cas_dir()).map_err(|e| SlipwayError::IoError { path: paths.cas_dir(), source: e })?;
        Ok(Self {
            store: ImageStore::open(paths.root())?,
            cas,
            containers_dir: paths.containers_dir(),
            isolation: config.isolation,
            default_endpoint: config.endpoint(),
            startup_timeout: config.startup_timeout(),
        })
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Resolve the image and work out the command and endpoint to launch.
    ///
    /// The endpoint comes from the bind flags baked into the image, then the
    /// image's first exposed port, then configuration. Overrides in `options`
    /// win, and the command always ends up carrying matching bind flags.
    pub fn resolve(&self, reference: &ImageReference, options: &LaunchOptions) -> Result<(ImageRecord, LaunchCommand)> {
        let image = self.store.resolve(reference)?;
        let command = LaunchCommand::from_image(&image.config)?;

        let mut endpoint = command.endpoint().unwrap_or_else(|| match image.config.exposed_ports.first() {
            Some(port) => ServeEndpoint::new(self.default_endpoint.address, *port),
            None => self.default_endpoint,
        });
        if let Some(port) = options.port {
            endpoint.port = port;
        }
        if let Some(address) = options.address {
            endpoint.address = address;
        }

        let command = if command.endpoint() == Some(endpoint) { command } else { command.with_endpoint(endpoint) };
        Ok((image, command))
    }

    /// Materialize the image into a fresh run directory.
    #[instrument(skip(self, image, command), fields(image = %image.reference))]
    pub async fn prepare(&self, image: ImageRecord, command: LaunchCommand) -> Result<Container> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.containers_dir.join(&id);
        let rootfs = dir.join("rootfs");
        let endpoint = command.endpoint().unwrap_or(self.default_endpoint);

        let container = Container { id, image, command, endpoint, dir, rootfs };

        let cas = self.cas.clone();
        let layers = container.image.layer_digests();
        let target = container.rootfs.clone();
        tokio::task::spawn_blocking(move || materialize(&layers, &target, &cas))
            .await
            .map_err(|e| SlipwayError::Internal(format!("materialize task failed: {}", e)))?
            .map_err(|e| SlipwayError::IoError { path: container.rootfs.clone(), source: e })?;

        debug!(container = %container.id, layers = container.image.layers.len(), "Root filesystem ready");
        Ok(container)
    }

    /// Launch the tagged image and wait for its process to exit.
    #[instrument(skip(self, options), fields(image = %reference))]
    pub async fn run(&self, reference: &ImageReference, options: &LaunchOptions) -> Result<LaunchOutcome> {
        let (image, command) = self.resolve(reference, options)?;
        let container = self.prepare(image, command).await?;

        preflight::preflight(&container)?;

        let isolation = Isolation::resolve(options.isolation.unwrap_or(self.isolation));
        let child = spawn(&container, isolation)?;
        info!(
            container = %container.id,
            endpoint = %container.endpoint,
            pid = child.id().unwrap_or_default(),
            "Started {}",
            container.command
        );

        let watch = tokio::spawn(readiness::wait_until_ready(container.endpoint, self.startup_timeout));
        let status = supervise(child).await?;

        let ready_after = if watch.is_finished() {
            watch.await.ok().flatten()
        } else {
            watch.abort();
            None
        };

        let exit_code = status_code(&status);
        info!(container = %container.id, exit_code, "Dashboard process exited");

        Ok(LaunchOutcome { container_id: container.id.clone(), endpoint: container.endpoint, exit_code, ready_after })
    }
}

fn spawn(container: &Container, isolation: Isolation) -> Result<Child> {
    let command = &container.command;
    let mut env = container.image.config.env.clone();
    let argv = match isolation {
        Isolation::Chroot => command.argv().to_vec(),
        Isolation::Host => host_argv(container.rootfs(), command.argv().to_vec(), &env),
    };

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .env_clear()
        .kill_on_drop(true);

    let cwd = host_path(container.rootfs(), container.workdir());
    std::fs::create_dir_all(&cwd).map_err(|e| SlipwayError::IoError { path: cwd.clone(), source: e })?;

    match isolation {
        Isolation::Chroot => {
            provision_rootfs(container.rootfs())
                .map_err(|e| SlipwayError::IoError { path: container.rootfs().to_path_buf(), source: e })?;
            confine(&mut cmd, container)?;
        }
        Isolation::Host => {
            cmd.current_dir(&cwd);
            env = host_env(container.rootfs(), env);
        }
    }
    if !env.iter().any(|(k, _)| k == "PATH") {
        env.push(("PATH".into(), DEFAULT_PATH.into()));
    }
    cmd.envs(env);

    debug!(isolation = ?isolation, argv = ?argv, "Spawning dashboard process");

    cmd.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound => SlipwayError::ProgramNotFound { program: command.program().to_string() },
        _ => SlipwayError::LaunchFailed { reason: format!("failed to start {}: {}", command.program(), e) },
    })
}

#[cfg(unix)]
fn confine(cmd: &mut Command, container: &Container) -> Result<()> {
    let hook = crate::builder::runner::chroot_hook(container.rootfs(), container.workdir())
        .map_err(|e| SlipwayError::LaunchFailed { reason: e.to_string() })?;
    unsafe {
        cmd.pre_exec(hook);
    }
    cmd.env("HOME", "/root");
    Ok(())
}

#[cfg(not(unix))]
fn confine(_cmd: &mut Command, _container: &Container) -> Result<()> {
    Err(SlipwayError::LaunchFailed { reason: "chroot isolation requires Linux".into() })
}

/// Wait for the child, forwarding SIGINT and SIGTERM to it.
#[cfg(unix)]
async fn supervise(mut child: Child) -> Result<ExitStatus> {
    use tokio::signal::unix::{signal, SignalKind};

    let setup = |e: std::io::Error| SlipwayError::LaunchFailed { reason: format!("signal handler: {}", e) };
    let mut interrupt = signal(SignalKind::interrupt()).map_err(setup)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(setup)?;
    let pid = child.id();

    loop {
        tokio::select! {
            status = child.wait() => {
                return status.map_err(|e| SlipwayError::LaunchFailed { reason: e.to_string() });
            }
            _ = interrupt.recv() => forward_signal(pid, libc::SIGINT),
            _ = terminate.recv() => forward_signal(pid, libc::SIGTERM),
        }
    }
}

#[cfg(not(unix))]
async fn supervise(mut child: Child) -> Result<ExitStatus> {
    child.wait().await.map_err(|e| SlipwayError::LaunchFailed { reason: e.to_string() })
}

#[cfg(unix)]
fn forward_signal(pid: Option<u32>, signal: libc::c_int) {
    if let Some(pid) = pid {
        debug!(pid, signal, "Forwarding signal to dashboard process");
        unsafe {
            libc::kill(pid as libc::pid_t, signal);
        }
    }
}

#[cfg(unix)]
fn status_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn status_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
