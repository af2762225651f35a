use crate::config::{SandboxBackendType, SandboxConfig};
use crate::error::{SandboxError, TraceError};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};

/// Exit code `timeout(1)` reports when it had to kill the target.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Extra time the host waits for the sandbox before killing the run itself.
const WALL_CLOCK_GRACE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Exited(i32),
    Timeout,
    Signaled(i32),
}

impl ExecutionStatus {
    /// The exit status as reported in oracle results; timeouts map to 124.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionStatus::Exited(code) => Some(*code),
            ExecutionStatus::Timeout => Some(TIMEOUT_EXIT_CODE),
            ExecutionStatus::Signaled(_) => None,
        }
    }

    fn from_exit_status(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(TIMEOUT_EXIT_CODE) => ExecutionStatus::Timeout,
            Some(code) => ExecutionStatus::Exited(code),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    ExecutionStatus::Signaled(status.signal().unwrap_or(0))
                }
                #[cfg(not(unix))]
                {
                    ExecutionStatus::Signaled(0)
                }
            }
        }
    }
}

/// An isolated place where the staged target and probe live.
///
/// Paths returned by `executable`, `probe_library` and `canary_path` are as
/// seen from inside the sandbox; `traces_dir` is the host folder the probe's
/// trace records end up in.
pub trait SandboxBackend: Send {
    fn name(&self) -> &'static str;
    fn executable(&self) -> &str;
    fn probe_library(&self) -> &str;
    fn canary_path(&self) -> &str;
    fn traces_dir(&self) -> &Path;
    /// Creates the canary file or truncates it to zero length.
    fn reset_canary(&mut self) -> Result<(), SandboxError>;
    /// Builds a command that runs `argv` inside the sandbox, in its working directory.
    fn command(&self, argv: &[String]) -> Command;
}

/// One isolated execution environment for one fuzzing run.
///
/// Dropping the session tears the environment down.
pub struct SandboxSession {
    backend: Box<dyn SandboxBackend>,
    target: PathBuf,
    target_digest: String,
}

impl SandboxSession {
    pub fn create(executable: &Path, config: &SandboxConfig) -> Result<Self, SandboxError> {
        let bytes = fs::read(executable).map_err(|e| {
            SandboxError::unavailable(format!("Cannot stage target {executable:?}"), e)
        })?;
        let target_digest = format!("{:x}", md5::compute(&bytes));

        let backend: Box<dyn SandboxBackend> = match config.backend {
            SandboxBackendType::Docker => Box::new(DockerSandbox::start(executable, config)?),
            SandboxBackendType::Local => Box::new(LocalSandbox::start(executable, config)?),
        };
        info!(
            "Staged {:?} (md5 {}) in {} sandbox",
            executable,
            target_digest,
            backend.name()
        );

        let mut session = Self::with_backend(backend, executable.to_path_buf(), target_digest);
        session.reset_traces()?;
        session.backend.reset_canary()?;
        Ok(session)
    }

    pub fn with_backend(
        backend: Box<dyn SandboxBackend>,
        target: PathBuf,
        target_digest: String,
    ) -> Self {
        Self {
            backend,
            target,
            target_digest,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn target_digest(&self) -> &str {
        &self.target_digest
    }

    pub fn canary_path(&self) -> &str {
        self.backend.canary_path()
    }

    pub fn reset_canary(&mut self) -> Result<(), SandboxError> {
        self.backend.reset_canary()
    }

    /// Empties the trace folder so nothing written by a previous occupant is read back.
    ///
    /// The folder itself is kept: the docker backend has it bind-mounted.
    fn reset_traces(&self) -> Result<(), SandboxError> {
        let dir = self.backend.traces_dir();
        fs::create_dir_all(dir)
            .map_err(|e| SandboxError::unavailable(format!("Cannot create {dir:?}"), e))?;
        let entries =
            fs::read_dir(dir).map_err(|e| SandboxError::unavailable(format!("Cannot list {dir:?}"), e))?;
        for entry in entries {
            let path = entry
                .map_err(|e| SandboxError::unavailable(format!("Cannot list {dir:?}"), e))?
                .path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| SandboxError::unavailable(format!("Cannot clear {path:?}"), e))?;
        }
        Ok(())
    }

    pub fn trace_path(&self, trace_id: &str) -> PathBuf {
        self.backend.traces_dir().join(trace_id)
    }

    pub fn clear_trace(&self, trace_id: &str) {
        let path = self.trace_path(trace_id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove stale trace {path:?}: {e}");
            }
        }
    }

    pub fn read_trace(&self, trace_id: &str) -> Result<String, TraceError> {
        let path = self.trace_path(trace_id);
        fs::read_to_string(&path).map_err(|_| TraceError::Missing(path))
    }

    /// The shell command run inside the sandbox for one set of arguments.
    pub fn invocation(&self, arguments: &[&str], feed_eof: bool) -> String {
        let mut line = String::new();
        if feed_eof {
            line.push_str("echo EOF | ");
        }
        line.push_str("LD_BIND_NOW=1 LD_PRELOAD=");
        line.push_str(&shell_quote(self.backend.probe_library()));
        line.push(' ');
        line.push_str(&shell_quote(self.backend.executable()));
        for argument in arguments {
            line.push(' ');
            line.push_str(&shell_quote(argument));
        }
        line
    }

    /// Runs the instrumented target once.
    ///
    /// With `suppress_stdin` the target reads EOF from stdin. Otherwise its
    /// stdin is a pipe held open for the whole run, so a target waiting on
    /// stdin blocks until the timeout fires.
    pub fn execute(
        &mut self,
        arguments: &[&str],
        timeout: Duration,
        suppress_stdin: bool,
    ) -> Result<ExecutionStatus, SandboxError> {
        let argv = vec![
            "timeout".to_string(),
            timeout.as_secs_f64().to_string(),
            "sh".to_string(),
            "-c".to_string(),
            self.invocation(arguments, suppress_stdin),
        ];
        debug!("[{}] {}", self.backend.name(), argv.join(" "));

        let mut cmd = self.backend.command(&argv);
        cmd.stdin(if suppress_stdin {
            Stdio::null()
        } else {
            Stdio::piped()
        });
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::unavailable(format!("Failed to spawn run in {}", self.backend.name()), e)
        })?;
        let held_stdin = child.stdin.take();

        let status = run_and_wait_with_timeout(child, timeout + WALL_CLOCK_GRACE, held_stdin)?;
        Ok(status)
    }
}

fn run_and_wait_with_timeout(
    mut child: Child,
    timeout: Duration,
    held_stdin: Option<ChildStdin>,
) -> Result<ExecutionStatus, SandboxError> {
    let start_time = Instant::now();

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break ExecutionStatus::from_exit_status(status),
            Ok(None) => {
                if start_time.elapsed() > timeout {
                    warn!("Sandbox did not enforce the timeout, killing the run");
                    child
                        .kill()
                        .map_err(|e| SandboxError::unavailable("Failed to kill run", e))?;
                    let _ = child.wait();
                    break ExecutionStatus::Timeout;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(SandboxError::unavailable("Error waiting for run", e)),
        }
    };
    drop(held_stdin);
    Ok(status)
}

/// Quotes a word for `sh`, leaving plain words untouched.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn require_binary(name: &str) -> Result<PathBuf, SandboxError> {
    which::which(name)
        .map_err(|e| SandboxError::unavailable(format!("`{name}` is not available"), e))
}

fn session_dir(config: &SandboxConfig) -> Result<tempfile::TempDir, SandboxError> {
    let builder = {
        let mut builder = tempfile::Builder::new();
        builder.prefix("argprobe-");
        builder
    };
    let dir = match &config.work_root {
        Some(root) => {
            fs::create_dir_all(root)
                .map_err(|e| SandboxError::unavailable(format!("Cannot create {root:?}"), e))?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    };
    dir.map_err(|e| SandboxError::unavailable("Cannot create session folder", e))
}

fn canary_file_name(config: &SandboxConfig) -> String {
    Path::new(&config.container_canary)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "canary.opencrs".to_string())
}

/// Runs the target in a plain process inside a private temporary folder.
///
/// The folder holds copies of the target and probe, the trace folder and the
/// canary file, and is removed when the sandbox is dropped.
pub struct LocalSandbox {
    dir: tempfile::TempDir,
    executable: String,
    probe: String,
    canary: String,
    traces: PathBuf,
}

impl LocalSandbox {
    pub fn start(executable: &Path, config: &SandboxConfig) -> Result<Self, SandboxError> {
        require_binary("sh")?;
        require_binary("timeout")?;

        let dir = session_dir(config)?;
        let staged_target = dir.path().join("target");
        fs::copy(executable, &staged_target).map_err(|e| {
            SandboxError::unavailable(format!("Cannot stage target {executable:?}"), e)
        })?;
        make_executable(&staged_target)?;

        let probe_name = config
            .probe_library
            .file_name()
            .ok_or_else(|| SandboxError::Unavailable("Probe library path has no file name".into()))?;
        let staged_probe = dir.path().join(probe_name);
        fs::copy(&config.probe_library, &staged_probe).map_err(|e| {
            SandboxError::unavailable(format!("Cannot stage probe {:?}", config.probe_library), e)
        })?;

        let canary = dir.path().join(canary_file_name(config));
        let traces = dir.path().join(&config.traces_folder);

        Ok(Self {
            executable: staged_target.to_string_lossy().into_owned(),
            probe: staged_probe.to_string_lossy().into_owned(),
            canary: canary.to_string_lossy().into_owned(),
            traces,
            dir,
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), SandboxError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| SandboxError::unavailable(format!("Cannot chmod {path:?}"), e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), SandboxError> {
    Ok(())
}

impl SandboxBackend for LocalSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    fn executable(&self) -> &str {
        &self.executable
    }

    fn probe_library(&self) -> &str {
        &self.probe
    }

    fn canary_path(&self) -> &str {
        &self.canary
    }

    fn traces_dir(&self) -> &Path {
        &self.traces
    }

    fn reset_canary(&mut self) -> Result<(), SandboxError> {
        fs::write(&self.canary, b"")
            .map_err(|e| SandboxError::unavailable(format!("Cannot reset canary {}", self.canary), e))
    }

    fn command(&self, argv: &[String]) -> Command {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.current_dir(self.dir.path());
        cmd
    }
}

/// Runs the target in a long-lived container of the probe image.
///
/// The container's trace folder is bind-mounted from a per-session host
/// folder so trace records can be read without copying them out.
pub struct DockerSandbox {
    container: Container,
    workdir: String,
    executable: String,
    probe: String,
    canary: String,
    traces: PathBuf,
    // Declared last: removed after the container is gone.
    _host_dir: tempfile::TempDir,
}

/// A named container, force-removed when dropped.
///
/// Created before `docker run` so a container that was created but failed
/// to start is removed as well.
struct Container {
    runtime: PathBuf,
    name: String,
}

impl Container {
    fn docker(&self, args: &[&str]) -> Result<(), SandboxError> {
        let output = Command::new(&self.runtime)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SandboxError::unavailable("Failed to run docker", e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Unavailable(format!(
                "`docker {}` failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn exec(&self, argv: &[&str]) -> Result<(), SandboxError> {
        let mut args = vec!["exec", self.name.as_str()];
        args.extend_from_slice(argv);
        self.docker(&args)
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        debug!("Removing container {}", self.name);
        let removed = Command::new(&self.runtime)
            .args(["rm", "--force", self.name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if !matches!(removed, Ok(status) if status.success()) {
            warn!("Failed to remove container {}", self.name);
        }
    }
}

impl DockerSandbox {
    pub fn start(executable: &Path, config: &SandboxConfig) -> Result<Self, SandboxError> {
        let runtime = which::which(&config.container_runtime).map_err(|e| {
            SandboxError::unavailable(format!("{:?} is not available", config.container_runtime), e)
        })?;

        let host_dir = session_dir(config)?;
        let traces = host_dir.path().join(&config.traces_folder);
        fs::create_dir_all(&traces)
            .map_err(|e| SandboxError::unavailable(format!("Cannot create {traces:?}"), e))?;

        let suffix = host_dir
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let container = Container {
            runtime,
            name: format!("argprobe-{}", suffix.trim_start_matches("argprobe-")),
        };
        let container_traces = format!(
            "{}/{}",
            config.container_workdir.trim_end_matches('/'),
            config.traces_folder
        );
        let mount = format!("{}:{}", traces.to_string_lossy(), container_traces);

        // From here on, an error drops `container` and removes it.
        container.docker(&[
            "run",
            "--detach",
            "--name",
            container.name.as_str(),
            "--volume",
            mount.as_str(),
            "--workdir",
            config.container_workdir.as_str(),
            config.image_tag.as_str(),
            "sleep",
            "infinity",
        ])?;

        let sandbox = Self {
            container,
            workdir: config.container_workdir.clone(),
            executable: config.container_executable.clone(),
            probe: config.probe_library.to_string_lossy().into_owned(),
            canary: config.container_canary.clone(),
            traces,
            _host_dir: host_dir,
        };

        let target_dir = Path::new(&sandbox.executable)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        sandbox.container.exec(&["mkdir", "-p", target_dir.as_str()])?;
        let destination = format!("{}:{}", sandbox.container.name, sandbox.executable);
        let source = executable.to_string_lossy();
        sandbox
            .container
            .docker(&["cp", source.as_ref(), destination.as_str()])?;
        sandbox
            .container
            .exec(&["chmod", "+x", sandbox.executable.as_str()])?;
        sandbox
            .container
            .exec(&["test", "-f", sandbox.probe.as_str()])
            .map_err(|_| {
                SandboxError::Unavailable(format!(
                    "Probe {} is missing from image {}",
                    sandbox.probe, config.image_tag
                ))
            })?;

        Ok(sandbox)
    }
}

impl SandboxBackend for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn executable(&self) -> &str {
        &self.executable
    }

    fn probe_library(&self) -> &str {
        &self.probe
    }

    fn canary_path(&self) -> &str {
        &self.canary
    }

    fn traces_dir(&self) -> &Path {
        &self.traces
    }

    fn reset_canary(&mut self) -> Result<(), SandboxError> {
        let script = format!(": > {}", shell_quote(&self.canary));
        self.container.exec(&["sh", "-c", script.as_str()])
    }

    fn command(&self, argv: &[String]) -> Command {
        let mut cmd = Command::new(&self.container.runtime);
        cmd.args(["exec", "-i", "-w", self.workdir.as_str(), self.container.name.as_str()]);
        cmd.args(argv);
        cmd
    }
}
