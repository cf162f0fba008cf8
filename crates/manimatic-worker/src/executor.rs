//! Sandboxed execution of animation scripts through the external renderer.
//!
//! The executor owns the full lifecycle of one render: static validation,
//! a per-task working directory, a timeout-bounded subprocess in its own
//! process group, and artifact resolution. Every failure surfaces as a typed
//! [`ExecutionError`] that the worker service converts into a
//! `compile_failed` event.
//!
//! ## Subprocess lifecycle
//!
//! The renderer forks helpers, so cancellation must signal the whole process
//! group, not just the direct child. The child is started with a fresh
//! process group id and `SIGKILL` goes to `-pgid` on timeout; the supervisor
//! waits for the reap before returning.
//!
//! ## Working directories
//!
//! Each execution gets `<base>/<session>_<uuid>`, so cross-task collisions
//! are impossible. The directory is removed on any failure; on success the
//! caller uploads the artifact first and then removes it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use uuid::Uuid;

use manimatic_core::EventEnvelope;

use crate::validator::{ScriptValidator, ValidationError};

/// Maximum accepted script size in bytes (1 MiB).
pub const MAX_SCRIPT_SIZE: usize = 1024 * 1024;

/// Maximum accepted size of captured stdout or stderr (10 MiB).
pub const MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

/// Default per-execution deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix for script files inside working directories.
const SCRIPT_FILE_PREFIX: &str = "scene_";

/// Renderer quality flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Quality {
    /// Low quality (fast preview renders).
    #[default]
    Low,
    /// Medium quality.
    Medium,
    /// High quality (4K renders).
    High,
}

impl Quality {
    /// Returns the renderer command-line flag for this quality.
    #[must_use]
    pub const fn flag(self) -> &'static str {
        match self {
            Self::Low => "-ql",
            Self::Medium => "-qm",
            Self::High => "-qh",
        }
    }
}

/// Categories of execution errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The validator rejected the script.
    Security,
    /// Script or subprocess output exceeded a size limit.
    Size,
    /// The subprocess exceeded the per-execution deadline.
    Timeout,
    /// The renderer exited non-zero or produced no artifact.
    Compilation,
    /// An I/O or spawn failure.
    System,
}

impl ErrorKind {
    /// Returns the user-facing label for this error category.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Security => "Security Validation Error",
            Self::Size => "Size Limit Error",
            Self::Timeout => "Timeout Error",
            Self::Compilation => "Compilation Error",
            Self::System => "System Error",
        }
    }
}

/// A structured error from script execution.
#[derive(Debug)]
pub struct ExecutionError {
    /// The category of failure.
    pub kind: ErrorKind,
    /// User-readable error message.
    pub message: String,
    /// Captured renderer stdout, if any.
    pub stdout: String,
    /// Captured renderer stderr, if any.
    pub stderr: String,
    /// Source line where the error occurred, if known.
    pub line: Option<u32>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

impl std::error::Error for ExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

impl ExecutionError {
    fn security(validation: &ValidationError) -> Self {
        Self {
            kind: ErrorKind::Security,
            message: format!("This code cannot be executed. {validation}"),
            stdout: String::new(),
            stderr: String::new(),
            line: u32::try_from(validation.line).ok(),
            source: Some(Box::new(validation.clone())),
        }
    }

    fn size(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Size,
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
            line: None,
            source: None,
        }
    }

    fn timeout() -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: "Script execution timed out".to_string(),
            stdout: String::new(),
            stderr: String::new(),
            line: None,
            source: None,
        }
    }

    fn compilation(message: impl Into<String>, stdout: String, stderr: String) -> Self {
        Self {
            kind: ErrorKind::Compilation,
            message: message.into(),
            stdout,
            stderr,
            line: None,
            source: None,
        }
    }

    fn system(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: ErrorKind::System,
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
            line: None,
            source: Some(Box::new(source)),
        }
    }

    /// Converts this error into a `compile_failed` envelope for `session_id`.
    #[must_use]
    pub fn to_event(&self, session_id: &str) -> EventEnvelope {
        EventEnvelope::compile_failed(
            session_id,
            self.to_string(),
            self.stdout.clone(),
            self.stderr.clone(),
            self.line,
        )
    }
}

/// Result of a successful script execution.
#[derive(Debug)]
pub struct ExecutionOutput {
    /// Path of the rendered artifact (`.mp4`, or `.png` for still frames).
    pub output_path: PathBuf,
    /// The per-task working directory. The caller removes it after upload.
    pub working_dir: PathBuf,
    /// Captured renderer stdout.
    pub stdout: String,
    /// Captured renderer stderr.
    pub stderr: String,
}

/// Executes animation scripts under sandbox rules.
#[derive(Debug)]
pub struct ScriptExecutor {
    base_dir: PathBuf,
    renderer: String,
    quality: Quality,
    timeout: Duration,
    validator: ScriptValidator,
}

impl ScriptExecutor {
    /// Creates an executor whose working directories live under
    /// `<base_dir>/tasks`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tasks directory cannot be created.
    pub fn new(base_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let tasks_dir = base_dir.as_ref().join("tasks");
        std::fs::create_dir_all(&tasks_dir)?;

        Ok(Self {
            base_dir: tasks_dir,
            renderer: "manim".to_string(),
            quality: Quality::Low,
            timeout: DEFAULT_TIMEOUT,
            validator: ScriptValidator::new(),
        })
    }

    /// Sets the render quality.
    #[must_use]
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    /// Sets the per-execution deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the renderer binary (tests substitute a stub here).
    #[must_use]
    pub fn with_renderer(mut self, renderer: impl Into<String>) -> Self {
        self.renderer = renderer.into();
        self
    }

    /// Executes `script` for `session_id` and resolves the rendered artifact.
    ///
    /// # Errors
    ///
    /// Returns a typed [`ExecutionError`]; see [`ErrorKind`] for the
    /// taxonomy. No subprocess is spawned for size or security rejections.
    pub async fn execute(
        &self,
        script: &str,
        session_id: &str,
    ) -> Result<ExecutionOutput, ExecutionError> {
        if script.len() > MAX_SCRIPT_SIZE {
            return Err(ExecutionError::size(format!(
                "Script size {} exceeds limit {MAX_SCRIPT_SIZE}",
                script.len()
            )));
        }

        if let Err(validation) = self.validator.validate(script) {
            return Err(ExecutionError::security(&validation));
        }

        let work_dir = self
            .base_dir
            .join(format!("{session_id}_{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| ExecutionError::system("Failed to create working directory", e))?;

        match self.run_renderer(&work_dir, script).await {
            Ok(output) => Ok(output),
            Err(err) => {
                let _ = tokio::fs::remove_dir_all(&work_dir).await;
                Err(err)
            }
        }
    }

    async fn run_renderer(
        &self,
        work_dir: &Path,
        script: &str,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let work_dir = tokio::fs::canonicalize(work_dir)
            .await
            .map_err(|e| ExecutionError::system("Failed to resolve working directory", e))?;

        let script_path = work_dir.join(format!("{SCRIPT_FILE_PREFIX}{}.py", Uuid::new_v4()));
        tokio::fs::write(&script_path, script)
            .await
            .map_err(|e| ExecutionError::system("Failed to write script to file", e))?;

        let output_path = work_dir.join("output.mp4");

        let mut child = Command::new(&self.renderer)
            .arg("render")
            .arg("--media_dir")
            .arg(&self.base_dir)
            .arg(self.quality.flag())
            .arg("-o")
            .arg(&output_path)
            .arg(&script_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::system("Failed to start renderer process", e))?;

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| missing_pipe("stdout"))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| missing_pipe("stderr"))?;
        let stdout_task = tokio::spawn(read_pipe(stdout_pipe));
        let stderr_task = tokio::spawn(read_pipe(stderr_pipe));

        let child_pid = child.id();

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ExecutionError::system("Failed to wait for renderer", e));
            }
            Err(_elapsed) => {
                kill_process_group(child_pid);
                // Wait for the reap so no zombies outlive this call.
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(ExecutionError::timeout());
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if stdout.len() > MAX_OUTPUT_SIZE || stderr.len() > MAX_OUTPUT_SIZE {
            return Err(ExecutionError::size(format!(
                "Output size exceeds limit of {MAX_OUTPUT_SIZE} bytes"
            )));
        }

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        if !status.success() {
            return Err(ExecutionError::compilation(
                "Manim compilation failed",
                stdout,
                stderr,
            ));
        }

        // When the script plays no animation the renderer emits a still
        // image at `<output>.png` instead of a video.
        let artifact = if path_exists(&output_path).await {
            output_path
        } else {
            let png_path = PathBuf::from(format!("{}.png", output_path.display()));
            if path_exists(&png_path).await {
                png_path
            } else {
                return Err(ExecutionError::compilation(
                    "Manim compilation completed but no output file was created",
                    stdout,
                    stderr,
                ));
            }
        };

        Ok(ExecutionOutput {
            output_path: artifact,
            working_dir: work_dir,
            stdout,
            stderr,
        })
    }
}

async fn read_pipe(mut pipe: impl tokio::io::AsyncRead + Unpin) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    buf
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

fn missing_pipe(name: &str) -> ExecutionError {
    ExecutionError::system(
        format!("Renderer {name} pipe was not captured"),
        std::io::Error::other("pipe missing"),
    )
}

/// Sends `SIGKILL` to the child's process group.
///
/// The child was spawned with `process_group(0)`, so its pid doubles as the
/// group id and the signal reaches every renderer helper.
fn kill_process_group(child_pid: Option<u32>) {
    let Some(pid) = child_pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::warn!(pid = pid, error = %e, "failed to kill renderer process group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    fn executor(dir: &Path) -> ScriptExecutor {
        ScriptExecutor::new(dir).expect("tasks dir should be created")
    }

    /// Writes an executable stub that stands in for the renderer binary.
    ///
    /// The stub receives the real argument vector
    /// (`render --media_dir <dir> -ql -o <output> <script>`), so `$6` is the
    /// output path.
    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-manim");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("stub written");
        let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("stub made executable");
        path
    }

    const VALID_SCRIPT: &str = "from manim import *\n\nclass S(Scene):\n    def construct(self):\n        pass\n";

    #[tokio::test]
    async fn oversized_script_fails_without_spawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = executor(dir.path()).with_renderer("/nonexistent/renderer");

        let script = "#".repeat(MAX_SCRIPT_SIZE + 1);
        let err = executor
            .execute(&script, "s1")
            .await
            .expect_err("oversized script must fail");
        assert_eq!(err.kind, ErrorKind::Size);
    }

    #[tokio::test]
    async fn script_at_exactly_max_size_passes_the_gate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = executor(dir.path()).with_renderer("/nonexistent/renderer");

        // Pad a valid script with comment bytes to exactly the limit. The
        // size gate passes; the bogus renderer then fails as a system error,
        // proving the gate was crossed.
        let mut script = VALID_SCRIPT.to_string();
        script.push_str(&"#".repeat(MAX_SCRIPT_SIZE - script.len()));
        let err = executor
            .execute(&script, "s1")
            .await
            .expect_err("bogus renderer must fail");
        assert_eq!(err.kind, ErrorKind::System);
    }

    #[tokio::test]
    async fn insecure_script_fails_without_spawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = executor(dir.path()).with_renderer("/nonexistent/renderer");

        let err = executor
            .execute("import os\n", "s1")
            .await
            .expect_err("os import must fail");
        assert_eq!(err.kind, ErrorKind::Security);
        assert!(err.to_string().starts_with("Security Validation Error"));
        assert!(err.message.starts_with("This code cannot be executed."));
    }

    #[tokio::test]
    async fn renders_video_artifact_with_stub_renderer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(dir.path(), "echo rendering; touch \"$6\"");
        let executor = executor(dir.path()).with_renderer(stub.display().to_string());

        let output = executor
            .execute(VALID_SCRIPT, "s1")
            .await
            .expect("stub render should succeed");
        assert!(output.output_path.ends_with("output.mp4"));
        assert!(output.output_path.exists());
        assert!(output.working_dir.exists());
        assert!(output.stdout.contains("rendering"));

        std::fs::remove_dir_all(&output.working_dir).expect("caller cleans up");
    }

    #[tokio::test]
    async fn falls_back_to_still_image_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(dir.path(), "touch \"$6.png\"");
        let executor = executor(dir.path()).with_renderer(stub.display().to_string());

        let output = executor
            .execute(VALID_SCRIPT, "s1")
            .await
            .expect("still-image render should succeed");
        assert!(output.output_path.extension().is_some_and(|e| e == "png"));
    }

    #[tokio::test]
    async fn missing_artifact_is_a_compilation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(dir.path(), "echo no output produced");
        let executor = executor(dir.path()).with_renderer(stub.display().to_string());

        let err = executor
            .execute(VALID_SCRIPT, "s1")
            .await
            .expect_err("missing artifact must fail");
        assert_eq!(err.kind, ErrorKind::Compilation);
        assert!(err.stdout.contains("no output produced"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_compilation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(dir.path(), "echo boom >&2; exit 3");
        let executor = executor(dir.path()).with_renderer(stub.display().to_string());

        let err = executor
            .execute(VALID_SCRIPT, "s1")
            .await
            .expect_err("non-zero exit must fail");
        assert_eq!(err.kind, ErrorKind::Compilation);
        assert!(err.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn slow_renderer_hits_timeout_and_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(dir.path(), "sleep 30");
        let executor = executor(dir.path())
            .with_renderer(stub.display().to_string())
            .with_timeout(Duration::from_millis(200));

        let started = Instant::now();
        let err = executor
            .execute(VALID_SCRIPT, "s1")
            .await
            .expect_err("slow renderer must time out");
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.to_string(), "Timeout Error: Script execution timed out");
        assert!(started.elapsed() < Duration::from_secs(2));

        // The per-task directory must not survive a timeout.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("tasks"))
            .expect("tasks dir readable")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn working_directories_never_collide() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(dir.path(), "touch \"$6\"");
        let executor = executor(dir.path()).with_renderer(stub.display().to_string());

        let first = executor
            .execute(VALID_SCRIPT, "same-session")
            .await
            .expect("first render");
        let second = executor
            .execute(VALID_SCRIPT, "same-session")
            .await
            .expect("second render");
        assert_ne!(first.working_dir, second.working_dir);
    }

    #[test]
    fn execution_error_converts_to_compile_failed_event() {
        let err = ExecutionError::compilation("Manim compilation failed", "out".into(), "err".into());
        let event = err.to_event("s9");
        assert_eq!(event.session_id, "s9");
        assert_eq!(event.kind(), manimatic_core::events::KIND_COMPILE_FAILED);

        let encoded = event.encode().expect("encode");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["data"]["message"], "Compilation Error: Manim compilation failed");
        assert_eq!(value["data"]["stdout"], "out");
    }
}
