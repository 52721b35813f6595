//! Environment provisioner: creates an isolated per-model Python virtual
//! environment and spawns the worker interpreter inside it.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Result, SupervisorError};

const DEFAULT_VENV_NAME: &str = "model_venv";

/// A provisioned, ready-to-use execution environment for one model.
#[derive(Debug, Clone)]
pub struct EnvHandle {
    pub root: PathBuf,
    pub interpreter: PathBuf,
}

impl EnvHandle {
    fn venv_dir(root: &Path) -> PathBuf {
        root.join(DEFAULT_VENV_NAME)
    }

    fn python_path(root: &Path) -> PathBuf {
        Self::venv_dir(root).join("bin").join("python")
    }

    fn pip_path(root: &Path) -> PathBuf {
        Self::venv_dir(root).join("bin").join("pip")
    }

    /// Whether a venv already exists at `root`.
    pub fn exists(root: &Path) -> bool {
        Self::venv_dir(root).exists() && Self::python_path(root).exists()
    }
}

/// Creates and populates per-model virtual environments.
pub struct Provisioner {
    python_cmd: OsString,
}

impl Default for Provisioner {
    fn default() -> Self {
        Provisioner {
            python_cmd: OsString::from("python3"),
        }
    }
}

impl Provisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the system interpreter used to create venvs (test fixtures
    /// use this to point at a stub binary).
    pub fn with_python_cmd(python_cmd: impl Into<OsString>) -> Self {
        Provisioner {
            python_cmd: python_cmd.into(),
        }
    }

    /// Idempotent unless `force` is set: if a venv already exists at
    /// `model_dir` and `force` is false, no subprocess is invoked at all.
    pub fn provision(
        &self,
        model_name: &str,
        model_dir: &Path,
        requirements_path: &Path,
        force: bool,
    ) -> Result<EnvHandle> {
        let venv_dir = EnvHandle::venv_dir(model_dir);

        if force && venv_dir.exists() {
            std::fs::remove_dir_all(&venv_dir).map_err(|e| SupervisorError::EnvError {
                name: model_name.to_string(),
                detail: format!("removing existing venv: {e}"),
            })?;
        }

        if force || !EnvHandle::exists(model_dir) {
            let status = Command::new(&self.python_cmd)
                .arg("-m")
                .arg("venv")
                .arg("--with-pip")
                .arg(&venv_dir)
                .status()
                .map_err(|e| SupervisorError::EnvError {
                    name: model_name.to_string(),
                    detail: format!("spawning venv creation: {e}"),
                })?;
            if !status.success() {
                return Err(SupervisorError::EnvError {
                    name: model_name.to_string(),
                    detail: format!("venv creation exited with {status}"),
                });
            }
        }

        if requirements_path.is_file() {
            let pip = EnvHandle::pip_path(model_dir);
            let output = Command::new(&pip)
                .arg("install")
                .arg("-r")
                .arg(requirements_path)
                .output()
                .map_err(|e| SupervisorError::DependencyInstallError {
                    name: model_name.to_string(),
                    detail: format!("spawning pip: {e}"),
                })?;
            if !output.status.success() {
                return Err(SupervisorError::DependencyInstallError {
                    name: model_name.to_string(),
                    detail: String::from_utf8_lossy(&output.stderr).to_string(),
                });
            }
        }

        Ok(EnvHandle {
            root: model_dir.to_path_buf(),
            interpreter: EnvHandle::python_path(model_dir),
        })
    }

    /// Launch the worker: `<interpreter> -m <entry_module>`, or just
    /// `<interpreter>` when `entry_module` is empty (used by test fixtures
    /// that point the interpreter directly at a compiled worker binary).
    pub fn spawn(
        &self,
        model_name: &str,
        env: &EnvHandle,
        entry_module: &str,
        env_vars: &HashMap<String, String>,
    ) -> Result<ProcessHandle> {
        let mut command = Command::new(&env.interpreter);
        if !entry_module.is_empty() {
            command.arg("-m").arg(entry_module);
        }
        command
            .current_dir(&env.root)
            .envs(env_vars)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = command.spawn().map_err(|e| SupervisorError::SpawnError {
            name: model_name.to_string(),
            detail: format!("{e}"),
        })?;

        Ok(ProcessHandle {
            child,
            model_name: model_name.to_string(),
        })
    }
}

/// A running (or recently exited) worker process.
pub struct ProcessHandle {
    child: Child,
    model_name: String,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Non-blocking exit-status check.
    pub fn poll(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    pub fn is_alive(&mut self) -> bool {
        self.poll().is_none()
    }

    /// Poll until exit or `timeout` elapses.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.poll() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[cfg(unix)]
    fn send_signal(&self, signal: libc::c_int) -> Result<()> {
        let pid = self.child.id() as libc::pid_t;
        let ret = unsafe { libc::kill(pid, signal) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone; treat as success.
            return Ok(());
        }
        Err(SupervisorError::Io(err))
    }

    /// Graceful shutdown request.
    #[cfg(unix)]
    pub fn terminate(&self) -> Result<()> {
        self.send_signal(libc::SIGTERM)
    }

    /// Forceful termination.
    #[cfg(unix)]
    pub fn kill(&self) -> Result<()> {
        self.send_signal(libc::SIGKILL)
    }

    #[cfg(not(unix))]
    pub fn terminate(&self) -> Result<()> {
        Err(SupervisorError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process termination is only supported on unix",
        )))
    }

    #[cfg(not(unix))]
    pub fn kill(&self) -> Result<()> {
        self.terminate()
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Bounded ring buffer of the worker's captured stderr lines, used only to
/// decorate startup/crash errors with recent diagnostic output.
#[derive(Debug, Default)]
pub struct StderrRing {
    lines: VecDeque<String>,
    cap: usize,
}

impl StderrRing {
    pub fn new(cap: usize) -> Self {
        StderrRing {
            lines: VecDeque::with_capacity(cap.min(256)),
            cap,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn tail(&self) -> String {
        self.lines
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_handle_not_exists_before_creation() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!EnvHandle::exists(dir.path()));
    }

    #[test]
    fn provision_is_skipped_when_already_provisioned() {
        let dir = tempfile::tempdir().unwrap();
        let venv_bin = dir.path().join("model_venv").join("bin");
        std::fs::create_dir_all(&venv_bin).unwrap();
        std::fs::write(venv_bin.join("python"), b"#!/bin/sh\n").unwrap();

        // python_cmd points at a binary that does not exist; if provision()
        // tried to invoke it, this would error out.
        let provisioner = Provisioner::with_python_cmd("definitely-not-a-real-interpreter-xyz");
        let handle = provisioner
            .provision("demo", dir.path(), &dir.path().join("requirements.txt"), false)
            .unwrap();
        assert_eq!(handle.interpreter, venv_bin.join("python"));
    }

    #[test]
    fn provision_surfaces_spawn_error_for_missing_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = Provisioner::with_python_cmd("definitely-not-a-real-interpreter-xyz");
        let err = provisioner
            .provision("demo", dir.path(), &dir.path().join("requirements.txt"), false)
            .unwrap_err();
        assert!(matches!(err, SupervisorError::EnvError { .. }));
    }

    #[test]
    fn stderr_ring_bounds_length() {
        let mut ring = StderrRing::new(3);
        for i in 0..5 {
            ring.push(format!("line {i}"));
        }
        assert_eq!(ring.tail(), "line 2\nline 3\nline 4");
    }

    #[test]
    fn spawn_and_terminate_roundtrip() {
        let env = EnvHandle {
            root: std::env::temp_dir(),
            interpreter: PathBuf::from("/bin/sleep"),
        };
        let provisioner = Provisioner::new();
        let mut handle = provisioner
            .spawn("demo", &env, "", &{
                let mut m = HashMap::new();
                m.insert("X".to_string(), "1".to_string());
                m
            })
            .unwrap();
        // can't pass "5" as an -m arg; spawn "/bin/sleep" with no module arg
        // and instead rely on terminate() to end it promptly.
        assert!(handle.is_alive() || handle.poll().is_some());
        handle.terminate().unwrap();
        handle.wait_timeout(Duration::from_secs(2));
    }
}
