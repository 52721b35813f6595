//! Model supervisor: owns one worker's full lifecycle and is the only
//! party that talks to its channel.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::channel::{NamedPipeServer, PipeConfig};
use crate::descriptor::ModelDescriptor;
use crate::error::{Result, SupervisorError};
use crate::provision::{EnvHandle, ProcessHandle, Provisioner, StderrRing};

const STDERR_RING_CAPACITY: usize = 200;
const PIPE_DIR_ENV_VAR: &str = "PYMODELSERVE_PIPE_DIR";
const GPU_ENV_VAR: &str = "CUDA_VISIBLE_DEVICES";
const STOP_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Provisioning,
    Spawning,
    Handshaking,
    Running,
    Stopping,
    ProvisionFailed,
    StartupFailed,
}

struct RunningWorker {
    channel: Mutex<NamedPipeServer>,
    process: Mutex<ProcessHandle>,
    stderr_ring: Arc<Mutex<StderrRing>>,
    stderr_thread: Option<JoinHandle<()>>,
}

/// Owns one model's worker lifecycle. Safe to call from any thread; request
/// ordering is enforced by the channel's internal mutex.
pub struct Supervisor {
    descriptor: ModelDescriptor,
    provisioner: Provisioner,
    auto_provision: bool,
    env: Mutex<Option<EnvHandle>>,
    worker: Mutex<Option<RunningWorker>>,
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    pub fn new(descriptor: ModelDescriptor) -> Self {
        Supervisor {
            descriptor,
            provisioner: Provisioner::new(),
            auto_provision: true,
            env: Mutex::new(None),
            worker: Mutex::new(None),
            state: Mutex::new(SupervisorState::Idle),
        }
    }

    /// Disable automatic venv provisioning (used by tests that point the
    /// descriptor's worker directly at a prebuilt fixture binary).
    pub fn without_auto_provision(mut self) -> Self {
        self.auto_provision = false;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Provisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    fn model_dir(&self) -> std::path::PathBuf {
        self.descriptor
            .model_dir
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state.lock().unwrap() = state;
    }

    /// Idempotent: starting an already-running supervisor is a no-op.
    pub fn start(&self, timeout: Duration) -> Result<()> {
        if self.is_running() {
            tracing::warn!(model = %self.name(), "start() called on an already-running supervisor");
            return Ok(());
        }

        let name = self.name().to_string();
        let model_dir = self.model_dir();

        self.set_state(SupervisorState::Provisioning);
        let env = {
            let mut guard = self.env.lock().unwrap();
            if let Some(env) = guard.clone() {
                env
            } else if self.auto_provision {
                let env = self
                    .provisioner
                    .provision(
                        &name,
                        &model_dir,
                        &self.descriptor.requirements_path(),
                        false,
                    )
                    .inspect_err(|_| self.set_state(SupervisorState::ProvisionFailed))?;
                *guard = Some(env.clone());
                env
            } else {
                let env = EnvHandle {
                    root: model_dir.clone(),
                    interpreter: model_dir.join("model_venv").join("bin").join("python"),
                };
                *guard = Some(env.clone());
                env
            }
        };

        self.set_state(SupervisorState::Spawning);
        let mut server = NamedPipeServer::setup()?;
        let pipe_dir = server.pipe_dir().to_path_buf();

        let mut env_vars = HashMap::new();
        env_vars.insert(
            PIPE_DIR_ENV_VAR.to_string(),
            pipe_dir.display().to_string(),
        );
        if let Some(gpu_ids) = &self.descriptor.resources.gpu_ids
            && !gpu_ids.is_empty()
        {
            let joined = gpu_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            env_vars.insert(GPU_ENV_VAR.to_string(), joined);
        }

        let mut process = self
            .provisioner
            .spawn(&name, &env, &self.descriptor.client_module_path(), &env_vars)
            .inspect_err(|_| self.set_state(SupervisorState::StartupFailed))?;

        let stderr_ring = Arc::new(Mutex::new(StderrRing::new(STDERR_RING_CAPACITY)));
        let stderr_thread = process.take_stderr().map(|stderr| {
            let ring = Arc::clone(&stderr_ring);
            std::thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines().map_while(std::result::Result::ok) {
                    tracing::debug!(line = %line, "worker stderr");
                    ring.lock().unwrap().push(line);
                }
            })
        });
        let _ = process.take_stdout();

        self.set_state(SupervisorState::Handshaking);
        if let Err(e) = server.connect() {
            process.kill().ok();
            self.set_state(SupervisorState::StartupFailed);
            return Err(SupervisorError::StartupFailed {
                name,
                detail: format!("handshake failed: {e}"),
                stderr_tail: stderr_ring.lock().unwrap().tail(),
            });
        }

        let ping_result = server.request("ping", Value::Null);
        let handshake_ok = matches!(
            ping_result,
            Ok(ref v) if v.get("status").and_then(Value::as_str) == Some("pong")
        );
        if !handshake_ok {
            process.kill().ok();
            self.set_state(SupervisorState::StartupFailed);
            let detail = match ping_result {
                Ok(v) => format!("unexpected ping reply: {v}"),
                Err(e) => format!("ping failed: {e}"),
            };
            return Err(SupervisorError::StartupFailed {
                name,
                detail,
                stderr_tail: stderr_ring.lock().unwrap().tail(),
            });
        }

        let _ = timeout; // handshake above is synchronous; timeout governs the caller's patience.

        *self.worker.lock().unwrap() = Some(RunningWorker {
            channel: Mutex::new(server),
            process: Mutex::new(process),
            stderr_ring,
            stderr_thread,
        });
        self.set_state(SupervisorState::Running);
        tracing::info!(model = %name, "worker started");
        Ok(())
    }

    /// Idempotent: stopping an already-stopped supervisor is a no-op.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        let worker = self.worker.lock().unwrap().take();
        let Some(worker) = worker else {
            self.set_state(SupervisorState::Idle);
            return Ok(());
        };

        self.set_state(SupervisorState::Stopping);
        {
            let mut channel = worker.channel.lock().unwrap();
            let _ = channel.request("shutdown", Value::Null);
        }

        {
            let mut process = worker.process.lock().unwrap();
            if process.wait_timeout(timeout).is_none() {
                process.terminate().ok();
                if process.wait_timeout(STOP_GRACE_PERIOD).is_none() {
                    process.kill().ok();
                    process.wait_timeout(STOP_GRACE_PERIOD);
                }
            }
        }

        if let Some(handle) = worker.stderr_thread {
            let _ = handle.join();
        }

        self.set_state(SupervisorState::Idle);
        tracing::info!(model = %self.name(), "worker stopped");
        Ok(())
    }

    pub fn restart(&self, start_timeout: Duration, stop_timeout: Duration) -> Result<()> {
        self.stop(stop_timeout)?;
        self.start(start_timeout)
    }

    /// Send a request to the worker and return its decoded reply.
    pub fn request(&self, handler: &str, data: Value) -> Result<Value> {
        let guard = self.worker.lock().unwrap();
        let Some(worker) = guard.as_ref() else {
            return Err(SupervisorError::NotStarted {
                name: self.name().to_string(),
            });
        };

        {
            let mut process = worker.process.lock().unwrap();
            if !process.is_alive() {
                return Err(SupervisorError::RequestFailed {
                    name: self.name().to_string(),
                    detail: format!(
                        "worker process exited\n--- worker stderr (tail) ---\n{}",
                        worker.stderr_ring.lock().unwrap().tail()
                    ),
                });
            }
        }

        let mut channel = worker.channel.lock().unwrap();
        let reply = channel
            .request(handler, data)
            .map_err(|e| SupervisorError::RequestFailed {
                name: self.name().to_string(),
                detail: format!("{e}"),
            })?;

        if let Some(error) = reply.get("error").and_then(Value::as_str) {
            return Err(SupervisorError::RequestFailed {
                name: self.name().to_string(),
                detail: error.to_string(),
            });
        }
        Ok(reply)
    }

    /// Non-raising health check.
    pub fn ping(&self) -> bool {
        match self.request("ping", Value::Null) {
            Ok(reply) => reply.get("status").and_then(Value::as_str) == Some("pong"),
            Err(_) => false,
        }
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }
}

/// Cheap liveness snapshot used by `ping`'s timing contract in tests.
pub fn timed_ping(supervisor: &Supervisor) -> (bool, Duration) {
    let start = Instant::now();
    let healthy = supervisor.ping();
    (healthy, start.elapsed())
}

#[allow(dead_code)]
static _ASSERT_SEND_SYNC: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Supervisor>();
};
