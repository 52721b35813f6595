//! In-worker dispatcher: the request loop that runs inside the worker
//! process, reading frames off the client channel and routing them to
//! registered handlers.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::channel::{NamedPipeClient, PipeConfig};
use crate::descriptor::RESERVED_HANDLER_NAMES;
use crate::error::{Result, SupervisorError};

/// A worker handler: takes the raw `data` object from a request frame and
/// returns a JSON value (or an error to be serialised into an error reply).
pub type HandlerFn = Box<dyn FnMut(Value) -> anyhow::Result<Value> + Send>;

/// Error a handler returns to report a malformed/missing argument in its
/// own `data` object, rather than a handler-internal failure. Reported to
/// the caller as `"Handler argument error: <detail>"` instead of carrying a
/// traceback.
#[derive(Debug)]
pub struct HandlerArgError(pub String);

impl fmt::Display for HandlerArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerArgError {}

/// Required-field extraction helper mirroring the "handler argument error"
/// contract: missing or mistyped fields become `HandlerArgError`s rather
/// than panics or silent defaults.
pub fn require_field<'a>(data: &'a Value, field: &str) -> anyhow::Result<&'a Value> {
    data.get(field)
        .ok_or_else(|| HandlerArgError(format!("missing required field '{field}'")).into())
}

/// Implemented by worker types that prefer to declare their handlers as
/// methods rather than through the [`WorkerApp`] builder. Mirrors a
/// name-prefixed-method convention with an explicit, statically checked
/// listing instead of runtime reflection.
pub trait ModelWorker {
    fn handlers(&mut self) -> Vec<(&'static str, HandlerFn)>;
}

/// Worker-side application: owns the registered handlers and drives the
/// request loop against the client end of the channel.
pub struct WorkerApp {
    handlers: HashMap<String, HandlerFn>,
    setup_hook: Option<Box<dyn FnMut() -> anyhow::Result<()> + Send>>,
    teardown_hook: Option<Box<dyn FnMut() + Send>>,
    running: bool,
}

impl Default for WorkerApp {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerApp {
    pub fn new() -> Self {
        WorkerApp {
            handlers: HashMap::new(),
            setup_hook: None,
            teardown_hook: None,
            running: true,
        }
    }

    /// Register a handler. Errors if `name` is reserved (`ping`,
    /// `shutdown`) or already registered, whether the prior registration
    /// came from this builder or from [`ModelWorker::handlers`].
    pub fn handler(
        mut self,
        name: &str,
        f: impl FnMut(Value) -> anyhow::Result<Value> + Send + 'static,
    ) -> Result<Self> {
        if RESERVED_HANDLER_NAMES.contains(&name) {
            return Err(SupervisorError::ConfigInvalid {
                name: name.to_string(),
                detail: format!("handler name '{name}' is reserved"),
            });
        }
        if self.handlers.contains_key(name) {
            return Err(SupervisorError::ConfigInvalid {
                name: name.to_string(),
                detail: format!("handler '{name}' already registered"),
            });
        }
        self.handlers.insert(name.to_string(), Box::new(f));
        Ok(self)
    }

    /// Fold a [`ModelWorker`]'s handler list into this app, through the
    /// same registration path as [`WorkerApp::handler`].
    pub fn from_model(mut model: impl ModelWorker) -> Result<Self> {
        let mut app = WorkerApp::new();
        for (name, f) in model.handlers() {
            app = app.handler_boxed(name, f)?;
        }
        Ok(app)
    }

    fn handler_boxed(mut self, name: &str, f: HandlerFn) -> Result<Self> {
        if RESERVED_HANDLER_NAMES.contains(&name) {
            return Err(SupervisorError::ConfigInvalid {
                name: name.to_string(),
                detail: format!("handler name '{name}' is reserved"),
            });
        }
        if self.handlers.contains_key(name) {
            return Err(SupervisorError::ConfigInvalid {
                name: name.to_string(),
                detail: format!("handler '{name}' already registered"),
            });
        }
        self.handlers.insert(name.to_string(), f);
        Ok(self)
    }

    pub fn on_setup(mut self, f: impl FnMut() -> anyhow::Result<()> + Send + 'static) -> Self {
        self.setup_hook = Some(Box::new(f));
        self
    }

    pub fn on_teardown(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.teardown_hook = Some(Box::new(f));
        self
    }

    /// Registered handler names plus the built-in `ping`/`shutdown` pair,
    /// which are dispatched directly and never live in `self.handlers`.
    fn available_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.extend(RESERVED_HANDLER_NAMES.iter().map(|s| s.to_string()));
        names.sort();
        names
    }

    /// Dispatch one request frame and produce the reply value. Never
    /// returns an `Err` — all failure modes are encoded in the reply
    /// object per the wire protocol.
    fn handle_message(&mut self, message: &str, data: Value) -> Value {
        match message {
            "ping" => {
                return serde_json::json!({
                    "status": "pong",
                    "handlers": self.available_handlers(),
                });
            }
            "shutdown" => {
                self.running = false;
                return serde_json::json!({ "status": "shutting_down" });
            }
            _ => {}
        }

        let Some(handler) = self.handlers.get_mut(message) else {
            return serde_json::json!({
                "error": format!("Unknown message type: {message}"),
                "available_handlers": self.available_handlers(),
            });
        };

        match handler(data) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(other) => serde_json::json!({ "result": other }),
            Err(e) => {
                if let Some(arg_err) = e.downcast_ref::<HandlerArgError>() {
                    serde_json::json!({ "error": format!("Handler argument error: {arg_err}") })
                } else {
                    serde_json::json!({
                        "error": format!("{e}"),
                        "traceback": format!("{e:#}"),
                    })
                }
            }
        }
    }

    /// Connect to the channel described by `config` and serve requests
    /// until a `shutdown` message is received or the channel closes.
    pub fn run(mut self, config: &PipeConfig) -> Result<()> {
        let mut client = NamedPipeClient::connect(config)?;

        if let Some(setup) = self.setup_hook.as_mut() {
            setup().map_err(|e| SupervisorError::ConfigInvalid {
                name: "worker".to_string(),
                detail: format!("setup failed: {e}"),
            })?;
        }

        let result = self.serve_loop(&mut client);

        if let Some(teardown) = self.teardown_hook.as_mut() {
            // Best-effort: a panicking or failing teardown must not mask
            // the loop's own result, and must not crash the worker.
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| teardown()));
        }

        client.close();
        result
    }

    fn serve_loop(&mut self, client: &mut NamedPipeClient) -> Result<()> {
        loop {
            let frame = match client.recv()? {
                Some(frame) => frame,
                None => return Ok(()),
            };
            let message = frame
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let data = frame.get("data").cloned().unwrap_or(Value::Null);

            let reply = self.handle_message(&message, data);
            client.send(&reply)?;

            if !self.running {
                return Ok(());
            }
        }
    }
}

/// Read `PYMODELSERVE_PIPE_DIR` from the environment and run `app` against
/// it. The conventional entry point for a worker's `main`.
pub fn run_from_env(app: WorkerApp) -> Result<()> {
    let pipe_dir =
        std::env::var("PYMODELSERVE_PIPE_DIR").map_err(|_| SupervisorError::ConfigInvalid {
            name: "worker".to_string(),
            detail: "PYMODELSERVE_PIPE_DIR is not set".to_string(),
        })?;
    let config = PipeConfig::new(std::path::PathBuf::from(pipe_dir));
    app.run(&config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_wraps_non_object_result() {
        let mut app = WorkerApp::new()
            .handler("simple", |_data| Ok(Value::String("just a string".to_string())))
            .unwrap();
        let reply = app.handle_message("simple", Value::Null);
        assert_eq!(reply, serde_json::json!({ "result": "just a string" }));
    }

    #[test]
    fn dispatch_passes_through_object_result() {
        let mut app = WorkerApp::new()
            .handler("echo", |data| {
                Ok(serde_json::json!({ "echoed": data["message"] }))
            })
            .unwrap();
        let reply = app.handle_message("echo", serde_json::json!({"message": "hello"}));
        assert_eq!(reply, serde_json::json!({ "echoed": "hello" }));
    }

    #[test]
    fn dispatch_reports_unknown_handler() {
        let mut app = WorkerApp::new()
            .handler("echo", |data| Ok(data))
            .unwrap();
        let reply = app.handle_message("bar", Value::Null);
        assert_eq!(reply["error"], "Unknown message type: bar");
        assert_eq!(
            reply["available_handlers"],
            serde_json::json!(["echo", "ping", "shutdown"])
        );
    }

    #[test]
    fn dispatch_reports_handler_error_with_traceback() {
        let mut app = WorkerApp::new()
            .handler("boom", |_data| anyhow::bail!("intentional error"))
            .unwrap();
        let reply = app.handle_message("boom", Value::Null);
        assert_eq!(reply["error"], "intentional error");
        assert!(reply.get("traceback").is_some());
    }

    #[test]
    fn dispatch_reports_handler_argument_error() {
        let mut app = WorkerApp::new()
            .handler("echo", |data| {
                let msg = require_field(&data, "message")?;
                Ok(serde_json::json!({ "echoed": msg }))
            })
            .unwrap();
        let reply = app.handle_message("echo", serde_json::json!({}));
        assert_eq!(
            reply["error"],
            "Handler argument error: missing required field 'message'"
        );
    }

    #[test]
    fn ping_lists_registered_handlers() {
        let mut app = WorkerApp::new()
            .handler("echo", |data| Ok(data))
            .unwrap()
            .handler("simple", |_| Ok(Value::Null))
            .unwrap();
        let reply = app.handle_message("ping", Value::Null);
        assert_eq!(reply["status"], "pong");
        assert_eq!(
            reply["handlers"],
            serde_json::json!(["echo", "ping", "shutdown", "simple"])
        );
    }

    #[test]
    fn shutdown_stops_the_loop() {
        let mut app = WorkerApp::new();
        let reply = app.handle_message("shutdown", Value::Null);
        assert_eq!(reply["status"], "shutting_down");
        assert!(!app.running);
    }

    #[test]
    fn registering_a_reserved_name_fails() {
        let err = WorkerApp::new().handler("ping", |d| Ok(d));
        assert!(err.is_err());
    }

    #[test]
    fn registering_a_duplicate_name_fails() {
        let app = WorkerApp::new().handler("echo", |d| Ok(d)).unwrap();
        let err = app.handler("echo", |d| Ok(d));
        assert!(err.is_err());
    }
}
