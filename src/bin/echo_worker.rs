//! Test-fixture worker used by the integration suite. Registers the
//! handlers the end-to-end scenarios exercise: a plain echo, a handler
//! returning a bare (non-object) value, and a handler that always errors.

use model_supervisor::{WorkerApp, dispatcher::run_from_env};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let app = WorkerApp::new()
        .handler("echo", |data| {
            Ok(serde_json::json!({ "echoed": data.get("message").cloned().unwrap_or(serde_json::Value::Null) }))
        })
        .unwrap()
        .handler("simple", |_data| Ok(serde_json::Value::String("just a string".to_string())))
        .unwrap()
        .handler("boom", |_data| anyhow::bail!("intentional error"))
        .unwrap();

    if let Err(e) = run_from_env(app) {
        eprintln!("echo-worker exited: {e}");
        std::process::exit(1);
    }
}
