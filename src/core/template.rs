//! Per-template launch recipe: interpreter command line and hook environment.

use crate::config::daemon::DaemonConfig;
use crate::config::types::{ContainerTemplate, SpawnRequest};

/// `NODE_OPTIONS` value that preloads the Node telemetry hook.
pub const NODE_AUTOHOOK_REQUIRE: &str = "--require kyntrix-node-embedded/autoHook";

/// Python module that wraps the user script with the telemetry agent.
pub const PYTHON_AUTOHOOK_MODULE: &str = "kyntrix_agent.autohook";

/// Command line executed inside the sandbox (argv[0] is resolved via `PATH`).
pub fn command_line(request: &SpawnRequest) -> Vec<String> {
    let entry = request.sandbox_entry().to_string_lossy().into_owned();
    match request.template {
        ContainerTemplate::Node => vec!["node".to_string(), entry],
        ContainerTemplate::Python => vec![
            "python3".to_string(),
            "-m".to_string(),
            PYTHON_AUTOHOOK_MODULE.to_string(),
            entry,
        ],
    }
}

/// Variables injected into every sandbox on top of the daemon's environment.
pub fn sandbox_environment(request: &SpawnRequest, config: &DaemonConfig) -> Vec<(String, String)> {
    let mut env = vec![
        ("KYNTRIX_RUN_ID".to_string(), request.run_id.clone()),
        ("KYNTRIX_INGEST_URL".to_string(), config.ingest_url.clone()),
        ("KYNTRIX_BATCH_SIZE".to_string(), config.batch_size.to_string()),
        ("KYNTRIX_FLUSH_MS".to_string(), config.flush_interval_ms.to_string()),
        // The Node agent reads the interval under this name.
        (
            "KYNTRIX_FLUSH_INTERVAL".to_string(),
            config.flush_interval_ms.to_string(),
        ),
    ];

    match request.template {
        ContainerTemplate::Node => {
            env.push(("NODE_OPTIONS".to_string(), NODE_AUTOHOOK_REQUIRE.to_string()));
        }
        ContainerTemplate::Python => {
            env.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
        }
    }
    env
}
