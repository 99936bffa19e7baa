use tracing::{debug, warn};

use crate::config::HooksConfig;
use crate::context::Context;
use crate::error::Result;
use crate::event::EventHandler;
use crate::types::{EventKind, GraphEvent};

/// Execute hook commands with environment variables.
/// Fire-and-forget: errors are logged, not propagated.
pub async fn run_hooks(commands: &[String], env_vars: &[(String, String)]) {
    for cmd in commands {
        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", cmd]);
        for (key, val) in env_vars {
            command.env(key, val);
        }
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());
        match command.status().await {
            Ok(s) if !s.success() => warn!(hook = %cmd, code = s.code(), "Hook exited non-zero"),
            Err(e) => warn!(hook = %cmd, error = %e, "Hook failed to execute"),
            _ => {}
        }
    }
}

/// Event observer that spawns the configured shell hooks.
pub struct HookRunner {
    config: HooksConfig,
}

impl HookRunner {
    pub fn new(config: HooksConfig) -> Self {
        Self { config }
    }

    fn commands_for(&self, kind: EventKind) -> &[String] {
        match kind {
            EventKind::GraphStart => &self.config.on_graph_start,
            EventKind::GraphEnd => &self.config.on_graph_end,
            EventKind::NodeError => &self.config.on_node_error,
            EventKind::NodeStart | EventKind::NodeEnd => &[],
        }
    }
}

/// `STRATUM_*` variables exposed to hook commands.
pub fn hook_env(event: &GraphEvent) -> Vec<(String, String)> {
    let mut vars = vec![
        ("STRATUM_EVENT".to_string(), event.kind.as_str().to_string()),
        (
            "STRATUM_CORRELATION_ID".to_string(),
            event.correlation_id.to_string(),
        ),
        ("STRATUM_GRAPH".to_string(), event.graph.clone()),
        ("STRATUM_STEP".to_string(), event.step.to_string()),
        (
            "STRATUM_ERROR_COUNT".to_string(),
            event.error_count.to_string(),
        ),
    ];
    if let Some(node) = &event.node {
        vars.push(("STRATUM_NODE".to_string(), node.clone()));
    }
    if let Some(status) = event.status {
        vars.push(("STRATUM_STATUS".to_string(), status.to_string()));
    }
    if let Some(message) = &event.message {
        vars.push(("STRATUM_MESSAGE".to_string(), message.clone()));
    }
    vars
}

impl EventHandler for HookRunner {
    fn handle(&self, event: &GraphEvent, _ctx: &Context) -> Result<()> {
        let commands = self.commands_for(event.kind);
        if commands.is_empty() {
            return Ok(());
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(event = event.kind.as_str(), "No runtime, skipping hooks");
            return Ok(());
        };
        let commands = commands.to_vec();
        let env = hook_env(event);
        handle.spawn(async move {
            run_hooks(&commands, &env).await;
        });
        Ok(())
    }
}
