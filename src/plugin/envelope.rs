use scanfleet_common::{PluginEnvelope, PluginKind, PluginResult};

const TRACE_MARKER: &str = "Traceback";

/// Turn captured plugin streams into a result. Never fails: anything that is
/// not a single JSON envelope becomes an unsuccessful result with one error.
pub fn parse_output(name: &str, kind: PluginKind, stdout: &str, stderr: &str) -> PluginResult {
    let parsed = serde_json::from_str::<PluginEnvelope>(stdout.trim())
        .map_err(|e| e.to_string())
        .and_then(|env| PluginResult::from_envelope(name, kind, env).map_err(|e| e.to_string()));
    match parsed {
        Ok(result) => result,
        Err(reason) => {
            tracing::debug!(plugin = name, reason = %reason, "plugin output rejected");
            let error = invalid_output_message(stdout, stderr);
            tracing::error!(plugin = name, "{}", error);
            PluginResult::failed(name, kind, error)
        }
    }
}

fn invalid_output_message(stdout: &str, stderr: &str) -> String {
    let mut shown = if stdout.is_empty() {
        "<empty>".to_string()
    } else {
        stdout.to_string()
    };
    if stderr.contains(TRACE_MARKER)
        && let Some(last) = stderr.trim().lines().last()
    {
        shown.push_str(&format!(" [Error: {}]", last));
    }
    format!("Plugin returned invalid output: {}", shown)
}
