//! Code evaluation entry points.
//!
//! `evaluate_code` is the minimal path: resolve the session's sandbox,
//! run the snippet, hand back the remote artifacts verbatim. Remote
//! errors propagate raw; there is no validation of the code and no
//! timeout beyond the sandbox's own lifetime.
//!
//! `run_fragment` is the richer surface behind `POST /api/sandbox`: an
//! interpreter-template fragment is executed and reported cell by cell,
//! any other template is treated as a web app whose preview URL is
//! returned instead.

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_SANDBOX_TEMPLATE;
use crate::errors::SandboxError;

use super::client::{ExecutionError, FileNode};
use super::registry::SessionRegistry;

/// Normalized result envelope of `evaluate_code`.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluateResult {
    pub results: Vec<serde_json::Value>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub error: Option<ExecutionError>,
}

pub async fn evaluate_code(
    registry: &SessionRegistry,
    session_id: &str,
    code: &str,
) -> Result<EvaluateResult, SandboxError> {
    let handle = registry.resolve(session_id, None).await?;
    let execution = registry.service().run_code(&handle.sandbox_id, code).await?;
    Ok(EvaluateResult {
        results: execution.results,
        stdout: execution.stdout,
        stderr: execution.stderr,
        error: execution.error,
    })
}

/// A generated code fragment submitted for execution.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub code: String,
    pub template: Option<String>,
    pub file_path: Option<String>,
    pub port: Option<u16>,
}

/// Discriminated by template kind: interpreter output or a web preview.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ExecutionResult {
    #[serde(rename_all = "camelCase")]
    Interpreter {
        sbx_id: String,
        template: String,
        stdout: Vec<String>,
        stderr: Vec<String>,
        runtime_error: Option<ExecutionError>,
        cell_results: Vec<serde_json::Value>,
        files: Vec<FileNode>,
    },
    #[serde(rename_all = "camelCase")]
    Web {
        sbx_id: String,
        template: String,
        url: String,
        files: Vec<FileNode>,
    },
}

pub async fn run_fragment(
    registry: &SessionRegistry,
    fragment: &Fragment,
) -> Result<ExecutionResult, SandboxError> {
    let template = fragment
        .template
        .clone()
        .unwrap_or_else(|| registry.default_template().to_string());
    let handle = registry
        .resolve(&fragment.session_id, Some(&template))
        .await?;
    let service = registry.service();

    if let Some(path) = &fragment.file_path {
        service
            .write_file(&handle.sandbox_id, path, &fragment.code)
            .await?;
    }

    if template == DEFAULT_SANDBOX_TEMPLATE {
        let execution = service.run_code(&handle.sandbox_id, &fragment.code).await?;
        let files = fetch_files(service.as_ref(), &handle.sandbox_id).await;
        return Ok(ExecutionResult::Interpreter {
            sbx_id: handle.sandbox_id,
            template,
            stdout: execution.stdout,
            stderr: execution.stderr,
            runtime_error: execution.error,
            cell_results: execution.results,
            files,
        });
    }

    let port = fragment.port.unwrap_or(80);
    let url = format!("https://{}", service.preview_host(&handle.sandbox_id, port));
    let files = fetch_files(service.as_ref(), &handle.sandbox_id).await;
    Ok(ExecutionResult::Web {
        sbx_id: handle.sandbox_id,
        template,
        url,
        files,
    })
}

/// Best-effort file tree fetch; listing failures degrade to an empty
/// tree rather than failing the execution that already succeeded.
async fn fetch_files(service: &dyn super::client::SandboxService, sandbox_id: &str) -> Vec<FileNode> {
    match service.list_files(sandbox_id, "/home/user").await {
        Ok(files) => files
            .into_iter()
            .filter(|node| !node.name.contains("node_modules"))
            .collect(),
        Err(err) => {
            tracing::warn!(sandbox = sandbox_id, error = %err, "failed to list sandbox files");
            Vec::new()
        }
    }
}
