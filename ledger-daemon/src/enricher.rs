//! Enrichment collaborators available to `ledgerd`.

use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use ledger_sync::{EnrichmentRequest, Enricher};

/// Used when no enrichment command is configured. Every reconciliation fails
/// and the artifact edit stays pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

#[async_trait]
impl Enricher for Unconfigured {
    async fn enrich(&self, _request: EnrichmentRequest) -> anyhow::Result<Value> {
        bail!("no enrichment command configured (start ledgerd with --enricher)")
    }
}

/// Runs an external program per request: the request JSON goes to stdin,
/// the response JSON is read from stdout.
///
/// The child is killed when the call is dropped, so the orchestrator's
/// enrichment timeout also bounds the process.
#[derive(Debug, Clone)]
pub struct CommandEnricher {
    program: String,
    args: Vec<String>,
}

impl CommandEnricher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Enricher for CommandEnricher {
    async fn enrich(&self, request: EnrichmentRequest) -> anyhow::Result<Value> {
        let payload = serde_json::to_vec(&request)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start enricher `{}`", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "enricher `{}` exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("enricher `{}` did not print JSON", self.program))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> EnrichmentRequest {
        EnrichmentRequest {
            instruction: "fold edits".to_string(),
            context: json!({"entity": {"id": "acme"}}),
        }
    }

    fn sh(script: &str) -> CommandEnricher {
        CommandEnricher::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn command_output_is_parsed_as_json() {
        let enricher = sh(r#"cat > /dev/null; echo '{"overview": "From the command."}'"#);
        let value = enricher.enrich(request()).await.expect("enrich");
        assert_eq!(value, json!({"overview": "From the command."}));
    }

    #[tokio::test]
    async fn request_is_written_to_stdin() {
        let value = sh("cat").enrich(request()).await.expect("enrich");
        assert_eq!(value["instruction"], json!("fold edits"));
        assert_eq!(value["context"]["entity"]["id"], json!("acme"));
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let err = sh("cat > /dev/null; echo boom >&2; exit 3")
            .enrich(request())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn unconfigured_always_fails() {
        assert!(Unconfigured.enrich(request()).await.is_err());
    }
}
