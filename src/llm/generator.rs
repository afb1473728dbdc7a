use super::client::OpenRouterClient;
use super::parse::{apply_edits, normalize_trailing_newline, parse_fix_response};
use super::prompts::{fix_user_prompt, FIX_SYSTEM};
use crate::error::GenerationError;
use crate::generate::FixGenerator;
use crate::model::{CodeChange, ErrorRecord, FixAttempt};
use crate::util::resolve_repo_path;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

const MAX_FIX_FILE_CHARS: usize = 40_000;

/// Proposes fixes by asking a chat model for search/replace edits to the
/// failing test's file.
pub struct LlmFixGenerator {
    client: OpenRouterClient,
    root: PathBuf,
}

impl LlmFixGenerator {
    pub fn new(client: OpenRouterClient, root: impl Into<PathBuf>) -> Self {
        Self {
            client,
            root: root.into(),
        }
    }

    fn read_target(&self, error: &ErrorRecord) -> Result<String, GenerationError> {
        let resolved = resolve_repo_path(&self.root, &error.file_path)
            .map_err(GenerationError::Unavailable)?;
        let content = fs::read_to_string(&resolved.absolute).map_err(|e| {
            GenerationError::Unavailable(format!(
                "could not read {}: {}",
                error.file_path.display(),
                e
            ))
        })?;
        let chars = content.chars().count();
        if chars > MAX_FIX_FILE_CHARS {
            return Err(GenerationError::Unavailable(format!(
                "{} is too large to send ({} chars, limit {})",
                error.file_path.display(),
                chars,
                MAX_FIX_FILE_CHARS
            )));
        }
        Ok(content)
    }
}

impl FixGenerator for LlmFixGenerator {
    async fn propose(
        &self,
        error: &ErrorRecord,
        temperature: f64,
        prior_attempts: &[FixAttempt],
    ) -> Result<CodeChange, GenerationError> {
        let content = self.read_target(error)?;
        let user = fix_user_prompt(error, &content, prior_attempts);

        let response = self
            .client
            .complete_json(FIX_SYSTEM, &user, temperature)
            .await
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;
        debug!(model = %response.model, temperature, "received fix proposal");

        build_change(&content, &response.content)
    }
}

/// Turns a raw model reply into a change against `content`.
pub(crate) fn build_change(content: &str, raw: &str) -> Result<CodeChange, GenerationError> {
    let parsed = parse_fix_response(raw).map_err(GenerationError::Unusable)?;
    if parsed.edits.is_empty() {
        return Err(GenerationError::Unusable("no edits in response".to_string()));
    }

    let modified = apply_edits(content, &parsed.edits).map_err(GenerationError::Unusable)?;
    let modified = normalize_trailing_newline(content, modified);
    if modified == content {
        return Err(GenerationError::Unusable(
            "edits leave the file unchanged".to_string(),
        ));
    }
    if modified.trim().is_empty() {
        return Err(GenerationError::Unusable("edits empty the file".to_string()));
    }

    let description = parsed
        .description
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| "Model-proposed fix".to_string());
    Ok(CodeChange::new(content, modified, description))
}
