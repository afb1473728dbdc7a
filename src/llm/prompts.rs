use crate::model::{ErrorRecord, FixAttempt};
use crate::util::truncate;

const MAX_TRACE_CHARS: usize = 4000;
const MAX_PRIOR_DETAIL_CHARS: usize = 600;

pub const FIX_SYSTEM: &str = r#"You are a senior Python developer repairing a failing pytest test.

You are shown one file, the failing test, and its failure output. Change the file so the test passes.

OUTPUT FORMAT (JSON):
{
  "description": "1-2 sentence summary of what you changed",
  "edits": [
    {
      "old_string": "exact text to find and replace",
      "new_string": "replacement text"
    }
  ]
}

RULES FOR EDITS:
- old_string must be EXACT text from the file, including indentation
- old_string must be UNIQUE in the file; include enough surrounding lines
- Edits are applied in order; each must still be unique when it is applied
- Do NOT include line numbers in old_string or new_string

SURGICAL EDITS:
- Make the smallest change that makes the test pass
- Do not reformat or reorder unrelated code
- Do not delete or skip the test, and do not weaken its assertion to something trivially true
- If earlier attempts are listed, do not repeat them; try a different approach"#;

/// User message for one attempt.
pub fn fix_user_prompt(error: &ErrorRecord, content: &str, prior: &[FixAttempt]) -> String {
    let mut prompt = format!(
        "File: {}\nFailing test: {}\nError: {}: {}\n",
        error.file_path.display(),
        error.node_id(),
        error.details.error_type,
        error.details.message,
    );

    if let Some(trace) = &error.details.stack_trace {
        prompt.push_str("\nFailure output:\n```\n");
        prompt.push_str(&truncate(trace, MAX_TRACE_CHARS));
        prompt.push_str("\n```\n");
    }

    if !prior.is_empty() {
        prompt.push_str("\nEarlier attempts (all failed, file was restored after each):\n");
        for attempt in prior {
            let description = attempt
                .change
                .as_ref()
                .map(|c| c.description.as_str())
                .unwrap_or("no change produced");
            let failure = attempt.failure.map(|f| f.label()).unwrap_or("unknown");
            prompt.push_str(&format!(
                "- Attempt {} (temperature {:.2}): {} [{} failure]",
                attempt.number, attempt.temperature, description, failure
            ));
            if let Some(detail) = &attempt.detail {
                prompt.push_str(&format!(
                    "\n  {}",
                    truncate(detail, MAX_PRIOR_DETAIL_CHARS).replace('\n', "\n  ")
                ));
            }
            prompt.push('\n');
        }
    }

    prompt.push_str(&format!(
        "\nCurrent file content:\n```python\n{}\n```\n\nRespond with search/replace edits as JSON.",
        content
    ));
    prompt
}
