//! Finding failing tests from pytest output
//!
//! Reads the short test summary (`-rfE`) for the list of failures and the
//! FAILURES/ERRORS sections for tracebacks. Collection errors have no test
//! function and become module-level records.

use crate::model::{ErrorDetails, ErrorRecord};
use crate::pytest::{PytestCommand, EXIT_NO_TESTS};
use crate::util::tail_chars;
use anyhow::Result;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

/// Where in the run the failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    /// Test body failed
    Failed,
    /// Setup or teardown raised
    Error,
    /// Module could not be imported
    Collection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFailure {
    pub file_path: String,
    /// `Class::test` form; empty for collection errors
    pub test_function: String,
    pub origin: FailureOrigin,
    pub details: ErrorDetails,
}

impl ParsedFailure {
    pub fn into_record(self) -> ErrorRecord {
        ErrorRecord::new(PathBuf::from(self.file_path), self.test_function, self.details)
    }
}

#[derive(Debug)]
pub struct DiscoveryReport {
    /// pytest exited cleanly with nothing failing
    pub passed: bool,
    pub failures: Vec<ParsedFailure>,
    pub output_tail: String,
}

impl DiscoveryReport {
    pub fn into_records(self) -> Vec<ErrorRecord> {
        self.failures
            .into_iter()
            .map(ParsedFailure::into_record)
            .collect()
    }
}

struct Patterns {
    summary: Regex,
    section: Regex,
    header: Regex,
    exception: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                // Parametrize ids may hold spaces, so the node id ends at its bracket.
                summary: Regex::new(
                    r"^(FAILED|ERROR)\s+(\S+?\.py(?:::[^\s\[]+)*(?:\[[^\]]*\])?)(?:\s+-\s+(.*))?$",
                )
                .ok()?,
                section: Regex::new(r"^=+\s*(.*?)\s*=+$").ok()?,
                header: Regex::new(r"^_{3,}\s+(.+?)\s+_{3,}$").ok()?,
                exception: Regex::new(
                    r"^([A-Za-z_][\w.]*(?:Error|Exception|Exit|Interrupt|Warning|Failed|Skipped))(?::\s*(.*))?$",
                )
                .ok()?,
            })
        })
        .as_ref()
}

/// Parses pytest output into failures, deduplicated by (file, test).
pub fn parse_pytest_output(output: &str) -> Vec<ParsedFailure> {
    let Some(patterns) = patterns() else {
        return Vec::new();
    };
    let tracebacks = collect_tracebacks(patterns, output);
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut failures = Vec::new();

    for line in output.lines() {
        let line = line.trim_end();
        let Some(caps) = patterns.summary.captures(line) else {
            continue;
        };
        let kind = &caps[1];
        let node = &caps[2];
        let message = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();

        let (file_path, test_function) = match node.split_once("::") {
            Some((file, test)) => (file.to_string(), test.to_string()),
            None => (node.to_string(), String::new()),
        };
        if !file_path.ends_with(".py") {
            continue;
        }

        let origin = match (kind, test_function.is_empty()) {
            ("FAILED", _) => FailureOrigin::Failed,
            (_, true) => FailureOrigin::Collection,
            _ => FailureOrigin::Error,
        };

        if !seen.insert((file_path.clone(), test_function.clone())) {
            continue;
        }

        let trace = traceback_for(&tracebacks, &file_path, &test_function);
        let mut details = classify(patterns, message, trace.as_deref());
        if let Some(trace) = trace {
            details = details.with_stack_trace(trace);
        }

        failures.push(ParsedFailure {
            file_path,
            test_function,
            origin,
            details,
        });
    }

    failures
}

/// Maps a section header key to its traceback text.
fn collect_tracebacks(patterns: &Patterns, output: &str) -> HashMap<String, String> {
    let mut blocks = HashMap::new();
    let mut in_section = false;
    let mut current: Option<(String, Vec<&str>)> = None;

    let mut flush = |current: &mut Option<(String, Vec<&str>)>| {
        if let Some((key, lines)) = current.take() {
            let text = lines.join("\n").trim().to_string();
            if !text.is_empty() {
                blocks.entry(key).or_insert(text);
            }
        }
    };

    for line in output.lines() {
        let trimmed = line.trim_end();
        if let Some(caps) = patterns.section.captures(trimmed) {
            flush(&mut current);
            let title = &caps[1];
            in_section = title == "FAILURES" || title == "ERRORS";
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some(caps) = patterns.header.captures(trimmed) {
            flush(&mut current);
            current = Some((header_key(&caps[1]), Vec::new()));
            continue;
        }
        if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    flush(&mut current);
    blocks
}

fn header_key(title: &str) -> String {
    for prefix in ["ERROR at setup of ", "ERROR at teardown of ", "ERROR collecting "] {
        if let Some(rest) = title.strip_prefix(prefix) {
            return rest.trim().to_string();
        }
    }
    title.trim().to_string()
}

fn traceback_for(
    blocks: &HashMap<String, String>,
    file_path: &str,
    test_function: &str,
) -> Option<String> {
    if test_function.is_empty() {
        return blocks.get(file_path).cloned();
    }
    // Headers use `Class.test` where node ids use `Class::test`.
    let dotted = test_function.replace("::", ".");
    blocks
        .get(&dotted)
        .or_else(|| blocks.get(test_function))
        .cloned()
}

/// Builds error details from the summary message, falling back to the
/// traceback's `E` lines.
fn classify(patterns: &Patterns, message: &str, trace: Option<&str>) -> ErrorDetails {
    if let Some(details) = classify_message(patterns, message) {
        return details;
    }
    if let Some(trace) = trace {
        let e_lines: Vec<&str> = trace
            .lines()
            .filter_map(|l| l.strip_prefix("E "))
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();
        if let Some(first) = e_lines.first() {
            if let Some(details) = classify_message(patterns, first) {
                return details;
            }
        }
    }
    ErrorDetails::new("Failure", message)
}

fn classify_message(patterns: &Patterns, message: &str) -> Option<ErrorDetails> {
    let message = message.trim();
    if message.is_empty() {
        return None;
    }
    if message.starts_with("assert ") || message == "assert" {
        return Some(ErrorDetails::new("AssertionError", message));
    }
    let caps = patterns.exception.captures(message)?;
    let error_type = caps[1].rsplit('.').next().unwrap_or(&caps[1]).to_string();
    let text = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
    Some(ErrorDetails::new(error_type, text))
}

/// Runs pytest over a scope and parses what failed.
#[derive(Debug, Clone)]
pub struct Discovery {
    pytest: PytestCommand,
}

impl Discovery {
    pub fn new(pytest: PytestCommand) -> Self {
        Self { pytest }
    }

    pub fn root(&self) -> &Path {
        self.pytest.root()
    }

    /// `scope` is a path relative to the root; `test_function` narrows it to one test.
    pub async fn discover(
        &self,
        scope: Option<&Path>,
        test_function: Option<&str>,
        timeout: Duration,
    ) -> Result<DiscoveryReport> {
        let target = match (scope, test_function) {
            (Some(scope), Some(func)) => Some(format!("{}::{}", scope.display(), func)),
            (Some(scope), None) => Some(scope.display().to_string()),
            (None, Some(_)) => anyhow::bail!("--test-function requires --test-path"),
            (None, None) => None,
        };

        let mut args = vec!["-rfE".to_string(), "--tb=short".to_string()];
        args.extend(target);

        info!(root = %self.root().display(), "running test suite");
        let pytest = self.pytest.clone();
        let run = tokio::task::spawn_blocking(move || pytest.run(args, timeout))
            .await?
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        let output = run.combined_output();
        if run.timed_out {
            anyhow::bail!("test suite timed out after {}s", timeout.as_secs());
        }

        let failures = parse_pytest_output(&output);
        let code = run.exit_code();
        debug!(exit_code = ?code, failures = failures.len(), "test suite finished");

        match code {
            Some(0) => {}
            Some(EXIT_NO_TESTS) => info!("no tests collected"),
            Some(1) => {}
            _ if !failures.is_empty() => {}
            _ => anyhow::bail!(
                "pytest failed to run (exit {:?}):\n{}",
                code,
                tail_chars(&output, 2000)
            ),
        }

        Ok(DiscoveryReport {
            passed: failures.is_empty() && matches!(code, Some(0) | Some(EXIT_NO_TESTS)),
            failures,
            output_tail: tail_chars(&output, 2000),
        })
    }
}
