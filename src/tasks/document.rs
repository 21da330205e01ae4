//! Task lists embedded in free-form documents.
//!
//! A task document is any text (usually markdown the user edits by hand)
//! containing exactly one fenced code block whose info string includes the
//! word `tasks`:
//!
//! ````text
//! Notes for the agent...
//!
//! ```json tasks
//! {"version": 1, "tasks": [{"id": "inbox", "title": "Triage inbox", "schedule": "1h"}]}
//! ```
//! ````
//!
//! Parsing distinguishes "no block" ([`ParseOutcome::Empty`]) from "block
//! present but unusable" ([`ParseOutcome::Corrupted`]) so a broken document
//! is never mistaken for an idle one. Rewriting replaces only the block's
//! bytes; everything around it is preserved exactly.

use std::collections::HashSet;
use std::ops::Range;
use std::path::{Path, PathBuf};

use super::schedule::ScheduleEngine;
use super::types::TaskList;
use crate::error::{Result, VigilError};
use crate::persist;

/// Info-string tag marking the task block.
pub const TASK_BLOCK_TAG: &str = "tasks";

/// Opening fence written when a block is (re)rendered.
const OPENING_FENCE: &str = "```json tasks";

/// Result of reading a task document.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// A valid task block.
    Ok(TaskList),
    /// No task block at all: nothing structured to do.
    Empty,
    /// A task block exists but cannot be used.
    Corrupted {
        /// Human-readable diagnosis, suitable for showing to the agent.
        reason: String,
    },
}

impl ParseOutcome {
    fn corrupted(reason: impl Into<String>) -> Self {
        Self::Corrupted {
            reason: reason.into(),
        }
    }
}

/// Location of the task block inside a document.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockSpan {
    /// From the first byte of the opening fence line to the last byte of the
    /// closing fence (its line terminator excluded).
    outer: Range<usize>,
    /// The JSON payload between the fences.
    inner: Range<usize>,
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn fence_len(line: &str) -> usize {
    line.trim_start().chars().take_while(|&c| c == '`').count()
}

/// A closing fence is backticks alone, at least as many as opened the block.
fn closes_fence(line: &str, open_len: usize) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && trimmed.chars().all(|c| c == '`') && trimmed.len() >= open_len
}

fn is_task_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```")
        && trimmed
            .trim_start_matches('`')
            .split_whitespace()
            .any(|token| token.eq_ignore_ascii_case(TASK_BLOCK_TAG))
}

/// Find the single task block.
///
/// Returns `Ok(None)` when there is none and `Err(reason)` for an
/// unterminated or duplicated block. Fenced blocks of other languages are
/// skipped so their contents cannot be misread as task fences, including
/// shorter fences nested inside a longer one.
fn locate_block(doc: &str) -> std::result::Result<Option<BlockSpan>, String> {
    let mut offset = 0;
    let mut found: Option<BlockSpan> = None;
    // (is_task_block, fence_len, outer_start, inner_start)
    let mut open: Option<(bool, usize, usize, usize)> = None;

    for raw in doc.split_inclusive('\n') {
        let line_start = offset;
        offset += raw.len();
        let line = raw.trim_end_matches(['\n', '\r']);

        match open {
            None if is_fence(line) => {
                open = Some((is_task_fence(line), fence_len(line), line_start, offset));
            }
            None => {}
            Some((is_task, open_len, outer_start, inner_start)) => {
                if !closes_fence(line, open_len) {
                    continue;
                }
                open = None;
                if !is_task {
                    continue;
                }
                if found.is_some() {
                    return Err("document contains more than one task block".to_owned());
                }
                let fence_start = line_start + (line.len() - line.trim_start().len());
                found = Some(BlockSpan {
                    outer: outer_start..fence_start + line.trim().len(),
                    inner: inner_start..line_start,
                });
            }
        }
    }

    if let Some((true, _, _, _)) = open {
        return Err("task block is not terminated by a closing fence".to_owned());
    }
    Ok(found)
}

/// Parse the task block of `doc`, validating ids and schedules.
///
/// Validation covers: JSON shape, non-empty and unique ids, and every
/// schedule being understood by `engine`.
pub fn parse_task_document(doc: &str, engine: &ScheduleEngine) -> ParseOutcome {
    let span = match locate_block(doc) {
        Ok(Some(span)) => span,
        Ok(None) => return ParseOutcome::Empty,
        Err(reason) => return ParseOutcome::corrupted(reason),
    };

    let payload = &doc[span.inner];
    if payload.trim().is_empty() {
        return ParseOutcome::Ok(TaskList::default());
    }
    let list: TaskList = match serde_json::from_str(payload) {
        Ok(list) => list,
        Err(e) => return ParseOutcome::corrupted(format!("task block is not valid JSON: {e}")),
    };

    let mut seen = HashSet::new();
    for task in &list.tasks {
        if task.id.trim().is_empty() {
            return ParseOutcome::corrupted(format!("task '{}' has an empty id", task.title));
        }
        if !seen.insert(task.id.as_str()) {
            return ParseOutcome::corrupted(format!("duplicate task id '{}'", task.id));
        }
        if let Some(schedule) = task.schedule.as_deref().filter(|s| !s.trim().is_empty())
            && let Err(e) = engine.validate(schedule, task.timezone.as_deref())
        {
            return ParseOutcome::corrupted(format!("task '{}': {e}", task.id));
        }
    }

    ParseOutcome::Ok(list)
}

fn render_block(list: &TaskList) -> Result<String> {
    let json = serde_json::to_string_pretty(list)?;
    Ok(format!("{OPENING_FENCE}\n{json}\n```"))
}

/// Return `doc` with its task block replaced by `list`.
///
/// Bytes outside the block are untouched. A document without a block gets
/// one appended after a blank line.
///
/// # Errors
///
/// Returns [`VigilError::TaskDocument`] if the existing block is
/// unterminated or duplicated (rewriting would guess at user intent).
pub fn write_task_block(doc: &str, list: &TaskList) -> Result<String> {
    let block = render_block(list)?;
    match locate_block(doc).map_err(VigilError::TaskDocument)? {
        Some(span) => {
            let mut out = String::with_capacity(doc.len() + block.len());
            out.push_str(&doc[..span.outer.start]);
            out.push_str(&block);
            out.push_str(&doc[span.outer.end..]);
            Ok(out)
        }
        None => {
            let mut out = doc.to_owned();
            if !out.is_empty() {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push('\n');
            }
            out.push_str(&block);
            out.push('\n');
            Ok(out)
        }
    }
}

/// A task document on disk.
///
/// Reads and writes are not locked here; callers hold the owning agent's
/// primary session lease around read-modify-write cycles.
#[derive(Debug, Clone)]
pub struct TaskDocument {
    path: PathBuf,
    engine: ScheduleEngine,
}

impl TaskDocument {
    /// Handle for the document at `path`.
    pub fn new(path: impl Into<PathBuf>, engine: ScheduleEngine) -> Self {
        Self {
            path: path.into(),
            engine,
        }
    }

    /// Document path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schedule engine used for validation.
    pub fn engine(&self) -> &ScheduleEngine {
        &self.engine
    }

    fn read_text(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VigilError::TaskDocument(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Parse the document. A missing file is [`ParseOutcome::Empty`].
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::TaskDocument`] if the file exists but cannot be read.
    pub fn load(&self) -> Result<ParseOutcome> {
        Ok(match self.read_text()? {
            Some(text) => parse_task_document(&text, &self.engine),
            None => ParseOutcome::Empty,
        })
    }

    /// Write `list` into the document atomically, preserving surrounding text.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::TaskDocument`] on read, render or write failure.
    pub fn save(&self, list: &TaskList) -> Result<()> {
        let current = self.read_text()?.unwrap_or_default();
        let updated = write_task_block(&current, list)?;
        persist::write_atomic(&self.path, updated.as_bytes(), None).map_err(|e| {
            VigilError::TaskDocument(format!("failed to write {}: {e}", self.path.display()))
        })
    }

    /// Load, apply `f` to a valid list, and save.
    ///
    /// Returns `Ok(None)` without writing when the document is empty or
    /// corrupted.
    ///
    /// # Errors
    ///
    /// Propagates load and save failures.
    pub fn update<R>(&self, f: impl FnOnce(&mut TaskList) -> R) -> Result<Option<R>> {
        match self.load()? {
            ParseOutcome::Ok(mut list) => {
                let out = f(&mut list);
                self.save(&list)?;
                Ok(Some(out))
            }
            ParseOutcome::Empty | ParseOutcome::Corrupted { .. } => Ok(None),
        }
    }
}
