//! Prompts sent to agents on heartbeat and task turns.

use std::fmt::Write;

use crate::tasks::{Task, TaskList};

fn describe_task(out: &mut String, task: &Task) {
    let _ = write!(out, "- [{}] {}", task.id, task.title);
    if let Some(schedule) = task.schedule.as_deref().filter(|s| !s.trim().is_empty()) {
        let _ = write!(out, " (every {schedule})");
    }
    out.push('\n');
    for line in task.description.lines().filter(|l| !l.trim().is_empty()) {
        let _ = writeln!(out, "    {}", line.trim());
    }
    if task.retry > 0
        && let Some(error) = &task.error_message
    {
        let _ = writeln!(out, "    previous attempt failed: {error}");
    }
}

fn ack_instructions(out: &mut String, ack_token: &str) {
    let _ = write!(
        out,
        "\nIf nothing needs the user's attention, reply EXACTLY with: {ack_token}\n\
         Otherwise reply with a concise summary of what needs attention.\n"
    );
}

/// One merged turn for every due inline task.
#[must_use]
pub fn inline_tasks_prompt(tasks: &[Task], mailbox: &str, ack_token: &str) -> String {
    let mut out = String::from("Heartbeat. The following scheduled tasks are due now. Work through each of them:\n\n");
    for task in tasks {
        describe_task(&mut out, task);
    }
    if !mailbox.trim().is_empty() {
        out.push_str("\nUnread notifications:\n");
        out.push_str(mailbox);
    }
    ack_instructions(&mut out, ack_token);
    out
}

/// A single task run in its own session.
#[must_use]
pub fn isolated_task_prompt(task: &Task, ack_token: &str) -> String {
    let mut out = String::from("Scheduled task. Complete the following task:\n\n");
    describe_task(&mut out, task);
    ack_instructions(&mut out, ack_token);
    out
}

/// Periodic review of the task list when nothing is due.
#[must_use]
pub fn reflection_prompt(list: &TaskList, capabilities: &str, ack_token: &str) -> String {
    let mut out = String::from(
        "Heartbeat review. No scheduled task is due. Look over your task list and \
         recent context, and decide whether anything needs doing that no schedule covers.\n\n\
         Current tasks:\n",
    );
    if list.is_empty() {
        out.push_str("(none)\n");
    }
    for task in &list.tasks {
        let _ = write!(out, "[{}] ", task.state);
        describe_task(&mut out, task);
    }
    if !capabilities.trim().is_empty() {
        out.push_str("\nAvailable capabilities:\n");
        out.push_str(capabilities);
        out.push('\n');
    }
    ack_instructions(&mut out, ack_token);
    out
}

/// Diagnostic turn for an unusable task block.
#[must_use]
pub fn corrupted_document_prompt(path: &str, reason: &str, ack_token: &str) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "Heartbeat diagnostic. The task block in {path} cannot be parsed:\n\n    {reason}\n\n\
         No scheduled tasks can run until it is fixed. The block must be a single fenced \
         block opened with ```json tasks and holding {{\"version\": 1, \"tasks\": [...]}} \
         with unique task ids.\nRepair it if you can, then report what you changed.\n"
    );
    ack_instructions(&mut out, ack_token);
    out
}
