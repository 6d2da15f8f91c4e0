use std::path::Path;

use crate::log_warn;
use crate::types::{ResumeMeta, Task};

/// Inputs for the prompts of one worker attempt.
pub struct PromptParams<'a> {
    pub task: &'a Task,
    pub worker_id: &'a str,
    pub branch: &'a str,
    pub trunk: &'a str,
    /// Contents of the task's plan document, when it has one.
    pub plan_text: Option<&'a str>,
    /// Present on retries.
    pub resume: Option<&'a ResumeMeta>,
}

/// Standing instructions for an autonomous worker.
///
/// Structure: [Role] + [Footprint Boundary] + [Completion Rules]
pub fn build_system_prompt(params: &PromptParams) -> String {
    let role = format!(
        "# Autonomous Worker\n\n\
        You are `{}`, one of several coding agents working in parallel on the same repository.\n\
        No human is available for questions. Use your judgment to make decisions.\n\
        You are working in a dedicated git worktree on branch `{}`. Your commits are merged \
        into `{}` after you finish.",
        params.worker_id, params.branch, params.trunk
    );

    let boundary = if params.task.footprint.is_empty() {
        "## Boundary\n\n\
        This task declares no file footprint. Keep your changes as small as the task allows."
            .to_string()
    } else {
        format!(
            "## Boundary\n\n\
            Other workers are editing other parts of the repository right now. Only modify files \
            matching these patterns:\n\n{}\n\n\
            If the task cannot be completed without touching other files, stop and explain why \
            in your final message instead of editing them.",
            format_list(&params.task.footprint)
        )
    };

    let completion = "## Completion\n\n\
        - Commit your work on the current branch with a message that names the task id.\n\
        - Do not push, rebase, or switch branches.\n\
        - Finish with a short summary of what changed and anything left undone."
        .to_string();

    [role, boundary, completion].join("\n\n")
}

/// Task-specific request for one attempt.
pub fn build_user_prompt(params: &PromptParams) -> String {
    let task = params.task;
    let mut sections = vec![format!(
        "## Task\n\n\
        - **ID:** {}\n\
        - **Title:** {}\n\
        - **Priority:** {}",
        task.id, task.title, task.priority
    )];

    if let Some(description) = task.description.as_deref().filter(|d| !d.trim().is_empty()) {
        sections.push(format!("## Description\n\n{}", description.trim()));
    }

    if !task.dependencies.is_empty() {
        sections.push(format!(
            "## Completed Prerequisites\n\n{}",
            format_list(&task.dependencies)
        ));
    }

    if let Some(plan) = params.plan_text {
        sections.push(format!("## Implementation Plan\n\n{}", plan.trim()));
    }

    if let Some(resume) = params.resume.filter(|r| r.attempts > 0) {
        let reason = resume.last_failure.as_deref().unwrap_or("unknown");
        sections.push(format!(
            "## Previous Attempt\n\n\
            This is attempt {} at this task. The previous attempt stopped early: {}\n\n\
            Check the current state of the worktree before continuing; earlier edits are still there.",
            resume.attempts + 1,
            reason
        ));
    }

    sections.join("\n\n")
}

/// Read a task's plan document relative to the project root.
///
/// A missing or unreadable plan is logged and treated as absent.
pub fn load_plan(project_root: &Path, task: &Task) -> Option<String> {
    let rel = task.plan.as_deref()?;
    let path = project_root.join(rel);
    match std::fs::read_to_string(&path) {
        Ok(text) => Some(text),
        Err(e) => {
            log_warn!(
                "[{}] Plan {} unreadable, continuing without it: {}",
                task.id,
                path.display(),
                e
            );
            None
        }
    }
}

fn format_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- `{}`", i))
        .collect::<Vec<_>>()
        .join("\n")
}
