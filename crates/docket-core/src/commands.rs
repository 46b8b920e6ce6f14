use std::io::{self, BufRead};
use std::path::Path;

use anyhow::{Context, anyhow};
use chrono::Utc;
use docket_shared::{LoginRequest, MAX_BULK_TASKS, RegisterRequest, TaskPatch, TaskPriority};
use tracing::{debug, error, info, instrument};

use crate::api::TaskService;
use crate::cli::{Command, FieldArgs, StateCommand};
use crate::config::Config;
use crate::duplicates::{DuplicateKey, mark_duplicates};
use crate::extract::{ExtractOptions, extract_tasks};
use crate::gateway::{Gateway, GatewayError};
use crate::render::Renderer;
use crate::session::UiState;
use crate::task::Task;

const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const PDF_MIME: &str = "application/pdf";

pub async fn dispatch<S: TaskService>(
    gw: &mut Gateway<S>,
    cfg: &Config,
    renderer: &mut Renderer,
    command: Command,
) -> anyhow::Result<()> {
    debug!(online = gw.is_online(), "dispatching command");

    if cfg.auto_sync()
        && gw.is_online()
        && gw.store().pending_count() > 0
        && needs_fresh_cache(&command)
    {
        info!(queued = gw.store().pending_count(), "replaying queued changes before command");
        let report = gw.sync_now().await.map_err(user_error)?;
        if !report.is_clean() {
            renderer.print_sync_report(&report)?;
        }
    }

    match command {
        Command::Register {
            username,
            email,
            password,
        } => cmd_register(gw, renderer, username, email, password).await,
        Command::Login { username, password } => cmd_login(gw, renderer, username, password).await,
        Command::Logout { purge } => {
            gw.logout(purge).map_err(user_error)?;
            if purge {
                renderer.line("Logged out. Local data removed.")
            } else {
                renderer.line("Logged out.")
            }
        }
        Command::List { all } => cmd_list(gw, renderer, all).await,
        Command::Add {
            description,
            fields,
        } => cmd_add(gw, renderer, description.join(" "), fields).await,
        Command::Update {
            id,
            description,
            fields,
            clear,
        } => cmd_update(gw, renderer, &id, description, fields, &clear).await,
        Command::Done { id, undo } => {
            let patch = TaskPatch {
                is_completed: Some(!undo),
                ..TaskPatch::default()
            };
            apply_patch(gw, renderer, &id, patch).await
        }
        Command::Priority { id, level } => cmd_priority(gw, renderer, &id, level).await,
        Command::Delete { id } => cmd_delete(gw, renderer, &id).await,
        Command::Search { query } => {
            let results = gw
                .search_tasks(&query.join(" "))
                .await
                .map_err(user_error)?;
            renderer.print_search_results(&results)
        }
        Command::Stats { local } => {
            let stats = if local {
                gw.local_stats()
            } else {
                gw.stats().await.map_err(user_error)?
            };
            renderer.print_stats(&stats)
        }
        Command::Duplicates { by_section, apply } => {
            cmd_duplicates(gw, renderer, by_section, apply).await
        }
        Command::Import {
            file,
            first_id,
            dry_run,
        } => cmd_import(gw, renderer, &file, first_id, dry_run).await,
        Command::Sync => {
            if !gw.is_online() {
                return Err(anyhow!("offline mode is on; run `docket online` to sync"));
            }
            let report = gw.sync_now().await.map_err(user_error)?;
            renderer.print_sync_report(&report)
        }
        Command::Offline => {
            gw.go_offline();
            renderer.line("Offline mode on. Changes are queued until you go online.")
        }
        Command::Online => match gw.go_online().await.map_err(user_error)? {
            Some(report) => renderer.print_sync_report(&report),
            None => renderer.line("Online. Nothing queued."),
        },
        Command::Status => cmd_status(gw, renderer),
        Command::Conflicts { clear } => cmd_conflicts(gw, renderer, clear),
        Command::State(state) => cmd_state(gw, renderer, state),
    }
}

/// Commands that read or write tasks benefit from a drained queue.
fn needs_fresh_cache(command: &Command) -> bool {
    !matches!(
        command,
        Command::Register { .. }
            | Command::Login { .. }
            | Command::Logout { .. }
            | Command::Sync
            | Command::Offline
            | Command::Online
            | Command::Status
            | Command::Conflicts { .. }
            | Command::State(_)
    )
}

/// Converts a gateway failure into the message shown to the user; storage
/// detail goes to the log only.
fn user_error(err: GatewayError) -> anyhow::Error {
    if let GatewayError::Store(inner) = &err {
        error!(error = ?inner, "local store failure");
    }
    if err.is_auth_required() {
        return anyhow!("{}; run `docket login` to continue", err.user_message());
    }
    anyhow!(err.user_message())
}

#[instrument(skip(gw, renderer, password))]
async fn cmd_register<S: TaskService>(
    gw: &mut Gateway<S>,
    renderer: &mut Renderer,
    username: String,
    email: String,
    password: Option<String>,
) -> anyhow::Result<()> {
    let password = password_or_prompt(password)?;
    let user = gw
        .register(&RegisterRequest {
            username,
            email,
            password,
        })
        .await
        .map_err(user_error)?;
    renderer.line(&format!("Registered and logged in as {}.", user.username))
}

#[instrument(skip(gw, renderer, password))]
async fn cmd_login<S: TaskService>(
    gw: &mut Gateway<S>,
    renderer: &mut Renderer,
    username: String,
    password: Option<String>,
) -> anyhow::Result<()> {
    let password = password_or_prompt(password)?;
    let user = gw
        .login(&LoginRequest { username, password })
        .await
        .map_err(user_error)?;
    renderer.line(&format!("Logged in as {}.", user.username))
}

fn password_or_prompt(password: Option<String>) -> anyhow::Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    eprint!("password: ");
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed reading password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        return Err(anyhow!("a password is required"));
    }
    Ok(password)
}

#[instrument(skip(gw, renderer))]
async fn cmd_list<S: TaskService>(
    gw: &mut Gateway<S>,
    renderer: &mut Renderer,
    all: bool,
) -> anyhow::Result<()> {
    let mut tasks = gw.get_tasks().await.map_err(user_error)?;
    if !all {
        tasks.retain(|task| !task.is_completed);
    }
    tasks.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    if !gw.is_online() {
        renderer.line("(offline: showing cached tasks)")?;
    }
    renderer.print_task_table(&tasks)
}

#[instrument(skip(gw, renderer, fields))]
async fn cmd_add<S: TaskService>(
    gw: &mut Gateway<S>,
    renderer: &mut Renderer,
    description: String,
    fields: FieldArgs,
) -> anyhow::Result<()> {
    if description.trim().is_empty() {
        return Err(anyhow!("a task description is required"));
    }
    let mut task = Task::draft(description.trim(), Utc::now());
    task.section = fields.section;
    task.responsible = fields.responsible;
    task.timeline = fields.timeline;
    task.notes = fields.notes;
    task.priority = priority_from(fields.priority)?;

    let created = gw.create_task(task).await.map_err(user_error)?;
    let suffix = if created.is_local_id() {
        " (queued offline)"
    } else {
        ""
    };
    renderer.line(&format!("Created task {}{suffix}.", created.id))
}

#[instrument(skip(gw, renderer, description, fields, clear))]
async fn cmd_update<S: TaskService>(
    gw: &mut Gateway<S>,
    renderer: &mut Renderer,
    id: &str,
    description: Option<String>,
    fields: FieldArgs,
    clear: &[String],
) -> anyhow::Result<()> {
    let mut patch = TaskPatch {
        task_description: description,
        section: fields.section.map(Some),
        responsible: fields.responsible.map(Some),
        timeline: fields.timeline.map(Some),
        notes: fields.notes.map(Some),
        priority: fields
            .priority
            .map(|level| priority_from(Some(level)))
            .transpose()?,
        ..TaskPatch::default()
    };
    for field in clear {
        match field.as_str() {
            "section" => patch.section = Some(None),
            "responsible" => patch.responsible = Some(None),
            "timeline" => patch.timeline = Some(None),
            "notes" => patch.notes = Some(None),
            other => return Err(anyhow!("cannot clear unknown field: {other}")),
        }
    }
    if patch.is_empty() {
        return Err(anyhow!("nothing to update"));
    }
    apply_patch(gw, renderer, id, patch).await
}

#[instrument(skip(gw, renderer))]
async fn cmd_priority<S: TaskService>(
    gw: &mut Gateway<S>,
    renderer: &mut Renderer,
    id: &str,
    level: Option<u8>,
) -> anyhow::Result<()> {
    let priority = match level {
        Some(level) => priority_from(Some(level))?,
        None => {
            let full_id = resolve_id(gw, id)?;
            gw.store()
                .get_task(&full_id)
                .map(|task| task.priority.next())
                .ok_or_else(|| anyhow!("task not found"))?
        }
    };
    let patch = TaskPatch {
        priority: Some(priority),
        ..TaskPatch::default()
    };
    apply_patch(gw, renderer, id, patch).await
}

async fn apply_patch<S: TaskService>(
    gw: &mut Gateway<S>,
    renderer: &mut Renderer,
    id: &str,
    patch: TaskPatch,
) -> anyhow::Result<()> {
    let id = resolve_id(gw, id)?;
    let updated = gw.update_task(&id, patch).await.map_err(user_error)?;
    renderer.print_task_info(&updated)
}

#[instrument(skip(gw, renderer))]
async fn cmd_delete<S: TaskService>(
    gw: &mut Gateway<S>,
    renderer: &mut Renderer,
    id: &str,
) -> anyhow::Result<()> {
    let id = resolve_id(gw, id)?;
    gw.delete_task(&id).await.map_err(user_error)?;
    renderer.line(&format!("Deleted task {id}."))
}

#[instrument(skip(gw, renderer))]
async fn cmd_duplicates<S: TaskService>(
    gw: &mut Gateway<S>,
    renderer: &mut Renderer,
    by_section: bool,
    apply: bool,
) -> anyhow::Result<()> {
    let key = if by_section {
        DuplicateKey::DescriptionAndSection
    } else {
        DuplicateKey::Description
    };
    let original = gw.get_tasks().await.map_err(user_error)?;
    let mut marked = original.clone();
    let flagged = mark_duplicates(&mut marked, key);

    if apply {
        let changed: Vec<(String, bool)> = original
            .iter()
            .zip(&marked)
            .filter(|(before, after)| before.is_duplicate != after.is_duplicate)
            .map(|(_, after)| (after.id.clone(), after.is_duplicate))
            .collect();
        for (id, duplicate) in &changed {
            let patch = TaskPatch {
                is_duplicate: Some(*duplicate),
                ..TaskPatch::default()
            };
            gw.update_task(id, patch).await.map_err(user_error)?;
        }
        info!(updated = changed.len(), "duplicate flags stored");
    }

    marked.retain(|task| task.is_duplicate);
    renderer.print_task_table(&marked)?;
    renderer.line(&format!("{flagged} duplicate(s) found."))
}

#[instrument(skip(gw, renderer))]
async fn cmd_import<S: TaskService>(
    gw: &mut Gateway<S>,
    renderer: &mut Renderer,
    file: &Path,
    first_id: Option<u64>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("not a file: {}", file.display()))?;
    let content_type = content_type_for(&filename)?;
    let bytes =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;

    let converted = gw
        .upload_document(&filename, content_type, bytes)
        .await
        .map_err(user_error)?;

    let first_id = match first_id {
        Some(id) => id,
        None => next_global_id(gw).await?,
    };
    let tasks = extract_tasks(&converted.html, &ExtractOptions::for_file(&filename, first_id))?;
    if tasks.is_empty() {
        return renderer.line("No task rows found in the document.");
    }

    if dry_run {
        let preview: Vec<Task> = tasks
            .into_iter()
            .map(|create| Task::from_create(create, Utc::now()))
            .collect();
        return renderer.print_task_table(&preview);
    }

    let mut imported = 0usize;
    for chunk in tasks.chunks(MAX_BULK_TASKS) {
        let created = gw
            .create_tasks(chunk.to_vec())
            .await
            .map_err(user_error)?;
        imported += created.len();
    }
    info!(imported, file = %filename, "document imported");
    renderer.line(&format!("Imported {imported} task(s) from {filename}."))
}

fn content_type_for(filename: &str) -> anyhow::Result<&'static str> {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".docx") {
        Ok(DOCX_MIME)
    } else if lower.ends_with(".pdf") {
        Ok(PDF_MIME)
    } else {
        Err(anyhow!("only .docx and .pdf documents can be imported"))
    }
}

async fn next_global_id<S: TaskService>(gw: &mut Gateway<S>) -> anyhow::Result<u64> {
    let tasks = gw.get_tasks().await.map_err(user_error)?;
    Ok(tasks
        .iter()
        .filter_map(|task| task.global_id)
        .max()
        .map_or(1, |max| max + 1))
}

fn cmd_status<S: TaskService>(gw: &Gateway<S>, renderer: &mut Renderer) -> anyhow::Result<()> {
    let state = gw.session().app_state();
    let user = gw
        .current_user()
        .map_or_else(|| "(not logged in)".to_string(), |user| user.username);

    renderer.line(&format!("user        {user}"))?;
    renderer.line(&format!(
        "mode        {}",
        if gw.is_online() { "online" } else { "offline" }
    ))?;
    renderer.line(&format!("queued      {}", gw.store().pending_count()))?;
    renderer.line(&format!("conflicts   {}", gw.store().conflicts().len()))?;
    renderer.line(&format!(
        "last sync   {}",
        state
            .last_sync
            .map_or_else(|| "never".to_string(), |at| at.to_rfc3339())
    ))?;
    renderer.line(&format!("data        {}", gw.store().data_dir.display()))
}

fn cmd_conflicts<S: TaskService>(
    gw: &mut Gateway<S>,
    renderer: &mut Renderer,
    clear: bool,
) -> anyhow::Result<()> {
    if clear {
        let cleared = gw.clear_conflicts().map_err(user_error)?;
        return renderer.line(&format!("Cleared {cleared} conflict(s)."));
    }
    let conflicts = gw.store().conflicts().to_vec();
    if conflicts.is_empty() {
        return renderer.line("No conflicts.");
    }
    renderer.print_task_table(&conflicts)
}

fn cmd_state<S: TaskService>(
    gw: &Gateway<S>,
    renderer: &mut Renderer,
    command: StateCommand,
) -> anyhow::Result<()> {
    match command {
        StateCommand::Save {
            view,
            filter,
            query,
            sort_by,
        } => {
            let mut state = UiState::new(Utc::now());
            state.current_view = view;
            state.current_filter = filter;
            state.search_query = query;
            state.sort_by = sort_by;
            gw.session().save_ui_state(&state)?;
            renderer.line("View state saved.")
        }
        StateCommand::Show => match gw.session().restore_ui_state(Utc::now()) {
            Some(state) => renderer.print_ui_state(&state),
            None => renderer.line("No saved view state (or it is older than a day)."),
        },
    }
}

fn priority_from(level: Option<u8>) -> anyhow::Result<TaskPriority> {
    level
        .map(TaskPriority::try_from)
        .transpose()
        .map_err(|err| anyhow!("{err}"))
        .map(Option::unwrap_or_default)
}

/// Accepts a full id or a unique prefix of a cached task id.
fn resolve_id<S: TaskService>(gw: &Gateway<S>, input: &str) -> anyhow::Result<String> {
    let known = gw.store().resolve_id(input);
    if gw.store().get_task(&known).is_some() {
        return Ok(known);
    }
    let matches: Vec<String> = gw
        .store()
        .get_all_tasks()
        .into_iter()
        .filter(|task| task.id.starts_with(input))
        .map(|task| task.id)
        .collect();
    match matches.as_slice() {
        [only] => Ok(only.clone()),
        [] => Ok(known),
        _ => Err(anyhow!("id prefix '{input}' matches {} tasks", matches.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::{content_type_for, user_error};
    use crate::api::ApiError;
    use crate::gateway::GatewayError;

    #[test]
    fn import_accepts_only_docx_and_pdf() {
        assert!(content_type_for("Minutes.DOCX").is_ok());
        assert_eq!(content_type_for("a.pdf").expect("pdf"), "application/pdf");
        assert!(content_type_for("notes.txt").is_err());
    }

    #[test]
    fn rejected_session_points_at_login() {
        let message = user_error(GatewayError::Api(ApiError::AuthRequired)).to_string();
        assert!(message.contains("docket login"), "{message}");

        let message = user_error(GatewayError::Api(ApiError::NotFound)).to_string();
        assert!(!message.contains("docket login"), "{message}");
    }
}
