use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use chrono::Local;
use docket_shared::{StatsDto, TaskDto, TaskPriority};
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::session::UiState;
use crate::sync::SyncReport;
use crate::task::{SyncStatus, Task};

const SHORT_ID_LEN: usize = 8;
const DESCRIPTION_WIDTH: usize = 60;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self { color })
    }

    #[tracing::instrument(skip(self, tasks), fields(count = tasks.len()))]
    pub fn print_task_table(&mut self, tasks: &[Task]) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        let headers = ["ID", "P", "Done", "Sync", "Section", "Description", "Responsible", "Timeline"]
            .map(str::to_string)
            .to_vec();

        let mut rows = Vec::with_capacity(tasks.len());
        for task in tasks {
            let sync = match task.sync_status {
                SyncStatus::Synced => String::new(),
                SyncStatus::Pending => self.paint("pending", "33"),
                SyncStatus::Conflict => self.paint("conflict", "31"),
            };
            let mut description = truncate(&task.task_description, DESCRIPTION_WIDTH);
            if task.is_duplicate {
                description = self.paint(&format!("{description} (dup)"), "2");
            }

            rows.push(vec![
                self.paint(short_id(&task.id), "36"),
                priority_label(task.priority).to_string(),
                if task.is_completed { "x" } else { "" }.to_string(),
                sync,
                task.section.clone().unwrap_or_default(),
                description,
                task.responsible.clone().unwrap_or_default(),
                task.timeline.clone().unwrap_or_default(),
            ]);
        }

        write_table(&mut out, headers, rows)?;
        writeln!(out, "{} task(s)", tasks.len())?;
        Ok(())
    }

    pub fn print_search_results(&mut self, tasks: &[TaskDto]) -> anyhow::Result<()> {
        let tasks: Vec<Task> = tasks.iter().cloned().map(Task::from_remote).collect();
        self.print_task_table(&tasks)
    }

    #[tracing::instrument(skip(self, task))]
    pub fn print_task_info(&mut self, task: &Task) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        writeln!(out, "id          {}", task.id)?;
        writeln!(out, "desc        {}", task.task_description)?;
        writeln!(out, "priority    {}", priority_label(task.priority))?;
        writeln!(
            out,
            "status      {}",
            if task.is_completed { "completed" } else { "open" }
        )?;
        writeln!(out, "sync        {:?}", task.sync_status)?;
        for (label, value) in [
            ("section", &task.section),
            ("responsible", &task.responsible),
            ("timeline", &task.timeline),
            ("notes", &task.notes),
            ("protocol", &task.protocol_date),
        ] {
            if let Some(value) = value {
                writeln!(out, "{label:<11} {value}")?;
            }
        }
        writeln!(
            out,
            "updated     {}",
            task.updated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        )?;
        Ok(())
    }

    pub fn print_stats(&mut self, stats: &StatsDto) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "total       {}", stats.total_tasks)?;
        writeln!(out, "completed   {}", stats.completed_tasks)?;
        writeln!(out, "prioritized {}", stats.prioritized_tasks)?;
        writeln!(out, "duplicates  {}", stats.duplicate_tasks)?;
        Ok(())
    }

    pub fn print_sync_report(&mut self, report: &SyncReport) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(
            out,
            "replayed {}, failed {}, deferred {}, dropped {}",
            report.replayed, report.failed, report.deferred, report.dropped
        )?;
        if !report.refreshed {
            writeln!(out, "{}", self.paint("server snapshot unavailable; cache not refreshed", "33"))?;
        }
        if !report.conflicts.is_empty() {
            writeln!(
                out,
                "{}",
                self.paint(
                    &format!(
                        "{} local change(s) moved to conflicts; see `docket conflicts`",
                        report.conflicts.len()
                    ),
                    "31"
                )
            )?;
        }
        Ok(())
    }

    pub fn print_ui_state(&mut self, state: &UiState) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(
            out,
            "saved       {}",
            state.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        )?;
        writeln!(out, "view        {}", state.current_view)?;
        writeln!(out, "filter      {}", state.current_filter)?;
        writeln!(out, "search      {}", state.search_query)?;
        writeln!(out, "sort        {}", state.sort_by)?;
        Ok(())
    }

    pub fn line(&mut self, text: &str) -> anyhow::Result<()> {
        writeln!(io::stdout().lock(), "{text}")?;
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) if !id.starts_with(crate::task::LOCAL_ID_PREFIX) => &id[..idx],
        _ => id,
    }
}

fn priority_label(priority: TaskPriority) -> &'static str {
    match priority {
        TaskPriority::None => "",
        TaskPriority::Low => "L",
        TaskPriority::Medium => "M",
        TaskPriority::High => "H",
    }
}

fn truncate(text: &str, max: usize) -> String {
    if UnicodeWidthStr::width(text) <= max {
        return text.to_string();
    }
    let mut out = String::new();
    let mut width = 0;
    for ch in text.chars() {
        let w = unicode_width::UnicodeWidthChar::width(ch).unwrap_or(0);
        if width + w + 1 > max {
            break;
        }
        width += w;
        out.push(ch);
    }
    out.push('…');
    out
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for width in &widths {
        write!(writer, "{:-<width$} ", "", width = *width)?;
    }
    writeln!(writer)?;

    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = widths[idx].saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::{short_id, strip_ansi, truncate, write_table};

    #[test]
    fn table_pads_by_visible_width() {
        let mut buf = Vec::new();
        write_table(
            &mut buf,
            vec!["ID".to_string(), "Description".to_string()],
            vec![vec!["\x1b[36mab\x1b[0m".to_string(), "שלום".to_string()]],
        )
        .expect("table");
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(strip_ansi(lines[2]), "ab שלום        ");
    }

    #[test]
    fn server_ids_are_shortened_local_ids_are_not() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        let local = "local-1234-5678-9abc";
        assert_eq!(short_id(local), local);
    }

    #[test]
    fn long_descriptions_are_cut() {
        let cut = truncate("abcdefghij", 5);
        assert_eq!(cut, "abcd…");
    }
}
