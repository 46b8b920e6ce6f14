//! Turns converted protocol documents into task records.
//!
//! The server hands back HTML; every table row with enough cells becomes one
//! task. Column order is number, section, description, responsible,
//! timeline. Narrower tables map onto the leading columns: two cells are
//! number + description, three are number + section + description.

use anyhow::anyhow;
use docket_shared::TaskCreate;
use regex::Regex;
use tracing::debug;

const DATE_PATTERN: &str = r"(\d{4})-(\d{1,2})-(\d{1,2})|(\d{1,2})[.\-](\d{1,2})[.\-](\d{4})";

struct Patterns {
    row: Regex,
    cell: Regex,
    tag: Regex,
}

impl Patterns {
    fn compile() -> anyhow::Result<Self> {
        let compile =
            |re: &str| Regex::new(re).map_err(|e| anyhow!("internal regex compile failure: {e}"));
        Ok(Self {
            row: compile(r"(?is)<tr\b[^>]*>(.*?)</tr>")?,
            cell: compile(r"(?is)<t([dh])\b[^>]*>(.*?)</t[dh]>")?,
            tag: compile(r"(?s)<[^>]+>")?,
        })
    }
}

const HEADER_WORDS: &[&str] = &[
    "description",
    "task",
    "section",
    "responsible",
    "timeline",
    "#",
    "no.",
    "מס'",
    "נושא",
    "משימה",
    "אחראי",
    "לו\"ז",
];

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub document_type: Option<String>,
    pub protocol_date: Option<String>,
    /// First `globalId` handed out; later rows count up from here.
    pub first_global_id: u64,
}

impl ExtractOptions {
    /// Options derived from the uploaded file's name.
    pub fn for_file(filename: &str, first_global_id: u64) -> Self {
        let document_type = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase());
        Self {
            document_type,
            protocol_date: protocol_date_from_filename(filename),
            first_global_id,
        }
    }
}

/// Finds a date in `dd.mm.yyyy`, `dd-mm-yyyy` or `yyyy-mm-dd` form and returns
/// it as `yyyy-mm-dd`.
pub fn protocol_date_from_filename(filename: &str) -> Option<String> {
    let date_re = Regex::new(DATE_PATTERN).ok()?;
    let caps = date_re.captures(filename)?;
    let (year, month, day) = match (caps.get(1), caps.get(4)) {
        (Some(year), _) => (year.as_str(), caps.get(2)?.as_str(), caps.get(3)?.as_str()),
        (None, Some(day)) => (caps.get(6)?.as_str(), caps.get(5)?.as_str(), day.as_str()),
        (None, None) => return None,
    };
    let month: u32 = month.parse().ok()?;
    let day: u32 = day.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(format!("{year}-{month:02}-{day:02}"))
}

#[tracing::instrument(skip(html, options), fields(len = html.len()))]
pub fn extract_tasks(html: &str, options: &ExtractOptions) -> anyhow::Result<Vec<TaskCreate>> {
    let patterns = Patterns::compile()?;
    let mut tasks = Vec::new();
    let mut next_global = options.first_global_id;

    for row in patterns.row.captures_iter(html) {
        let row_html = row.get(1).map_or("", |m| m.as_str());
        let mut header_cells = false;
        let cells: Vec<String> = patterns
            .cell
            .captures_iter(row_html)
            .map(|cell| {
                if cell.get(1).is_some_and(|kind| kind.as_str().eq_ignore_ascii_case("h")) {
                    header_cells = true;
                }
                cell_text(&patterns.tag, cell.get(2).map_or("", |m| m.as_str()))
            })
            .collect();

        if cells.len() < 2 || header_cells || is_header_row(&cells) {
            continue;
        }

        let (number, section, description, responsible, timeline) = match cells.as_slice() {
            [number, description] => (number, None, description, None, None),
            [number, section, description] => (number, Some(section), description, None, None),
            [number, section, description, responsible] => {
                (number, Some(section), description, Some(responsible), None)
            }
            [number, section, description, responsible, timeline, ..] => (
                number,
                Some(section),
                description,
                Some(responsible),
                Some(timeline),
            ),
            _ => continue,
        };

        if description.is_empty() {
            continue;
        }

        let mut task = TaskCreate::new(description.clone());
        task.number_from_file = non_empty(Some(number));
        task.section = non_empty(section);
        task.responsible = non_empty(responsible);
        task.timeline = non_empty(timeline);
        task.document_type = options.document_type.clone();
        task.protocol_date = options.protocol_date.clone();
        task.global_id = Some(next_global);
        next_global += 1;
        tasks.push(task);
    }

    debug!(extracted = tasks.len(), "table rows extracted");
    Ok(tasks)
}

fn cell_text(tag: &Regex, raw: &str) -> String {
    let text = tag.replace_all(raw, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_header_row(cells: &[String]) -> bool {
    let hits = cells
        .iter()
        .filter(|cell| {
            let lower = cell.to_lowercase();
            HEADER_WORDS.iter().any(|word| lower == *word)
        })
        .count();
    hits >= 2
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::{ExtractOptions, extract_tasks, protocol_date_from_filename};

    const PROTOCOL: &str = r#"
        <p>Board meeting</p>
        <table>
          <tr><th>#</th><th>Section</th><th>Description</th><th>Responsible</th><th>Timeline</th></tr>
          <tr><td>1</td><td>Finance</td><td><p>Approve <b>budget</b></p></td><td>Dana</td><td>Q3</td></tr>
          <tr><td>2</td><td>Ops</td><td>   </td><td>Avi</td><td></td></tr>
          <tr><td>3</td><td>Legal</td><td>Review contract &amp; terms</td><td></td><td>May</td></tr>
        </table>
    "#;

    #[test]
    fn rows_become_tasks_with_sequential_global_ids() {
        let tasks = extract_tasks(PROTOCOL, &ExtractOptions::for_file("board 12.03.2026.docx", 40))
            .expect("extract");

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].task_description, "Approve budget");
        assert_eq!(tasks[0].section.as_deref(), Some("Finance"));
        assert_eq!(tasks[0].responsible.as_deref(), Some("Dana"));
        assert_eq!(tasks[0].global_id, Some(40));
        assert_eq!(tasks[1].task_description, "Review contract & terms");
        assert_eq!(tasks[1].responsible, None);
        assert_eq!(tasks[1].global_id, Some(41));
        assert_eq!(tasks[1].protocol_date.as_deref(), Some("2026-03-12"));
        assert_eq!(tasks[1].document_type.as_deref(), Some("docx"));
    }

    #[test]
    fn narrow_tables_fill_leading_columns() {
        let html = "<table><tr><td>7</td><td>Call supplier</td></tr></table>";
        let tasks =
            extract_tasks(html, &ExtractOptions::for_file("notes.pdf", 1)).expect("extract");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].number_from_file.as_deref(), Some("7"));
        assert_eq!(tasks[0].section, None);
        assert_eq!(tasks[0].protocol_date, None);
    }

    #[test]
    fn filename_dates_in_all_supported_shapes() {
        assert_eq!(
            protocol_date_from_filename("minutes-2026-01-05.pdf").as_deref(),
            Some("2026-01-05")
        );
        assert_eq!(
            protocol_date_from_filename("protocol 5-1-2026.docx").as_deref(),
            Some("2026-01-05")
        );
        assert_eq!(protocol_date_from_filename("protocol 40.13.2026.docx"), None);
        assert_eq!(protocol_date_from_filename("plain.docx"), None);
    }
}
