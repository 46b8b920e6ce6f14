use std::collections::HashSet;

use docket_shared::{StatsDto, TaskDto, TaskPriority};
use tracing::debug;

use crate::task::Task;

/// Fields the aggregator reads from a task, whichever side holds it.
pub trait AggregateRecord {
    fn description(&self) -> &str;
    fn section(&self) -> Option<&str>;
    fn priority(&self) -> TaskPriority;
    fn is_completed(&self) -> bool;
    fn is_duplicate(&self) -> bool;
    fn set_duplicate(&mut self, duplicate: bool);
}

impl AggregateRecord for Task {
    fn description(&self) -> &str {
        &self.task_description
    }

    fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    fn priority(&self) -> TaskPriority {
        self.priority
    }

    fn is_completed(&self) -> bool {
        self.is_completed
    }

    fn is_duplicate(&self) -> bool {
        self.is_duplicate
    }

    fn set_duplicate(&mut self, duplicate: bool) {
        self.is_duplicate = duplicate;
    }
}

impl AggregateRecord for TaskDto {
    fn description(&self) -> &str {
        &self.task_description
    }

    fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    fn priority(&self) -> TaskPriority {
        self.priority
    }

    fn is_completed(&self) -> bool {
        self.is_completed
    }

    fn is_duplicate(&self) -> bool {
        self.is_duplicate
    }

    fn set_duplicate(&mut self, duplicate: bool) {
        self.is_duplicate = duplicate;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicateKey {
    #[default]
    Description,
    DescriptionAndSection,
}

/// Lowercases, trims and collapses runs of whitespace.
pub fn normalize_description(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Flags every task whose normalized key was already seen earlier in
/// `tasks`; the first occurrence of each key stays unflagged. Returns the
/// number of tasks flagged.
pub fn mark_duplicates<T: AggregateRecord>(tasks: &mut [T], key: DuplicateKey) -> usize {
    let mut seen: HashSet<(String, Option<String>)> = HashSet::with_capacity(tasks.len());
    let mut flagged = 0usize;

    for task in tasks.iter_mut() {
        let description = normalize_description(task.description());
        let section = match key {
            DuplicateKey::Description => None,
            DuplicateKey::DescriptionAndSection => {
                Some(normalize_description(task.section().unwrap_or_default()))
            }
        };

        let duplicate = !seen.insert((description, section));
        task.set_duplicate(duplicate);
        if duplicate {
            flagged += 1;
        }
    }

    debug!(total = tasks.len(), flagged, ?key, "duplicate detection finished");
    flagged
}

pub fn compute_stats<T: AggregateRecord>(tasks: &[T]) -> StatsDto {
    let mut stats = StatsDto {
        total_tasks: tasks.len(),
        completed_tasks: 0,
        prioritized_tasks: 0,
        duplicate_tasks: 0,
    };
    for task in tasks {
        if task.is_completed() {
            stats.completed_tasks += 1;
        }
        if task.priority().is_set() {
            stats.prioritized_tasks += 1;
        }
        if task.is_duplicate() {
            stats.duplicate_tasks += 1;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use docket_shared::TaskPriority;

    use super::{DuplicateKey, compute_stats, mark_duplicates, normalize_description};
    use crate::task::Task;

    fn task(description: &str, section: Option<&str>) -> Task {
        let mut task = Task::draft(description, Utc::now());
        task.section = section.map(str::to_string);
        task
    }

    #[test]
    fn normalization_ignores_case_and_spacing() {
        assert_eq!(
            normalize_description("  Update   the\tBudget "),
            "update the budget"
        );
    }

    #[test]
    fn exactly_one_of_two_equal_descriptions_is_flagged() {
        let mut tasks = vec![
            task("Send the report", None),
            task("send  the REPORT", None),
        ];
        let flagged = mark_duplicates(&mut tasks, DuplicateKey::Description);

        assert_eq!(flagged, 1);
        assert!(!tasks[0].is_duplicate);
        assert!(tasks[1].is_duplicate);
    }

    #[test]
    fn distinct_descriptions_are_never_flagged() {
        let mut tasks = vec![task("One", None), task("Two", None), task("Three", None)];
        tasks[2].is_duplicate = true;

        assert_eq!(mark_duplicates(&mut tasks, DuplicateKey::Description), 0);
        assert!(tasks.iter().all(|t| !t.is_duplicate));
    }

    #[test]
    fn section_key_separates_equal_descriptions() {
        let mut tasks = vec![
            task("Approve plan", Some("Finance")),
            task("Approve plan", Some("Legal")),
            task("approve plan", Some("finance")),
        ];
        let flagged = mark_duplicates(&mut tasks, DuplicateKey::DescriptionAndSection);

        assert_eq!(flagged, 1);
        assert!(tasks[2].is_duplicate);
    }

    #[test]
    fn stats_count_in_one_pass() {
        let mut tasks = vec![task("a", None), task("b", None), task("a", None)];
        tasks[0].is_completed = true;
        tasks[1].priority = TaskPriority::Medium;
        mark_duplicates(&mut tasks, DuplicateKey::Description);

        let stats = compute_stats(&tasks);
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.prioritized_tasks, 1);
        assert_eq!(stats.duplicate_tasks, 1);
    }
}
