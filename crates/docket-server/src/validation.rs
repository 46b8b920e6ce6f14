use anyhow::anyhow;
use docket_shared::{RegisterRequest, TaskCreate, TaskPatch};
use regex::Regex;

const USERNAME_PATTERN: &str = r"^[A-Za-z0-9_]{3,30}$";
const EMAIL_PATTERN: &str = r"^[^\s@]+@[^\s@]+\.[^\s@]+$";
const PASSWORD_SPECIALS: &str = "@$!%*?&";

const MAX_EMAIL: usize = 100;
const MIN_PASSWORD: usize = 6;
const MAX_PASSWORD: usize = 128;
const MAX_DESCRIPTION: usize = 1000;
const MAX_SECTION: usize = 200;
const MAX_RESPONSIBLE: usize = 100;
const MAX_TIMELINE: usize = 100;

/// A registration that passed validation, normalized for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub email: String,
}

/// `Ok(Err(message))` is a client error; the outer `Err` is internal.
pub fn validate_registration(req: &RegisterRequest) -> anyhow::Result<Result<NewUser, String>> {
    let username_re = Regex::new(USERNAME_PATTERN)
        .map_err(|e| anyhow!("internal regex compile failure: {e}"))?;
    let email_re =
        Regex::new(EMAIL_PATTERN).map_err(|e| anyhow!("internal regex compile failure: {e}"))?;

    let mut problems = Vec::new();

    let username = req.username.trim();
    if !username_re.is_match(username) {
        problems.push(
            "username must be 3-30 characters of letters, digits or underscore".to_string(),
        );
    }

    let email = req.email.trim().to_lowercase();
    if email.is_empty() {
        problems.push("email is required".to_string());
    } else if email.chars().count() > MAX_EMAIL {
        problems.push(format!("email must be at most {MAX_EMAIL} characters"));
    } else if !email_re.is_match(&email) {
        problems.push("email is not valid".to_string());
    }

    let password_len = req.password.chars().count();
    if !(MIN_PASSWORD..=MAX_PASSWORD).contains(&password_len) {
        problems.push(format!(
            "password must be {MIN_PASSWORD}-{MAX_PASSWORD} characters"
        ));
    }

    if !problems.is_empty() {
        return Ok(Err(problems.join(", ")));
    }

    if !password_is_strong(&req.password) {
        return Ok(Err(
            "password must contain an uppercase letter, a lowercase letter and a digit"
                .to_string(),
        ));
    }

    Ok(Ok(NewUser {
        username: username.to_string(),
        email,
    }))
}

fn password_is_strong(password: &str) -> bool {
    password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || PASSWORD_SPECIALS.contains(c))
}

fn check_len(problems: &mut Vec<String>, field: &str, value: Option<&str>, max: usize) {
    if let Some(value) = value
        && value.chars().count() > max
    {
        problems.push(format!("{field} must be at most {max} characters"));
    }
}

pub fn validate_task(create: &TaskCreate) -> Result<(), String> {
    let mut problems = Vec::new();
    if create.task_description.trim().is_empty() {
        problems.push("taskDescription is required".to_string());
    }
    check_len(
        &mut problems,
        "taskDescription",
        Some(create.task_description.as_str()),
        MAX_DESCRIPTION,
    );
    check_len(&mut problems, "section", create.section.as_deref(), MAX_SECTION);
    check_len(
        &mut problems,
        "responsible",
        create.responsible.as_deref(),
        MAX_RESPONSIBLE,
    );
    check_len(&mut problems, "timeline", create.timeline.as_deref(), MAX_TIMELINE);

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join(", "))
    }
}

/// Same limits as creation, applied only to the fields present.
pub fn validate_patch(patch: &TaskPatch) -> Result<(), String> {
    let mut problems = Vec::new();
    if let Some(description) = patch.task_description.as_deref() {
        if description.trim().is_empty() {
            problems.push("taskDescription must not be empty".to_string());
        }
        check_len(&mut problems, "taskDescription", Some(description), MAX_DESCRIPTION);
    }
    check_len(
        &mut problems,
        "section",
        patch.section.as_ref().and_then(Option::as_deref),
        MAX_SECTION,
    );
    check_len(
        &mut problems,
        "responsible",
        patch.responsible.as_ref().and_then(Option::as_deref),
        MAX_RESPONSIBLE,
    );
    check_len(
        &mut problems,
        "timeline",
        patch.timeline.as_ref().and_then(Option::as_deref),
        MAX_TIMELINE,
    );

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join(", "))
    }
}
