use crate::error::{ProcessingError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Local, NaiveDateTime};
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Substitute strftime tokens (`%Y`, `%m`, `%d`, `%H`, ...) in a file template
pub fn expand_date_template(template: &str, datetime: &NaiveDateTime) -> Result<String> {
    let items: Vec<Item> = StrftimeItems::new(template).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(ProcessingError::Config(format!(
            "Invalid date template: '{}'",
            template
        )));
    }

    let mut expanded = String::with_capacity(template.len() + 16);
    write!(expanded, "{}", datetime.format_with_items(items.into_iter())).map_err(|_| {
        ProcessingError::Config(format!("Cannot format date template: '{}'", template))
    })?;
    Ok(expanded)
}

/// Replace the observation key placeholders `%t` and `!k`
pub fn substitute_key(template: &str, key: &str) -> String {
    template.replace("%t", key).replace("!k", key)
}

/// Expand a `*`/`?` wildcard in the final path component into matching files.
///
/// Paths without a wildcard are returned unchanged, whether or not they exist.
pub fn expand_wildcard(path: &str) -> Result<Vec<PathBuf>> {
    let path_ref = Path::new(path);
    let file_pattern = match path_ref.file_name().and_then(|f| f.to_str()) {
        Some(name) if name.contains(|c: char| c == '*' || c == '?') => name,
        _ => return Ok(vec![PathBuf::from(path)]),
    };

    let dir = match path_ref.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let entry_path = entry.path();
        if !entry_path.is_file() {
            continue;
        }
        if let Some(name) = entry_path.file_name().and_then(|f| f.to_str()) {
            if wildcard_match(file_pattern, name) {
                files.push(entry_path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Match `name` against a pattern where `*` is any run and `?` any single char
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    let (mut p, mut n) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = n;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            n = resume;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Generate default matched output filename: cfobs-matched-{YYMMDD}.{extension}
pub fn generate_default_output_filename(extension: &str) -> PathBuf {
    let now = Local::now();
    let filename = format!(
        "cfobs-matched-{:02}{:02}{:02}.{}",
        now.year() % 100,
        now.month(),
        now.day(),
        extension
    );
    PathBuf::from("output").join(filename)
}
