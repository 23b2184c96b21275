/// Task file codec.
///
/// A task file is a fenced key/value header followed by free-form body text:
///   ---
///   id: t-18c2f-1
///   title: Write the release notes
///   status: todo
///   ...
///   ---
///   body text, preserved byte-for-byte
///
/// Decoding never panics on bad input; it returns a `ParseFailure` that keeps
/// whatever header fields could be read so a directory scan can report the
/// file and move on.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::types::{Priority, Status, Task};

pub const TASK_FILE_EXTENSION: &str = "md";
const HEADER_FENCE: &str = "---";
const SLUG_MAX_LEN: usize = 50;
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}: {}", .path.display(), .reason)]
pub struct ParseFailure {
    pub path: PathBuf,
    pub reason: String,
    /// Header fields as they appeared in the file, for diagnostics.
    pub raw_fields: BTreeMap<String, String>,
}

/// Decode file bytes into a task.
pub fn decode(path: &Path, bytes: &[u8]) -> Result<Task, ParseFailure> {
    let fail = |reason: String, raw_fields: BTreeMap<String, String>| ParseFailure {
        path: path.to_path_buf(),
        reason,
        raw_fields,
    };

    let text = std::str::from_utf8(bytes)
        .map_err(|e| fail(format!("file is not valid UTF-8: {}", e), BTreeMap::new()))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let (header_lines, body) =
        split_header(text).ok_or_else(|| fail("missing header block".to_string(), BTreeMap::new()))?;

    let mut raw_fields = BTreeMap::new();
    for (index, line) in header_lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match trimmed.split_once(':') {
            Some((key, value)) => {
                raw_fields.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => {
                return Err(fail(
                    format!("malformed header line {}: {:?}", index + 2, trimmed),
                    raw_fields,
                ));
            }
        }
    }

    match task_from_fields(&raw_fields, body, path) {
        Ok(task) => Ok(task),
        Err(reason) => Err(fail(reason, raw_fields)),
    }
}

/// Split `text` into header lines and the body that follows the closing fence.
fn split_header(text: &str) -> Option<(Vec<&str>, &str)> {
    let mut rest = text;
    let first = next_line(&mut rest)?;
    if first.trim_end() != HEADER_FENCE {
        return None;
    }

    let mut header = Vec::new();
    loop {
        let line = next_line(&mut rest)?;
        if line.trim_end() == HEADER_FENCE {
            return Some((header, rest));
        }
        header.push(line);
    }
}

/// Pop one line (without its terminator) off the front of `rest`.
fn next_line<'a>(rest: &mut &'a str) -> Option<&'a str> {
    if rest.is_empty() {
        return None;
    }
    let (line, remainder) = match rest.find('\n') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (*rest, ""),
    };
    *rest = remainder;
    Some(line.strip_suffix('\r').unwrap_or(line))
}

fn task_from_fields(
    fields: &BTreeMap<String, String>,
    body: &str,
    path: &Path,
) -> Result<Task, String> {
    let required = |key: &str| -> Result<String, String> {
        let raw = fields
            .get(key)
            .ok_or_else(|| format!("missing required field '{}'", key))?;
        parse_scalar(raw).map_err(|e| format!("field '{}': {}", key, e))
    };
    let optional = |key: &str| -> Result<Option<String>, String> {
        match fields.get(key) {
            None => Ok(None),
            Some(raw) if raw.is_empty() || raw == "null" || raw == "~" => Ok(None),
            Some(raw) => parse_scalar(raw)
                .map(|v| Some(v).filter(|v| !v.is_empty()))
                .map_err(|e| format!("field '{}': {}", key, e)),
        }
    };

    let id = required("id")?;
    if id.trim().is_empty() {
        return Err("field 'id' is empty".to_string());
    }
    if !is_safe_id(&id) {
        return Err(format!("field 'id': {:?} cannot name a file in the task directory", id));
    }
    let title = required("title")?;
    let status = required("status")?.parse::<Status>()?;
    let priority = match optional("priority")? {
        Some(value) => value.parse::<Priority>()?,
        None => Priority::default(),
    };
    let labels = match fields.get("labels") {
        Some(raw) => parse_list(raw).map_err(|e| format!("field 'labels': {}", e))?,
        None => BTreeSet::new(),
    };
    let assignee = optional("assignee")?;
    let created = parse_date(&required("created")?).map_err(|e| format!("field 'created': {}", e))?;
    let due = match optional("due")? {
        Some(value) => Some(parse_date(&value).map_err(|e| format!("field 'due': {}", e))?),
        None => None,
    };
    let order = match optional("order")? {
        Some(value) => parse_order(&value)?,
        None => 0,
    };

    Ok(Task {
        id,
        title,
        status,
        priority,
        labels,
        assignee,
        created,
        due,
        order,
        content: body.to_string(),
        file_path: path.to_path_buf(),
    })
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|dt| dt.date_naive()))
        .map_err(|_| format!("invalid date '{}'", value))
}

fn parse_order(value: &str) -> Result<i64, String> {
    if let Ok(n) = value.parse::<i64>() {
        return Ok(n);
    }
    // Tolerate integral floats written by other tools ("3.0").
    match value.parse::<f64>() {
        Ok(n) if n.is_finite() && n.fract() == 0.0 => Ok(n as i64),
        _ => Err(format!("field 'order': invalid integer '{}'", value)),
    }
}

/// Bare scalars are taken verbatim; quoted scalars use JSON string escaping.
fn parse_scalar(raw: &str) -> Result<String, String> {
    if raw.starts_with('"') {
        serde_json::from_str::<String>(raw).map_err(|e| format!("bad quoted string: {}", e))
    } else {
        Ok(raw.to_string())
    }
}

/// Parse a flow list such as `[bug, "needs review", ui]`.
fn parse_list(raw: &str) -> Result<BTreeSet<String>, String> {
    let inner = match raw.strip_prefix('[') {
        Some(rest) => rest
            .strip_suffix(']')
            .ok_or_else(|| "unterminated list".to_string())?,
        None => raw,
    };

    let mut items = BTreeSet::new();
    let mut rest = inner.trim_start();
    while !rest.is_empty() {
        // Quoted items are kept even when empty; bare empty items are skipped.
        let remainder = if rest.starts_with('"') {
            let end = quoted_end(rest).ok_or_else(|| "unterminated quoted item".to_string())?;
            items.insert(parse_scalar(&rest[..end])?);
            &rest[end..]
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let item = rest[..end].trim();
            if !item.is_empty() {
                items.insert(item.to_string());
            }
            &rest[end..]
        };

        let remainder = remainder.trim_start();
        rest = match remainder.strip_prefix(',') {
            Some(after) => after.trim_start(),
            None if remainder.is_empty() => remainder,
            None => return Err(format!("unexpected text in list: {:?}", remainder)),
        };
    }
    Ok(items)
}

/// Byte index just past the closing quote of a JSON string starting at 0.
fn quoted_end(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(i + 1),
            _ => {}
        }
    }
    None
}

fn needs_quoting(value: &str, in_list: bool) -> bool {
    value.is_empty()
        || value != value.trim()
        || value == "null"
        || value == "~"
        || value.starts_with(['"', '[', '#'])
        || value.chars().any(|c| c.is_control())
        || (in_list && value.contains([',', ']', '"']))
}

fn write_scalar(out: &mut String, value: &str, in_list: bool) {
    if needs_quoting(value, in_list) {
        // Serializing a &str cannot fail.
        out.push_str(&serde_json::to_string(value).unwrap_or_default());
    } else {
        out.push_str(value);
    }
}

/// Encode a task into file contents. Field order is fixed; `assignee` and
/// `due` are left out when absent.
pub fn encode(task: &Task) -> String {
    let mut out = String::with_capacity(task.content.len() + 256);
    out.push_str(HEADER_FENCE);
    out.push('\n');

    out.push_str("id: ");
    write_scalar(&mut out, &task.id, false);
    out.push_str("\ntitle: ");
    write_scalar(&mut out, &task.title, false);
    out.push_str("\nstatus: ");
    out.push_str(task.status.as_str());
    out.push_str("\npriority: ");
    out.push_str(task.priority.as_str());

    out.push_str("\nlabels: [");
    for (i, label) in task.labels.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_scalar(&mut out, label, true);
    }
    out.push(']');

    if let Some(assignee) = task.assignee.as_deref().filter(|a| !a.is_empty()) {
        out.push_str("\nassignee: ");
        write_scalar(&mut out, assignee, false);
    }
    out.push_str("\ncreated: ");
    out.push_str(&task.created.format(DATE_FORMAT).to_string());
    if let Some(due) = task.due {
        out.push_str("\ndue: ");
        out.push_str(&due.format(DATE_FORMAT).to_string());
    }
    out.push_str("\norder: ");
    out.push_str(&task.order.to_string());
    out.push('\n');

    out.push_str(HEADER_FENCE);
    out.push('\n');
    out.push_str(&task.content);
    out
}

fn slug_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("valid slug regex"))
}

/// Filename-friendly form of a title. Cosmetic only, never used for identity.
pub fn slug(title: &str) -> String {
    let folded: String = title
        .nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();
    let dashed = slug_separator().replace_all(&folded, "-");
    dashed.trim_matches('-').chars().take(SLUG_MAX_LEN).collect()
}

/// Whether `id` can prefix a filename without leaving the task directory or
/// producing a hidden file.
pub fn is_safe_id(id: &str) -> bool {
    !id.trim().is_empty() && !id.starts_with('.') && !id.contains(['/', '\\', '\0'])
}

/// `{id}-{slug}.md`, or `{id}.md` when the title has no usable characters.
pub fn filename(id: &str, title: &str) -> String {
    let slug = slug(title);
    if slug.is_empty() {
        format!("{}.{}", id, TASK_FILE_EXTENSION)
    } else {
        format!("{}-{}.{}", id, slug, TASK_FILE_EXTENSION)
    }
}

/// Whether `path` looks like a task file (not hidden, not a temp or backup).
pub fn is_task_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.')
        && !name.ends_with('~')
        && path.extension().and_then(|e| e.to_str()) == Some(TASK_FILE_EXTENSION)
}
