//! Filename helpers shared by the analyzer and the artifact store.

/// Title used when the source title is missing or sanitizes to nothing.
pub const DEFAULT_TITLE: &str = "video";

/// Maximum number of characters kept from a sanitized title.
pub const MAX_TITLE_CHARS: usize = 80;

/// Maximum length of a job id.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Characters that are invalid in filenames on at least one supported platform.
const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Turn an arbitrary video title into a filesystem-safe filename component.
///
/// Invalid and control characters become `_`, whitespace runs collapse to a
/// single space, leading/trailing dots, underscores and spaces are stripped and
/// the result is capped at [`MAX_TITLE_CHARS`] characters. Falls back to
/// [`DEFAULT_TITLE`] when nothing usable remains.
pub fn sanitize_title(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_TITLE_CHARS * 4));
    let mut last_was_space = false;

    for c in raw.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
            continue;
        }
        last_was_space = false;
        if c.is_control() || INVALID_FILENAME_CHARS.contains(&c) {
            out.push('_');
        } else {
            out.push(c);
        }
    }

    let capped: String = out
        .trim_matches(|c: char| c == '.' || c == '_' || c == ' ')
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    let capped = capped.trim_end_matches(|c: char| c == '.' || c == ' ');

    if capped.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        capped.to_string()
    }
}

/// Job ids end up in filenames after a `_` separator, so only `[A-Za-z0-9-]`
/// is accepted. A `_` in the id would make `<title>_<job_id>` ambiguous.
pub fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= MAX_JOB_ID_LEN
        && job_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
