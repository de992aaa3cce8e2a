//! POSIX path helpers for remote paths.
//!
//! Remote paths are plain strings: the remote host is always POSIX, whatever
//! the local platform is.

use std::borrow::Cow;

/// Check if `path` is absolute.
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Join `name` onto `dir` with exactly one separator.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Directory part of `path`.
///
/// `/a/b` gives `/a`, `/a` gives `/`, and `/a/b/` gives `/a/b`.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        None => "",
        Some(idx) => {
            let head = &path[..=idx];
            let trimmed = head.trim_end_matches('/');
            if trimmed.is_empty() {
                &head[..1]
            } else {
                trimmed
            }
        }
    }
}

/// Final component of `path`; empty if it ends with a separator.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        None => path,
        Some(idx) => &path[idx + 1..],
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_./=@%+:,-".contains(c)
}

/// Quote `word` for a POSIX shell command line.
///
/// Words made only of safe characters are returned unchanged.
pub fn quote(word: &str) -> Cow<'_, str> {
    if word.is_empty() {
        return Cow::Borrowed("''");
    }
    if word.chars().all(is_shell_safe) {
        return Cow::Borrowed(word);
    }
    Cow::Owned(format!("'{}'", word.replace('\'', r#"'"'"'"#)))
}
