// Utility Functions
// Duration parsing, variable expansion, path globs, identifiers and project root detection

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error returned when a human duration ("1h 30m", "2 days") cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationError {
    pub input: String,
    pub message: String,
}

impl fmt::Display for DurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid duration '{}': {}", self.input, self.message)
    }
}

impl std::error::Error for DurationError {}

/// Parse a human-readable duration such as `"1h 30m"`, `"30 minutes"`,
/// `"2 weeks"` or a bare number of seconds (`"3600"`).
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let err = |message: &str| DurationError {
        input: input.to_string(),
        message: message.to_string(),
    };

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(err("empty duration"));
    }

    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut chars = trimmed.chars().peekable();
    let mut matched_any = false;

    while chars.peek().is_some() {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut number = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_digit()) {
            number.push(c);
            chars.next();
        }
        if number.is_empty() {
            return Err(err("expected a number"));
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_alphabetic()) {
            unit.push(c.to_ascii_lowercase());
            chars.next();
        }

        let multiplier = match unit.as_str() {
            "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
            "d" | "day" | "days" => 86_400,
            "w" | "wk" | "week" | "weeks" => 604_800,
            "mo" | "mos" | "month" | "months" => 2_592_000,
            "y" | "yr" | "yrs" | "year" | "years" => 31_536_000,
            other => return Err(err(&format!("unknown unit '{}'", other))),
        };

        let value: u64 = number.parse().map_err(|_| err("number out of range"))?;
        total = total
            .checked_add(value.saturating_mul(multiplier))
            .ok_or_else(|| err("duration out of range"))?;
        matched_any = true;
    }

    if !matched_any {
        return Err(err("no duration components"));
    }

    Ok(Duration::from_secs(total))
}

/// Parse an artifact expiry. `"never"` yields `None` (keep forever).
pub fn parse_expiry(input: &str) -> Result<Option<Duration>, DurationError> {
    if input.trim().eq_ignore_ascii_case("never") {
        return Ok(None);
    }
    parse_duration(input).map(Some)
}

/// Expand `$VAR` and `${VAR}` references using the given variables.
///
/// Unknown variables expand to an empty string; `$$` produces a literal `$`.
pub fn expand_variables(input: &str, variables: &HashMap<String, String>) -> String {
    let mut result = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '$' {
            result.push(chars[i]);
            i += 1;
            continue;
        }

        if chars.get(i + 1) == Some(&'$') {
            result.push('$');
            i += 2;
            continue;
        }

        if chars.get(i + 1) == Some(&'{') {
            if let Some(end) = chars[i + 2..].iter().position(|c| *c == '}') {
                let name: String = chars[i + 2..i + 2 + end].iter().collect();
                result.push_str(variables.get(&name).map(String::as_str).unwrap_or(""));
                i += end + 3;
                continue;
            }
        }

        let name: String = chars[i + 1..]
            .iter()
            .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
            .collect();
        if name.is_empty() {
            result.push('$');
            i += 1;
        } else {
            result.push_str(variables.get(&name).map(String::as_str).unwrap_or(""));
            i += name.len() + 1;
        }
    }

    result
}

/// Build a path matcher from CI-style patterns.
///
/// `*` does not cross `/`; `**` does. A pattern without wildcards matches the
/// path itself and everything below it, so `docs` and `docs/` cover `docs/a.md`.
pub fn build_glob_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.trim().trim_start_matches("./");
        let looks_like_glob = pattern.contains(['*', '?', '[', '{']);
        let base = pattern.trim_end_matches('/');

        if looks_like_glob {
            builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
        } else {
            builder.add(GlobBuilder::new(base).literal_separator(true).build()?);
            builder.add(
                GlobBuilder::new(&format!("{}/**", base))
                    .literal_separator(true)
                    .build()?,
            );
        }
    }
    builder.build()
}

/// Turn a ref name into a slug usable in cache keys and paths
/// (lowercase, `[a-z0-9-]`, at most 63 characters).
pub fn slugify(input: &str) -> String {
    let mut slug: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.truncate(63);
    slug.trim_matches('-').to_string()
}

/// Generate a short hexadecimal identifier (8 chars)
pub fn short_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let bump = COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9E37_79B9);
    format!(
        "{:08x}",
        (nanos as u32) ^ std::process::id().rotate_left(16) ^ bump
    )
}

/// Find the root of a git repository by walking up from the given starting path.
///
/// Returns `None` if no `.git` directory is found.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    for ancestor in start.ancestors() {
        if ancestor.join(".git").exists() {
            return Some(ancestor.to_path_buf());
        }
    }
    None
}

/// Resolve the project directory: the enclosing git repository root, or the
/// current directory when not inside a repository.
pub fn resolve_project_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_repo_root(&cwd).unwrap_or(cwd)
}
