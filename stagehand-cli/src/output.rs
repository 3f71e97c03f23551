// Output formatting helpers for CLI commands

use pipeline_engine::{JobRun, JobStatus};

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

/// Print a warning message
pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

/// Print an info message
pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

/// Print a dim success message
pub fn dim_success(message: &str) {
    eprintln!("\x1b[32m{}\x1b[0m", message);
}

/// Print a dim failure message
pub fn dim_failure(message: &str) {
    eprintln!("\x1b[31m{}\x1b[0m", message);
}

/// Print a stage header
pub fn stage_header(name: &str, total_jobs: usize) {
    eprintln!("\x1b[1;34m  Stage\x1b[0m '{}' ({} jobs)", name, total_jobs);
}

/// Print job output (indented)
pub fn step_output(line: &str) {
    println!("        | {}", line);
}

/// Print job error output (indented, red)
pub fn step_error(line: &str) {
    eprintln!("\x1b[31m        | {}\x1b[0m", line);
}

/// Print a header line
pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

fn status_symbol(status: JobStatus) -> (&'static str, &'static str) {
    match status {
        JobStatus::Success => ("\u{2713}", "32"),
        JobStatus::Failed => ("\u{2717}", "31"),
        JobStatus::Skipped | JobStatus::Canceled => ("-", "33"),
        JobStatus::ManualWait => ("\u{25b6}", "36"),
        _ => ("\u{2026}", "2"),
    }
}

/// Print one row of the final job table
pub fn job_line(run: &JobRun) {
    let (symbol, color) = status_symbol(run.status);
    let mut line = format!(
        "\x1b[{}m  {}\x1b[0m  {:<24} {:<10} {:<12}",
        color,
        symbol,
        run.job,
        run.stage,
        run.status.as_str()
    );
    if let Some(duration) = run.duration() {
        line.push_str(&format!(" {:>7.2}s", duration.as_secs_f64()));
    }
    if run.attempts > 1 {
        line.push_str(&format!(" ({} attempts)", run.attempts));
    }
    if let Some(cause) = &run.failure {
        let note = if run.allow_failure { " (allowed)" } else { "" };
        line.push_str(&format!("  {}{}", cause, note));
    } else if let Some(reason) = &run.skip_reason {
        line.push_str(&format!("  {}", reason));
    }
    eprintln!("{}", line);
}
