use snapshotter_lib::snapshot::{procinfo, protocol::Pid};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

const INITIAL_DELAY: Duration = Duration::from_millis(20);
const MAX_DELAY: Duration = Duration::from_millis(500);

/// A condition that never became true
#[derive(Debug)]
pub struct WaitError {
    what: String,
    attempts: u32,
    waited: Duration,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timed out after {} attempts over {:?} waiting for {}",
            self.attempts, self.waited, self.what
        )
    }
}

impl std::error::Error for WaitError {}

/// Poll `check` with exponential backoff until it yields a value or
/// `timeout` elapses.
pub fn poll_until<T>(
    what: &str,
    timeout: Duration,
    mut check: impl FnMut() -> Option<T>,
) -> Result<T, WaitError> {
    let start = Instant::now();
    let mut delay = INITIAL_DELAY;
    let mut attempts = 0;

    loop {
        attempts += 1;
        if let Some(value) = check() {
            return Ok(value);
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(WaitError {
                what: what.to_string(),
                attempts,
                waited: start.elapsed(),
            });
        }
        thread::sleep(delay.min(remaining));
        delay = (delay * 2).min(MAX_DELAY);
    }
}

/// Wait until `path` exists and its content satisfies `predicate`
pub fn wait_for_file_content(
    path: &Path,
    predicate: impl Fn(&str) -> bool,
    timeout: Duration,
) -> Result<String, WaitError> {
    poll_until(&path.display().to_string(), timeout, || {
        match fs::read_to_string(path) {
            Ok(content) if predicate(&content) => Some(content),
            Ok(_) => None,
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(_) => None,
        }
    })
}

/// Wait until a freshly spawned child has exec'd `program`; before that its
/// comm and cmdline are still the parent's.
pub fn wait_for_exec(pid: Pid, program: &str, timeout: Duration) -> Result<(), WaitError> {
    poll_until(&format!("pid {} to exec {}", pid, program), timeout, || {
        let argv = procinfo::read_argument_vector(pid)?;
        (procinfo::read_short_name(pid)? == program && argv.first()? == program).then_some(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn wait_for_file_content_returns_existing_content() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("value.txt");
        fs::write(&file, "ready").unwrap();

        let content =
            wait_for_file_content(&file, |text| text.contains("ready"), Duration::from_secs(1))
                .unwrap();
        assert_eq!(content, "ready");
    }

    #[test]
    fn wait_for_file_content_times_out_with_context() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("missing.txt");

        let err = wait_for_file_content(&file, |_| true, Duration::from_millis(1)).unwrap_err();
        assert!(err.to_string().contains("missing.txt"));
    }
}
