#![cfg(target_os = "linux")]

use std::ops;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gyre::{Completion, Context, OpId};

/// Run a test body against a fresh context (depth 32) with logging wired
/// up, shutting the context down afterwards.
pub fn with_test_env<U>(
    f: impl FnOnce(&Context) -> Result<U, Box<dyn std::error::Error>>,
) -> Result<U, Box<dyn std::error::Error>> {
    with_test_env_sized(32, f)
}

pub fn with_test_env_sized<U>(
    concurrency: u32,
    f: impl FnOnce(&Context) -> Result<U, Box<dyn std::error::Error>>,
) -> Result<U, Box<dyn std::error::Error>> {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .is_test(true)
        .try_init();

    let ctx = Context::init(concurrency)?;
    let out = f(&ctx)?;
    ctx.shutdown()?;
    Ok(out)
}

/// Submit whatever is queued and poll until `want` completions have
/// surfaced, with a per-poll deadline so a wedged test fails instead of
/// hanging.
pub fn drive(ctx: &Context, want: usize) -> Result<Vec<Completion>, Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    ctx.submit()?;
    while out.len() < want {
        let missing = want - out.len();
        let n = ctx.poll(&mut out, missing, Some(Duration::from_secs(5)))?;
        if n == 0 {
            return Err(format!(
                "timed out with {} of {} completions",
                out.len(),
                want
            )
            .into());
        }
    }
    Ok(out)
}

/// Remove and return the completion for `id`, if it surfaced.
#[allow(dead_code)]
pub fn take_completion(completions: &mut Vec<Completion>, id: OpId) -> Option<Completion> {
    let idx = completions.iter().position(|c| c.id() == id)?;
    Some(completions.remove(idx))
}

/// A test directory under /tmp named after the current thread. Cargo
/// names test threads after the test, so each test gets its own
/// directory. Cleaned up on drop.
#[derive(Debug, Clone)]
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new() -> Self {
        let thread = std::thread::current();
        let thread_name = thread.name().expect("no thread name");
        let sanitized = thread_name.replace("::", "-");
        let path = std::env::temp_dir().join("gyre-tests").join(sanitized);
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).expect("could not create directory");
        Self { path }
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}

impl ops::Deref for TestDir {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

impl AsRef<Path> for TestDir {
    fn as_ref(&self) -> &Path {
        self.path.as_path()
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
