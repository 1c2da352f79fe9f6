//! POSIX runner: every execution gets its own process group and writes its
//! output and exit code into a capture directory, so it survives (and can
//! be finalized after) a restart of the orchestrator.
//!
//! Capture layout, `<base>/_meta/runs/<job_id>/`:
//! - `pid`: process group id plus the leader's start time and boot id
//! - `stdout.log`, `stderr.log`
//! - `exit_code`: written by the shell wrapper when the pipeline exits

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use super::{Invocation, OutputObserver, PipelineRunner, RunOutcome};
use crate::config::JobsConfig;
use crate::error::RunnerError;
use crate::job::request::MAX_TIMEOUT_SECS;
use crate::sanitize::{truncate_tail, TRUNCATION_MARKER};
use crate::store::atomic::{read_json, write_json_atomic};

const PID_FILE: &str = "pid";
const STDOUT_FILE: &str = "stdout.log";
const STDERR_FILE: &str = "stderr.log";
const EXIT_FILE: &str = "exit_code";
const EXIT_TMP_FILE: &str = ".exit_code.tmp";
const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Runs `"$@"` and publishes its exit status with a rename, so a reader
/// never sees a half-written code.
const WRAPPER_SCRIPT: &str = r#""$@"
code=$?
printf '%s' "$code" > "$LOANJOBS_EXIT_TMP" && mv -f "$LOANJOBS_EXIT_TMP" "$LOANJOBS_EXIT_FILE"
exit "$code""#;

#[derive(Debug, Clone)]
pub struct ProcessGroupRunner {
    capture_root: PathBuf,
    stdout_max_bytes: usize,
    stderr_max_bytes: usize,
    kill_grace: Duration,
    poll_interval: Duration,
}

impl ProcessGroupRunner {
    pub fn new(config: &JobsConfig) -> Self {
        Self {
            capture_root: config.base_path.join("_meta").join("runs"),
            stdout_max_bytes: config.limits.stdout_max_bytes,
            stderr_max_bytes: config.limits.stderr_max_bytes,
            kill_grace: config.timeouts.kill_grace(),
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn capture_dir(&self, job_id: &str) -> PathBuf {
        self.capture_root.join(job_id)
    }

    fn prepare_capture_dir(&self, job_id: &str) -> Result<PathBuf, RunnerError> {
        let dir = self.capture_dir(job_id);
        if dir.exists() {
            warn!(job_id, "Removing leftover capture directory");
            fs::remove_dir_all(&dir).map_err(|e| RunnerError::Capture {
                path: dir.clone(),
                source: e,
            })?;
        }
        fs::create_dir_all(&dir).map_err(|e| RunnerError::Capture {
            path: dir.clone(),
            source: e,
        })?;
        Ok(dir)
    }

    fn spawn(&self, invocation: &Invocation, dir: &Path) -> Result<Child, RunnerError> {
        let capture_file = |name: &str| {
            let path = dir.join(name);
            File::create(&path).map_err(|e| RunnerError::Capture { path, source: e })
        };
        let stdout = capture_file(STDOUT_FILE)?;
        let stderr = capture_file(STDERR_FILE)?;

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(WRAPPER_SCRIPT)
            .arg("loanjobs-run")
            .arg(&invocation.program)
            .args(&invocation.args)
            .envs(&invocation.env)
            .env("LOANJOBS_JOB_ID", &invocation.job_id)
            .env("LOANJOBS_EXIT_FILE", dir.join(EXIT_FILE))
            .env("LOANJOBS_EXIT_TMP", dir.join(EXIT_TMP_FILE))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        if let Some(cwd) = &invocation.working_directory {
            command.current_dir(cwd);
        }

        command.spawn().map_err(|e| RunnerError::Spawn {
            program: invocation.program.clone(),
            source: e,
        })
    }

    /// Exit code published by the wrapper, if it got that far.
    fn read_exit_code(dir: &Path) -> Option<i32> {
        fs::read_to_string(dir.join(EXIT_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// A `pid` file without a verifiable identity reads as absent.
    fn read_leader(dir: &Path) -> Option<GroupLeader> {
        read_json::<GroupLeader>(&dir.join(PID_FILE))
            .ok()
            .flatten()
            .filter(|leader| leader.pgid > 0)
    }

    fn record_leader(dir: &Path, job_id: &str, pgid: Pid) {
        let Some(leader) = GroupLeader::of(pgid.as_raw()) else {
            warn!(job_id, "Cannot identify process group leader; the job will not survive a restart");
            return;
        };
        if let Err(e) = write_json_atomic(&dir.join(PID_FILE), &leader) {
            warn!("Failed to record pid for job {}: {}", job_id, e);
        }
    }

    fn collect(&self, dir: &Path, exit_code: Option<i32>, timed_out: bool) -> RunOutcome {
        let outcome = RunOutcome {
            exit_code,
            stdout: read_tail(&dir.join(STDOUT_FILE), self.stdout_max_bytes),
            stderr: read_tail(&dir.join(STDERR_FILE), self.stderr_max_bytes),
            timed_out,
        };

        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("Failed to remove capture directory {}: {}", dir.display(), e);
        }
        outcome
    }

    /// SIGTERM to the group, SIGKILL after the grace period. `reap` is
    /// polled so a direct child does not linger as a zombie.
    fn terminate_group(&self, pgid: Pid, mut reap: impl FnMut()) {
        info!(pgid = pgid.as_raw(), "Terminating process group");
        let _ = killpg(pgid, Signal::SIGTERM);

        let deadline = deadline_after(self.kill_grace);
        while Instant::now() < deadline {
            reap();
            if !group_alive(pgid) {
                return;
            }
            thread::sleep(self.poll_interval.min(Duration::from_millis(100)));
        }

        warn!(pgid = pgid.as_raw(), "Process group ignored SIGTERM; sending SIGKILL");
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

impl PipelineRunner for ProcessGroupRunner {
    fn run(
        &self,
        invocation: &Invocation,
        observer: &dyn OutputObserver,
    ) -> Result<RunOutcome, RunnerError> {
        let _span = info_span!("pipeline_process",
            job_id = %invocation.job_id,
            program = %invocation.program,
        )
        .entered();

        let dir = self.prepare_capture_dir(&invocation.job_id)?;
        let mut child = self.spawn(invocation, &dir)?;
        let pgid = Pid::from_raw(child.id() as i32);

        // Recovery in a later process finds the group through this file.
        Self::record_leader(&dir, &invocation.job_id, pgid);
        info!(pid = pgid.as_raw(), "Pipeline started");

        let mut tail = LineTail::open(&dir.join(STDOUT_FILE));
        let deadline = deadline_after(invocation.timeout);
        let mut timed_out = false;

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) => {
                    let _ = killpg(pgid, Signal::SIGKILL);
                    let _ = child.wait();
                    return Err(RunnerError::Wait(e));
                }
            }

            tail.poll(observer);

            if Instant::now() >= deadline {
                warn!(
                    "Job {} exceeded timeout of {}s",
                    invocation.job_id,
                    invocation.timeout.as_secs()
                );
                timed_out = true;
                self.terminate_group(pgid, || {
                    let _ = child.try_wait();
                });
                break child.wait().ok();
            }

            thread::sleep(self.poll_interval);
        };

        tail.poll(observer);
        tail.flush(observer);

        let exit_code = if timed_out {
            None
        } else {
            Self::read_exit_code(&dir).or_else(|| status.and_then(|s| s.code()))
        };
        debug!(?exit_code, timed_out, "Pipeline finished");

        Ok(self.collect(&dir, exit_code, timed_out))
    }

    fn is_alive(&self, job_id: &str) -> bool {
        let dir = self.capture_dir(job_id);
        if dir.join(EXIT_FILE).exists() {
            return false;
        }
        Self::read_leader(&dir).map_or(false, |leader| leader.is_running())
    }

    fn await_detached(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<Option<RunOutcome>, RunnerError> {
        let dir = self.capture_dir(job_id);
        if !dir.is_dir() {
            return Ok(None);
        }

        let _span = info_span!("detached_wait", job_id = %job_id).entered();
        let leader = Self::read_leader(&dir);
        let deadline = deadline_after(timeout);
        let mut timed_out = false;

        while let Some(leader) = &leader {
            if dir.join(EXIT_FILE).exists() || !leader.is_running() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("Detached job {} exceeded timeout; terminating", job_id);
                timed_out = true;
                self.terminate_group(leader.pid(), || {});
                break;
            }
            thread::sleep(self.poll_interval);
        }

        let exit_code = if timed_out {
            None
        } else {
            Self::read_exit_code(&dir)
        };
        Ok(Some(self.collect(&dir, exit_code, timed_out)))
    }
}

/// The shell wrapper that leads a job's process group, pinned by start time
/// and boot so a recycled pid never passes for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct GroupLeader {
    pgid: i32,
    /// Field 22 of `/proc/<pid>/stat`, in clock ticks since boot.
    start_ticks: u64,
    boot_id: String,
}

impl GroupLeader {
    fn of(pid: i32) -> Option<Self> {
        Some(Self {
            pgid: pid,
            start_ticks: process_start_ticks(pid)?,
            boot_id: boot_id()?,
        })
    }

    fn pid(&self) -> Pid {
        Pid::from_raw(self.pgid)
    }

    /// The recorded leader still exists and still leads a live group.
    fn is_running(&self) -> bool {
        GroupLeader::of(self.pgid).as_ref() == Some(self) && group_alive(self.pid())
    }
}

fn process_start_ticks(pid: i32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces and parentheses; fields after it
    // start at field 3 (state).
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}

fn boot_id() -> Option<String> {
    let id = fs::read_to_string(BOOT_ID_PATH).ok()?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// `now + wait`, with the wait capped so no duration can overflow.
fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    let wait = wait.min(Duration::from_secs(MAX_TIMEOUT_SECS));
    now.checked_add(wait).unwrap_or(now)
}

/// Signal 0 to the group: it exists if delivery succeeds or is merely
/// not permitted.
fn group_alive(pgid: Pid) -> bool {
    match killpg(pgid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Last `max_bytes` of a capture file, marked when truncated.
fn read_tail(path: &Path, max_bytes: usize) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(max_bytes as u64);

    let mut bytes = Vec::new();
    if file.seek(SeekFrom::Start(start)).is_err() || file.read_to_end(&mut bytes).is_err() {
        return String::new();
    }

    // Lossy decoding can grow the text, so bound it again.
    let bounded = truncate_tail(&String::from_utf8_lossy(&bytes), max_bytes);
    if start > 0 && !bounded.starts_with(TRUNCATION_MARKER) {
        format!("{}{}", TRUNCATION_MARKER, bounded)
    } else {
        bounded
    }
}

/// Follows a growing capture file and hands complete lines to an observer.
struct LineTail {
    file: Option<File>,
    path: PathBuf,
    pending: Vec<u8>,
}

impl LineTail {
    fn open(path: &Path) -> Self {
        Self {
            file: File::open(path).ok(),
            path: path.to_path_buf(),
            pending: Vec::new(),
        }
    }

    fn poll(&mut self, observer: &dyn OutputObserver) {
        if self.file.is_none() {
            self.file = File::open(&self.path).ok();
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };

        if file.read_to_end(&mut self.pending).is_err() {
            return;
        }

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            observer.on_stdout_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    /// Emits a trailing line without newline.
    fn flush(&mut self, observer: &dyn OutputObserver) {
        if !self.pending.is_empty() {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            observer.on_stdout_line(&line);
            self.pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Collect(Mutex<Vec<String>>);

    impl OutputObserver for Collect {
        fn on_stdout_line(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    fn runner(temp_dir: &TempDir) -> ProcessGroupRunner {
        let mut config = JobsConfig::with_base_path(temp_dir.path());
        config.limits.stdout_max_bytes = 1_000;
        config.limits.stderr_max_bytes = 1_000;
        config.timeouts.kill_grace_secs = 1;
        ProcessGroupRunner::new(&config).with_poll_interval(Duration::from_millis(20))
    }

    fn shell(job_id: &str, script: &str, timeout: Duration) -> Invocation {
        Invocation {
            job_id: job_id.to_string(),
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "stub".to_string()],
            env: BTreeMap::new(),
            working_directory: None,
            timeout,
        }
    }

    #[test]
    fn test_run_captures_output_and_exit_code() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);
        let observer = Collect(Mutex::new(Vec::new()));

        let outcome = runner
            .run(
                &shell("job-1", "echo one; echo two; echo oops >&2; exit 3", Duration::from_secs(10)),
                &observer,
            )
            .unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
        assert_eq!(outcome.stdout, "one\ntwo\n");
        assert_eq!(outcome.stderr, "oops\n");
        assert_eq!(*observer.0.lock().unwrap(), vec!["one", "two"]);
        assert!(!runner.capture_dir("job-1").exists());
    }

    #[test]
    fn test_run_passes_env_and_cwd() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);
        let mut invocation = shell("job-env", "echo \"$LOAN_FLAG $(pwd)\"", Duration::from_secs(10));
        invocation.env.insert("LOAN_FLAG".into(), "on".into());
        invocation.working_directory = Some(temp_dir.path().to_path_buf());

        let outcome = runner.run(&invocation, &super::super::NoopObserver).unwrap();
        assert!(outcome.success());
        assert!(outcome.stdout.starts_with("on /"));
    }

    #[test]
    fn test_run_truncates_output_tail() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);

        let outcome = runner
            .run(
                &shell(
                    "job-big",
                    "i=0; while [ $i -lt 500 ]; do echo line-$i; i=$((i+1)); done",
                    Duration::from_secs(10),
                ),
                &super::super::NoopObserver,
            )
            .unwrap();

        assert!(outcome.stdout.starts_with(TRUNCATION_MARKER));
        assert!(outcome.stdout.ends_with("line-499\n"));
        assert!(outcome.stdout.len() <= 1_000 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_timeout_kills_whole_group() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);
        let marker = temp_dir.path().join("grandchild-survived");
        let script = format!("(sleep 2; touch {}) & sleep 30", marker.display());

        let started = Instant::now();
        let outcome = runner
            .run(
                &shell("job-slow", &script, Duration::from_millis(300)),
                &super::super::NoopObserver,
            )
            .unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));

        thread::sleep(Duration::from_millis(2500));
        assert!(!marker.exists());
    }

    #[test]
    fn test_missing_program_reports_127() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);
        let mut invocation = shell("job-missing", "", Duration::from_secs(10));
        invocation.program = "/nonexistent/pipeline".to_string();
        invocation.args.clear();

        let outcome = runner.run(&invocation, &super::super::NoopObserver).unwrap();
        assert_eq!(outcome.exit_code, Some(127));
        assert!(!outcome.stderr.is_empty());
    }

    #[test]
    fn test_detached_liveness_and_collection() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);

        // Simulate an execution left by a previous process.
        let dir = runner.prepare_capture_dir("job-detached").unwrap();
        let mut child = runner
            .spawn(
                &shell("job-detached", "echo started; sleep 1; echo finished", Duration::from_secs(10)),
                &dir,
            )
            .unwrap();
        ProcessGroupRunner::record_leader(&dir, "job-detached", Pid::from_raw(child.id() as i32));

        assert!(runner.is_alive("job-detached"));
        assert!(!runner.is_alive("job-unknown"));

        // Reap in the background so the group does not linger as a zombie.
        let reaper = thread::spawn(move || child.wait());
        let outcome = runner
            .await_detached("job-detached", Duration::from_secs(10))
            .unwrap()
            .unwrap();
        reaper.join().unwrap().unwrap();

        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "started\nfinished\n");
        assert!(!runner.is_alive("job-detached"));
        assert!(runner
            .await_detached("job-detached", Duration::from_secs(1))
            .unwrap()
            .is_none());
    }

    fn unrelated_sleeper() -> Child {
        Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30")
            .process_group(0)
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_recycled_pid_is_not_treated_as_the_job() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);
        let mut sleeper = unrelated_sleeper();
        let pid = sleeper.id() as i32;

        // Same pid, but the recorded leader started at another time.
        let dir = runner.prepare_capture_dir("job-recycled").unwrap();
        let mut stale = GroupLeader::of(pid).unwrap();
        stale.start_ticks += 1;
        write_json_atomic(&dir.join(PID_FILE), &stale).unwrap();

        assert!(!runner.is_alive("job-recycled"));
        let outcome = runner
            .await_detached("job-recycled", Duration::ZERO)
            .unwrap()
            .unwrap();
        assert!(!outcome.timed_out);
        assert!(sleeper.try_wait().unwrap().is_none());

        sleeper.kill().unwrap();
        sleeper.wait().unwrap();
    }

    #[test]
    fn test_bare_pid_file_is_not_trusted() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);
        let mut sleeper = unrelated_sleeper();

        let dir = runner.prepare_capture_dir("job-legacy").unwrap();
        write_json_atomic(&dir.join(PID_FILE), &(sleeper.id() as i32)).unwrap();

        assert!(!runner.is_alive("job-legacy"));
        runner
            .await_detached("job-legacy", Duration::ZERO)
            .unwrap()
            .unwrap();
        assert!(sleeper.try_wait().unwrap().is_none());

        sleeper.kill().unwrap();
        sleeper.wait().unwrap();
    }

    #[test]
    fn test_leader_identity_matches_itself() {
        let mut sleeper = unrelated_sleeper();
        let leader = GroupLeader::of(sleeper.id() as i32).unwrap();
        assert!(leader.is_running());

        sleeper.kill().unwrap();
        sleeper.wait().unwrap();
        assert!(!leader.is_running());
    }

    #[test]
    fn test_run_with_unbounded_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);

        let outcome = runner
            .run(
                &shell("job-unbounded", "echo ok", Duration::MAX),
                &super::super::NoopObserver,
            )
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "ok\n");
    }

    #[test]
    fn test_read_tail_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(read_tail(&temp_dir.path().join("nope"), 10), "");
    }
}
