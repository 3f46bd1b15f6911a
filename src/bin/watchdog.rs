//! Process watchdog for the capture loop.
//! Spawns the capture binary as a child process, polls its liveness, and
//! restarts it on unexpected exits within a configurable budget. Child
//! output is mirrored to the console; lifecycle events land in a
//! timestamped log file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Arg, Command};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command as ChildCommand};
use tokio::time::timeout;

const CAPTURE_BINARY: &str = "clickwatch";
/// Bound on the graceful-shutdown wait before the child is force-killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Alive-status log lines are throttled to roughly this period.
const STATUS_PERIOD: Duration = Duration::from_secs(30);

struct WatchdogConfig {
    capture_bin: PathBuf,
    capture_args: Vec<String>,
    work_dir: PathBuf,
    restart_delay: Duration,
    check_interval: Duration,
    /// 0 = unlimited.
    max_restarts: u32,
    log_file: PathBuf,
}

/// Append-only, timestamped event log, echoed to the console.
struct WatchdogLog {
    file: Option<File>,
}

impl WatchdogLog {
    fn open(path: &Path) -> Self {
        let file = OpenOptions::new().create(true).append(true).open(path);
        if let Err(err) = &file {
            eprintln!("Warning: could not open log file {}: {err}", path.display());
        }
        Self { file: file.ok() }
    }

    fn log(&mut self, message: &str) {
        let line = format!(
            "[{}] {message}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        println!("{line}");
        if let Some(file) = &mut self.file {
            if let Err(err) = writeln!(file, "{line}") {
                eprintln!("Warning: could not write to log file: {err}");
            }
        }
    }
}

/// The watchdog's view of the capture process.
struct SupervisedChild {
    child: Child,
    pid: u32,
    started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Starting,
    Running,
    Crashed(Option<i32>),
    Stopped,
}

struct Watchdog {
    cfg: WatchdogConfig,
    log: WatchdogLog,
    child: Option<SupervisedChild>,
    restart_count: u32,
    polls_since_status: u32,
}

impl Watchdog {
    fn new(cfg: WatchdogConfig) -> Self {
        let log = WatchdogLog::open(&cfg.log_file);
        Self { cfg, log, child: None, restart_count: 0, polls_since_status: 0 }
    }

    /// Runs the supervision state machine until the restart budget is
    /// spent. Returns `Err` only when a spawn fails.
    async fn supervise(&mut self) -> Result<()> {
        let mut state = State::Starting;
        loop {
            state = match state {
                State::Starting => {
                    self.log.log(&format!(
                        "Starting {} (attempt {})",
                        self.cfg.capture_bin.display(),
                        self.restart_count + 1
                    ));
                    match self.spawn_child() {
                        Ok(child) => {
                            self.log.log(&format!(
                                "Process started successfully (PID: {})",
                                child.pid
                            ));
                            self.child = Some(child);
                            State::Running
                        }
                        Err(err) => {
                            self.log.log(&format!("Error starting process: {err:#}"));
                            return Err(err);
                        }
                    }
                }
                State::Running => {
                    tokio::time::sleep(self.cfg.check_interval).await;
                    let child = self
                        .child
                        .as_mut()
                        .context("no supervised child while running")?;
                    match child.child.try_wait().context("failed to poll child liveness")? {
                        Some(status) => {
                            self.child = None;
                            State::Crashed(status.code())
                        }
                        None => {
                            self.maybe_log_status().await;
                            State::Running
                        }
                    }
                }
                State::Crashed(exit_code) => {
                    let code = exit_code
                        .map_or_else(|| "signal".to_string(), |code| code.to_string());
                    self.log.log(&format!("Process died (exit code: {code})"));

                    if self.cfg.max_restarts > 0 && self.restart_count >= self.cfg.max_restarts {
                        self.log.log(&format!(
                            "Max restart attempts ({}) reached. Stopping watchdog.",
                            self.cfg.max_restarts
                        ));
                        State::Stopped
                    } else {
                        self.log.log(&format!(
                            "Waiting {}s before restart...",
                            self.cfg.restart_delay.as_secs_f64()
                        ));
                        tokio::time::sleep(self.cfg.restart_delay).await;
                        self.restart_count += 1;
                        State::Starting
                    }
                }
                State::Stopped => return Ok(()),
            };
        }
    }

    fn spawn_child(&mut self) -> Result<SupervisedChild> {
        let mut command = ChildCommand::new(&self.cfg.capture_bin);
        command
            .args(&self.cfg.capture_args)
            .current_dir(&self.cfg.work_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.cfg.capture_bin.display()))?;
        let pid = child.id().context("spawned child has no pid")?;
        relay_output(&mut child);
        Ok(SupervisedChild { child, pid, started_at: Instant::now() })
    }

    /// Reduced-frequency alive line with best-effort memory sampling, so a
    /// long steady run does not flood the log.
    async fn maybe_log_status(&mut self) {
        self.polls_since_status += 1;
        let polls_per_status = (STATUS_PERIOD.as_millis()
            / self.cfg.check_interval.as_millis().max(1))
        .max(1) as u32;
        if self.polls_since_status < polls_per_status {
            return;
        }
        self.polls_since_status = 0;

        let Some(child) = &self.child else { return };
        let uptime = child.started_at.elapsed().as_secs();
        match sample_rss_kb(child.pid).await {
            Some(rss_kb) => self.log.log(&format!(
                "Process alive - PID: {}, uptime: {uptime}s, memory: {:.1}MB",
                child.pid,
                rss_kb as f64 / 1024.0
            )),
            None => self
                .log
                .log(&format!("Process alive - PID: {}, uptime: {uptime}s", child.pid)),
        }
    }

    /// Terminates the child if it is still running: graceful signal first,
    /// a bounded wait, then a hard kill.
    async fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else { return };
        if let Ok(Some(_)) = child.child.try_wait() {
            return;
        }

        self.log.log(&format!("Terminating capture process (PID: {})", child.pid));
        terminate_gracefully(&child);
        match timeout(SHUTDOWN_GRACE, child.child.wait()).await {
            Ok(Ok(_)) => self.log.log("Process terminated gracefully"),
            Ok(Err(err)) => self.log.log(&format!("Error waiting for process: {err}")),
            Err(_) => {
                self.log.log(&format!(
                    "Process did not terminate within {}s, forcing kill...",
                    SHUTDOWN_GRACE.as_secs()
                ));
                match child.child.kill().await {
                    Ok(()) => self.log.log("Process killed"),
                    Err(err) => self.log.log(&format!("Error killing process: {err}")),
                }
            }
        }
    }
}

/// Mirrors the child's output to the console, prefixed so it is
/// distinguishable from the watchdog's own lines. Runs independently of the
/// liveness poll; the tasks end when the pipes close. Child output is kept
/// out of the log file to bound its size.
fn relay_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                println!("[capture] {line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                eprintln!("[capture] {line}");
            }
        });
    }
}

#[cfg(unix)]
fn terminate_gracefully(child: &SupervisedChild) {
    unsafe {
        libc::kill(child.pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(_child: &SupervisedChild) {
    // No graceful signal available; the bounded wait falls through to kill.
}

#[cfg(unix)]
async fn sample_rss_kb(pid: u32) -> Option<u64> {
    let output = ChildCommand::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

#[cfg(not(unix))]
async fn sample_rss_kb(_pid: u32) -> Option<u64> {
    None
}

/// The capture binary shipped alongside the watchdog executable.
fn sibling_capture_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to resolve watchdog executable path")?;
    let dir = exe.parent().context("watchdog executable has no parent directory")?;
    let name = if cfg!(windows) {
        format!("{CAPTURE_BINARY}.exe")
    } else {
        CAPTURE_BINARY.to_string()
    };
    Ok(dir.join(name))
}

fn parse_args() -> Result<WatchdogConfig> {
    let matches = Command::new("clickwatch-watchdog")
        .version("0.1.0")
        .about("Monitors the capture loop and restarts it if it is killed")
        .arg(
            Arg::new("work-dir")
                .long("work-dir")
                .value_name("DIR")
                .default_value(".")
                .help("Working directory for the capture process"),
        )
        .arg(
            Arg::new("restart-delay")
                .long("restart-delay")
                .value_name("SECS")
                .value_parser(clap::value_parser!(u64))
                .default_value("2")
                .help("Seconds to wait before restarting after a crash"),
        )
        .arg(
            Arg::new("check-interval")
                .long("check-interval")
                .value_name("SECS")
                .value_parser(clap::value_parser!(u64))
                .default_value("2")
                .help("Seconds between liveness checks"),
        )
        .arg(
            Arg::new("max-restarts")
                .long("max-restarts")
                .value_name("N")
                .value_parser(clap::value_parser!(u32))
                .default_value("0")
                .help("Max restart attempts before giving up (0 = unlimited)"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .value_name("FILE")
                .help("Log file path (default: watchdog.log in the working directory)"),
        )
        .arg(
            Arg::new("capture-bin")
                .long("capture-bin")
                .value_name("PATH")
                .help("Capture binary to supervise (default: the sibling clickwatch executable)"),
        )
        .arg(
            Arg::new("capture-args")
                .value_name("ARGS")
                .num_args(0..)
                .last(true)
                .help("Arguments passed through to the capture process"),
        )
        .get_matches();

    let work_dir = PathBuf::from(matches.get_one::<String>("work-dir").unwrap()); // Safe due to default
    let capture_bin = match matches.get_one::<String>("capture-bin") {
        Some(path) => PathBuf::from(path),
        None => sibling_capture_binary()?,
    };
    let log_file = matches
        .get_one::<String>("log-file")
        .map(PathBuf::from)
        .unwrap_or_else(|| work_dir.join("watchdog.log"));

    Ok(WatchdogConfig {
        capture_bin,
        capture_args: matches
            .get_many::<String>("capture-args")
            .map(|values| values.cloned().collect())
            .unwrap_or_default(),
        work_dir,
        restart_delay: Duration::from_secs(*matches.get_one::<u64>("restart-delay").unwrap()),
        check_interval: Duration::from_secs(*matches.get_one::<u64>("check-interval").unwrap()),
        max_restarts: *matches.get_one::<u32>("max-restarts").unwrap(),
        log_file,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = parse_args()?;
    if !cfg.capture_bin.exists() {
        bail!("capture binary not found at: {}", cfg.capture_bin.display());
    }

    let mut watchdog = Watchdog::new(cfg);
    watchdog.log.log(&"=".repeat(70));
    watchdog.log.log("CAPTURE WATCHDOG STARTED");
    watchdog.log.log(&"=".repeat(70));
    watchdog.log.log(&format!("Watching: {}", watchdog.cfg.capture_bin.display()));
    watchdog.log.log(&format!(
        "Restart delay: {}s, Check interval: {}s, Max restarts: {}",
        watchdog.cfg.restart_delay.as_secs(),
        watchdog.cfg.check_interval.as_secs(),
        watchdog.cfg.max_restarts
    ));

    let mut spawn_failure = None;
    let mut interrupted = false;
    tokio::select! {
        result = watchdog.supervise() => {
            if let Err(err) = result {
                spawn_failure = Some(err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            interrupted = true;
        }
    }
    if interrupted {
        watchdog.log.log("Watchdog interrupted by user (Ctrl+C)");
    }

    watchdog.log.log(&"=".repeat(70));
    watchdog.log.log("SHUTTING DOWN WATCHDOG");
    watchdog.shutdown().await;
    watchdog.log.log(&format!(
        "Watchdog stopped. Total restarts: {}",
        watchdog.restart_count
    ));
    watchdog.log.log(&"=".repeat(70));

    match spawn_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &Path, program: &str, args: &[&str], max_restarts: u32) -> WatchdogConfig {
        WatchdogConfig {
            capture_bin: PathBuf::from(program),
            capture_args: args.iter().map(|arg| arg.to_string()).collect(),
            work_dir: dir.to_path_buf(),
            restart_delay: Duration::from_millis(10),
            check_interval: Duration::from_millis(20),
            max_restarts,
            log_file: dir.join("watchdog.log"),
        }
    }

    #[test]
    fn log_lines_are_timestamped_and_appended() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watchdog.log");
        let mut log = WatchdogLog::open(&path);
        log.log("first");
        log.log("second");

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        // "[YYYY-MM-DD HH:MM:SS] " is a fixed-width prefix.
        assert!(lines[0].starts_with('['));
        assert_eq!(lines[0].find(']'), Some(20));
        assert!(lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] second"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restarts_crashed_child_until_the_budget_is_spent() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), "sh", &["-c", "exit 3"], 2);
        let mut watchdog = Watchdog::new(cfg);

        watchdog.supervise().await.unwrap();

        // The initial start plus exactly two restarts.
        assert_eq!(watchdog.restart_count, 2);
        let log = std::fs::read_to_string(dir.path().join("watchdog.log")).unwrap();
        assert_eq!(log.matches("Process died (exit code: 3)").count(), 3);
        assert!(log.contains("Max restart attempts (2) reached"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn waits_the_restart_delay_between_crash_and_respawn() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(dir.path(), "sh", &["-c", "exit 1"], 1);
        cfg.restart_delay = Duration::from_millis(150);
        let mut watchdog = Watchdog::new(cfg);

        let started = Instant::now();
        watchdog.supervise().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(watchdog.restart_count, 1);
    }

    #[tokio::test]
    async fn spawn_failure_is_terminal() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), "definitely-not-a-real-binary-4279", &[], 0);
        let mut watchdog = Watchdog::new(cfg);

        assert!(watchdog.supervise().await.is_err());
        assert_eq!(watchdog.restart_count, 0);
        let log = std::fs::read_to_string(dir.path().join("watchdog.log")).unwrap();
        assert!(log.contains("Error starting process"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_terminates_a_long_running_child() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), "sh", &["-c", "sleep 30"], 0);
        let mut watchdog = Watchdog::new(cfg);
        let child = watchdog.spawn_child().unwrap();
        watchdog.child = Some(child);

        watchdog.shutdown().await;

        assert!(watchdog.child.is_none());
        let log = std::fs::read_to_string(dir.path().join("watchdog.log")).unwrap();
        assert!(log.contains("Terminating capture process"));
        assert!(log.contains("Process terminated gracefully"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_with_no_child_is_a_no_op() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), "sh", &[], 0);
        let mut watchdog = Watchdog::new(cfg);
        watchdog.shutdown().await;
        let log = std::fs::read_to_string(dir.path().join("watchdog.log")).unwrap_or_default();
        assert!(!log.contains("Terminating"));
    }
}
