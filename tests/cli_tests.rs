use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use subtitle_batch::shutdown::FORCED_EXIT_CODE;
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_subtitle-batch");

/// Start a one-file batch whose command marks the job as started and then
/// hangs far longer than any test waits.
fn spawn_stuck_batch(dir: &Path, shutdown_timeout_ms: u64) -> (Child, std::path::PathBuf) {
    let source = dir.join("episode.srt");
    std::fs::write(&source, "1\n00:00:01,000 --> 00:00:02,000\nHi\n").unwrap();
    let marker = dir.join("episode.srt.started");

    let child = Command::new(BIN)
        .arg("run")
        .arg(&source)
        .args(["--command", r#"touch "$INPUT_PATH.started"; sleep 30"#])
        .args(["--shutdown-timeout-ms", &shutdown_timeout_ms.to_string()])
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    (child, marker)
}

fn wait_for_file(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn send_sigint(child: &Child) {
    let status = Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> ExitStatus {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            panic!("process still running {:?} after the stop signal", limit);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_interrupt_exits_after_shutdown_timeout_with_stuck_job() {
    let dir = TempDir::new().unwrap();
    let (mut child, marker) = spawn_stuck_batch(dir.path(), 300);

    wait_for_file(&marker);
    send_sigint(&child);
    let status = wait_with_deadline(&mut child, Duration::from_secs(10));

    assert_eq!(status.code(), Some(1));
    let mut stdout = String::new();
    child
        .stdout
        .take()
        .unwrap()
        .read_to_string(&mut stdout)
        .unwrap();
    assert!(stdout.contains("FAILED"), "{}", stdout);
    assert!(
        stdout.lines().any(|l| l.starts_with("Failed:") && l.ends_with(" 1")),
        "{}",
        stdout
    );
}

#[test]
fn test_second_interrupt_exits_immediately() {
    let dir = TempDir::new().unwrap();
    let (mut child, marker) = spawn_stuck_batch(dir.path(), 60_000);

    wait_for_file(&marker);
    send_sigint(&child);
    // Give the handler time to see the first signal before sending the second.
    std::thread::sleep(Duration::from_millis(500));
    send_sigint(&child);
    let status = wait_with_deadline(&mut child, Duration::from_secs(5));

    assert_eq!(status.code(), Some(FORCED_EXIT_CODE));
}
