use overseer::config::ProcessSpec;
use overseer::process::{ProcessStatus, Supervisor, SupervisorSettings};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const LINES: usize = 200;

async fn wait_for_exit(supervisor: &Supervisor, name: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = supervisor.status(Some(name)).await.unwrap().remove(0);
        if !status.status.is_live() {
            assert_eq!(status.status, ProcessStatus::Stopped);
            return;
        }
        assert!(Instant::now() < deadline, "{} never exited", name);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Strip the `YYYY-MM-DD HH:mm:ss Z: ` prefix, checking it is there
fn payload(line: &str) -> &str {
    let (stamp, rest) = line.split_once(": ").expect("timestamp prefix");
    assert!(
        chrono::DateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S %:z").is_ok(),
        "bad timestamp {:?}",
        stamp
    );
    rest
}

#[tokio::test]
async fn test_stdout_lines_reach_out_and_combined_in_order() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::new(SupervisorSettings {
        log_dir: dir.path().join("logs"),
        ..SupervisorSettings::default()
    });

    let mut spec = ProcessSpec::new("printer", "/bin/sh", dir.path());
    spec.args = vec![
        "-c".to_string(),
        format!("i=1; while [ $i -le {} ]; do echo \"line $i\"; i=$((i+1)); done", LINES),
    ];
    spec.autorestart = false;
    supervisor.start(spec).await.unwrap();
    wait_for_exit(&supervisor, "printer").await;

    let expected: Vec<String> = (1..=LINES).map(|i| format!("line {}", i)).collect();
    for file in ["printer-out.log", "printer-combined.log"] {
        let lines = read_lines(&dir.path().join("logs").join(file));
        assert_eq!(lines.len(), LINES, "{}", file);
        let payloads: Vec<&str> = lines.iter().map(|l| payload(l)).collect();
        assert_eq!(payloads, expected, "{}", file);
    }

    let errors = dir.path().join("logs/printer-error.log");
    assert!(!errors.exists() || read_lines(&errors).is_empty());
}

#[tokio::test]
async fn test_stderr_and_plain_lines() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::new(SupervisorSettings {
        log_dir: dir.path().join("logs"),
        ..SupervisorSettings::default()
    });

    let mut spec = ProcessSpec::new("noisy", "/bin/sh", dir.path());
    spec.args = vec!["-c".to_string(), "echo out; echo err >&2".to_string()];
    spec.autorestart = false;
    spec.time = false;
    spec.error_file = Some(dir.path().join("custom/noisy.err"));
    supervisor.start(spec).await.unwrap();
    wait_for_exit(&supervisor, "noisy").await;

    assert_eq!(read_lines(&dir.path().join("custom/noisy.err")), vec!["err"]);
    assert_eq!(read_lines(&dir.path().join("logs/noisy-out.log")), vec!["out"]);

    let mut combined = read_lines(&dir.path().join("logs/noisy-combined.log"));
    combined.sort();
    assert_eq!(combined, vec!["err", "out"]);
}

#[tokio::test]
async fn test_logs_without_merge_skip_combined() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::new(SupervisorSettings {
        log_dir: dir.path().join("logs"),
        ..SupervisorSettings::default()
    });

    let mut spec = ProcessSpec::new("solo", "/bin/sh", dir.path());
    spec.args = vec!["-c".to_string(), "echo hello".to_string()];
    spec.autorestart = false;
    spec.merge_logs = false;
    supervisor.start(spec).await.unwrap();
    wait_for_exit(&supervisor, "solo").await;

    assert_eq!(read_lines(&dir.path().join("logs/solo-out.log")).len(), 1);
    assert!(!dir.path().join("logs/solo-combined.log").exists());
}
