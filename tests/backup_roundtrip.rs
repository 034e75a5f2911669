use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_pathwaysd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn pathwaysd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn bundle_roundtrip_preserves_attempt_state() {
    let src_workspace = temp_dir("pathways-backup-src");
    let dst_workspace = temp_dir("pathways-backup-dst");
    let bundle = src_workspace.join("export.pwbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": src_workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "profiles.upsert",
        json!({ "storedGrade": "Grade 8" }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attempts.start",
        json!({ "studentId": student_id, "track": "middle" }),
    );
    let attempt_id = started
        .get("attemptId")
        .and_then(|v| v.as_str())
        .expect("attemptId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attempts.saveResponses",
        json!({ "attemptId": attempt_id, "responses": { "q1": 3, "q2": 1, "q3": 4 } }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": src_workspace.to_string_lossy(),
            "outPath": bundle.to_string_lossy()
        }),
    );
    assert_eq!(exported["bundleFormat"], "pathways-workspace-v1");
    assert_eq!(exported["entryCount"], 3);
    let sha = exported["dbSha256"].as_str().expect("dbSha256");
    assert_eq!(sha.len(), 64);

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": dst_workspace.to_string_lossy(),
            "inPath": bundle.to_string_lossy()
        }),
    );
    assert_eq!(imported["bundleFormatDetected"], "pathways-workspace-v1");
    assert_eq!(imported["checksumVerified"], true);

    // The import re-targets the workspace; stored state carries over.
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attempts.get",
        json!({ "attemptId": attempt_id }),
    );
    assert_eq!(fetched["attempt"]["status"], "in_progress");
    assert_eq!(fetched["attempt"]["responseCount"], 3);

    let progress = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attempts.progress",
        json!({ "attemptId": attempt_id }),
    );
    // 3 of 41 -> 7%
    assert_eq!(progress["percent"], 7);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(src_workspace);
    let _ = std::fs::remove_dir_all(dst_workspace);
}
