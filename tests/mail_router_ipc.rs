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

fn route(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    pathname: &str,
    method: &str,
    body: serde_json::Value,
) -> serde_json::Value {
    let result = request_ok(
        stdin,
        reader,
        id,
        "mail.route",
        json!({ "pathname": pathname, "method": method, "body": body }),
    );
    result.get("response").cloned().expect("response")
}

#[test]
fn mail_routes_dispatch_and_record_to_outbox() {
    let workspace = temp_dir("pathways-mail");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let resp = route(
        &mut stdin,
        &mut reader,
        "2",
        "/send-invitation",
        "POST",
        json!({ "email": "a@example.com", "name": "Asha" }),
    );
    assert_eq!(resp["success"], true);

    let resp = route(
        &mut stdin,
        &mut reader,
        "3",
        "/send-bulk-countdown",
        "POST",
        json!({ "recipients": ["b@example.com", "c@example.com"], "eventDate": "2026-09-15" }),
    );
    assert_eq!(resp["success"], true);

    let resp = route(
        &mut stdin,
        &mut reader,
        "4",
        "/send-event-otp",
        "POST",
        json!({ "email": "d@example.com", "otp": "482913" }),
    );
    assert_eq!(resp["success"], true);

    let resp = route(
        &mut stdin,
        &mut reader,
        "5",
        "/send-password-reset",
        "POST",
        json!({ "email": "e@example.com", "resetLink": "https://app.example.com/reset/tok" }),
    );
    assert_eq!(resp["success"], true);

    // Missing required fields are a 400, not a queued mail.
    let resp = route(
        &mut stdin,
        &mut reader,
        "6",
        "/send-password-reset",
        "POST",
        json!({ "email": "f@example.com" }),
    );
    assert_eq!(resp["success"], false);
    assert_eq!(resp["status"], 400);

    // Unknown path and wrong method both 404.
    let resp = route(&mut stdin, &mut reader, "7", "/send-spam", "POST", json!({}));
    assert_eq!(resp["status"], 404);
    let resp = route(
        &mut stdin,
        &mut reader,
        "8",
        "/send-invitation",
        "GET",
        json!({}),
    );
    assert_eq!(resp["status"], 404);

    let outbox = request_ok(&mut stdin, &mut reader, "9", "mail.outbox.list", json!({}));
    let messages = outbox["messages"].as_array().expect("messages");
    // invitation + 2 bulk countdowns + otp + reset
    assert_eq!(messages.len(), 5);

    let countdowns = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "mail.outbox.list",
        json!({ "route": "bulk_countdown" }),
    );
    let recipients: Vec<&str> = countdowns["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .filter_map(|m| m["recipient"].as_str())
        .collect();
    assert_eq!(recipients, vec!["b@example.com", "c@example.com"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn receipt_route_serves_orders_by_id() {
    let workspace = temp_dir("pathways-receipt");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "orders.upsert",
        json!({
            "orderId": "ord-1001",
            "amount": 499.0,
            "description": "Career assessment",
            "paidAt": "2026-08-01T10:00:00+00:00"
        }),
    );

    let resp = route(
        &mut stdin,
        &mut reader,
        "3",
        "/download-receipt/ord-1001",
        "GET",
        json!({}),
    );
    assert_eq!(resp["success"], true);
    assert_eq!(resp["receipt"]["orderId"], "ord-1001");
    assert_eq!(resp["receipt"]["amount"], 499.0);

    let resp = route(
        &mut stdin,
        &mut reader,
        "4",
        "/download-receipt/ord-9999",
        "GET",
        json!({}),
    );
    assert_eq!(resp["success"], false);
    assert_eq!(resp["status"], 404);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
