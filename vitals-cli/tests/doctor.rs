use assert_cmd::Command;
use httpmock::prelude::*;

#[tokio::test]
async fn doctor_command_checks_health() {
    let server = MockServer::start_async().await;

    let _health = server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"status":"ok"}"#);
        })
        .await;

    let _status = server
        .mock_async(|when, then| {
            when.method(GET).path("/status");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{
                    "status": "ok",
                    "started_at": 1700000000,
                    "uptime_secs": 3600,
                    "ticks": 3600,
                    "tick_failures": 0,
                    "history_saves": 360,
                    "history_failures": 0,
                    "history_pruned": 12,
                    "alerts_fired": 2,
                    "notifications_sent": 2,
                    "notifications_suppressed": 0,
                    "last_tick_at": 1700003600,
                    "last_error": null
                }"#);
        })
        .await;

    let _alerts = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/alerts");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"rules":[{"id":1,"enabled":true},{"id":2,"enabled":false}],"recent":[]}"#);
        })
        .await;

    Command::new(assert_cmd::cargo::cargo_bin!("vitals"))
        .args(["--no-color", "--url", &server.base_url(), "doctor"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Vitals Doctor"))
        .stdout(predicates::str::contains("1 of 2 enabled"))
        .stdout(predicates::str::contains("Daemon is healthy"));
}

#[tokio::test]
async fn doctor_command_flags_degraded_daemon() {
    let server = MockServer::start_async().await;

    let _health = server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"status":"ok"}"#);
        })
        .await;

    let _status = server
        .mock_async(|when, then| {
            when.method(GET).path("/status");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{
                    "status": "degraded",
                    "uptime_secs": 10,
                    "ticks": 10,
                    "tick_failures": 3,
                    "history_saves": 1,
                    "history_failures": 1,
                    "alerts_fired": 0,
                    "notifications_sent": 0,
                    "notifications_suppressed": 0,
                    "last_error": "database is locked"
                }"#);
        })
        .await;

    Command::new(assert_cmd::cargo::cargo_bin!("vitals"))
        .args(["--no-color", "--url", &server.base_url(), "doctor"])
        .assert()
        .success()
        .stdout(predicates::str::contains("DEGRADED"))
        .stdout(predicates::str::contains("database is locked"))
        .stdout(predicates::str::contains("Daemon has issues"));
}

#[tokio::test]
async fn doctor_command_handles_unreachable_server() {
    // Doctor still exits 0 and reports the failure inline.
    Command::new(assert_cmd::cargo::cargo_bin!("vitals"))
        .args(["--url", "http://127.0.0.1:59999", "doctor"])
        .assert()
        .success()
        .stdout(predicates::str::contains("FAIL"));
}
