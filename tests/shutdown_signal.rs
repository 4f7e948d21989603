#![cfg(unix)]

use std::time::Duration;

use csv_import::job;

#[tokio::test]
async fn sigterm_resolves_the_shutdown_future() {
    let waiter = tokio::spawn(job::shutdown_signal());
    // let the task register its handlers before the signal arrives
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(std::process::id().to_string())
        .status()
        .unwrap();
    assert!(status.success());

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("shutdown future did not resolve on SIGTERM")
        .unwrap();
}
