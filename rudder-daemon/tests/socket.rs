//! The daemon runtime end to end over its Unix socket.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use rudder_daemon::{is_running, request, request_status, request_stop, DaemonError, DaemonRequest};

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.expect("blocking task")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socket_serves_commands_until_stopped() {
    let home = TempDir::new().expect("home");
    let root: PathBuf = home.path().to_path_buf();
    let daemon = tokio::spawn(rudder_daemon::run(root.clone()));

    let probe = root.clone();
    let up = blocking(move || {
        for _ in 0..50 {
            if is_running(&probe) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        false
    })
    .await;
    assert!(up, "daemon socket never came up");

    let h = root.clone();
    let status = blocking(move || request_status(&h)).await.expect("status");
    assert_eq!(status["running"], json!(true));
    assert_eq!(status["apps"], json!(0));

    let h = root.clone();
    let list = blocking(move || request(&h, &DaemonRequest::List))
        .await
        .expect("list");
    assert_eq!(list, json!([]));

    let h = root.clone();
    let err = blocking(move || {
        request(
            &h,
            &DaemonRequest::Get {
                app: "ghost".into(),
            },
        )
    })
    .await
    .expect_err("unknown app");
    assert!(matches!(err, DaemonError::Protocol(msg) if msg.contains("unknown application 'ghost'")));

    let h = root.clone();
    blocking(move || request_stop(&h)).await.expect("stop");

    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon exits after stop")
        .expect("daemon task")
        .expect("clean shutdown");
    assert!(!is_running(&root));
}
