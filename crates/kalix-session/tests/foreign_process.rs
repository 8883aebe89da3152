mod common;

use kalix_session::{SessionError, TaskManager};

use common::{mock_engine, wait_until};

#[tokio::test]
async fn detects_and_kills_unmanaged_engine_processes() {
    // an engine nobody here owns, as if left behind by a crashed host
    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_mock-kalixcli"))
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();
    let pid = child.id();
    // hold stdin open so the engine blocks on reads instead of exiting,
    // and reap it from a helper thread so the pid leaves the process table
    let stdin = child.stdin.take().unwrap();
    let reaper = std::thread::spawn(move || {
        let _ = child.wait();
    });

    let manager = TaskManager::new(mock_engine());

    assert!(
        wait_until(|| manager.detect_foreign_engines().iter().any(|e| e.pid == pid)).await,
        "foreign engine never detected"
    );
    let foreign = manager
        .detect_foreign_engines()
        .into_iter()
        .find(|e| e.pid == pid)
        .unwrap();
    assert!(foreign.name.to_lowercase().contains("kalix"));

    manager.kill_foreign_engine(pid).await.unwrap();
    reaper.join().unwrap();
    drop(stdin);

    assert!(
        wait_until(|| !manager.detect_foreign_engines().iter().any(|e| e.pid == pid)).await,
        "foreign engine still visible after kill"
    );
}

#[tokio::test]
async fn refuses_pids_that_are_not_foreign_engines() {
    let manager = TaskManager::new(mock_engine());

    // our own process is not an engine
    let err = manager
        .kill_foreign_engine(std::process::id())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotForeign(_)));

    // a managed session's engine is off limits too
    let key = manager.run_model_from_memory("[model]").await.unwrap();
    let pid = manager.snapshot(&key).unwrap().pid.unwrap();
    let err = manager.kill_foreign_engine(pid).await.unwrap_err();
    assert!(matches!(err, SessionError::NotForeign(_)));

    manager.shutdown().await;
}
