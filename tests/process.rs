#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use gameserver_agent::error::ProcessError;
use gameserver_agent::monitor::ServerLauncher;
use gameserver_agent::process::{ProcessEvent, ProcessState, ServerProcess};
use tokio::sync::broadcast;

fn sh(name: &str, script: &str) -> ServerProcess {
    ServerProcess::new(name, "/bin/sh").with_args(["-c", script])
}

async fn wait_for_exit(events: &mut broadcast::Receiver<ProcessEvent>) -> Option<i32> {
    let deadline = Duration::from_secs(10);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(ProcessEvent::Exited { code }) => return code,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    })
    .await
    .expect("process did not exit in time")
}

async fn wait_for_line(rx: &mut broadcast::Receiver<String>, wanted: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let line = rx.recv().await.expect("console closed");
            if line == wanted {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never saw line {wanted:?}"));
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let proc = sh("twice", "exec sleep 30");
    proc.start().await.unwrap();
    assert_eq!(proc.state(), ProcessState::Running);
    assert!(proc.pid().is_some());

    let err = proc.start().await.unwrap_err();
    assert!(matches!(err, ProcessError::AlreadyRunning));

    proc.dispose().await;
    assert!(!proc.is_running());
}

#[tokio::test]
async fn command_to_never_started_process_fails() {
    let proc = sh("idle", "true");
    assert_eq!(proc.state(), ProcessState::NotStarted);
    assert!(matches!(
        proc.send_command("save").await,
        Err(ProcessError::NotRunning)
    ));
    // stop on an idle handle is a no-op
    proc.stop().await.unwrap();
    assert_eq!(proc.state(), ProcessState::NotStarted);
}

#[tokio::test]
async fn graceful_stop_via_shutdown_command() {
    let proc = sh("graceful", "echo ready; read line; echo \"bye $line\"; exit 0");
    let mut output = proc.subscribe_output();
    proc.start().await.unwrap();
    wait_for_line(&mut output, "ready").await;

    proc.stop().await.unwrap();
    assert_eq!(proc.state(), ProcessState::Stopped);

    let lines = proc.console().snapshot().await;
    assert!(lines.contains(&"Command sent: shutdown".to_string()), "{lines:?}");
    assert!(lines.contains(&"bye shutdown".to_string()), "{lines:?}");
    assert_eq!(lines.last().map(String::as_str), Some("Server gracefully stopped"));
}

#[tokio::test]
async fn stop_escalates_to_kill_after_grace_period() {
    let proc = sh("stubborn", "exec sleep 30").with_grace_period(Duration::from_millis(200));
    proc.start().await.unwrap();

    proc.stop().await.unwrap();
    assert_eq!(proc.state(), ProcessState::Stopped);
    assert!(!proc.is_running());

    let lines = proc.console().snapshot().await;
    assert_eq!(lines.last().map(String::as_str), Some("Server forcefully terminated"));
}

#[tokio::test]
async fn stderr_lines_are_tagged() {
    let proc = sh("noisy", "echo fine; echo oops 1>&2; exit 0");
    let mut events = proc.subscribe_events();
    proc.start().await.unwrap();
    wait_for_exit(&mut events).await;

    let lines = proc.console().snapshot().await;
    assert!(lines.contains(&"fine".to_string()), "{lines:?}");
    assert!(lines.contains(&"ERROR: oops".to_string()), "{lines:?}");
}

#[tokio::test]
async fn exit_is_reported_exactly_once() {
    let proc = sh("crasher", "exit 3");
    let mut events = proc.subscribe_events();
    proc.start().await.unwrap();

    assert!(matches!(events.recv().await, Ok(ProcessEvent::Started { .. })));
    assert_eq!(wait_for_exit(&mut events).await, Some(3));
    assert_eq!(proc.state(), ProcessState::Stopped);

    let again = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(again.is_err(), "unexpected second event: {again:?}");

    // A finished session does not block a new one.
    proc.start().await.unwrap();
    assert_eq!(wait_for_exit(&mut events).await, Some(3));
}

#[tokio::test]
async fn commands_are_written_and_echoed() {
    let proc = sh("echoer", "read a; echo \"got:$a\"; read b");
    let mut output = proc.subscribe_output();
    proc.start().await.unwrap();

    proc.send_command("save").await.unwrap();
    wait_for_line(&mut output, "Command sent: save").await;
    wait_for_line(&mut output, "got:save").await;

    proc.dispose().await;
    proc.dispose().await;
    assert!(matches!(
        proc.send_command("save").await,
        Err(ProcessError::NotRunning)
    ));
}

#[tokio::test]
async fn closed_console_falls_back_to_kill() {
    let proc = sh("deaf", "exec 0<&-; echo ready; exec sleep 30");
    let mut output = proc.subscribe_output();
    proc.start().await.unwrap();
    wait_for_line(&mut output, "ready").await;

    proc.stop().await.unwrap();
    assert_eq!(proc.state(), ProcessState::Stopped);

    let lines = proc.console().snapshot().await;
    let last = lines.last().cloned().unwrap_or_default();
    assert!(
        last.starts_with("Error during shutdown, server forcefully terminated:"),
        "{lines:?}"
    );
    assert!(!lines.contains(&"Command sent: shutdown".to_string()), "{lines:?}");
}

#[tokio::test]
async fn relaunch_leaves_a_live_process_alone() {
    let proc = sh("alive", "exec sleep 30");
    let mut events = proc.subscribe_events();
    proc.start().await.unwrap();
    assert!(matches!(events.recv().await, Ok(ProcessEvent::Started { .. })));
    let pid = proc.pid();

    let err = proc.relaunch().await.unwrap_err();
    assert!(matches!(err, ProcessError::AlreadyRunning));
    assert_eq!(proc.pid(), pid);
    assert_eq!(proc.state(), ProcessState::Running);

    let quiet = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(quiet.is_err(), "unexpected event: {quiet:?}");

    proc.dispose().await;
}

#[tokio::test]
async fn relaunch_starts_a_dead_process() {
    let proc = sh("phoenix", "exit 0");
    let mut events = proc.subscribe_events();
    proc.start().await.unwrap();
    assert_eq!(wait_for_exit(&mut events).await, Some(0));
    assert_eq!(proc.pid(), None);

    proc.relaunch().await.unwrap();
    assert!(matches!(events.recv().await, Ok(ProcessEvent::Started { .. })));
    assert_eq!(wait_for_exit(&mut events).await, Some(0));
}

#[tokio::test]
async fn pid_and_uptime_stay_readable_while_stopping() {
    let proc = Arc::new(sh("slow", "exec sleep 30").with_grace_period(Duration::from_millis(500)));
    proc.start().await.unwrap();
    let pid = proc.pid();
    assert!(pid.is_some());

    let stopping = tokio::spawn({
        let proc = proc.clone();
        async move { proc.stop().await }
    });
    let mut state = proc.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        let _ = state.wait_for(|s| *s == ProcessState::Stopping).await;
    })
    .await
    .expect("stop never began");

    // the stop holds the session for the whole grace period
    assert_eq!(proc.pid(), pid);
    assert!(proc.uptime().is_some());
    assert!(!stopping.is_finished());

    stopping.await.unwrap().unwrap();
    assert_eq!(proc.state(), ProcessState::Stopped);
    assert_eq!(proc.pid(), None);
    assert_eq!(proc.uptime(), None);
}
