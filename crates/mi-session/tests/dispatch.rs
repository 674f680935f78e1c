use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use mi_core::{Connection, Record, ResultClass, Transport, TransportError, TransportEvent};
use mi_session::{Command, LockStatus, Session, SessionError, SessionEvent, SessionOptions};
use mi_transport::{PlaybackTransport, StreamParts, StreamTransport};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
};

fn playback(transcript: &str, first_token: u32) -> Session {
    Session::new(
        PlaybackTransport::from_transcript(transcript),
        SessionOptions {
            first_token,
            ..SessionOptions::default()
        },
    )
}

/// True if `future` does not complete within a short grace period.
async fn still_pending<F: Future + Unpin>(future: &mut F) -> bool {
    tokio::time::timeout(Duration::from_millis(50), future)
        .await
        .is_err()
}

#[tokio::test]
async fn test_done_result_resolves_with_its_values() {
    let session = playback(
        r#"->(gdb)
<-5-data-evaluate-expression x
->5^done,value="42"
"#,
        5,
    );
    session.wait_until_ready().await.unwrap();

    let response = session.send("-data-evaluate-expression x").await.unwrap();
    assert_eq!(response.class(), ResultClass::Done);
    assert_eq!(response.results().find_str("value").unwrap(), "42");
    assert_eq!(session.pending_count(), 0);
    assert_eq!(session.lock_status(), LockStatus::Idle);
}

#[tokio::test]
async fn test_error_result_carries_backend_text() {
    let session = playback(
        r#"->(gdb)
<-7-data-evaluate-expression nosuch
->7^error,msg="no such symbol"
"#,
        7,
    );

    let err = session
        .send("-data-evaluate-expression nosuch")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no such symbol");
    assert_eq!(err.backend_message(), Some("no such symbol"));
    assert!(matches!(
        err,
        SessionError::UnexpectedResult {
            expected: ResultClass::Done,
            actual: ResultClass::Error,
            ..
        }
    ));
    assert!(!err.is_fatal());
    assert_eq!(session.lock_status(), LockStatus::Idle);
}

#[tokio::test]
async fn test_exclusive_hold_lasts_until_token_is_closed() {
    let session = playback(
        r#"->(gdb)
<-3-exec-step
->3^running
->*running,thread-id="all"
->(gdb)
->*stopped,reason="end-stepping-range",thread-id="1"
<-4-data-evaluate-expression i
->4^done,value="1"
"#,
        3,
    );
    let mut events = session.subscribe();

    let mut step = session
        .send(Command::new("-exec-step").expecting(ResultClass::Running))
        .await
        .unwrap();
    let mut token = step.take_exclusive().unwrap();
    assert_eq!(session.lock_status(), LockStatus::Exclusive);

    let eval = session.send("-data-evaluate-expression i");
    let other = session.acquire_exclusive();
    tokio::pin!(eval, other);
    assert!(still_pending(&mut eval).await);
    assert!(still_pending(&mut other).await);

    let Some(SessionEvent::Record(Record::ExecAsync(running))) = events.next().await else {
        panic!("expected *running");
    };
    assert_eq!(running.class, "running");
    let Some(SessionEvent::Record(Record::ExecAsync(stopped))) = events.next().await else {
        panic!("expected *stopped");
    };
    assert_eq!(stopped.class, "stopped");
    assert!(still_pending(&mut eval).await);

    token.close();
    token.close();
    assert!(token.is_closed());

    let value = eval.await.unwrap();
    assert_eq!(value.results().find_str("value").unwrap(), "1");
    let next = other.await.unwrap();
    assert_eq!(session.lock_status(), LockStatus::Exclusive);
    drop(next);
    assert_eq!(session.lock_status(), LockStatus::Idle);
}

#[tokio::test]
async fn test_commands_under_a_held_token() {
    let session = playback(
        r#"->(gdb)
<-50-break-insert main
->50^done,bkpt={number="1",type="breakpoint",func="main"}
<-51-exec-run
->51^running
"#,
        50,
    );

    let mut token = session.acquire_exclusive().await.unwrap();
    let inserted = session
        .send_exclusive(&token, "-break-insert main")
        .await
        .unwrap();
    let bkpt = inserted.results().find_tuple("bkpt").unwrap();
    assert_eq!(bkpt.find_str("number").unwrap(), "1");
    session
        .send_exclusive(
            &token,
            Command::new("-exec-run").expecting(ResultClass::Running),
        )
        .await
        .unwrap();
    assert_eq!(session.lock_status(), LockStatus::Exclusive);

    token.close();
    assert!(matches!(
        session.send_exclusive(&token, "-exec-continue").await,
        Err(SessionError::TokenClosed)
    ));
    assert_eq!(session.lock_status(), LockStatus::Idle);
}

#[tokio::test]
async fn test_connection_loss_fails_pending_and_closes_lock() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(ours);
    let session = Session::new(
        StreamTransport::start(StreamParts::new(reader, writer)),
        SessionOptions {
            first_token: 4,
            ..SessionOptions::default()
        },
    );
    let mut backend = BufReader::new(theirs);

    let first = session.send("-data-list-register-names");
    let second = session.send("-stack-list-frames");
    tokio::pin!(first, second);
    assert!(still_pending(&mut first).await);
    assert!(still_pending(&mut second).await);

    let mut line = String::new();
    backend.read_line(&mut line).await.unwrap();
    assert_eq!(line, "4-data-list-register-names\n");
    line.clear();
    backend.read_line(&mut line).await.unwrap();
    assert_eq!(line, "5-stack-list-frames\n");
    assert_eq!(session.pending_count(), 2);

    drop(backend);
    for result in [first.await, second.await] {
        match result {
            Err(SessionError::Transport(TransportError::ConnectionLost(reason))) => {
                assert_eq!(reason, "connection closed by backend");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    assert!(session.is_closed());
    assert!(matches!(
        session.acquire_exclusive().await,
        Err(SessionError::Disposed(_))
    ));
    assert!(matches!(
        session.acquire_shared().await,
        Err(SessionError::Disposed(_))
    ));
    assert!(matches!(
        session.send("-stack-list-frames").await,
        Err(SessionError::Disposed(_))
    ));
}

#[tokio::test]
async fn test_late_result_after_timeout_is_discarded() {
    let session = playback(
        r#"->(gdb)
<-10-data-evaluate-expression slow
<-11-data-evaluate-expression fast
->10^done,value="late"
->11^done,value="2"
"#,
        10,
    );

    let err = session
        .send(Command::new("-data-evaluate-expression slow").timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Timeout {
            token: Some(10),
            ..
        }
    ));
    assert_eq!(session.pending_count(), 0);
    assert_eq!(session.lock_status(), LockStatus::Idle);

    let fast = session
        .send("-data-evaluate-expression fast")
        .await
        .unwrap();
    assert_eq!(fast.results().find_str("value").unwrap(), "2");
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_console_command_returns_captured_output() {
    let session = playback(
        r#"->(gdb)
<-20-interpreter-exec console "info frame"
->~"Stack level 0, frame at 0x7ffe:\n"
->~" rip = 0x401136 in main\n"
->20^done
->(gdb)
"#,
        20,
    );
    let mut events = session.subscribe();

    let text = session.console_command("info frame").await.unwrap();
    assert_eq!(text, "Stack level 0, frame at 0x7ffe:\n rip = 0x401136 in main\n");
    assert_eq!(session.lock_status(), LockStatus::Idle);
    assert_eq!(
        events.next().await,
        Some(SessionEvent::Record(Record::ConsoleStream(
            "Stack level 0, frame at 0x7ffe:\n".into()
        )))
    );
}

#[tokio::test]
async fn test_echo_of_pending_command_is_suppressed() {
    let session = playback(
        r#"->(gdb)
<-30-gdb-set mi-async on
->30-gdb-set mi-async on
->30^done
->=cmd-param-changed,param="mi-async",value="on"
"#,
        30,
    );
    let mut events = session.subscribe();

    session.send("-gdb-set mi-async on").await.unwrap();
    let Some(SessionEvent::Record(Record::NotifyAsync(notify))) = events.next().await else {
        panic!("expected =cmd-param-changed");
    };
    assert_eq!(notify.class, "cmd-param-changed");
}

#[tokio::test]
async fn test_cli_commands_and_posts_are_untokenized() {
    let session = playback(
        r#"->(gdb)
<-info threads
->~"* 1 Thread main\n"
->^done
<--gdb-set confirm off
->^done
"#,
        1,
    );
    let mut events = session.subscribe();

    let mut threads = session.send("info threads").await.unwrap();
    assert_eq!(threads.record.token, None);
    assert_eq!(session.lock_status(), LockStatus::Exclusive);
    drop(threads.take_exclusive());
    assert_eq!(session.lock_status(), LockStatus::Idle);

    session.post("-gdb-set confirm off").await;
    assert_eq!(
        events.next().await,
        Some(SessionEvent::Record(Record::ConsoleStream(
            "* 1 Thread main\n".into()
        )))
    );
    let Some(SessionEvent::Record(Record::Result(posted))) = events.next().await else {
        panic!("expected the posted command's result");
    };
    assert_eq!(posted.token, None);
    assert_eq!(posted.class, ResultClass::Done);
}

#[tokio::test]
async fn test_initialize_failure_reports_stderr() {
    let (ours, backend) = tokio::io::duplex(1024);
    let (errors, mut backend_errors) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(ours);
    let session = Session::new(
        StreamTransport::start(StreamParts::new(reader, writer).with_stderr(errors)),
        SessionOptions::default(),
    );

    backend_errors
        .write_all(b"gdb: unrecognized option '--bogus'\n")
        .await
        .unwrap();
    drop(backend_errors);
    drop(backend);

    match session.wait_until_ready().await {
        Err(SessionError::InitializeFailed { stderr }) => {
            assert_eq!(stderr, vec!["gdb: unrecognized option '--bogus'".to_string()]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_close_fails_outstanding_commands_and_ends_events() {
    let session = playback(
        r#"->(gdb)
<-40-stack-list-frames
"#,
        40,
    );
    session.wait_until_ready().await.unwrap();
    let mut events = session.subscribe();

    let frames = session.send("-stack-list-frames");
    tokio::pin!(frames);
    assert!(still_pending(&mut frames).await);

    session.close().await;
    assert!(matches!(
        frames.await,
        Err(SessionError::Transport(TransportError::ConnectionLost(_)))
    ));
    assert_eq!(
        events.next().await,
        Some(SessionEvent::Disconnected {
            exit_code: None,
            reason: Some("transport closed".into()),
        })
    );
    assert_eq!(events.next().await, None);
    assert!(session.is_closed());

    // Posting to a closed session is a no-op.
    session.post("-gdb-exit").await;
}

/// Rejects `-gdb-set` writes and answers everything else with `^done`.
struct RejectingSettings {
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

#[async_trait]
impl Transport for RejectingSettings {
    fn send(&self, line: &str) -> Result<(), TransportError> {
        if line.starts_with("-gdb-set") {
            return Err(TransportError::ConnectionLost("write refused".into()));
        }
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(TransportEvent::Stdout("^done".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        let events = self.events.lock().unwrap().take();
        if let Some(events) = events {
            let _ = events.send(TransportEvent::Disconnected {
                exit_code: None,
                reason: Some("transport closed".into()),
            });
        }
    }

    fn is_closed(&self) -> bool {
        self.events.lock().unwrap().is_none()
    }
}

#[tokio::test]
async fn test_failed_post_does_not_claim_a_later_result() {
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(TransportEvent::Stdout("(gdb)".into())).unwrap();
    let transport = Arc::new(RejectingSettings {
        events: Mutex::new(Some(tx)),
    });
    let session = Session::new(Connection::new(transport, rx), SessionOptions::default());
    session.wait_until_ready().await.unwrap();

    session.post("-gdb-set confirm off").await;
    let threads = tokio::time::timeout(Duration::from_secs(5), session.send("info threads"))
        .await
        .expect("CLI command never completed")
        .unwrap();
    assert_eq!(threads.class(), ResultClass::Done);
    assert_eq!(threads.record.token, None);
}
