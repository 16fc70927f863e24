//! End-to-end scenarios driving the agent loop and dispatcher through the
//! in-memory queue transport.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{Days, Local};

use outpost::agent::{Agent, Disposition, ExitReason};
use outpost::config::AgentConfig;
use outpost::packet::TaskPacket;
use outpost::transfer::FilePart;
use outpost::transport::QueueTransport;

fn fast_config() -> AgentConfig {
    AgentConfig {
        delay: 0,
        jitter: 0.0,
        lost_limit: 3,
        ..AgentConfig::default()
    }
}

fn make_agent(config: AgentConfig) -> (Agent, Arc<QueueTransport>) {
    let transport = Arc::new(QueueTransport::new());
    let agent = Agent::new(config, transport.clone());
    (agent, transport)
}

async fn push_task(transport: &QueueTransport, kind: u32, data: &str, id: &str) {
    let body = serde_json::to_vec(&TaskPacket::new(kind, data, id)).unwrap();
    transport.push_body(body).await;
}

async fn run_to_exit(agent: Agent) -> ExitReason {
    tokio::time::timeout(Duration::from_secs(10), agent.run())
        .await
        .expect("agent loop should terminate")
}

#[tokio::test]
async fn test_lost_limit_terminates_after_consecutive_defaults() {
    // Nothing queued: every poll serves the default sentinel.
    let (agent, _transport) = make_agent(fast_config());
    assert_eq!(run_to_exit(agent).await, ExitReason::LostLimit);
}

#[tokio::test]
async fn test_real_tasking_resets_the_missed_counter() {
    let (agent, transport) = make_agent(fast_config());
    // Two idle polls, one real task, then idle again: the reset means the
    // loop survives past the first three cycles.
    transport.push_body(b"".to_vec()).await;
    transport.push_body(b"".to_vec()).await;
    push_task(&transport, 1, "", "keepalive").await;

    assert_eq!(run_to_exit(agent).await, ExitReason::LostLimit);
    let packets = transport.sent_packets().await;
    assert!(packets.iter().any(|p| p.kind == 1 && p.id == "keepalive"));
}

#[tokio::test]
async fn test_past_kill_date_sends_one_exit_notice_and_terminates() {
    let yesterday = Local::now()
        .date_naive()
        .checked_sub_days(Days::new(1))
        .unwrap();
    let config = AgentConfig {
        kill_date: Some(yesterday),
        ..fast_config()
    };
    let (agent, transport) = make_agent(config);
    let session_id = agent.config().session_id.clone();

    assert_eq!(run_to_exit(agent).await, ExitReason::KillDate);

    let packets = transport.sent_packets().await;
    let notices: Vec<_> = packets.iter().filter(|p| p.kind == 2).collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].data, format!("agent {session_id} exiting"));
    assert_eq!(notices[0].id, "");
}

#[tokio::test]
async fn test_exit_task_terminates_and_acknowledges() {
    let (agent, transport) = make_agent(fast_config());
    push_task(&transport, 2, "", "task-exit").await;

    assert_eq!(run_to_exit(agent).await, ExitReason::ExitTask);
    let packets = transport.sent_packets().await;
    assert!(packets.iter().any(|p| p.kind == 2 && p.id == "task-exit"));
}

#[tokio::test]
async fn test_unknown_code_yields_exactly_one_error_response() {
    let (agent, transport) = make_agent(fast_config());
    let packet = TaskPacket::new(999, "whatever", "task-unknown");
    assert_eq!(agent.dispatch(&packet).await, Disposition::Continue);

    let packets = transport.sent_packets().await;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].kind, 0);
    assert_eq!(packets[0].data, "invalid tasking ID: 999");
    assert_eq!(packets[0].id, "task-unknown");
}

#[tokio::test]
async fn test_sysinfo_response_has_thirteen_fields() {
    let (agent, transport) = make_agent(fast_config());
    let packet = TaskPacket::new(1, "", "task-si");
    agent.dispatch(&packet).await;

    let packets = transport.sent_packets().await;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].kind, 1);
    assert_eq!(packets[0].id, "task-si");
    assert_eq!(packets[0].data.split('|').count(), 13);
}

#[tokio::test]
async fn test_upload_then_download_round_trips_file_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drop.bin");
    let path_str = path.to_str().unwrap();
    let content = b"round-trip payload bytes";

    let (agent, transport) = make_agent(fast_config());

    // Upload in two chunks; appends must concatenate in order.
    let (first, second) = content.split_at(10);
    for chunk in [first, second] {
        let body = format!("{path_str}|{}", BASE64.encode(chunk));
        agent
            .dispatch(&TaskPacket::new(42, body, "task-up"))
            .await;
    }
    assert_eq!(tokio::fs::read(&path).await.unwrap(), content);

    // Download it back; the job emits one type-41 part per chunk.
    agent
        .dispatch(&TaskPacket::new(41, path_str, "task-down"))
        .await;
    let mut reassembled = Vec::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let parts: Vec<_> = transport
            .sent_packets()
            .await
            .into_iter()
            .filter(|p| p.kind == 41)
            .collect();
        if !parts.is_empty() {
            for packet in &parts {
                assert_eq!(packet.id, "task-down");
                let part = FilePart::parse(&packet.data).unwrap();
                reassembled.extend(part.payload().unwrap());
            }
            break;
        }
    }
    assert_eq!(reassembled, content);
}

#[tokio::test]
async fn test_job_lifecycle_start_list_stop() {
    let (agent, transport) = make_agent(fast_config());

    // A shell job that would run far longer than the test.
    agent
        .dispatch(&TaskPacket::new(112, "sleep 30", "job-1"))
        .await;
    assert!(agent.jobs().contains("job-1").await);

    agent.dispatch(&TaskPacket::new(50, "", "task-list")).await;
    let packets = transport.sent_packets().await;
    let listing = packets
        .iter()
        .find(|p| p.kind == 50)
        .expect("job list response");
    assert!(listing.data.contains("job-1"));

    agent
        .dispatch(&TaskPacket::new(51, "job-1", "task-stop"))
        .await;
    assert!(!agent.jobs().contains("job-1").await);
    let packets = transport.sent_packets().await;
    assert!(packets.iter().any(|p| p.kind == 51 && p.id == "task-stop"));
}

#[tokio::test]
async fn test_stopping_unknown_job_reports_handled_error() {
    let (agent, transport) = make_agent(fast_config());
    agent
        .dispatch(&TaskPacket::new(51, "missing", "task-stop"))
        .await;

    let packets = transport.sent_packets().await;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].kind, 0);
    assert!(packets[0].data.contains("missing"));
    assert_eq!(packets[0].id, "task-stop");
}

#[tokio::test]
async fn test_duplicate_job_id_is_rejected_via_error_channel() {
    let (agent, transport) = make_agent(fast_config());
    agent
        .dispatch(&TaskPacket::new(112, "sleep 30", "dup"))
        .await;
    agent
        .dispatch(&TaskPacket::new(112, "sleep 30", "dup"))
        .await;

    let packets = transport.sent_packets().await;
    assert!(
        packets
            .iter()
            .any(|p| p.kind == 0 && p.data.contains("dup") && p.id == "dup")
    );
    agent.jobs().stop_all().await;
}

#[tokio::test]
async fn test_reserved_codes_are_silent() {
    let (agent, transport) = make_agent(fast_config());
    for code in [34, 111, 119] {
        let disposition = agent
            .dispatch(&TaskPacket::new(code, "", "task-res"))
            .await;
        assert_eq!(disposition, Disposition::Continue);
    }
    assert!(transport.sent_packets().await.is_empty());
}

#[tokio::test]
async fn test_placeholder_codes_answer_on_their_own_code() {
    let (agent, transport) = make_agent(fast_config());
    agent.dispatch(&TaskPacket::new(130, "", "task-130")).await;
    agent.dispatch(&TaskPacket::new(131, "", "task-131")).await;

    let packets = transport.sent_packets().await;
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].kind, 130);
    assert_eq!(packets[1].kind, 131);
    assert!(packets[0].data.contains("not implemented"));
}

#[tokio::test]
async fn test_script_run_codes_answer_on_their_own_code() {
    // 100 and 118 share the captured-run handler; each must echo the code
    // it arrived on.
    let config = AgentConfig {
        interpreter: "sh".to_string(),
        ..fast_config()
    };
    let (agent, transport) = make_agent(config);
    agent
        .dispatch(&TaskPacket::new(100, "echo first", "task-100"))
        .await;
    agent
        .dispatch(&TaskPacket::new(118, "echo second", "task-118"))
        .await;

    let packets = transport.sent_packets().await;
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].kind, 100);
    assert_eq!(packets[0].id, "task-100");
    assert_eq!(packets[0].data.trim(), "first");
    assert_eq!(packets[1].kind, 118);
    assert_eq!(packets[1].id, "task-118");
    assert_eq!(packets[1].data.trim(), "second");
}

#[tokio::test]
async fn test_directory_list_responds_with_json() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("seen.txt"), b"x")
        .await
        .unwrap();

    let (agent, transport) = make_agent(fast_config());
    agent
        .dispatch(&TaskPacket::new(
            43,
            dir.path().to_str().unwrap(),
            "task-ls",
        ))
        .await;

    let packets = transport.sent_packets().await;
    assert_eq!(packets[0].kind, 43);
    let value: serde_json::Value = serde_json::from_str(&packets[0].data).unwrap();
    assert_eq!(value["directory_path"], dir.path().to_str().unwrap());
    assert_eq!(value["items"][0]["name"], "seen.txt");
    assert_eq!(value["items"][0]["is_file"], true);
}

#[tokio::test]
async fn test_run_command_prebuilt_verb() {
    let (agent, transport) = make_agent(fast_config());
    agent
        .dispatch(&TaskPacket::new(40, "hostname", "task-hn"))
        .await;

    let packets = transport.sent_packets().await;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].kind, 40);
    assert!(!packets[0].data.trim().is_empty());
}
