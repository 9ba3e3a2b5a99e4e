use std::{collections::VecDeque, sync::Arc, time::Duration};

use chrono::Utc;
use ota_common::{
    BridgeEvent, OtaTracker, PhoneCommand, TimerKind, TrackerAction, TrackerConfig, TrackerStatus,
    UpdateComponent,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::timers::TimerTable;

#[derive(Debug)]
pub enum SessionMsg {
    Begin,
    Bridge(BridgeEvent),
    TimerFired { kind: TimerKind, generation: u64 },
    Retry,
    Dispose,
}

/// Outbound half of the hardware bridge as seen by an update session.
pub trait CommandBridge: Send + 'static {
    fn send_command(&self, command: PhoneCommand) -> anyhow::Result<()>;
}

/// A mounted update screen: one tracker driven by one task.
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionMsg>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn send(&self, msg: SessionMsg) {
        if self.tx.send(msg).is_err() {
            debug!("ota session already closed");
        }
    }

    /// Unmounts the session; its task drains and exits.
    pub fn dispose(self) -> JoinHandle<()> {
        self.send(SessionMsg::Dispose);
        self.task
    }
}

pub fn spawn_session<B: CommandBridge>(
    config: TrackerConfig,
    sequence: Vec<UpdateComponent>,
    bridge: B,
    status: Arc<Mutex<TrackerStatus>>,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    info!(
        "mounting ota session for [{}]",
        sequence
            .iter()
            .map(|component| component.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let session = Session {
        tracker: OtaTracker::new(config, sequence),
        timers: TimerTable::new(tx.clone()),
        bridge,
        status,
    };
    let task = tokio::spawn(session.run(rx));

    let handle = SessionHandle { tx, task };
    handle.send(SessionMsg::Begin);
    handle
}

struct Session<B> {
    tracker: OtaTracker,
    timers: TimerTable,
    bridge: B,
    status: Arc<Mutex<TrackerStatus>>,
}

impl<B: CommandBridge> Session<B> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMsg>) {
        while let Some(msg) = rx.recv().await {
            let before = self.tracker.state();
            let dispose = matches!(msg, SessionMsg::Dispose);

            let actions = match msg {
                SessionMsg::Begin => self.tracker.begin(),
                SessionMsg::Bridge(event) => self.tracker.handle_event(&event),
                SessionMsg::TimerFired { kind, generation } => {
                    if !self.timers.claim(kind, generation) {
                        debug!("dropping stale {kind:?} timer expiry");
                        continue;
                    }
                    self.tracker.timer_fired(kind)
                }
                SessionMsg::Retry => self.tracker.retry(),
                SessionMsg::Dispose => self.tracker.dispose(),
            };
            self.execute(actions);

            if dispose {
                *self.status.lock().await = TrackerStatus::idle();
                break;
            }

            let after = self.tracker.state();
            if before != after {
                info!("ota session: {} -> {}", before.as_str(), after.as_str());
            }
            *self.status.lock().await = self.tracker.status();
        }

        self.timers.cancel_all();
        info!("ota session closed");
    }

    fn execute(&mut self, actions: Vec<TrackerAction>) {
        let mut pending: VecDeque<TrackerAction> = actions.into();

        while let Some(action) = pending.pop_front() {
            match action {
                TrackerAction::SendStart => {
                    let command = PhoneCommand::OtaStart {
                        timestamp: Utc::now().timestamp_millis(),
                    };
                    match self.bridge.send_command(command) {
                        Ok(()) => info!(
                            "sent ota_start (attempt {} of {})",
                            self.tracker.attempts(),
                            self.tracker.config.max_retries
                        ),
                        Err(err) => {
                            warn!("ota_start dispatch failed: {err:#}");
                            pending.extend(self.tracker.start_dispatch_failed(&format!("{err:#}")));
                        }
                    }
                }
                TrackerAction::ArmTimer { kind, after_ms } => {
                    self.timers.arm(kind, Duration::from_millis(after_ms));
                }
                TrackerAction::CancelTimer(kind) => self.timers.cancel(kind),
                TrackerAction::CancelAllTimers => self.timers.cancel_all(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use ota_common::{LinkState, ProgressEvent, ProgressStage, ProgressStatus, SessionState};

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingBridge {
        sent: Arc<StdMutex<Vec<PhoneCommand>>>,
        reject: bool,
    }

    impl RecordingBridge {
        fn starts(&self) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|command| matches!(command, PhoneCommand::OtaStart { .. }))
                .count()
        }
    }

    impl CommandBridge for RecordingBridge {
        fn send_command(&self, command: PhoneCommand) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(command);
            if self.reject {
                anyhow::bail!("glasses not connected");
            }
            Ok(())
        }
    }

    fn installed(component: UpdateComponent) -> BridgeEvent {
        BridgeEvent::Progress(ProgressEvent {
            component,
            stage: ProgressStage::Install,
            status: ProgressStatus::Finished,
            percent: 100,
            error_message: None,
        })
    }

    async fn state_of(status: &Arc<Mutex<TrackerStatus>>) -> Option<SessionState> {
        status.lock().await.state
    }

    fn mount(
        sequence: Vec<UpdateComponent>,
        bridge: RecordingBridge,
    ) -> (SessionHandle, Arc<Mutex<TrackerStatus>>) {
        let status = Arc::new(Mutex::new(TrackerStatus::idle()));
        let handle = spawn_session(TrackerConfig::default(), sequence, bridge, status.clone());
        (handle, status)
    }

    #[tokio::test(start_paused = true)]
    async fn silent_glasses_fail_after_fifteen_seconds() {
        let bridge = RecordingBridge::default();
        let (_handle, status) = mount(vec![UpdateComponent::Apk], bridge.clone());

        tokio::time::sleep(Duration::from_millis(14_900)).await;
        assert_eq!(state_of(&status).await, Some(SessionState::Starting));
        assert_eq!(bridge.starts(), 3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = status.lock().await.clone();
        assert_eq!(snapshot.state, Some(SessionState::Failed));
        assert_eq!(
            snapshot.error_message.as_deref(),
            Some("No response from glasses")
        );
        assert_eq!(bridge.starts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_dispatch_is_retried_then_fails() {
        let bridge = RecordingBridge {
            reject: true,
            ..RecordingBridge::default()
        };
        let (_handle, status) = mount(vec![UpdateComponent::Apk], bridge.clone());

        tokio::time::sleep(Duration::from_secs(16)).await;
        let snapshot = status.lock().await.clone();
        assert_eq!(snapshot.state, Some(SessionState::Failed));
        assert_eq!(
            snapshot.error_message.as_deref(),
            Some("Could not reach the glasses to start the update")
        );
        assert_eq!(bridge.starts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bridge_events_drive_the_session() {
        let bridge = RecordingBridge::default();
        let (handle, status) = mount(
            vec![UpdateComponent::Mtk, UpdateComponent::Bes],
            bridge.clone(),
        );

        handle.send(SessionMsg::Bridge(installed(UpdateComponent::Mtk)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state_of(&status).await, Some(SessionState::Transitioning));

        handle.send(SessionMsg::Bridge(installed(UpdateComponent::Bes)));
        handle.send(SessionMsg::Bridge(BridgeEvent::HardwareLink(LinkState::Down)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state_of(&status).await, Some(SessionState::Restarting));

        handle.send(SessionMsg::Bridge(BridgeEvent::HardwareLink(LinkState::Up)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state_of(&status).await, Some(SessionState::Completed));

        // The retry timer never fired again after the first progress event.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(bridge.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_failure_sends_a_fresh_start() {
        let bridge = RecordingBridge::default();
        let (handle, status) = mount(vec![UpdateComponent::Apk], bridge.clone());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(state_of(&status).await, Some(SessionState::Failed));

        handle.send(SessionMsg::Retry);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let snapshot = status.lock().await.clone();
        assert_eq!(snapshot.state, Some(SessionState::Starting));
        assert_eq!(snapshot.attempts, 1);
        assert!(snapshot.error_message.is_none());
        assert_eq!(bridge.starts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_session_never_updates_status_again() {
        let bridge = RecordingBridge::default();
        let (handle, status) = mount(vec![UpdateComponent::Apk], bridge.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bridge.starts(), 1);

        let task = handle.dispose();
        task.await.unwrap();
        assert_eq!(*status.lock().await, TrackerStatus::idle());

        // Well past every retry and watchdog deadline.
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(*status.lock().await, TrackerStatus::idle());
        assert_eq!(bridge.starts(), 1);
    }
}
