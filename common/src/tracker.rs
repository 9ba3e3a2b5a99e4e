use crate::{
    config::TrackerConfig,
    events::BridgeEvent,
    types::{
        LinkState, ProgressEvent, ProgressStage, ProgressStatus, SessionState, TrackerStatus,
        UpdateComponent,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Retry,
    Watchdog,
    Transition,
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerAction {
    SendStart,
    /// Replaces any pending timer of the same kind.
    ArmTimer {
        kind: TimerKind,
        after_ms: u64,
    },
    CancelTimer(TimerKind),
    CancelAllTimers,
}

/// Lifecycle of the component currently in flight. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ComponentPhase {
    Pending,
    Downloading,
    Installing,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Starting,
    Downloading { percent: u8 },
    Installing { percent: u8 },
    Transitioning,
    Restarting,
    Completed,
    Failed { reason: String },
    Disconnected,
    WifiDisconnected,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Self::Starting => SessionState::Starting,
            Self::Downloading { .. } => SessionState::Downloading,
            Self::Installing { .. } => SessionState::Installing,
            Self::Transitioning => SessionState::Transitioning,
            Self::Restarting => SessionState::Restarting,
            Self::Completed => SessionState::Completed,
            Self::Failed { .. } => SessionState::Failed,
            Self::Disconnected => SessionState::Disconnected,
            Self::WifiDisconnected => SessionState::WifiDisconnected,
        }
    }

    fn timer(&self) -> Option<TimerKind> {
        match self {
            Self::Starting => Some(TimerKind::Retry),
            Self::Downloading { .. } | Self::Installing { .. } => Some(TimerKind::Watchdog),
            Self::Transitioning => Some(TimerKind::Transition),
            Self::Restarting => Some(TimerKind::Restart),
            _ => None,
        }
    }
}

/// Progress state machine behind the glasses update screens.
///
/// Consumes hardware events, timer expiries and user actions one at a time
/// and answers with the side effects the runtime must perform. It never
/// touches a clock or the bridge itself.
#[derive(Debug, Clone)]
pub struct OtaTracker {
    pub config: TrackerConfig,

    phase: Phase,
    sequence: Vec<UpdateComponent>,
    index: usize,
    component_phase: ComponentPhase,

    attempts: u8,
    received_progress: bool,
    dispatch_error: Option<String>,
    disposed: bool,
}

impl OtaTracker {
    pub fn new(config: TrackerConfig, sequence: Vec<UpdateComponent>) -> Self {
        Self {
            config,
            phase: Phase::Starting,
            sequence,
            index: 0,
            component_phase: ComponentPhase::Pending,
            attempts: 0,
            received_progress: false,
            dispatch_error: None,
            disposed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.phase.state()
    }

    pub fn sequence(&self) -> &[UpdateComponent] {
        &self.sequence
    }

    pub fn component(&self) -> Option<UpdateComponent> {
        self.sequence
            .get(self.index)
            .or_else(|| self.sequence.last())
            .copied()
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.phase {
            Phase::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Mounts the session: sends the first start command or, with nothing to
    /// apply, completes immediately.
    pub fn begin(&mut self) -> Vec<TrackerAction> {
        if self.disposed || self.attempts > 0 || self.phase != Phase::Starting {
            return Vec::new();
        }

        if self.sequence.is_empty() {
            self.phase = Phase::Completed;
            return Vec::new();
        }

        self.attempts = 1;
        vec![TrackerAction::SendStart, self.arm_retry()]
    }

    pub fn handle_event(&mut self, event: &BridgeEvent) -> Vec<TrackerAction> {
        if self.disposed {
            return Vec::new();
        }

        match event {
            BridgeEvent::Progress(progress) => self.on_progress(progress),
            BridgeEvent::MtkUpdateComplete { .. } => self.on_progress(&ProgressEvent {
                component: UpdateComponent::Mtk,
                stage: ProgressStage::Install,
                status: ProgressStatus::Finished,
                percent: 100,
                error_message: None,
            }),
            BridgeEvent::UpdatesAvailable(offer) => self.revise_sequence(&offer.updates),
            BridgeEvent::HardwareLink(LinkState::Down) => self.on_hardware_down(),
            BridgeEvent::HardwareLink(LinkState::Up) => self.on_hardware_up(),
            BridgeEvent::NetworkLink(LinkState::Down) => self.on_network_down(),
            BridgeEvent::NetworkLink(LinkState::Up) | BridgeEvent::WifiScanResults(_) => {
                Vec::new()
            }
        }
    }

    pub fn timer_fired(&mut self, kind: TimerKind) -> Vec<TrackerAction> {
        if self.disposed {
            return Vec::new();
        }

        let mut actions = Vec::new();
        match (kind, self.state()) {
            (TimerKind::Retry, SessionState::Starting) if !self.received_progress => {
                if self.attempts < self.config.max_retries {
                    self.attempts += 1;
                    actions.push(TrackerAction::SendStart);
                    actions.push(self.arm_retry());
                } else {
                    let reason = if self.dispatch_error.is_some() {
                        "Could not reach the glasses to start the update"
                    } else {
                        "No response from glasses"
                    };
                    self.settle(
                        Phase::Failed {
                            reason: reason.to_string(),
                        },
                        &mut actions,
                    );
                }
            }
            (TimerKind::Watchdog, SessionState::Downloading | SessionState::Installing) => {
                self.settle(
                    Phase::Failed {
                        reason: "Update stalled: no progress from glasses".to_string(),
                    },
                    &mut actions,
                );
            }
            (TimerKind::Transition, SessionState::Transitioning) => {
                self.settle(Phase::Completed, &mut actions);
            }
            (TimerKind::Restart, SessionState::Restarting) => {
                // Only a restart after the last component was applied counts as success.
                let next = if self.all_finished() {
                    Phase::Completed
                } else {
                    Phase::Failed {
                        reason: "Glasses did not reconnect after restarting".to_string(),
                    }
                };
                self.settle(next, &mut actions);
            }
            _ => {}
        }
        actions
    }

    /// Records a rejected start command. The retry timer decides whether to resend.
    pub fn start_dispatch_failed(&mut self, message: &str) -> Vec<TrackerAction> {
        if !self.disposed && self.phase == Phase::Starting {
            self.dispatch_error = Some(message.to_string());
        }
        Vec::new()
    }

    pub fn retry(&mut self) -> Vec<TrackerAction> {
        if self.disposed
            || !matches!(
                self.phase,
                Phase::Failed { .. } | Phase::Disconnected | Phase::WifiDisconnected
            )
        {
            return Vec::new();
        }

        let mut actions = vec![TrackerAction::CancelAllTimers];
        self.attempts = 1;
        self.received_progress = false;
        self.dispatch_error = None;

        if self.component_phase == ComponentPhase::Finished {
            self.index += 1;
        }
        self.component_phase = ComponentPhase::Pending;

        if self.index >= self.sequence.len() {
            self.phase = Phase::Completed;
            return actions;
        }

        self.phase = Phase::Starting;
        actions.push(TrackerAction::SendStart);
        actions.push(self.arm_retry());
        actions
    }

    /// Drops pending components a version re-check found already satisfied.
    ///
    /// Finished components and the one in flight are kept; only the pending
    /// tail is filtered against `remaining`.
    pub fn revise_sequence(&mut self, remaining: &[UpdateComponent]) -> Vec<TrackerAction> {
        if self.disposed || self.state().is_terminal() {
            return Vec::new();
        }

        let first_pending = if self.component_phase == ComponentPhase::Pending {
            self.index
        } else {
            self.index + 1
        }
        .min(self.sequence.len());

        let tail: Vec<UpdateComponent> = self.sequence[first_pending..]
            .iter()
            .copied()
            .filter(|component| remaining.contains(component))
            .collect();
        self.sequence.truncate(first_pending);
        self.sequence.extend(tail);

        let mut actions = Vec::new();
        match self.phase {
            Phase::Starting | Phase::Transitioning if self.index >= self.sequence.len() => {
                self.index = self.sequence.len().saturating_sub(1);
                self.component_phase = ComponentPhase::Finished;
                self.settle(Phase::Completed, &mut actions);
            }
            Phase::Transitioning => {
                actions.push(TrackerAction::ArmTimer {
                    kind: TimerKind::Transition,
                    after_ms: self.config.transition_watchdog_ms,
                });
            }
            _ => {}
        }
        actions
    }

    /// Unmount. Every later input is ignored.
    pub fn dispose(&mut self) -> Vec<TrackerAction> {
        if self.disposed {
            return Vec::new();
        }
        self.disposed = true;
        vec![TrackerAction::CancelAllTimers]
    }

    pub fn status(&self) -> TrackerStatus {
        let component = self.component();
        let total = self.sequence.len();
        let state = self.state();

        let raw_percent = match &self.phase {
            Phase::Downloading { percent } | Phase::Installing { percent } => *percent,
            Phase::Completed => 100,
            Phase::Restarting if self.component_phase == ComponentPhase::Finished => 100,
            _ => 0,
        };

        let label = component.map(UpdateComponent::label).unwrap_or("Update");
        let (phase, message) = match &self.phase {
            Phase::Starting if self.attempts > 1 => (
                "Preparing update",
                format!(
                    "Waiting for glasses to start the update (attempt {} of {})",
                    self.attempts, self.config.max_retries
                ),
            ),
            Phase::Starting => (
                "Preparing update",
                "Waiting for glasses to start the update".to_string(),
            ),
            Phase::Downloading { .. } => ("Downloading", format!("Downloading {label}")),
            Phase::Installing { .. } => ("Installing", format!("Installing {label}")),
            Phase::Transitioning => (
                "Starting update",
                format!("Starting update {} of {}", self.index + 1, total),
            ),
            Phase::Restarting => (
                "Restarting",
                "Glasses are restarting to finish the update".to_string(),
            ),
            Phase::Completed => ("Completed", "Update complete".to_string()),
            Phase::Failed { .. } => ("Failed", "Update failed".to_string()),
            Phase::Disconnected => (
                "Disconnected",
                "Glasses disconnected. Reconnect them and retry.".to_string(),
            ),
            Phase::WifiDisconnected => (
                "Wi-Fi disconnected",
                "Glasses lost Wi-Fi. Reconnect them to a network and retry.".to_string(),
            ),
        };

        TrackerStatus {
            state: Some(state),
            phase: phase.to_string(),
            component,
            component_label: component.map(UpdateComponent::label),
            component_number: (self.index + 1).min(total),
            component_total: total,
            percent: display_percent(raw_percent, self.config.percent_step),
            indeterminate: state == SessionState::Installing
                && component.is_some_and(|component| !component.reports_install_progress()),
            message,
            error_message: self.error_message().map(str::to_string),
            attempts: self.attempts,
        }
    }

    fn on_progress(&mut self, event: &ProgressEvent) -> Vec<TrackerAction> {
        if !matches!(
            self.phase,
            Phase::Starting
                | Phase::Downloading { .. }
                | Phase::Installing { .. }
                | Phase::Transitioning
                | Phase::Restarting
        ) {
            return Vec::new();
        }

        let Some(position) = self
            .sequence
            .iter()
            .position(|component| *component == event.component)
        else {
            return Vec::new();
        };
        if position < self.index
            || (position == self.index && self.component_phase == ComponentPhase::Finished)
        {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if !self.received_progress {
            self.received_progress = true;
            actions.push(TrackerAction::CancelTimer(TimerKind::Retry));
        }

        if position > self.index {
            // The glasses moved on; whatever finished in between was never reported.
            self.index = position;
            self.component_phase = ComponentPhase::Pending;
        }

        if event.status == ProgressStatus::Failed {
            let reason = event
                .error_message
                .clone()
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| "Update failed".to_string());
            self.settle(Phase::Failed { reason }, &mut actions);
            return actions;
        }

        if event.status == ProgressStatus::Finished && event.stage == ProgressStage::Install {
            self.finish_component(&mut actions);
            return actions;
        }

        let target = if event.stage == ProgressStage::Install || event.component.always_installing()
        {
            ComponentPhase::Installing
        } else {
            ComponentPhase::Downloading
        };
        if target < self.component_phase {
            return actions;
        }

        let percent = match (event.status, target) {
            (ProgressStatus::Finished, ComponentPhase::Downloading) => 100,
            (ProgressStatus::Finished, _) => self.current_percent(),
            _ => event.percent.min(100),
        };

        self.component_phase = target;
        let next = if target == ComponentPhase::Installing {
            Phase::Installing { percent }
        } else {
            Phase::Downloading { percent }
        };
        self.enter(next, &mut actions);
        actions.push(TrackerAction::ArmTimer {
            kind: TimerKind::Watchdog,
            after_ms: self.watchdog_ms(event.component, target),
        });
        actions
    }

    fn finish_component(&mut self, actions: &mut Vec<TrackerAction>) {
        self.component_phase = ComponentPhase::Finished;
        let Some(component) = self.sequence.get(self.index).copied() else {
            return;
        };

        if self.index + 1 >= self.sequence.len() {
            if component.restarts_device() {
                self.enter(Phase::Restarting, actions);
                actions.push(TrackerAction::ArmTimer {
                    kind: TimerKind::Restart,
                    after_ms: self.config.restart_watchdog_ms,
                });
            } else {
                self.settle(Phase::Completed, actions);
            }
            return;
        }

        self.index += 1;
        self.component_phase = ComponentPhase::Pending;
        self.enter(Phase::Transitioning, actions);
        actions.push(TrackerAction::ArmTimer {
            kind: TimerKind::Transition,
            after_ms: self.config.transition_watchdog_ms,
        });
    }

    fn on_hardware_down(&mut self) -> Vec<TrackerAction> {
        let mut actions = Vec::new();
        match self.phase {
            Phase::Installing { .. } | Phase::Restarting => {
                self.enter(Phase::Restarting, &mut actions);
                actions.push(TrackerAction::ArmTimer {
                    kind: TimerKind::Restart,
                    after_ms: self.config.restart_watchdog_ms,
                });
            }
            Phase::Completed | Phase::Failed { .. } | Phase::Disconnected => {}
            Phase::Starting
            | Phase::Downloading { .. }
            | Phase::Transitioning
            | Phase::WifiDisconnected => {
                self.settle(Phase::Disconnected, &mut actions);
            }
        }
        actions
    }

    fn on_hardware_up(&mut self) -> Vec<TrackerAction> {
        let mut actions = Vec::new();
        if self.phase != Phase::Restarting {
            return actions;
        }

        if self.all_finished() {
            self.settle(Phase::Completed, &mut actions);
            return actions;
        }

        // Rebooted mid-install; the glasses resume the same component.
        let Some(component) = self.sequence.get(self.index).copied() else {
            self.settle(Phase::Completed, &mut actions);
            return actions;
        };
        self.component_phase = self.component_phase.max(ComponentPhase::Installing);
        self.enter(Phase::Installing { percent: 0 }, &mut actions);
        actions.push(TrackerAction::ArmTimer {
            kind: TimerKind::Watchdog,
            after_ms: self.watchdog_ms(component, ComponentPhase::Installing),
        });
        actions
    }

    fn on_network_down(&mut self) -> Vec<TrackerAction> {
        let mut actions = Vec::new();
        if matches!(self.phase, Phase::Starting | Phase::Downloading { .. }) {
            self.settle(Phase::WifiDisconnected, &mut actions);
        }
        actions
    }

    fn enter(&mut self, next: Phase, actions: &mut Vec<TrackerAction>) {
        if let Some(kind) = self.phase.timer() {
            if next.timer() != Some(kind) {
                actions.push(TrackerAction::CancelTimer(kind));
            }
        }
        self.phase = next;
    }

    /// Enters a state that waits on the user, not on a timer.
    fn settle(&mut self, next: Phase, actions: &mut Vec<TrackerAction>) {
        self.phase = next;
        actions.push(TrackerAction::CancelAllTimers);
    }

    fn all_finished(&self) -> bool {
        self.component_phase == ComponentPhase::Finished && self.index + 1 >= self.sequence.len()
    }

    fn arm_retry(&self) -> TrackerAction {
        TrackerAction::ArmTimer {
            kind: TimerKind::Retry,
            after_ms: self.config.retry_interval_ms,
        }
    }

    fn current_percent(&self) -> u8 {
        match self.phase {
            Phase::Downloading { percent } | Phase::Installing { percent } => percent,
            _ => 0,
        }
    }

    fn watchdog_ms(&self, component: UpdateComponent, phase: ComponentPhase) -> u64 {
        if phase == ComponentPhase::Installing && component.always_installing() {
            self.config.system_install_watchdog_ms
        } else {
            self.config.progress_watchdog_ms
        }
    }
}

/// Snaps a percentage to the nearest display step so the bar does not jitter.
pub fn display_percent(percent: u8, step: u8) -> u8 {
    let step = u16::from(step.max(1));
    let percent = u16::from(percent.min(100));
    (((percent + step / 2) / step) * step).min(100) as u8
}
