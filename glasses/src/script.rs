use std::time::Duration;

use ota_common::{
    wire::{BesOtaBody, OtaProgressPayload},
    GlassesMessage, ProgressStage, ProgressStatus, UpdateComponent,
};

const STEP_PAUSE: Duration = Duration::from_millis(400);
const APK_SIZE_BYTES: u64 = 48 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Send(GlassesMessage),
    Pause(Duration),
    /// Drop off the link and come back, as the glasses do after flashing the Bluetooth chip.
    Reboot,
}

/// What the glasses report while applying `updates` in order.
///
/// With `fail_at` set, that component reports a failure after its first
/// progress report and the script stops there.
pub fn update_script(updates: &[UpdateComponent], fail_at: Option<UpdateComponent>) -> Vec<Step> {
    let mut steps = Vec::new();
    for &component in updates {
        let fails = fail_at == Some(component);
        let finished = match component {
            UpdateComponent::Apk => apk_steps(&mut steps, fails),
            UpdateComponent::Mtk => mtk_steps(&mut steps, fails),
            UpdateComponent::Bes => bes_steps(&mut steps, fails),
        };
        if !finished {
            break;
        }
    }
    steps
}

fn apk_steps(steps: &mut Vec<Step>, fails: bool) -> bool {
    let component = UpdateComponent::Apk;
    push(steps, progress(component, ProgressStage::Download, ProgressStatus::Started, 0));

    for percent in (10..=100).step_by(10) {
        if fails && percent > 10 {
            push(steps, failure(component, ProgressStage::Download));
            return false;
        }
        let mut payload = progress(
            component,
            ProgressStage::Download,
            ProgressStatus::Progress,
            percent,
        );
        if let GlassesMessage::OtaProgress(inner) = &mut payload {
            inner.total_bytes = APK_SIZE_BYTES;
            inner.bytes_downloaded = APK_SIZE_BYTES * percent as u64 / 100;
        }
        push(steps, payload);
    }

    push(steps, progress(component, ProgressStage::Download, ProgressStatus::Finished, 100));
    push(steps, progress(component, ProgressStage::Install, ProgressStatus::Started, 0));
    push(steps, progress(component, ProgressStage::Install, ProgressStatus::Finished, 100));
    true
}

fn mtk_steps(steps: &mut Vec<Step>, fails: bool) -> bool {
    let component = UpdateComponent::Mtk;
    push(steps, progress(component, ProgressStage::Install, ProgressStatus::Started, 0));

    for percent in (20..=100).step_by(20) {
        if fails && percent > 20 {
            push(steps, failure(component, ProgressStage::Install));
            return false;
        }
        push(
            steps,
            progress(
                component,
                ProgressStage::Install,
                ProgressStatus::Progress,
                percent,
            ),
        );
    }

    push(
        steps,
        GlassesMessage::MtkUpdateComplete {
            message: "MTK firmware updated. Please restart glasses.".to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        },
    );
    true
}

fn bes_steps(steps: &mut Vec<Step>, fails: bool) -> bool {
    for raw in (0..100).step_by(7) {
        if fails && raw > 0 {
            push(steps, bes_report("error", raw, Some("Bluetooth chip rejected the image")));
            return false;
        }
        push(steps, bes_report("update", raw, None));
    }
    push(steps, bes_report("success", 100, None));
    steps.push(Step::Reboot);
    true
}

fn push(steps: &mut Vec<Step>, message: GlassesMessage) {
    steps.push(Step::Send(message));
    steps.push(Step::Pause(STEP_PAUSE));
}

fn progress(
    component: UpdateComponent,
    stage: ProgressStage,
    status: ProgressStatus,
    percent: i32,
) -> GlassesMessage {
    GlassesMessage::OtaProgress(OtaProgressPayload {
        stage,
        status,
        progress: percent,
        bytes_downloaded: 0,
        total_bytes: 0,
        current_update: component,
        error_message: None,
    })
}

fn failure(component: UpdateComponent, stage: ProgressStage) -> GlassesMessage {
    let mut message = progress(component, stage, ProgressStatus::Failed, 0);
    if let GlassesMessage::OtaProgress(inner) = &mut message {
        inner.error_message = Some(format!(
            "Simulated failure while updating {}",
            component.label()
        ));
    }
    message
}

fn bes_report(kind: &str, progress: i32, message: Option<&str>) -> GlassesMessage {
    GlassesMessage::SrAdota {
        body: BesOtaBody {
            kind: kind.to_string(),
            progress,
            message: message.map(str::to_string),
        },
    }
}

#[cfg(test)]
mod tests {
    use ota_common::{
        BridgeDecoder, BridgeEvent, OtaTracker, SessionState, TrackerConfig,
        UpdateComponent::{Apk, Bes, Mtk},
    };

    use super::*;

    fn play(tracker: &mut OtaTracker, steps: &[Step]) {
        let mut decoder = BridgeDecoder::default();
        tracker.begin();
        for step in steps {
            if let Step::Send(message) = step {
                if let Some(event) = decoder.translate(message.clone()) {
                    tracker.handle_event(&event);
                }
            }
        }
    }

    #[test]
    fn full_script_walks_the_tracker_to_restarting() {
        let steps = update_script(&[Apk, Mtk, Bes], None);
        assert_eq!(steps.last(), Some(&Step::Reboot));

        let mut tracker = OtaTracker::new(TrackerConfig::default(), vec![Apk, Mtk, Bes]);
        play(&mut tracker, &steps);
        assert_eq!(tracker.state(), SessionState::Restarting);
    }

    #[test]
    fn script_without_bluetooth_completes() {
        let steps = update_script(&[Apk, Mtk], None);
        assert!(!steps.contains(&Step::Reboot));

        let mut tracker = OtaTracker::new(TrackerConfig::default(), vec![Apk, Mtk]);
        play(&mut tracker, &steps);
        assert_eq!(tracker.state(), SessionState::Completed);
    }

    #[test]
    fn injected_failure_stops_the_script() {
        let steps = update_script(&[Apk, Mtk, Bes], Some(Mtk));
        let mut decoder = BridgeDecoder::default();
        let last_event = steps
            .iter()
            .filter_map(|step| match step {
                Step::Send(message) => decoder.translate(message.clone()),
                _ => None,
            })
            .last();

        match last_event {
            Some(BridgeEvent::Progress(event)) => {
                assert_eq!(event.component, Mtk);
                assert_eq!(event.status, ProgressStatus::Failed);
            }
            other => panic!("expected a failure report, got {other:?}"),
        }

        let mut tracker = OtaTracker::new(TrackerConfig::default(), vec![Apk, Mtk, Bes]);
        play(&mut tracker, &steps);
        assert_eq!(tracker.state(), SessionState::Failed);
        assert_eq!(
            tracker.error_message(),
            Some("Simulated failure while updating System firmware")
        );
    }
}
