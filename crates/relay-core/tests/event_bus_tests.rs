mod common;

use common::{pipeline, shell_stage};
use relay_core::events::{EventBus, EventSink, PipelineEvent};
use relay_core::types::{PipelineState, TriggerInfo, TriggerKind};

fn sample_state() -> PipelineState {
    PipelineState::new(
        "01ARZ3NDEKTSV4RRFFQ69G5FAV",
        pipeline("events", vec![shell_stage("only", "true", &[])]),
        TriggerInfo::now(TriggerKind::Manual, None),
    )
}

#[tokio::test]
async fn subscriber_receives_events_in_order() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe();

    bus.emit(PipelineEvent::PipelineStarted {
        state: sample_state(),
    });
    bus.emit(PipelineEvent::StageStarted {
        state: sample_state(),
        stage_name: "only".to_string(),
    });
    bus.emit(PipelineEvent::PipelineCompleted {
        state: sample_state(),
        partial: false,
    });

    assert_eq!(sub.recv().await.unwrap().name(), "pipeline.started");
    assert_eq!(sub.recv().await.unwrap().name(), "stage.started");
    let last = sub.recv().await.unwrap();
    assert_eq!(last.name(), "pipeline.completed");
    assert!(last.is_terminal());
    assert_eq!(sub.dropped(), 0);
}

#[tokio::test]
async fn slow_subscriber_drops_oldest_and_counts() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe();

    // Overflow the 256-slot channel without receiving.
    for _ in 0..300 {
        bus.emit(PipelineEvent::StageStarted {
            state: sample_state(),
            stage_name: "noisy".to_string(),
        });
    }

    let mut received = 0usize;
    while sub.try_recv().is_some() {
        received += 1;
    }

    assert_eq!(received, 256, "channel retains its capacity");
    assert_eq!(sub.dropped(), 44, "oldest events are counted as dropped");
}

#[tokio::test]
async fn emit_without_subscribers_is_fire_and_forget() {
    let bus = EventBus::new();
    // Must not panic or block.
    bus.emit(PipelineEvent::PipelineFailed {
        state: sample_state(),
    });
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn event_names_are_stable() {
    let state = sample_state;
    let cases = [
        (
            PipelineEvent::PipelineStarted { state: state() },
            "pipeline.started",
        ),
        (
            PipelineEvent::PipelineCompleted {
                state: state(),
                partial: true,
            },
            "pipeline.completed",
        ),
        (
            PipelineEvent::PipelineFailed { state: state() },
            "pipeline.failed",
        ),
        (
            PipelineEvent::PipelineAborted { state: state() },
            "pipeline.aborted",
        ),
        (
            PipelineEvent::StageStarted {
                state: state(),
                stage_name: "s".into(),
            },
            "stage.started",
        ),
        (
            PipelineEvent::StageCompleted {
                state: state(),
                stage_name: "s".into(),
            },
            "stage.completed",
        ),
        (
            PipelineEvent::StageFailed {
                state: state(),
                stage_name: "s".into(),
            },
            "stage.failed",
        ),
        (
            PipelineEvent::PrCreated {
                state: state(),
                pr_url: "u".into(),
            },
            "pr.created",
        ),
    ];
    for (event, expected) in cases {
        assert_eq!(event.name(), expected);
    }
}
