//! Exercises the session/scheduler/backend pipeline end to end against the
//! deterministic demo backend, standing in for a real wire client.

use lmtp_core::kwargs::Kwargs;
use lmtp_core::transport::{FinishReason, MsgEvent, OutputPayload, TokenEvent};
use lmtp_server::server::backend_fake::DemoBackend;
use lmtp_server::server::scheduler::{ExecutionMode, SchedulerConfig, SchedulerRegistry};
use lmtp_server::server::session::{Command, TokenSession};
use lmtp_server::server::transport_stdio::RecordingTransport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_batch_size: 16,
        collection_window: Duration::from_millis(50),
        idle_sleep: Duration::from_millis(5),
        rate_window_samples: 50,
    }
}

fn new_session(
    static_session: bool,
) -> (Arc<TokenSession<DemoBackend>>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new());
    let registry = Arc::new(SchedulerRegistry::<DemoBackend>::new());
    let session = Arc::new(TokenSession::new(
        transport.clone(),
        registry,
        Kwargs::new(),
        static_session,
        false,
        ExecutionMode::Threaded,
        scheduler_config(),
        2,
        Duration::from_millis(5),
    ));
    (session, transport)
}

fn token_payloads_for(sent: &[(&'static str, OutputPayload)], stream_id: u64) -> Vec<lmtp_core::transport::TokenPayload> {
    sent.iter()
        .filter_map(|(_, payload)| match payload {
            OutputPayload::Token(TokenEvent::Token(p)) if p.stream_id == stream_id => Some(p.clone()),
            _ => None,
        })
        .collect()
}

async fn wait_for<F: Fn() -> bool>(predicate: F) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn single_generate_emits_one_token_per_step_until_eos() {
    let (session, transport) = new_session(false);

    let mut kwargs = Kwargs::new();
    kwargs.insert("max_tokens", 100_i64);
    kwargs.insert("stop_after", 3_i64);

    session.handle(Command::Generate {
        model: "demo".to_string(),
        stream_id: 1,
        prompt: vec![10, 11, 12],
        logit_bias: HashMap::new(),
        kwargs,
    });

    wait_for(|| {
        token_payloads_for(&transport.sent(), 1)
            .iter()
            .any(|p| p.finish_reason.is_some())
    })
    .await;

    let tokens = token_payloads_for(&transport.sent(), 1);
    assert_eq!(tokens.len(), 3);
    assert_eq!(tokens.last().unwrap().finish_reason, Some(FinishReason::Stop));
}

#[tokio::test]
async fn batching_groups_compatible_calls_into_one_batch() {
    let (session, transport) = new_session(false);

    for (stream_id, prompt) in [(1_u64, vec![1_u32, 2]), (2_u64, vec![1, 2, 3])] {
        let mut kwargs = Kwargs::new();
        kwargs.insert("max_tokens", 2_i64);
        session.handle(Command::Generate {
            model: "demo".to_string(),
            stream_id,
            prompt,
            logit_bias: HashMap::new(),
            kwargs,
        });
    }

    wait_for(|| {
        token_payloads_for(&transport.sent(), 1).len() >= 2
            && token_payloads_for(&transport.sent(), 2).len() >= 2
    })
    .await;

    assert!(token_payloads_for(&transport.sent(), 1).len() >= 2);
    assert!(token_payloads_for(&transport.sent(), 2).len() >= 2);
}

#[tokio::test]
async fn score_and_generate_never_share_a_batch() {
    let (session, transport) = new_session(false);

    let mut generate_kwargs = Kwargs::new();
    generate_kwargs.insert("max_tokens", 2_i64);
    session.handle(Command::Generate {
        model: "demo".to_string(),
        stream_id: 1,
        prompt: vec![1, 2],
        logit_bias: HashMap::new(),
        kwargs: generate_kwargs,
    });

    session.handle(Command::Score {
        model: "demo".to_string(),
        stream_id: 2,
        prompt: vec![1, 2],
        scored: vec![3, 4],
        kwargs: Kwargs::new(),
    });

    wait_for(|| {
        !token_payloads_for(&transport.sent(), 1).is_empty()
            && !token_payloads_for(&transport.sent(), 2).is_empty()
    })
    .await;

    assert!(!token_payloads_for(&transport.sent(), 1).is_empty());
    assert!(!token_payloads_for(&transport.sent(), 2).is_empty());
}

#[tokio::test]
async fn cancel_stops_generation_and_acknowledges() {
    let (session, transport) = new_session(false);

    let mut kwargs = Kwargs::new();
    kwargs.insert("max_tokens", 10_000_i64);
    kwargs.insert("stop_after", 10_000_i64);

    session.handle(Command::Generate {
        model: "demo".to_string(),
        stream_id: 1,
        prompt: vec![1],
        logit_bias: HashMap::new(),
        kwargs,
    });

    session.handle(Command::Cancel {
        stream_id: 2,
        target_stream_id: 1,
    });

    wait_for(|| {
        transport.sent().iter().any(|(_, p)| {
            matches!(
                p,
                OutputPayload::Token(TokenEvent::Error(e)) if e.stream_id == 1
            )
        })
    })
    .await;

    let sent = transport.sent();
    assert!(sent.iter().any(|(_, p)| matches!(
        p,
        OutputPayload::Msg(MsgEvent::Message { stream_id: 2, message }) if message == "cancel requested"
    )));
    assert!(sent.iter().any(|(_, p)| matches!(
        p,
        OutputPayload::Token(TokenEvent::Error(e)) if e.stream_id == 1 && e.error == "lmtp.cancelled"
    )));
}

#[tokio::test]
async fn static_session_refuses_unloaded_model() {
    let (session, transport) = new_session(true);

    session.handle(Command::ModelInfo {
        model: "never-loaded".to_string(),
        stream_id: 1,
    });

    wait_for(|| !transport.sent().is_empty()).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        &sent[0].1,
        OutputPayload::Msg(MsgEvent::Error { stream_id: 1, error })
            if error.contains("not loaded")
    ));
}

#[tokio::test]
async fn unknown_command_reports_client_visible_error() {
    let (session, transport) = new_session(false);

    session.handle(Command::Unknown {
        stream_id: 5,
        cmd: "frobnicate".to_string(),
    });

    wait_for(|| !transport.sent().is_empty()).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        &sent[0].1,
        OutputPayload::Msg(MsgEvent::Error { stream_id: 5, error })
            if error.contains("Unknown command") && error.contains("frobnicate")
    ));
}

#[tokio::test]
async fn closing_a_session_evicts_its_schedulers() {
    let transport = Arc::new(RecordingTransport::new());
    let registry = Arc::new(SchedulerRegistry::<DemoBackend>::new());
    let session = Arc::new(TokenSession::new(
        transport,
        registry.clone(),
        Kwargs::new(),
        false,
        false,
        ExecutionMode::Threaded,
        scheduler_config(),
        2,
        Duration::from_millis(5),
    ));

    for model in ["model-a", "model-b"] {
        let mut kwargs = Kwargs::new();
        kwargs.insert("max_tokens", 1_i64);
        session.handle(Command::Generate {
            model: model.to_string(),
            stream_id: 1,
            prompt: vec![1],
            logit_bias: HashMap::new(),
            kwargs,
        });
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    session.close();

    let scheduler_a = registry
        .instance("model-a", &Kwargs::new(), None, true, ExecutionMode::Threaded, scheduler_config(), 2)
        .err();
    let scheduler_b = registry
        .instance("model-b", &Kwargs::new(), None, true, ExecutionMode::Threaded, scheduler_config(), 2)
        .err();

    assert!(scheduler_a.is_some());
    assert!(scheduler_b.is_some());
}
