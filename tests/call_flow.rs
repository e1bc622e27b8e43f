mod common;

use common::*;
use parley::peer::{LinkState, PeerEventKind, SessionDescription};
use parley::transport::{MemoryBackend, MemoryRelay, SignalEnvelope, SignalInbound, SignalKind, SignalingConnector};
use parley::{CallError, CallState, CoordinatorError, CoordinatorEvent, Identity};

fn ident(id: &str) -> Identity {
    Identity {
        id: id.into(),
        display_name: id.into(),
    }
}

#[tokio::test]
async fn two_parties_call_and_hang_up() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let mut u1 = connected_party(&backend, &relay, "u1", FakeMedia::new()).await;
    let mut u2 = connected_party(&backend, &relay, "u2", FakeMedia::new()).await;

    u1.coord.start_call(&u2.id).await.expect("start");
    u1.wait_state(CallState::Connected).await;
    u2.wait_state(CallState::Negotiating).await;

    // the answerer is connected once its transport says so
    u2.links.last().emit(PeerEventKind::StateChanged(LinkState::Connected));
    u2.wait_state(CallState::Connected).await;

    assert_eq!(
        u1.drain_states(),
        vec![
            CallState::AwaitingMedia,
            CallState::Negotiating,
            CallState::Connected
        ]
    );
    assert_eq!(
        u2.drain_states(),
        vec![CallState::Negotiating, CallState::Connected]
    );

    let offer_seen = u2.links.last().remote_descriptions();
    assert_eq!(offer_seen, vec![SessionDescription::offer("v=0 offer-1")]);
    let answer_seen = u1.links.last().remote_descriptions();
    assert_eq!(answer_seen, vec![SessionDescription::answer("v=0 answer-1")]);

    assert!(u2.coord.hangup().await.expect("hangup"));
    u1.wait_state(CallState::Idle).await;
    assert_eq!(u2.coord.call_state(), CallState::Idle);

    assert_eq!(
        u1.drain_states(),
        vec![CallState::Ending, CallState::Ended, CallState::Idle]
    );
    assert_eq!(kinds_from(&relay, &u1.id), vec![SignalKind::Offer]);
    assert_eq!(
        kinds_from(&relay, &u2.id),
        vec![SignalKind::Answer, SignalKind::Hangup]
    );
    for party in [&u1, &u2] {
        assert_eq!(party.links.last().closes(), 1);
        assert_eq!(party.media.streams()[0].stop_calls(), 1);
    }
}

#[tokio::test]
async fn second_call_while_busy_is_refused() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let media = FakeMedia::gated();
    let u1 = connected_party(&backend, &relay, "u1", media.clone()).await;
    // u2 never answers, so u1 stays in Negotiating
    let u2 = connected_party(&backend, &relay, "u2", FakeMedia::gated()).await;
    let u3 = connected_party(&backend, &relay, "u3", FakeMedia::new()).await;

    u1.coord.start_call(&u2.id).await.expect("start");
    assert_eq!(u1.coord.call_state(), CallState::AwaitingMedia);

    let err = u1.coord.start_call(&u3.id).await.expect_err("busy");
    assert!(matches!(err, CoordinatorError::Call(CallError::Busy)));
    assert_eq!(u1.coord.call_state(), CallState::AwaitingMedia);

    media.release();
    u1.wait_state(CallState::Negotiating).await;
    settle().await;
    let offers: Vec<_> = relay
        .routed()
        .into_iter()
        .filter(|e| e.kind == SignalKind::Offer)
        .collect();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].to, u2.id);
    assert!(routed_to(&relay, &u3.id).is_empty());
}

#[tokio::test]
async fn early_candidates_are_applied_first_in_order() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let media = FakeMedia::gated();
    let u2 = connected_party(&backend, &relay, "u2", media.clone()).await;
    let caller = relay.connect(&ident("caller")).await.expect("caller link");

    let send = |env: SignalEnvelope| caller.outbound.send(env).expect("relay");
    send(SignalEnvelope::offer("caller", &u2.id, &SessionDescription::offer("v=0 remote")));
    send(SignalEnvelope::ice("caller", &u2.id, &candidate("c1")));
    send(SignalEnvelope::ice("caller", &u2.id, &candidate("c2")));
    u2.wait_state(CallState::Negotiating).await;
    settle().await;
    assert!(u2.links.created().is_empty());

    media.release();
    settle().await;
    send(SignalEnvelope::ice("caller", &u2.id, &candidate("c3")));
    settle().await;

    let link = u2.links.last();
    assert_eq!(link.applied_candidates(), vec!["c1", "c2", "c3"]);
    assert_eq!(
        link.remote_descriptions(),
        vec![SessionDescription::offer("v=0 remote")]
    );
    let answers: Vec<_> = routed_to(&relay, "caller")
        .into_iter()
        .filter(|e| e.kind == SignalKind::Answer)
        .collect();
    assert_eq!(answers.len(), 1);
}

#[tokio::test]
async fn hangup_from_awaiting_media_releases_once() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let media = FakeMedia::gated();
    let u1 = connected_party(&backend, &relay, "u1", media.clone()).await;
    let u2 = connected_party(&backend, &relay, "u2", FakeMedia::new()).await;

    u1.coord.start_call(&u2.id).await.expect("start");
    assert!(u1.coord.hangup().await.expect("hangup"));
    assert_eq!(u1.coord.call_state(), CallState::Idle);
    assert!(!u1.coord.hangup().await.expect("second hangup"));

    // the media that arrives afterwards belongs to a dead call
    media.release();
    settle().await;
    assert_eq!(u1.coord.call_state(), CallState::Idle);
    assert!(u1.links.created().is_empty());
    let streams = media.streams();
    assert_eq!(streams.len(), 1);
    assert!(streams[0].is_stopped());
    // u2 never saw an offer, so it is not told about the hangup either
    assert!(kinds_from(&relay, &u1.id).is_empty());
}

#[tokio::test]
async fn hangup_from_negotiating_releases_once() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let u1 = connected_party(&backend, &relay, "u1", FakeMedia::new()).await;
    // nobody answers: the callee is not on the relay
    u1.coord.start_call("ghost").await.expect("start");
    u1.wait_state(CallState::Negotiating).await;

    assert!(u1.coord.hangup().await.expect("hangup"));
    assert_eq!(u1.coord.call_state(), CallState::Idle);
    assert!(!u1.coord.hangup().await.expect("second hangup"));
    settle().await;

    let link = u1.links.last();
    assert_eq!(link.closes(), 1);
    assert_eq!(u1.media.streams()[0].stop_calls(), 1);
    assert_eq!(
        kinds_from(&relay, &u1.id),
        vec![SignalKind::Offer, SignalKind::Hangup]
    );
}

#[tokio::test]
async fn connected_call_hangup_is_idempotent() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let u1 = connected_party(&backend, &relay, "u1", FakeMedia::new()).await;
    let u2 = connected_party(&backend, &relay, "u2", FakeMedia::new()).await;

    u1.coord.start_call(&u2.id).await.expect("start");
    u1.wait_state(CallState::Connected).await;

    assert!(u1.coord.hangup().await.expect("hangup"));
    assert!(!u1.coord.hangup().await.expect("again"));
    u2.wait_state(CallState::Idle).await;

    assert_eq!(u1.links.last().closes(), 1);
    assert_eq!(u1.media.streams()[0].stop_calls(), 1);
    // u2 hung up because it was told to, and does not echo it back
    assert_eq!(kinds_from(&relay, &u2.id), vec![SignalKind::Answer]);
}

#[tokio::test]
async fn denied_media_returns_to_idle_silently() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let media = FakeMedia::new();
    media.deny("camera blocked");
    let mut u1 = connected_party(&backend, &relay, "u1", media).await;

    u1.coord.start_call("u2").await.expect("start");
    u1.wait_state(CallState::Idle).await;
    settle().await;

    assert!(relay.routed().is_empty());
    let events = u1.drain_events();
    assert!(events.contains(&CoordinatorEvent::MediaError(
        "media access denied: camera blocked".into()
    )));
    assert_eq!(u1.coord.call_state(), CallState::Idle);
}

#[tokio::test]
async fn incoming_call_with_denied_media_tells_the_caller() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let media = FakeMedia::new();
    media.deny("no camera");
    let u2 = connected_party(&backend, &relay, "u2", media).await;
    let mut caller = relay.connect(&ident("caller")).await.expect("caller link");

    caller
        .outbound
        .send(SignalEnvelope::offer("caller", &u2.id, &SessionDescription::offer("v=0")))
        .expect("offer");
    let reply = caller.inbound.recv().await.expect("reply");
    assert_eq!(
        reply,
        SignalInbound::Envelope(SignalEnvelope::hangup(&u2.id, "caller"))
    );
    u2.wait_state(CallState::Idle).await;
}

#[tokio::test]
async fn late_callbacks_from_a_closed_link_are_ignored() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let u1 = connected_party(&backend, &relay, "u1", FakeMedia::new()).await;
    let u2 = connected_party(&backend, &relay, "u2", FakeMedia::new()).await;

    u1.coord.start_call(&u2.id).await.expect("start");
    u1.wait_state(CallState::Connected).await;
    let old = u1.links.last();
    u1.coord.hangup().await.expect("hangup");
    u2.wait_state(CallState::Idle).await;
    let routed_before = relay.routed().len();

    old.emit(PeerEventKind::LocalCandidate(candidate("late")));
    old.emit(PeerEventKind::StateChanged(LinkState::Failed));
    settle().await;
    assert_eq!(relay.routed().len(), routed_before);
    assert_eq!(u1.coord.call_state(), CallState::Idle);

    // a fresh call is unaffected by the old link's noise
    u1.coord.start_call(&u2.id).await.expect("second call");
    u1.wait_state(CallState::Connected).await;
    old.emit(PeerEventKind::StateChanged(LinkState::Closed));
    settle().await;
    assert_eq!(u1.coord.call_state(), CallState::Connected);
    assert_eq!(u1.links.created().len(), 2);
}

#[tokio::test]
async fn local_candidates_trickle_to_the_peer() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let u1 = connected_party(&backend, &relay, "u1", FakeMedia::new()).await;
    let u2 = connected_party(&backend, &relay, "u2", FakeMedia::new()).await;

    u1.coord.start_call(&u2.id).await.expect("start");
    u1.wait_state(CallState::Connected).await;
    u2.wait_state(CallState::Negotiating).await;
    u1.links
        .last()
        .emit(PeerEventKind::LocalCandidate(candidate("host-1")));
    settle().await;

    assert_eq!(u2.links.last().applied_candidates(), vec!["host-1"]);
}

#[tokio::test]
async fn connection_failure_ends_the_call_without_hangup() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let u1 = connected_party(&backend, &relay, "u1", FakeMedia::new()).await;
    let u2 = connected_party(&backend, &relay, "u2", FakeMedia::new()).await;

    u1.coord.start_call(&u2.id).await.expect("start");
    u1.wait_state(CallState::Connected).await;
    u1.links
        .last()
        .emit(PeerEventKind::StateChanged(LinkState::Failed));
    u1.wait_state(CallState::Idle).await;

    assert_eq!(u1.links.last().closes(), 1);
    assert_eq!(kinds_from(&relay, &u1.id), vec![SignalKind::Offer]);
}

#[tokio::test]
async fn offer_from_a_third_party_is_rejected() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let u1 = connected_party(&backend, &relay, "u1", FakeMedia::new()).await;
    let mut u2 = connected_party(&backend, &relay, "u2", FakeMedia::new()).await;
    let mut intruder = relay.connect(&ident("u3")).await.expect("u3 link");

    u1.coord.start_call(&u2.id).await.expect("start");
    u1.wait_state(CallState::Connected).await;
    u2.links.last().emit(PeerEventKind::StateChanged(LinkState::Connected));
    u2.wait_state(CallState::Connected).await;
    u2.drain_events();

    intruder
        .outbound
        .send(SignalEnvelope::offer("u3", &u2.id, &SessionDescription::offer("v=0 u3")))
        .expect("offer");
    let reply = intruder.inbound.recv().await.expect("reply");
    assert_eq!(
        reply,
        SignalInbound::Envelope(SignalEnvelope::hangup(&u2.id, "u3"))
    );
    assert_eq!(u2.coord.call_state(), CallState::Connected);
    assert_eq!(u2.links.created().len(), 1);
    assert!(u2.drain_events().contains(&CoordinatorEvent::CallRejected {
        from: "u3".into(),
        reason: "busy".into()
    }));
}

#[tokio::test]
async fn signaling_closure_ends_the_call() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let mut u1 = connected_party(&backend, &relay, "u1", FakeMedia::new()).await;
    let u2 = connected_party(&backend, &relay, "u2", FakeMedia::new()).await;

    u1.coord.start_call(&u2.id).await.expect("start");
    u1.wait_state(CallState::Connected).await;
    relay.close(&u1.id);
    u1.wait_state(CallState::Idle).await;
    settle().await;

    assert_eq!(kinds_from(&relay, &u1.id), vec![SignalKind::Offer]);
    assert!(u1.drain_events().contains(&CoordinatorEvent::SignalingClosed));
    let err = u1.coord.start_call(&u2.id).await.expect_err("detached");
    assert!(matches!(err, CoordinatorError::Call(CallError::NotAttached)));

    // reconnecting restores calling
    u1.coord.connect_signaling().await.expect("reconnect");
    u1.coord.start_call(&u2.id).await.expect("after reconnect");
}

#[tokio::test]
async fn self_calls_and_unattached_calls_are_refused() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let u1 = party(&backend, &relay, "u1", FakeMedia::new()).await;

    let err = u1.coord.start_call("u2").await.expect_err("not attached");
    assert!(matches!(err, CoordinatorError::Call(CallError::NotAttached)));

    u1.coord.connect_signaling().await.expect("signaling");
    let err = u1.coord.start_call(&u1.id).await.expect_err("self");
    assert!(matches!(err, CoordinatorError::Call(CallError::InvalidPeer(_))));
    assert_eq!(u1.coord.call_state(), CallState::Idle);
}

#[tokio::test]
async fn refused_signaling_is_reported_and_retryable() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let mut u1 = party(&backend, &relay, "u1", FakeMedia::new()).await;

    relay.refuse_connections(true);
    assert!(u1.coord.connect_signaling().await.is_err());
    assert!(u1
        .drain_events()
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::SignalingFailed(_))));
    assert_eq!(u1.coord.call_state(), CallState::Idle);

    relay.refuse_connections(false);
    u1.coord.connect_signaling().await.expect("retry");
    assert!(relay.is_connected(&u1.id));
}

#[tokio::test]
async fn same_peer_offer_while_connected_renegotiates() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let u1 = connected_party(&backend, &relay, "u1", FakeMedia::new()).await;
    let u2 = connected_party(&backend, &relay, "u2", FakeMedia::new()).await;

    u1.coord.start_call(&u2.id).await.expect("start");
    u1.wait_state(CallState::Connected).await;
    u2.links.last().emit(PeerEventKind::StateChanged(LinkState::Connected));
    u2.wait_state(CallState::Connected).await;

    let again = SessionDescription::offer("v=0 renegotiate");
    assert!(relay.inject(
        &u2.id,
        SignalInbound::Envelope(SignalEnvelope::offer(&u1.id, &u2.id, &again))
    ));
    settle().await;

    let link = u2.links.last();
    assert_eq!(
        link.remote_descriptions(),
        vec![SessionDescription::offer("v=0 offer-1"), again]
    );
    assert_eq!(u2.links.created().len(), 1);
    assert_eq!(
        kinds_from(&relay, &u2.id),
        vec![SignalKind::Answer, SignalKind::Answer]
    );
    assert_eq!(u2.coord.call_state(), CallState::Connected);
    assert_eq!(u1.coord.call_state(), CallState::Connected);
}

#[tokio::test]
async fn crossing_offers_from_the_callee_are_rejected_as_glare() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let mut u1 = connected_party(&backend, &relay, "u1", FakeMedia::new()).await;
    // u2 never answers, so u1 stays in Negotiating
    let u2 = connected_party(&backend, &relay, "u2", FakeMedia::gated()).await;

    u1.coord.start_call(&u2.id).await.expect("start");
    u1.wait_state(CallState::Negotiating).await;
    u1.drain_events();

    let crossing = SessionDescription::offer("v=0 from u2");
    assert!(relay.inject(
        &u1.id,
        SignalInbound::Envelope(SignalEnvelope::offer(&u2.id, &u1.id, &crossing))
    ));
    settle().await;

    assert!(u1.drain_events().contains(&CoordinatorEvent::CallRejected {
        from: u2.id.clone(),
        reason: "glare".into()
    }));
    assert_eq!(kinds_from(&relay, &u1.id), vec![SignalKind::Offer]);
    assert_eq!(u1.coord.call_state(), CallState::Negotiating);
    assert_eq!(u1.links.created().len(), 1);
    assert!(u1.links.last().remote_descriptions().is_empty());
}

#[tokio::test]
async fn candidates_after_hangup_are_discarded() {
    let backend = MemoryBackend::new();
    let relay = MemoryRelay::new();
    let u1 = connected_party(&backend, &relay, "u1", FakeMedia::new()).await;

    u1.coord.start_call("ghost").await.expect("start");
    u1.wait_state(CallState::Negotiating).await;
    u1.coord.hangup().await.expect("hangup");

    assert!(relay.inject(
        &u1.id,
        SignalInbound::Envelope(SignalEnvelope::ice("ghost", &u1.id, &candidate("late")))
    ));
    settle().await;

    // a new call to the same peer must not inherit the stray candidate
    u1.coord.start_call("ghost").await.expect("second call");
    u1.wait_state(CallState::Negotiating).await;
    let answer = SessionDescription::answer("v=0 ghost");
    assert!(relay.inject(
        &u1.id,
        SignalInbound::Envelope(SignalEnvelope::answer("ghost", &u1.id, &answer))
    ));
    u1.wait_state(CallState::Connected).await;

    assert_eq!(u1.links.created().len(), 2);
    let link = u1.links.last();
    assert_eq!(link.remote_descriptions(), vec![answer]);
    assert!(link.applied_candidates().is_empty());
    assert!(u1.links.created()[0].applied_candidates().is_empty());
}
