mod common;

use common::{World, eventually, lobby, settings};
use nocap_sync::{
    dao::{
        models::{AnswerEntity, GameStatus, RoundStage},
        paths,
    },
    error::CoreError,
    services::{
        game_service,
        results::PlayerResult,
        round_coordinator::{self, AdvanceOutcome},
        timer,
    },
    state::{
        SessionEvent,
        state_machine::{GamePhase, RoundPhase},
    },
};

#[tokio::test]
async fn a_perfect_game_ends_without_penalties() {
    let world = World::new();
    let mut host = world.client("H");
    let mut guest = world.client("G");
    let game_id = lobby(&host, &[&guest], settings(2)).await;

    game_service::start_game(&host.session, &game_id).await.unwrap();

    for round in 1..=2 {
        host.round_started(round).await;
        guest.round_started(round).await;

        round_coordinator::submit_answer(&host.session, &game_id, round, "H", true, 2)
            .await
            .unwrap();
        assert_eq!(host.session.phase().await, GamePhase::Playing(RoundPhase::Waiting));
        round_coordinator::submit_answer(&guest.session, &game_id, round, "G", true, 2)
            .await
            .unwrap();

        let summary = host.round_completed(round).await;
        assert_eq!(summary.actual_yes_count, 2);
        assert_eq!(summary.player_count, 2);
        assert!(summary.results.iter().all(|result| result.is_correct && result.penalty == 0));
        assert_eq!(guest.round_completed(round).await, summary);

        assert_eq!(host.session.phase().await, GamePhase::Playing(RoundPhase::Results));
        let published: Vec<PlayerResult> = serde_json::from_value(
            world
                .backend
                .value_at(&paths::round_field(&game_id, round, "results"))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(published, summary.results);

        let outcome = round_coordinator::advance_round(&host.session, &game_id)
            .await
            .unwrap();
        if round == 1 {
            assert_eq!(outcome, AdvanceOutcome::Started { round: 2 });
        } else {
            assert_eq!(outcome, AdvanceOutcome::Finished);
        }
    }

    guest
        .expect_event(|event| matches!(event, SessionEvent::GameFinished))
        .await;
    let game = host.session.fetch_game(&game_id).await.unwrap();
    assert_eq!(game.status, GameStatus::Finished);
    assert!(game.players.values().all(|player| player.score == 0));
    assert_eq!(host.session.phase().await, GamePhase::Finished);
}

#[tokio::test]
async fn penalties_follow_the_estimation_error_and_add_up() {
    let world = World::new();
    let mut host = world.client("H");
    let guest = world.client("G");
    let third = world.client("T");
    let game_id = lobby(&host, &[&guest, &third], settings(3)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    host.round_started(1).await;

    // Two yes answers; medium difficulty doubles the error.
    round_coordinator::submit_answer(&host.session, &game_id, 1, "H", true, 2)
        .await
        .unwrap();
    round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", true, 0)
        .await
        .unwrap();
    round_coordinator::submit_answer(&third.session, &game_id, 1, "T", false, 3)
        .await
        .unwrap();

    let summary = host.round_completed(1).await;
    let order: Vec<(&str, u32)> = summary
        .results
        .iter()
        .map(|result| (result.player_id.as_str(), result.penalty))
        .collect();
    assert_eq!(order, vec![("G", 4), ("T", 2), ("H", 0)]);

    let game = host.session.fetch_game(&game_id).await.unwrap();
    assert_eq!(game.phase, Some(RoundStage::Results));
    assert_eq!(game.players["G"].score, 4);
    assert_eq!(game.players["T"].score, 2);
    assert_eq!(game.players["H"].score, 0);
}

#[tokio::test]
async fn concurrent_submissions_store_exactly_one_answer() {
    let world = World::new();
    let host = world.client("H");
    let mut guest = world.client("G");
    let game_id = lobby(&host, &[&guest], settings(2)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    guest.round_started(1).await;

    let writes = world.backend.write_count();
    let (first, second) = tokio::join!(
        round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", true, 1),
        round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", false, 0),
    );
    assert_eq!(
        [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
        1
    );
    let rejected = first.err().or(second.err()).unwrap();
    assert!(rejected.is_already_submitted());
    assert_eq!(world.backend.write_count(), writes + 1);

    // A later retry is answered locally without touching the store.
    let err = round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", true, 2)
        .await
        .unwrap_err();
    assert!(err.is_already_submitted());
    assert_eq!(world.backend.write_count(), writes + 1);

    let stored: AnswerEntity = serde_json::from_value(
        world
            .backend
            .value_at(&paths::answer(&game_id, 1, "G"))
            .unwrap(),
    )
    .unwrap();
    assert!(stored.value);
    assert_eq!(stored.estimation, 1);
}

#[tokio::test]
async fn a_second_device_cannot_overwrite_a_stored_answer() {
    let world = World::new();
    let host = world.client("H");
    let mut guest = world.client("G");
    let other_device = world.client("G");
    let game_id = lobby(&host, &[&guest], settings(2)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    guest.round_started(1).await;

    round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", true, 1)
        .await
        .unwrap();
    let err = round_coordinator::submit_answer(&other_device.session, &game_id, 1, "G", false, 0)
        .await
        .unwrap_err();
    assert!(err.is_already_submitted());
}

#[tokio::test]
async fn answers_are_validated_before_anything_is_written() {
    let world = World::new();
    let host = world.client("H");
    let mut guest = world.client("G");
    let game_id = lobby(&host, &[&guest], settings(2)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    guest.round_started(1).await;
    let writes = world.backend.write_count();

    let err = round_coordinator::submit_answer(&guest.session, &game_id, 1, "H", true, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Permission { .. }));

    let err = round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", true, 3)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert_eq!(world.backend.write_count(), writes);

    // The rejected attempt did not use up the slot; the upper bound itself is allowed.
    round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", false, 2)
        .await
        .unwrap();
    assert_eq!(world.backend.write_count(), writes + 1);
}

#[tokio::test]
async fn transient_write_failures_are_retried() {
    let world = World::new();
    let host = world.client("H");
    let mut guest = world.client("G");
    let game_id = lobby(&host, &[&guest], settings(2)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    guest.round_started(1).await;

    world.backend.fail_next_writes(1);
    round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", true, 1)
        .await
        .unwrap();
    assert!(
        world
            .backend
            .value_at(&paths::answer(&game_id, 1, "G"))
            .is_some()
    );

    world.backend.fail_next_writes(2);
    let err = round_coordinator::submit_answer(&host.session, &game_id, 1, "H", true, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::TransientStore { attempts: 2, .. }));
    round_coordinator::submit_answer(&host.session, &game_id, 1, "H", true, 1)
        .await
        .unwrap();
}

#[tokio::test]
async fn a_round_completes_when_a_missing_player_leaves() {
    let world = World::new();
    let mut host = world.client("H");
    let guest = world.client("G");
    let quitter = world.client("Q");
    let game_id = lobby(&host, &[&guest, &quitter], settings(2)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    host.round_started(1).await;

    round_coordinator::submit_answer(&host.session, &game_id, 1, "H", true, 1)
        .await
        .unwrap();
    round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", false, 1)
        .await
        .unwrap();
    host.expect_event(|event| {
        matches!(event, SessionEvent::AnswersUpdated { answered: 2, total: 3, .. })
    })
    .await;

    game_service::leave_game(&quitter.session, &game_id)
        .await
        .unwrap();
    let summary = host.round_completed(1).await;
    assert_eq!(summary.player_count, 2);
    assert_eq!(summary.actual_yes_count, 1);
}

#[tokio::test]
async fn answers_left_behind_by_a_quitter_are_ignored() {
    let world = World::new();
    let mut host = world.client("H");
    let guest = world.client("G");
    let quitter = world.client("Q");
    let game_id = lobby(&host, &[&guest, &quitter], settings(2)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    host.round_started(1).await;

    round_coordinator::submit_answer(&quitter.session, &game_id, 1, "Q", true, 1)
        .await
        .unwrap();
    host.expect_event(|event| {
        matches!(event, SessionEvent::AnswersUpdated { answered: 1, total: 3, .. })
    })
    .await;
    game_service::leave_game(&quitter.session, &game_id)
        .await
        .unwrap();
    let host_session = &host.session;
    eventually("the quitter to leave the roster", || async move {
        host_session
            .game_snapshot()
            .is_some_and(|game| game.player_count() == 2)
    })
    .await;

    round_coordinator::submit_answer(&host.session, &game_id, 1, "H", true, 1)
        .await
        .unwrap();
    host.expect_event(|event| {
        matches!(event, SessionEvent::AnswersUpdated { answered: 1, total: 2, .. })
    })
    .await;
    assert_eq!(
        host.session.phase().await,
        GamePhase::Playing(RoundPhase::Waiting)
    );

    round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", true, 2)
        .await
        .unwrap();
    let summary = host.round_completed(1).await;
    assert_eq!(summary.player_count, 2);
    assert_eq!(summary.actual_yes_count, 2);
    let mut scored: Vec<_> = summary
        .results
        .iter()
        .map(|result| result.player_id.as_str())
        .collect();
    scored.sort_unstable();
    assert_eq!(scored, ["G", "H"]);
}

#[tokio::test]
async fn expired_countdowns_submit_a_default_answer() {
    let world = World::new();
    let mut host = world.client("H");
    let mut guest = world.client("G");
    let game_id = lobby(&host, &[&guest], settings(2)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    host.round_started(1).await;
    guest.round_started(1).await;

    round_coordinator::submit_answer(&host.session, &game_id, 1, "H", true, 1)
        .await
        .unwrap();
    world.clock.advance(31_000);

    guest
        .expect_event(|event| matches!(event, SessionEvent::TimerExpired { round: 1 }))
        .await;
    let summary = host.round_completed(1).await;
    assert_eq!(summary.player_count, 2);

    let stored: AnswerEntity = serde_json::from_value(
        world
            .backend
            .value_at(&paths::answer(&game_id, 1, "G"))
            .unwrap(),
    )
    .unwrap();
    assert!(stored.timed_out);
    assert!(!stored.value);
    assert_eq!(stored.estimation, 0);

    let host_answer: AnswerEntity = serde_json::from_value(
        world
            .backend
            .value_at(&paths::answer(&game_id, 1, "H"))
            .unwrap(),
    )
    .unwrap();
    assert!(!host_answer.timed_out);
    assert!(host_answer.value);
}

#[tokio::test]
async fn host_pauses_and_resumes_the_countdown_for_everyone() {
    let world = World::new();
    let mut host = world.client("H");
    let mut guest = world.client("G");
    let game_id = lobby(&host, &[&guest], settings(2)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    host.round_started(1).await;
    guest.round_started(1).await;

    world.clock.advance(5_000);
    let err = timer::pause_round_timer(&guest.session, &game_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Permission { .. }));

    let frozen = timer::pause_round_timer(&host.session, &game_id)
        .await
        .unwrap();
    assert_eq!(frozen, 25_000);
    let guest_session = &guest.session;
    eventually("guest countdown to pause", || async move {
        guest_session.timer().is_paused()
    })
    .await;
    assert_eq!(guest.session.timer().remaining_ms(), 25_000);

    // Time spent paused never counts against the round.
    world.clock.advance(60_000);
    assert_eq!(guest.session.timer().remaining_ms(), 25_000);
    assert!(!guest.session.timer().take_expiry());

    let err = timer::resume_round_timer(&guest.session, &game_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Permission { .. }));
    timer::resume_round_timer(&host.session, &game_id)
        .await
        .unwrap();
    eventually("guest countdown to resume", || async move {
        !guest_session.timer().is_paused()
    })
    .await;
    assert_eq!(guest.session.timer().remaining_ms(), 25_000);
    assert_eq!(host.session.timer().remaining_ms(), 25_000);

    world.clock.advance(1_000);
    assert_eq!(guest.session.timer().remaining_ms(), 24_000);
}

#[tokio::test]
async fn roles_follow_the_host_id_after_a_transfer() {
    let world = World::new();
    let mut host = world.client("H");
    let mut guest = world.client("G");
    let game_id = lobby(&host, &[&guest], settings(3)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    guest.round_started(1).await;

    game_service::transfer_host(&host.session, &game_id, "G")
        .await
        .unwrap();
    guest
        .expect_event(|event| matches!(event, SessionEvent::RoleChanged { is_host: true }))
        .await;
    host.expect_event(|event| matches!(event, SessionEvent::RoleChanged { is_host: false }))
        .await;

    round_coordinator::submit_answer(&host.session, &game_id, 1, "H", true, 1)
        .await
        .unwrap();
    round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", false, 1)
        .await
        .unwrap();
    guest.round_completed(1).await;

    // The new host publishes the results.
    let backend = &world.backend;
    let results = &paths::round_field(&game_id, 1, "results");
    eventually("results to be published", || async move {
        backend.value_at(results).is_some()
    })
    .await;

    let err = round_coordinator::advance_round(&host.session, &game_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Permission { ref operation } if operation == "advance_round"));
}

#[tokio::test]
async fn advancing_requires_final_results() {
    let world = World::new();
    let host = world.client("H");
    let mut guest = world.client("G");
    let game_id = lobby(&host, &[&guest], settings(2)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    guest.round_started(1).await;

    let err = round_coordinator::advance_round(&host.session, &game_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidState(_)));
}

#[tokio::test]
async fn round_listeners_see_the_current_answers_first() {
    let world = World::new();
    let host = world.client("H");
    let mut guest = world.client("G");
    let game_id = lobby(&host, &[&guest], settings(2)).await;
    game_service::start_game(&host.session, &game_id).await.unwrap();
    guest.round_started(1).await;
    round_coordinator::submit_answer(&guest.session, &game_id, 1, "G", true, 1)
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let guard = round_coordinator::on_round_update(&host.session, &game_id, 1, move |update| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((update.answers.len(), update.is_complete()));
        }
    });

    assert_eq!(rx.recv().await, Some((1, false)));
    round_coordinator::submit_answer(&host.session, &game_id, 1, "H", false, 1)
        .await
        .unwrap();
    assert_eq!(rx.recv().await, Some((2, true)));
    drop(guard);
}
