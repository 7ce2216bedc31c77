//! Round lifecycle: starting rounds, collecting answers, detecting completion and advancing.
//!
//! The host drives every transition through the game node; guests follow through the game
//! listener installed by [`join`]. Every client computes the round results itself from the
//! same answers, the host additionally publishes them together with the updated scores.

use std::{collections::BTreeMap, future::Future, pin::pin, sync::Arc, time::Duration};

use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{
    dao::{
        models::{AnswerEntity, GameEntity, GameStatus, RoundEntity, RoundStage},
        paths,
        realtime_store::decode,
    },
    error::CoreError,
    services::{
        results::{self, RoundSummary},
        role_guard, timer,
    },
    state::{
        ListenerGuard, ListenerKind, RoundState, SessionEvent, SharedSession,
        game::{GameId, GameSettings, PendingAnswer, Question, is_age_restricted_category},
        state_machine::{GameEvent, GamePhase, RoundPhase},
    },
};

/// Answers of one round as delivered by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundUpdate {
    /// Round the answers belong to.
    pub round: u32,
    /// Answers keyed by player id, limited to players still in the game.
    pub answers: BTreeMap<String, AnswerEntity>,
    /// Players registered in the game when the answers arrived.
    pub player_count: usize,
}

impl RoundUpdate {
    /// Pair `answers` with the current roster of `game`.
    ///
    /// Answers left behind by players who already quit are dropped, so they neither count
    /// towards completion nor get scored. Without a known game every answer is kept and the
    /// round never completes.
    pub fn new(
        round: u32,
        mut answers: BTreeMap<String, AnswerEntity>,
        game: Option<&GameEntity>,
    ) -> Self {
        let player_count = game.map_or(0, GameEntity::player_count);
        if let Some(game) = game {
            answers.retain(|player_id, _| game.players.contains_key(player_id));
        }
        Self {
            round,
            answers,
            player_count,
        }
    }

    /// Whether every current player answered.
    pub fn is_complete(&self) -> bool {
        check_completion(self.answers.len(), self.player_count)
    }
}

/// What [`advance_round`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The next round is running.
    Started {
        /// Number of the round that just started.
        round: u32,
    },
    /// The round limit was reached or the questions ran out.
    Finished,
}

/// A round is complete once every player answered and at least two players take part.
pub fn check_completion(answer_count: usize, player_count: usize) -> bool {
    player_count >= 2 && answer_count >= player_count
}

/// Host-only: publish round `round` with `question` and start its countdown.
///
/// Returns the server timestamp the round started at. Overwriting a round that is still in
/// progress is up to the caller.
pub async fn start_round(
    session: &SharedSession,
    game_id: &GameId,
    round: u32,
    question: Question,
) -> Result<i64, CoreError> {
    start_round_with(session, game_id, round, question, BTreeMap::new()).await
}

/// [`start_round`] with extra game fields written in the same atomic update.
pub(crate) async fn start_round_with(
    session: &SharedSession,
    game_id: &GameId,
    round: u32,
    question: Question,
    game_fields: BTreeMap<&str, Value>,
) -> Result<i64, CoreError> {
    role_guard::require_host(session, game_id, "start_round").await?;
    if question.is_age_restricted() && !session.age_verifier().is_verified() {
        return Err(CoreError::permission("start_round: age-restricted question"));
    }

    let duration_ms = session.config().round_duration.as_millis() as u64;
    let now = session.store().server_timestamp();
    let mut updates = BTreeMap::from([
        (
            paths::round(game_id, round),
            json!({
                "question": question,
                "startedAt": now.clone(),
                "timerDuration": duration_ms,
            }),
        ),
        (paths::game_field(game_id, "currentRound"), json!(round)),
        (paths::game_field(game_id, "phase"), json!(RoundStage::Answering)),
        (paths::game_field(game_id, "timerStartTime"), now),
        (paths::game_field(game_id, "timerPaused"), Value::Bool(false)),
        (paths::game_field(game_id, "timerRemaining"), Value::Null),
    ]);
    updates.extend(
        game_fields
            .into_iter()
            .map(|(field, value)| (paths::game_field(game_id, field), value)),
    );
    session.update("start_round", updates).await?;

    let started_at: i64 = session
        .fetch(&paths::round_field(game_id, round, "startedAt"))
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("round {round} of game `{game_id}`")))?;

    enter_round(
        session,
        game_id,
        round,
        Some(question),
        started_at,
        duration_ms,
        false,
    )
    .await;
    info!(game_id = %game_id, round, started_at, "round started");
    Ok(started_at)
}

/// Store the local player's answer for `round`.
///
/// Checks run in this order: the caller owns `player_id`; no local record of an earlier
/// submission (answered without touching the store); the estimation lies within
/// `0..=players`; the store holds no answer yet. The answer is written exactly once.
pub async fn submit_answer(
    session: &SharedSession,
    game_id: &GameId,
    round: u32,
    player_id: &str,
    value: bool,
    estimation: u32,
) -> Result<(), CoreError> {
    submit(
        session,
        game_id,
        round,
        player_id,
        PendingAnswer { value, estimation },
        false,
    )
    .await
}

/// Submit the default answer once the countdown ran out. Returns whether it was stored.
pub async fn auto_submit_timeout(
    session: &SharedSession,
    game_id: &GameId,
    round: u32,
) -> Result<bool, CoreError> {
    let user_id = session.user_id()?;
    if session
        .round()
        .read()
        .await
        .submission(game_id, round, &user_id)
        .is_some()
    {
        return Ok(false);
    }

    let answer = PendingAnswer {
        value: false,
        estimation: 0,
    };
    match submit(session, game_id, round, &user_id, answer, true).await {
        Ok(()) => {
            info!(game_id = %game_id, round, "submitted timeout answer");
            Ok(true)
        }
        Err(err) if err.is_already_submitted() => Ok(false),
        Err(err) => Err(err),
    }
}

async fn submit(
    session: &SharedSession,
    game_id: &GameId,
    round: u32,
    player_id: &str,
    answer: PendingAnswer,
    timed_out: bool,
) -> Result<(), CoreError> {
    let user_id = session.user_id()?;
    if user_id != player_id {
        return Err(CoreError::permission("submit_answer"));
    }

    if !session
        .round()
        .write()
        .await
        .claim_submission(game_id, round, player_id)
    {
        return Err(CoreError::AlreadySubmitted {
            player_id: player_id.to_string(),
            round,
        });
    }

    let result = store_answer(session, game_id, round, player_id, answer, timed_out).await;

    {
        let mut state = session.round().write().await;
        match &result {
            Ok(()) | Err(CoreError::AlreadySubmitted { .. }) => {
                state.mark_stored(game_id, round, player_id);
                if state.current_round == round {
                    state.pending_answer = None;
                }
            }
            Err(_) => state.release_submission(game_id, round, player_id),
        }
    }

    if result.is_ok() {
        if let Err(err) = session.fire(GameEvent::AnswerSubmitted).await {
            debug!(error = ?err, "answer stored outside of the answering phase");
        }
    }
    result
}

async fn store_answer(
    session: &SharedSession,
    game_id: &GameId,
    round: u32,
    player_id: &str,
    answer: PendingAnswer,
    timed_out: bool,
) -> Result<(), CoreError> {
    let total_players = player_count(session, game_id).await?;
    // Only the upper bound needs a check: `estimation` is unsigned, so negative values never
    // get past decoding.
    if answer.estimation as usize > total_players {
        return Err(CoreError::Validation(format!(
            "estimation {} outside 0..={total_players}",
            answer.estimation
        )));
    }

    if !timed_out {
        let mut state = session.round().write().await;
        if state.game_id.as_ref() == Some(game_id) && state.current_round == round {
            state.pending_answer = Some(answer);
        }
    }

    let path = paths::answer(game_id, round, player_id);
    if session.fetch::<Value>(&path).await?.is_some() {
        return Err(CoreError::AlreadySubmitted {
            player_id: player_id.to_string(),
            round,
        });
    }

    let mut value = json!({
        "value": answer.value,
        "estimation": answer.estimation,
        "timestamp": session.store().server_timestamp(),
    });
    if timed_out {
        value["timedOut"] = Value::Bool(true);
    }
    session.write("submit_answer", &path, value).await?;
    debug!(game_id = %game_id, round, player_id, "answer stored");
    Ok(())
}

async fn player_count(session: &SharedSession, game_id: &GameId) -> Result<usize, CoreError> {
    let joined = session.round().read().await.game_id.as_ref() == Some(game_id);
    match session.game_snapshot() {
        Some(game) if joined => Ok(game.player_count()),
        _ => Ok(session.fetch_game(game_id).await?.player_count()),
    }
}

/// Run `handler` for every delivery of the answers of `round`.
///
/// The current answers are delivered first. Dropping the returned guard unsubscribes.
pub fn on_round_update<F, Fut>(
    session: &SharedSession,
    game_id: &GameId,
    round: u32,
    handler: F,
) -> ListenerGuard
where
    F: Fn(RoundUpdate) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let path = paths::answers(game_id, round);
    let snapshots = session.store().subscribe(&path).into_stream();
    let weak = Arc::downgrade(session);
    let listener_path = path.clone();

    ListenerGuard::spawn(path, async move {
        let mut snapshots = pin!(snapshots);
        while let Some(snapshot) = snapshots.next().await {
            let Some(session) = weak.upgrade() else {
                break;
            };
            let answers = match decode::<BTreeMap<String, AnswerEntity>>(&listener_path, snapshot) {
                Ok(answers) => answers.unwrap_or_default(),
                Err(err) => {
                    warn!(path = %listener_path, error = %err, "ignoring undecodable answers");
                    session.events().broadcast(SessionEvent::ListenerFailed {
                        path: listener_path.clone(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            let update = RoundUpdate::new(round, answers, session.game_snapshot().as_deref());
            drop(session);

            handler(update).await;
        }
    })
}

/// Host-only: move on to the next round, or end the game when none is left.
pub async fn advance_round(
    session: &SharedSession,
    game_id: &GameId,
) -> Result<AdvanceOutcome, CoreError> {
    let game = role_guard::require_host(session, game_id, "advance_round").await?;
    if game.status != GameStatus::Playing {
        return Err(CoreError::InvalidState("game is not running".into()));
    }
    if session.phase().await != GamePhase::Playing(RoundPhase::Results) {
        return Err(CoreError::InvalidState(
            "results of the current round are not final yet".into(),
        ));
    }

    let next = game.current_round + 1;
    if next > game.settings.rounds {
        end_game(session, game_id).await?;
        return Ok(AdvanceOutcome::Finished);
    }
    let Some(question) = next_question(session, &game.settings).await? else {
        info!(game_id = %game_id, "question deck exhausted");
        end_game(session, game_id).await?;
        return Ok(AdvanceOutcome::Finished);
    };

    session
        .run_transition(GameEvent::NextRound, || {
            start_round(session, game_id, next, question)
        })
        .await?;
    Ok(AdvanceOutcome::Started { round: next })
}

/// Host-only: mark the game as finished.
pub async fn end_game(session: &SharedSession, game_id: &GameId) -> Result<(), CoreError> {
    role_guard::require_host(session, game_id, "end_game").await?;
    let updates = BTreeMap::from([
        (paths::game_field(game_id, "status"), json!(GameStatus::Finished)),
        (paths::game_field(game_id, "timerPaused"), Value::Bool(false)),
        (paths::game_field(game_id, "timerRemaining"), Value::Null),
    ]);
    session
        .run_transition(GameEvent::EndGame, || session.update("end_game", updates))
        .await?;

    session.remove_listener(ListenerKind::Countdown);
    session.timer().stop();
    session.events().broadcast(SessionEvent::GameFinished);
    info!(game_id = %game_id, "game finished");
    Ok(())
}

/// Next question of the session deck, reloading the deck when it ran empty.
pub(crate) async fn next_question(
    session: &SharedSession,
    settings: &GameSettings,
) -> Result<Option<Question>, CoreError> {
    if let Some(question) = session.round().write().await.deck.pop_front() {
        return Ok(Some(question));
    }
    let deck = load_deck(session, settings).await?;
    let mut state = session.round().write().await;
    state.deck = deck.into();
    Ok(state.deck.pop_front())
}

/// Load one question per configured round, leaving out locked categories.
pub(crate) async fn load_deck(
    session: &SharedSession,
    settings: &GameSettings,
) -> Result<Vec<Question>, CoreError> {
    let verified = session.age_verifier().is_verified();
    let categories: Vec<String> = settings
        .categories
        .iter()
        .filter(|category| verified || !is_age_restricted_category(category))
        .cloned()
        .collect();
    if categories.is_empty() {
        return Err(CoreError::permission(
            "load_questions: age verification required",
        ));
    }

    let count = settings.rounds as usize;
    let mut questions = session
        .retrying("load_questions", || {
            session.questions().load_questions(&categories, count)
        })
        .await?;
    questions.retain(|question| verified || !question.is_age_restricted());
    Ok(questions)
}

/// Follow the game node: role, countdown, round changes, end and deletion.
pub async fn join(session: &SharedSession, game_id: &GameId) -> Result<GameEntity, CoreError> {
    let user_id = session.user_id()?;
    let game = session.fetch_game(game_id).await?;
    if !game.players.contains_key(&user_id) {
        return Err(CoreError::permission("join: not a player of this game"));
    }

    {
        let mut state = session.round().write().await;
        if state.game_id.as_ref() != Some(game_id) {
            *state = RoundState::for_game(game_id.clone());
        }
    }

    apply_game_snapshot(session, game_id, game.clone()).await;
    install_game_listener(session, game_id);
    info!(game_id = %game_id, user_id = %user_id, "joined game");
    Ok(game)
}

fn install_game_listener(session: &SharedSession, game_id: &GameId) {
    let path = paths::game(game_id);
    let mut subscription = session.store().subscribe(&path);
    let weak = Arc::downgrade(session);
    let game_id = game_id.clone();
    let listener_path = path.clone();

    let guard = ListenerGuard::spawn(path, async move {
        while let Some(snapshot) = subscription.recv().await {
            let Some(session) = weak.upgrade() else {
                break;
            };
            match decode::<GameEntity>(&listener_path, snapshot) {
                Ok(Some(game)) => apply_game_snapshot(&session, &game_id, game).await,
                Ok(None) => {
                    handle_game_deleted(&session, &game_id).await;
                    break;
                }
                Err(err) => {
                    warn!(path = %listener_path, error = %err, "ignoring undecodable game");
                    session.events().broadcast(SessionEvent::ListenerFailed {
                        path: listener_path.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
    });
    session.install_listener(ListenerKind::Game, guard);
}

async fn handle_game_deleted(session: &SharedSession, game_id: &GameId) {
    info!(game_id = %game_id, "game was deleted");
    session.remove_listener(ListenerKind::Round);
    session.remove_listener(ListenerKind::Countdown);
    session.timer().stop();
    session.set_game(None);
    session.sync_phase(GamePhase::Finished).await;
    session.events().broadcast(SessionEvent::GameDeleted);
}

async fn apply_game_snapshot(session: &SharedSession, game_id: &GameId, game: GameEntity) {
    let user_id = session.user_id().ok();
    let is_host_of = |game: &GameEntity| {
        user_id
            .as_deref()
            .is_some_and(|user| role_guard::derive_role(game, user).is_host)
    };

    let game = Arc::new(game);
    let previous = session.set_game(Some(game.clone()));
    let is_host = is_host_of(&game);
    if previous
        .as_deref()
        .is_some_and(|previous| is_host_of(previous) != is_host)
    {
        info!(game_id = %game_id, is_host, "role changed");
        session
            .events()
            .broadcast(SessionEvent::RoleChanged { is_host });
    }
    session
        .events()
        .broadcast(SessionEvent::GameUpdated(game.clone()));

    // A game never goes back to an earlier status.
    let local = session.phase().await;
    let behind = match game.status {
        GameStatus::Lobby => local != GamePhase::Lobby,
        GameStatus::Playing => local == GamePhase::Finished,
        GameStatus::Finished => false,
    };
    if behind {
        debug!(game_id = %game_id, status = ?game.status, phase = ?local, "ignoring stale game snapshot");
        return;
    }

    match game.status {
        GameStatus::Lobby => {}
        GameStatus::Finished => {
            session.remove_listener(ListenerKind::Countdown);
            session.timer().stop();
            if session.sync_phase(GamePhase::Finished).await {
                session.events().broadcast(SessionEvent::GameFinished);
            }
        }
        GameStatus::Playing => sync_playing(session, game_id, &game, previous.as_deref()).await,
    }
}

async fn sync_playing(
    session: &SharedSession,
    game_id: &GameId,
    game: &GameEntity,
    previous: Option<&GameEntity>,
) {
    let round = game.current_round;
    let local_round = {
        let state = session.round().read().await;
        (state.game_id.as_ref() == Some(game_id)).then_some(state.current_round)
    };
    // Rounds only move forward; older snapshots may still be queued.
    if local_round.is_some_and(|local| round < local) {
        debug!(game_id = %game_id, round, "ignoring stale game snapshot");
        return;
    }

    session.timer().sync_from_game(game);
    if round == 0 {
        return;
    }

    if local_round != Some(round) {
        if let Err(err) = enter_round_from_store(session, game_id, round).await {
            warn!(game_id = %game_id, round, error = %err, "failed to follow round change");
            session.events().broadcast(SessionEvent::ListenerFailed {
                path: paths::round(game_id, round),
                message: err.to_string(),
            });
            return;
        }
    } else if previous.is_some_and(|previous| previous.player_count() != game.player_count()) {
        recheck_completion(session, game_id, round).await;
    }

    let user_id = session.user_id().ok();
    let (submitted, completed) = {
        let state = session.round().read().await;
        let submitted = user_id
            .as_deref()
            .is_some_and(|user| state.submission(game_id, round, user).is_some());
        (submitted, state.completed_round == Some(round))
    };
    let phase = if completed || game.phase == Some(RoundStage::Results) {
        RoundPhase::Results
    } else if submitted {
        RoundPhase::Waiting
    } else {
        RoundPhase::Answering
    };
    session.sync_phase(GamePhase::Playing(phase)).await;
}

async fn enter_round_from_store(
    session: &SharedSession,
    game_id: &GameId,
    round: u32,
) -> Result<(), CoreError> {
    let entity: RoundEntity = session
        .fetch(&paths::round(game_id, round))
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("round {round} of game `{game_id}`")))?;
    let finished = entity.results.is_some();
    enter_round(
        session,
        game_id,
        round,
        Some(entity.question),
        entity.started_at,
        entity.timer_duration,
        finished,
    )
    .await;
    Ok(())
}

/// Make `round` the local round: reset per-round flags, swap the answers listener and
/// (re)start the countdown. Returns `false` when the client already shows that round.
async fn enter_round(
    session: &SharedSession,
    game_id: &GameId,
    round: u32,
    question: Option<Question>,
    started_at: i64,
    duration_ms: u64,
    finished: bool,
) -> bool {
    let verified = session.age_verifier().is_verified();
    let question = question.filter(|question| {
        let visible = verified || !question.is_age_restricted();
        if !visible {
            warn!(game_id = %game_id, round, "hiding age-restricted question");
        }
        visible
    });

    if !session
        .round()
        .write()
        .await
        .enter(game_id, round, question.clone())
    {
        return false;
    }

    if finished {
        session.remove_listener(ListenerKind::Countdown);
        session.timer().stop();
    } else {
        session
            .timer()
            .start(started_at, Duration::from_millis(duration_ms));
        timer::spawn_countdown(session, game_id.clone(), round);
    }
    install_round_listener(session, game_id, round);
    session
        .events()
        .broadcast(SessionEvent::RoundStarted { round, question });
    true
}

fn install_round_listener(session: &SharedSession, game_id: &GameId, round: u32) {
    let weak = Arc::downgrade(session);
    let owned_id = game_id.clone();
    let guard = on_round_update(session, game_id, round, move |update| {
        let weak = weak.clone();
        let game_id = owned_id.clone();
        async move {
            if let Some(session) = weak.upgrade() {
                handle_round_update(&session, &game_id, update).await;
            }
        }
    });
    session.install_listener(ListenerKind::Round, guard);
}

async fn recheck_completion(session: &SharedSession, game_id: &GameId, round: u32) {
    let answers = match session
        .fetch::<BTreeMap<String, AnswerEntity>>(&paths::answers(game_id, round))
        .await
    {
        Ok(answers) => answers.unwrap_or_default(),
        Err(err) => {
            warn!(game_id = %game_id, round, error = %err, "failed to re-check completion");
            return;
        }
    };
    let update = RoundUpdate::new(round, answers, session.game_snapshot().as_deref());
    handle_round_update(session, game_id, update).await;
}

async fn handle_round_update(session: &SharedSession, game_id: &GameId, update: RoundUpdate) {
    {
        let state = session.round().read().await;
        if state.game_id.as_ref() != Some(game_id) || state.current_round != update.round {
            return;
        }
    }

    session.events().broadcast(SessionEvent::AnswersUpdated {
        round: update.round,
        answered: update.answers.len(),
        total: update.player_count,
    });
    if update.is_complete() {
        complete_round(session, game_id, &update).await;
    }
}

async fn complete_round(session: &SharedSession, game_id: &GameId, update: &RoundUpdate) {
    let Some(game) = session.game_snapshot() else {
        return;
    };
    let multiplier = session.config().multiplier(game.settings.difficulty);
    let summary = results::summarize(&update.answers, multiplier);

    {
        let mut state = session.round().write().await;
        if state.completed_round == Some(update.round) || state.current_round != update.round {
            return;
        }
        state.completed_round = Some(update.round);
        state.last_summary = Some(summary.clone());
        state.pending_answer = None;
    }

    session.remove_listener(ListenerKind::Countdown);
    session.timer().stop();
    if let Err(err) = session.fire(GameEvent::AllAnswered).await {
        debug!(error = ?err, "round completed outside of an active round");
    }
    info!(
        game_id = %game_id,
        round = update.round,
        yes = summary.actual_yes_count,
        "round complete"
    );

    // Results land in the store before the host can advance past them.
    if session.is_host() {
        if let Err(err) = publish_results(session, game_id, update.round, &summary).await {
            warn!(game_id = %game_id, round = update.round, error = %err, "failed to publish results");
            session.events().broadcast(SessionEvent::ListenerFailed {
                path: paths::round_field(game_id, update.round, "results"),
                message: err.to_string(),
            });
        }
    }
    session.events().broadcast(SessionEvent::RoundCompleted {
        round: update.round,
        summary,
    });
}

/// Host-only: store the results, add the penalties to the scores and flip the stage, once.
async fn publish_results(
    session: &SharedSession,
    game_id: &GameId,
    round: u32,
    summary: &RoundSummary,
) -> Result<bool, CoreError> {
    let game = role_guard::require_host(session, game_id, "publish_results").await?;
    let results_path = paths::round_field(game_id, round, "results");
    if session.fetch::<Value>(&results_path).await?.is_some() {
        return Ok(false);
    }

    let mut updates = BTreeMap::from([
        (results_path, json!(summary.results)),
        (paths::game_field(game_id, "phase"), json!(RoundStage::Results)),
    ]);
    for result in &summary.results {
        if let Some(player) = game.players.get(&result.player_id) {
            updates.insert(
                paths::player_field(game_id, &result.player_id, "score"),
                json!(player.score + i64::from(result.penalty)),
            );
        }
    }
    session.update("publish_results", updates).await?;
    Ok(true)
}
