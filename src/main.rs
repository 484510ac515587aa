//! Cue Clash Match Engine
//!
//! Demo binary: drives one staked match end to end through the public
//! boundary operations and prints the settlement result.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cue_clash::game::board::SeededShotModel;
use cue_clash::game::moves::MovePayload;
use cue_clash::game::state::{MatchMode, MatchRules, MatchStatus};
use cue_clash::{EngineConfig, EventLog, MatchEngine, MemoryEventLog, UserId, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("Cue Clash Match Engine v{}", VERSION);

    demo_match().await
}

/// Run a demo match: fund two players, fill a match, alternate strikes until
/// a terminal state, then show the settled balances.
async fn demo_match() -> Result<()> {
    info!("=== Starting Demo Match ===");

    let config = EngineConfig {
        min_move_interval_ms: 0,
        ..EngineConfig::from_env()
    };
    let journal: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
    let engine = MatchEngine::new(config, journal.clone(), Arc::new(SeededShotModel::default()));

    let alice = UserId::new([1; 16]);
    let bob = UserId::new([2; 16]);
    engine.ledger().credit(&alice, 1_000, "deposit").await?;
    engine.ledger().credit(&bob, 1_000, "deposit").await?;

    let rules = MatchRules {
        countdown_ms: 250,
        ..Default::default()
    };
    let match_id = engine
        .create_match(MatchMode::Classic, 100, 2, rules)
        .await?;
    info!("Match ID: {}", match_id.to_uuid_string());

    engine.join_match(&match_id, &alice).await?;
    let join = engine.join_match(&match_id, &bob).await?;
    info!("Both players joined, prize pool: {}", join.prize_pool);
    info!(
        "Alice wallet: {:?}, Bob wallet: {:?}",
        engine.ledger().balances(&alice).await,
        engine.ledger().balances(&bob).await
    );

    // Wait for the countdown to hand out the first turn.
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        if engine.match_snapshot(&match_id).await?.status == MatchStatus::Running {
            break;
        }
    }
    info!("Match running");

    // Alternate strikes until the match ends.
    let mut turns = 0u32;
    loop {
        let snap = engine.match_snapshot(&match_id).await?;
        if snap.status != MatchStatus::Running {
            break;
        }
        if turns >= 200 {
            info!("Turn cap reached, stopping demo");
            break;
        }

        let holder = snap.turn_holder.clone().expect("running match has a holder");
        let mover = if holder == alice.to_uuid_string() {
            alice
        } else {
            bob
        };
        let payload = MovePayload {
            force: 35 + (turns % 50) as u8,
            angle_deci: (turns * 137 % 3600) as u16,
            aim_x: (turns as i16 % 20) - 10,
            aim_y: ((turns * 3) as i16 % 20) - 10,
        };

        let outcome = engine
            .submit_move(&match_id, &mover, payload, snap.next_seq, None)
            .await?;
        turns += 1;

        if turns % 10 == 0 {
            let scores: Vec<u32> = outcome.snapshot.participants.iter().map(|p| p.score).collect();
            info!(
                "Turn {}: scores {:?}, {} moves logged",
                turns, scores, outcome.snapshot.move_count
            );
        }
    }

    // Final results
    info!("=== Match Results ===");
    let snap = engine.match_snapshot(&match_id).await?;
    info!("Status: {:?}", snap.status);
    match &snap.winner {
        Some(winner) => info!("Winner: {}", winner),
        None => info!("No winner recorded"),
    }
    for p in &snap.participants {
        info!(
            "{}: score {}, coins left {}",
            p.user, p.score, p.coins_remaining
        );
    }
    info!("Settled: {}", snap.settled);
    info!(
        "Alice wallet: {:?}, Bob wallet: {:?}",
        engine.ledger().balances(&alice).await,
        engine.ledger().balances(&bob).await
    );
    info!("Journal events: {}", journal.len());

    Ok(())
}
