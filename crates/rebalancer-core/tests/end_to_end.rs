//! End-to-end flow: portfolio, policy, session, signed swap, leg execution,
//! completion, and the cooldown it re-arms.

use chrono::{Duration, Utc};
use ed25519_dalek::{Signer, SigningKey};
use rebalancer_core::*;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct World {
    engine: RebalanceEngine,
    clock: Arc<ManualClock>,
    key: SigningKey,
    owner: Identity,
    agent: Identity,
}

fn world() -> World {
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let owner = Identity::new("owner-1");
    let agent = Identity::new("agent-1");

    let ring = Ed25519KeyRing::new();
    ring.register_key(owner.clone(), key.verifying_key()).unwrap();

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let config = EngineConfig {
        admins: vec![Identity::new("admin")],
        price_feeds: vec![Identity::new("oracle")],
        authorized_agents: vec![agent.clone()],
        ..EngineConfig::default()
    };
    let engine = RebalanceEngine::new(config, Arc::new(ring), clock.clone()).unwrap();

    World {
        engine,
        clock,
        key,
        owner,
        agent,
    }
}

fn sign(world: &World, session: &DelegationSession, nonce: u64, payload: serde_json::Value) -> SignedOperation {
    let mut op = SignedOperation {
        owner: world.owner.clone(),
        delegate: world.agent.clone(),
        nonce,
        op_type: OperationType::Swap,
        payload,
        timestamp: world.clock.now(),
        signature: Vec::new(),
    };
    let digest = operation_digest(&op, &session.policy_hash).unwrap();
    op.signature = world.key.sign(digest.as_bytes()).to_bytes().to_vec();
    op
}

fn swap_leg() -> SwapLeg {
    SwapLeg {
        token_in: TokenId::new("USDC"),
        token_out: TokenId::new("ETH"),
        amount_in: 1_000,
        min_amount_out: 995,
        chain_id: 1,
        route_ref: "route-usdc-eth".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn single_swap_rebalance_completes_once() {
    let w = world();

    w.engine
        .create_portfolio(
            &w.owner,
            vec![Asset::new("USDC", 1, 5_000), Asset::new("ETH", 1, 5_000)],
        )
        .unwrap();
    let policy = w
        .engine
        .set_delegation_policy(
            &w.owner,
            &w.agent,
            PolicyBounds {
                max_slippage_bps: 50,
                max_rebalance_usd: 1_000_000,
                threshold_bps: 100,
                cooldown_secs: 3_600,
            },
        )
        .unwrap();
    let session = w
        .engine
        .create_session(
            &w.owner,
            &w.agent,
            w.clock.now() + Duration::seconds(86_400),
            &policy.policy_hash(),
            1,
        )
        .unwrap();

    assert!(w.engine.needs_rebalancing(&w.owner, &[6_000, 4_000]).unwrap());

    let op = sign(&w, &session, 0, serde_json::json!({"leg": 0, "route": "route-usdc-eth"}));
    w.engine.verify_operation(&session.id, &op).unwrap();
    w.engine
        .execute_operation(&w.agent, &session.id, &op, "route-usdc-eth")
        .unwrap();
    assert!(!w.engine.is_session_valid(&session.id));

    let action = w
        .engine
        .create_action(&w.agent, &w.owner, vec![swap_leg()], vec![], 1_000)
        .unwrap();
    w.engine
        .execute_swap_leg(&w.agent, &action.id, 0, 995)
        .unwrap();
    assert_eq!(w.engine.balance(&w.owner, &TokenId::new("ETH")), 995);
    assert_eq!(w.engine.balance(&w.owner, &TokenId::new("USDC")), 0);

    let completed = w.engine.complete_action(&w.agent, &action.id).unwrap();
    assert!(completed.executed);
    let portfolio = w.engine.get_portfolio(&w.owner).unwrap().unwrap();
    assert_eq!(portfolio.last_rebalance_ts, Some(w.clock.now()));
    assert_eq!(portfolio.total_value_usd, 1_000);

    let err = w.engine.complete_action(&w.agent, &action.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    // Cooldown now gates the next decision.
    assert!(!w.engine.needs_rebalancing(&w.owner, &[6_000, 4_000]).unwrap());
    w.clock.advance(Duration::seconds(3_600));
    assert!(w.engine.needs_rebalancing(&w.owner, &[6_000, 4_000]).unwrap());

    assert!(w.engine.verify_audit_chain());
    let stages: Vec<String> = w
        .engine
        .audit_entries(Some(&action.id))
        .unwrap()
        .into_iter()
        .map(|entry| entry.event.stage)
        .collect();
    assert_eq!(stages, vec!["action_created", "swap_leg_executed", "action_completed"]);
}

#[test]
fn replayed_signature_fails_on_every_session() {
    let w = world();
    w.engine
        .create_portfolio(&w.owner, vec![Asset::new("USDC", 1, 10_000)])
        .unwrap();
    let bounds = PolicyBounds {
        max_slippage_bps: 100,
        max_rebalance_usd: 10_000,
        threshold_bps: 200,
        cooldown_secs: 7_200,
    };
    let first = w
        .engine
        .enable_delegation(&w.owner, &w.agent, bounds, None, Some(3))
        .unwrap();
    let second = w
        .engine
        .create_session(
            &w.owner,
            &w.agent,
            w.clock.now() + Duration::seconds(600),
            &first.policy.policy_hash(),
            3,
        )
        .unwrap();

    let op = sign(&w, &first.session, 0, serde_json::json!({"amount": "10"}));
    w.engine
        .execute_operation(&w.agent, &first.session.id, &op, "ref-1")
        .unwrap();

    for session_id in [&first.session.id, &second.id] {
        let err = w.engine.verify_operation(session_id, &op).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Replay);
    }
    assert_eq!(w.engine.get_nonce(&w.owner), 2);
}

#[test]
fn paused_action_never_stamps_portfolio() {
    let w = world();
    w.engine
        .create_portfolio(
            &w.owner,
            vec![Asset::new("USDC", 1, 5_000), Asset::new("ETH", 1, 5_000)],
        )
        .unwrap();
    w.engine
        .set_delegation_policy(
            &w.owner,
            &w.agent,
            PolicyBounds {
                max_slippage_bps: 50,
                max_rebalance_usd: 1_000_000,
                threshold_bps: 100,
                cooldown_secs: 3_600,
            },
        )
        .unwrap();
    let action = w
        .engine
        .create_action(&w.agent, &w.owner, vec![swap_leg()], vec![], 1_000)
        .unwrap();

    w.engine
        .pause_action(&Identity::new("admin"), &action.id)
        .unwrap();
    assert!(w
        .engine
        .get_portfolio(&w.owner)
        .unwrap()
        .unwrap()
        .last_rebalance_ts
        .is_none());
    let err = w
        .engine
        .execute_swap_leg(&w.agent, &action.id, 0, 995)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
}
