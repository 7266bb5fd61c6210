//! End-to-end vault scenarios
//!
//! Each test builds vaults the way the binary does (in-memory backing,
//! manual clock) and drives them through the public API only.

use std::sync::Arc;

use multivault_backend::vault::{
    Amount, BackingOp, Caller, DeltaNeutralConfig, DeltaNeutralStrategy, EventBus,
    InMemoryBacking, InMemoryBackingConfig, ManualClock, SimpleAccrualConfig,
    SimpleAccrualStrategy, UtilizationAwareConfig, UtilizationAwareStrategy, Vault, VaultDb,
    VaultError, VaultEvent, VaultLimits,
};

const START: i64 = 1_700_000_000;

fn limits(min_deposit: Amount, max_capacity: Amount) -> VaultLimits {
    VaultLimits {
        min_deposit,
        max_capacity,
    }
}

fn noble(apy_bps: u32, limits: VaultLimits) -> (Vault<SimpleAccrualStrategy>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START));
    let strategy = SimpleAccrualStrategy::new(
        SimpleAccrualConfig {
            apy_bps,
            ..SimpleAccrualConfig::default()
        },
        Arc::new(InMemoryBacking::named("noble")),
    );
    (Vault::new("noble", limits, strategy, clock.clone()), clock)
}

fn aave(limits: VaultLimits) -> (Vault<UtilizationAwareStrategy>, Arc<InMemoryBacking>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START));
    let backing = Arc::new(InMemoryBacking::named("aave"));
    let strategy = UtilizationAwareStrategy::new(UtilizationAwareConfig::default(), backing.clone());
    (Vault::new("aave", limits, strategy, clock.clone()), backing, clock)
}

fn resolv(realized_yield_bps: u32) -> (Vault<DeltaNeutralStrategy>, Arc<InMemoryBacking>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START));
    let backing = Arc::new(InMemoryBacking::new(InMemoryBackingConfig {
        realized_yield_bps,
        ..InMemoryBackingConfig::named("resolv")
    }));
    let strategy = DeltaNeutralStrategy::new(DeltaNeutralConfig::default(), backing.clone()).unwrap();
    let vault = Vault::new("resolv", limits(10_000, 100_000_000), strategy, clock.clone());
    (vault, backing, clock)
}

#[tokio::test]
async fn test_full_year_accrual_at_800_bps() {
    let (vault, clock) = noble(800, limits(1_000, 10_000_000));
    vault.deposit("alice", 10_000).await.unwrap();

    clock.advance_days(365);
    assert_eq!(vault.calculate_user_yield("alice").await, 800);

    let position = vault.user_position("alice").await.unwrap();
    assert_eq!(position.pending_yield, 800);
    assert_eq!(position.assets, 10_000);
}

#[tokio::test]
async fn test_minimum_deposit_boundary() {
    let (vault, _) = noble(500, limits(10_000, 10_000_000));

    let err = vault.deposit("alice", 1_000).await.unwrap_err();
    assert_eq!(
        err,
        VaultError::BelowMinimumDeposit {
            minimum: 10_000,
            actual: 1_000
        }
    );
    assert!(vault.deposit("alice", 9_999).await.is_err());
    assert_eq!(vault.total_assets().await, 0);
    assert_eq!(vault.total_shares().await, 0);
    assert!(vault.user_position("alice").await.is_none());

    let receipt = vault.deposit("alice", 10_000).await.unwrap();
    assert_eq!(receipt.shares, 10_000);
}

#[tokio::test]
async fn test_capacity_enforcement() {
    let (vault, _) = noble(500, limits(1_000, 50_000));
    vault.deposit("alice", 40_000).await.unwrap();

    assert_eq!(
        vault.deposit("bob", 10_001).await,
        Err(VaultError::ExceedsMaxCapacity {
            capacity: 50_000,
            requested_total: 50_001
        })
    );
    vault.deposit("bob", 10_000).await.unwrap();
    assert_eq!(vault.max_deposit().await, 0);
    assert_eq!(vault.total_assets().await, 50_000);
}

#[tokio::test]
async fn test_high_utilization_blocks_deposits_not_withdrawals() {
    let (vault, _, _) = aave(limits(1_000, 100_000));
    vault.deposit("whale", 90_000).await.unwrap();

    let err = vault.deposit("alice", 1_000).await.unwrap_err();
    assert_eq!(
        err,
        VaultError::HighUtilizationRisk {
            utilization_bps: 9_000,
            threshold_bps: 8_500
        }
    );
    assert!(err.is_retryable());
    assert_eq!(vault.total_assets().await, 90_000);

    let receipt = vault.withdraw("whale", 10_000).await.unwrap();
    assert_eq!(receipt.assets, 10_000);

    // Back at 80% the gate opens again
    vault.deposit("alice", 1_000).await.unwrap();
}

#[tokio::test]
async fn test_incentives_accrue_and_pay_out() {
    let (vault, backing, clock) = aave(limits(1_000, 1_000_000));
    vault.deposit("alice", 100_000).await.unwrap();
    vault.deposit("bob", 300_000).await.unwrap();

    clock.advance_days(1);
    let harvested = vault.harvest_yield(&Caller::harvester("keeper")).await.unwrap();
    assert!(harvested > 0);

    // 400_000 * 50 bps = 2_000, split 1:3
    assert_eq!(vault.user_position("alice").await.unwrap().accrued_incentives, 500);
    assert_eq!(vault.claim_incentives("alice").await.unwrap(), 500);
    assert_eq!(vault.claim_incentives("alice").await, Err(VaultError::NothingToClaim));

    let receipt = vault.withdraw("bob", 300_000).await.unwrap();
    assert_eq!(receipt.incentives, 1_500);
    assert!(receipt.assets > 300_000);
    assert!(vault.user_position("bob").await.is_none());
    assert_eq!(backing.book().total_rewards, 2_000);
}

#[tokio::test]
async fn test_failed_reward_claim_keeps_principal_in_backing() {
    let (vault, backing, clock) = aave(limits(1_000, 1_000_000));
    vault.deposit("alice", 100_000).await.unwrap();
    clock.advance_days(1);
    vault.harvest_yield(&Caller::harvester("keeper")).await.unwrap();

    let balance = backing.book().balance;
    let total_assets = vault.total_assets().await;
    assert_eq!(balance, total_assets);
    assert_eq!(vault.user_position("alice").await.unwrap().accrued_incentives, 500);

    backing.fail_next(BackingOp::ClaimRewards);
    assert!(matches!(
        vault.withdraw("alice", 50_000).await,
        Err(VaultError::Backing { .. })
    ));
    assert_eq!(backing.book().balance, balance);
    assert_eq!(vault.total_assets().await, total_assets);
    assert_eq!(vault.shares_of("alice").await, 100_000);
    assert_eq!(vault.user_position("alice").await.unwrap().accrued_incentives, 500);

    let receipt = vault.withdraw("alice", 50_000).await.unwrap();
    assert_eq!(receipt.incentives, 500);
    assert_eq!(backing.book().balance, vault.total_assets().await);
}

#[tokio::test]
async fn test_failed_reward_claim_aborts_emergency_exit() {
    let (vault, backing, clock) = aave(limits(1_000, 1_000_000));
    vault.deposit("alice", 100_000).await.unwrap();
    clock.advance_days(1);
    vault.harvest_yield(&Caller::harvester("keeper")).await.unwrap();
    let admin = Caller::admin("ops");

    let balance = backing.book().balance;
    let before = vault.get_strategy_info().await;

    backing.fail_next(BackingOp::ClaimRewards);
    assert!(matches!(
        vault.emergency_withdraw(&admin, "alice").await,
        Err(VaultError::EmergencyWithdrawalFailed { .. })
    ));
    assert_eq!(backing.book().balance, balance);
    assert_eq!(vault.get_strategy_info().await, before);
    assert_eq!(vault.shares_of("alice").await, 100_000);

    // Liquidity is intact, so the retry drains the position completely
    let receipt = vault.emergency_withdraw(&admin, "alice").await.unwrap();
    assert_eq!(receipt.assets, balance);
    assert_eq!(receipt.incentives, 500);
    assert_eq!(backing.book().balance, 0);
    assert_eq!(vault.total_assets().await, 0);
}

#[tokio::test]
async fn test_delta_neutral_skew_and_rebalance() {
    let (vault, _, _) = resolv(10_000);
    let strategist = Caller::strategist("desk");

    vault.deposit("alice", 100_000).await.unwrap();
    let info = vault.delta_neutral_info().await;
    assert_eq!((info.long_position, info.short_position), (50_000, 50_000));

    vault.sync_leg_values(&strategist, 70_000, 30_000).await.unwrap();
    let outcome = vault.rebalance_position(&strategist).await.unwrap();
    assert_eq!((outcome.long_after, outcome.short_after), (50_000, 50_000));

    let info = vault.delta_neutral_info().await;
    assert_eq!((info.long_position, info.short_position), (50_000, 50_000));
    assert_eq!(info.long_position + info.short_position, vault.total_assets().await);
    assert!(vault
        .events()
        .recent(20)
        .iter()
        .any(|r| matches!(r.event, VaultEvent::DeltaNeutralityRestored { deviation_before_bps: 2_000, .. })));
}

#[tokio::test]
async fn test_performance_buffer_stays_bounded() {
    let keeper = Caller::harvester("keeper");

    let (hot, _, clock) = resolv(15_000);
    hot.deposit("alice", 1_000_000).await.unwrap();
    for _ in 0..12 {
        clock.advance_days(30);
        hot.harvest_yield(&keeper).await.unwrap();
        let buffer = hot.get_performance_data().await.performance_buffer_bps.unwrap();
        assert!(buffer <= 2_000, "buffer {} above cap", buffer);
    }
    assert_eq!(hot.get_performance_data().await.performance_buffer_bps, Some(2_000));

    let (cold, _, clock) = resolv(5_000);
    cold.deposit("alice", 1_000_000).await.unwrap();
    for _ in 0..12 {
        clock.advance_days(30);
        cold.harvest_yield(&keeper).await.unwrap();
        assert_eq!(cold.get_performance_data().await.performance_buffer_bps, Some(0));
    }
}

#[tokio::test]
async fn test_share_price_never_decreases() {
    let (vault, clock) = noble(1_500, limits(1_000, 100_000_000));
    let keeper = Caller::harvester("keeper");
    let mut last_price = vault.get_strategy_info().await.share_price;

    let deposits: [(&str, Amount); 6] = [
        ("alice", 12_345),
        ("bob", 1_000_001),
        ("carol", 7_777),
        ("alice", 3_333),
        ("dave", 250_000),
        ("bob", 1_001),
    ];
    for (i, (who, amount)) in deposits.iter().enumerate() {
        vault.deposit(who, *amount).await.unwrap();
        let price = vault.get_strategy_info().await.share_price;
        assert!(price >= last_price, "deposit {} lowered price", i);
        last_price = price;

        clock.advance_by(12_345 + i as i64 * 1_000);
        vault.harvest_yield(&keeper).await.unwrap();
        let price = vault.get_strategy_info().await.share_price;
        assert!(price >= last_price, "harvest {} lowered price", i);
        last_price = price;
    }

    let bob_shares = vault.shares_of("bob").await;
    vault.withdraw("bob", bob_shares / 3).await.unwrap();
    assert!(vault.get_strategy_info().await.share_price >= last_price);
}

#[tokio::test]
async fn test_conservation_across_mixed_operations() {
    let (vault, clock) = noble(900, limits(1_000, 100_000_000));
    let keeper = Caller::harvester("keeper");

    for (who, amount) in [("alice", 50_003), ("bob", 20_011), ("carol", 99_999)] {
        vault.deposit(who, amount).await.unwrap();
    }
    clock.advance_days(45);
    vault.harvest_yield(&keeper).await.unwrap();
    vault.deposit("dave", 33_333).await.unwrap();
    vault.withdraw("bob", 7_000).await.unwrap();
    clock.advance_days(10);
    vault.harvest_yield(&keeper).await.unwrap();

    vault.check_invariants().await.unwrap();
    let total = vault.total_assets().await;
    let sum = vault.sum_of_position_assets().await.unwrap();
    assert!(sum <= total);
    // One unit of truncation per position at most
    assert!(total - sum <= 4, "total {} vs positions {}", total, sum);

    // Everyone exits; the pool resets to empty
    for who in ["alice", "bob", "carol", "dave"] {
        let shares = vault.shares_of(who).await;
        vault.withdraw(who, shares).await.unwrap();
    }
    assert_eq!(vault.total_shares().await, 0);
    assert_eq!(vault.total_assets().await, 0);
}

#[tokio::test]
async fn test_failed_emergency_exit_changes_nothing() {
    let clock = Arc::new(ManualClock::new(START));
    let backing = Arc::new(InMemoryBacking::named("noble"));
    let vault = Vault::new(
        "noble",
        limits(1_000, 1_000_000),
        SimpleAccrualStrategy::new(SimpleAccrualConfig::default(), backing.clone()),
        clock,
    );
    vault.deposit("alice", 25_000).await.unwrap();
    let admin = Caller::admin("ops");

    backing.set_failing(BackingOp::EmergencyRedeem, true);
    let before = vault.get_strategy_info().await;
    assert!(matches!(
        vault.emergency_withdraw(&admin, "alice").await,
        Err(VaultError::EmergencyWithdrawalFailed { .. })
    ));
    assert_eq!(vault.get_strategy_info().await, before);
    assert_eq!(vault.shares_of("alice").await, 25_000);

    backing.set_failing(BackingOp::EmergencyRedeem, false);
    let receipt = vault.emergency_withdraw(&admin, "alice").await.unwrap();
    assert_eq!(receipt.assets, 25_000);
    assert_eq!(backing.book().balance, 0);
}

#[tokio::test]
async fn test_committed_events_reach_the_database() {
    let db = VaultDb::new(":memory:").unwrap();
    let bus = EventBus::new(64);
    let recorder = multivault_backend::vault::spawn_event_recorder(db.clone(), bus.subscribe());

    let (vault, _) = noble(500, limits(1_000, 1_000_000));
    let vault = vault.with_event_bus(bus.clone());
    vault.deposit("alice", 5_000).await.unwrap();
    // Rejected deposits publish nothing
    assert!(vault.deposit("alice", 10).await.is_err());
    vault.withdraw("alice", 2_000).await.unwrap();

    drop(vault);
    drop(bus);
    recorder.await.unwrap();

    let events = db.list_events(10, Some("noble"), Some("alice")).await.unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec!["withdrawn", "deposited"]);
}
