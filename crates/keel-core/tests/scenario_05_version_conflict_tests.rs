//! Scenario 5: concurrent writers to one row
//!
//! The second writer's flush fails with `StaleVersionConflict` and nothing
//! of its batch reaches storage. Retrying the unit of work succeeds.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{gateway, pirate, seed_pirate, Fixture, Pirate};
use keel_core::{Identity, KeelError, Value};

#[test]
fn test_scenario_05_second_writer_gets_stale_version() {
    // GIVEN sessions A and B both holding Pirate #1 at version 0
    let fixture = Fixture::starting_after(1);
    let mut gateway = gateway();
    seed_pirate(&mut gateway, 1, "Jack", 10_000);
    let mut a = fixture.session();
    let mut b = fixture.session();
    let in_a = a.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    let in_b = b.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    assert!(!in_a.ptr_eq(&in_b));

    // WHEN A changes the bounty and flushes
    in_a.update(|p| p.bounty = 30_000);
    a.flush(&mut gateway).unwrap();
    assert_eq!(in_a.read(|p| p.version), 1);

    // AND B changes the nickname and flushes
    in_b.update(|p| p.nickname = Some("Sparrow".to_string()));
    let err = b.flush(&mut gateway).unwrap_err();

    // THEN B's flush is a stale version conflict
    assert_eq!(
        err,
        KeelError::StaleVersionConflict {
            identity: Identity::new("Pirate", 1),
            expected_version: Some(0),
        }
    );
    assert!(err.is_retryable());

    // AND storage holds only A's change
    let stored = gateway.row("pirates", 1).unwrap();
    assert_eq!(stored.get("bounty"), Some(&Value::Int(30_000)));
    assert_eq!(stored.get("nickname"), Some(&Value::Null));
    assert_eq!(stored.get("version"), Some(&Value::Int(1)));

    // AND B's bookkeeping is unchanged
    let entry = b.entry_of(&in_b).unwrap();
    assert_eq!(entry.version(), Some(0));
    assert_eq!(entry.snapshot().value("nickname"), Some(&Value::Null));
    assert_eq!(b.diff(&in_b).unwrap().fields(), vec!["nickname"]);
}

#[test]
fn test_scenario_05_failed_batch_rolls_back_every_operation() {
    // GIVEN B with a new pirate to insert and a stale update
    let fixture = Fixture::starting_after(1);
    let mut gateway = gateway();
    seed_pirate(&mut gateway, 1, "Jack", 10_000);
    let mut a = fixture.session();
    let mut b = fixture.session();
    let in_a = a.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    let in_b = b.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    in_a.update(|p| p.bounty = 30_000);
    a.flush(&mut gateway).unwrap();

    let anne = pirate("Anne", 500);
    b.persist(&anne).unwrap();
    in_b.update(|p| p.bounty = 1);

    // WHEN B flushes
    let err = b.flush(&mut gateway).unwrap_err();

    // THEN the insert that ran before the conflict was rolled back too
    assert!(matches!(err, KeelError::StaleVersionConflict { .. }));
    assert_eq!(gateway.count("pirates"), 1);
    assert!(!b.entry_of(&anne).unwrap().is_persisted());
    assert_eq!(b.change_set().unwrap().inserts.len(), 1);
}

#[test]
fn test_scenario_05_retry_with_fresh_session_succeeds() {
    // GIVEN B lost the race
    let fixture = Fixture::new();
    let mut gateway = gateway();
    seed_pirate(&mut gateway, 1, "Jack", 10_000);
    let mut a = fixture.session();
    let mut b = fixture.session();
    let in_a = a.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    let in_b = b.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    in_a.update(|p| p.bounty = 30_000);
    a.flush(&mut gateway).unwrap();
    in_b.update(|p| p.nickname = Some("Sparrow".to_string()));
    assert!(b.flush(&mut gateway).is_err());
    drop(b);

    // WHEN the unit of work is replayed in a new session
    let mut retry = fixture.session();
    let again = retry.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    again.update(|p| p.nickname = Some("Sparrow".to_string()));
    retry.commit(&mut gateway).unwrap();

    // THEN both changes are stored and the version is 2
    let stored = gateway.row("pirates", 1).unwrap();
    assert_eq!(stored.get("bounty"), Some(&Value::Int(30_000)));
    assert_eq!(stored.get("nickname"), Some(&Value::from("Sparrow")));
    assert_eq!(stored.get("version"), Some(&Value::Int(2)));
    assert!(retry.is_empty());
}

#[test]
fn test_scenario_05_refresh_picks_up_new_token() {
    // GIVEN B holds a stale copy
    let fixture = Fixture::new();
    let mut gateway = gateway();
    seed_pirate(&mut gateway, 1, "Jack", 10_000);
    let mut a = fixture.session();
    let mut b = fixture.session();
    let in_a = a.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    let in_b = b.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    in_a.update(|p| p.bounty = 30_000);
    a.flush(&mut gateway).unwrap();

    // WHEN B refreshes and then edits
    b.refresh(&mut gateway, &in_b).unwrap();
    assert_eq!(in_b.read(|p| (p.bounty, p.version)), (30_000, 1));
    in_b.update(|p| p.name = "Captain Jack".to_string());

    // THEN B's flush succeeds against version 1
    b.flush(&mut gateway).unwrap();
    assert_eq!(in_b.read(|p| p.version), 2);
}

#[test]
fn test_scenario_05_stale_delete_keeps_row() {
    let fixture = Fixture::new();
    let mut gateway = gateway();
    seed_pirate(&mut gateway, 1, "Jack", 10_000);
    let mut a = fixture.session();
    let mut b = fixture.session();
    let in_a = a.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    let in_b = b.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    in_a.update(|p| p.bounty = 30_000);
    a.flush(&mut gateway).unwrap();

    b.remove(&in_b).unwrap();
    let err = b.flush(&mut gateway).unwrap_err();

    assert!(matches!(err, KeelError::StaleVersionConflict { .. }));
    assert!(gateway.row("pirates", 1).is_some());
    assert_eq!(b.state_of(&in_b), keel_core::EntityState::Removed);
}
