//! Scenario 3: changes made while detached are flushed after a merge
//!
//! The merged copy is a different instance; the detached original never
//! enters the new session.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{gateway, seed_pirate, Fixture, Pirate};
use keel_core::{EntityState, KeelError, Value};

#[test]
fn test_scenario_03_merge_commits_detached_change() {
    // GIVEN Pirate #1 loaded in a session that then ends
    let fixture = Fixture::new();
    let mut gateway = gateway();
    seed_pirate(&mut gateway, 1, "Jack", 10_000);
    let mut first = fixture.session();
    let jack = first.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    first.close();

    // AND its nickname is changed while detached
    jack.update(|p| p.nickname = Some("Sparrow".to_string()));
    assert_eq!(gateway.row("pirates", 1).unwrap().get("nickname"), Some(&Value::Null));

    // WHEN merging it into a new session and flushing
    let mut second = fixture.session();
    assert_eq!(second.state_of(&jack), EntityState::Detached);
    let merged = second.merge(&jack).unwrap();
    let summary = second.flush(&mut gateway).unwrap();

    // THEN the nickname is committed
    assert_eq!(summary.updated.len(), 1);
    assert_eq!(summary.updated[0].fields, vec!["nickname".to_string()]);
    let stored = gateway.row("pirates", 1).unwrap();
    assert_eq!(stored.get("nickname"), Some(&Value::from("Sparrow")));
    assert_eq!(stored.get("version"), Some(&Value::Int(1)));
    assert_eq!(merged.read(|p| p.version), 1);
}

#[test]
fn test_scenario_03_merge_does_not_alias() {
    // GIVEN a detached pirate
    let fixture = Fixture::new();
    let mut gateway = gateway();
    seed_pirate(&mut gateway, 1, "Jack", 10_000);
    let mut first = fixture.session();
    let jack = first.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    drop(first);

    // WHEN merging
    let mut second = fixture.session();
    let merged = second.merge(&jack).unwrap();

    // THEN the result is a distinct managed instance
    assert!(!merged.ptr_eq(&jack));
    assert!(second.contains(&merged));
    assert!(!second.contains(&jack));
    assert_eq!(second.state_of(&jack), EntityState::Detached);
    assert_eq!(second.lookup::<Pirate>(1).unwrap(), merged);

    // AND later edits to the original stay out of storage
    jack.update(|p| p.bounty = 0);
    assert!(second.flush(&mut gateway).unwrap().is_empty());
    assert_eq!(gateway.row("pirates", 1).unwrap().get("bounty"), Some(&Value::Int(10_000)));
}

#[test]
fn test_scenario_03_merge_onto_managed_copy_overwrites_it() {
    // GIVEN Pirate #1 already managed in the second session
    let fixture = Fixture::new();
    let mut gateway = gateway();
    seed_pirate(&mut gateway, 1, "Jack", 10_000);
    let mut first = fixture.session();
    let detached = first.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    first.clear();
    let mut second = fixture.session();
    let managed = second.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();

    // WHEN merging the detached copy with a new bounty
    detached.update(|p| p.bounty = 50_000);
    let merged = second.merge(&detached).unwrap();

    // THEN the existing instance is updated and returned
    assert!(merged.ptr_eq(&managed));
    assert_eq!(managed.read(|p| p.bounty), 50_000);
    assert_eq!(second.diff(&managed).unwrap().fields(), vec!["bounty"]);
}

#[test]
fn test_scenario_03_plain_persist_of_detached_is_rejected() {
    let fixture = Fixture::new();
    let mut gateway = gateway();
    seed_pirate(&mut gateway, 1, "Jack", 10_000);
    let mut first = fixture.session();
    let jack = first.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();
    first.close();

    let mut second = fixture.session();
    let err = second.persist(&jack).unwrap_err();

    assert!(matches!(err, KeelError::DetachedEntityOperation { .. }));
    assert!(second.is_empty());
}
