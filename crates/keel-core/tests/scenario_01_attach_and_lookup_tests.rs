//! Scenario 1: attaching a new pirate assigns its identity
//!
//! The first key from the sequence is 1 and a versioned type starts at
//! version 0. Lookups in the same session return the same instance.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{pirate, Fixture, Pirate};
use keel_core::{EntityState, Identity};

#[test]
fn test_scenario_01_attach_assigns_key_and_initial_version() {
    // GIVEN a fresh session and a new pirate
    let fixture = Fixture::new();
    let mut session = fixture.session();
    let jack = pirate("Jack", 10_000);

    // WHEN attaching it
    let identity = session.attach(&jack).expect("attach should succeed");

    // THEN it has id 1 and version 0
    assert_eq!(identity, Identity::new("Pirate", 1));
    assert_eq!(jack.read(|p| p.id), Some(1));
    assert_eq!(jack.read(|p| p.version), 0);
    assert_eq!(session.state_of(&jack), EntityState::Managed);
}

#[test]
fn test_scenario_01_lookup_returns_same_reference() {
    // GIVEN an attached pirate
    let fixture = Fixture::new();
    let mut session = fixture.session();
    let jack = pirate("Jack", 10_000);
    session.attach(&jack).unwrap();

    // WHEN looking it up by key twice
    let first = session.lookup::<Pirate>(1).expect("pirate should be tracked");
    let second = session.lookup::<Pirate>(1).expect("pirate should be tracked");

    // THEN both are the attached instance itself
    assert!(first.ptr_eq(&jack));
    assert!(second.ptr_eq(&first));

    // AND mutation through one handle is visible through the other
    first.update(|p| p.bounty = 20_000);
    assert_eq!(jack.read(|p| p.bounty), 20_000);
}

#[test]
fn test_scenario_01_lookup_misses_unknown_key() {
    let fixture = Fixture::new();
    let mut session = fixture.session();
    session.attach(&pirate("Jack", 10_000)).unwrap();

    assert!(session.lookup::<Pirate>(2).is_none());
}

#[test]
fn test_scenario_01_attach_does_not_touch_storage() {
    // GIVEN an attached pirate
    let fixture = Fixture::new();
    let mut session = fixture.session();
    let mut gateway = common::gateway();
    session.attach(&pirate("Jack", 10_000)).unwrap();

    // THEN nothing is written until flush
    assert_eq!(gateway.stats().batches, 0);

    let summary = session.flush(&mut gateway).unwrap();
    assert_eq!(summary.inserted, vec![Identity::new("Pirate", 1)]);
    assert_eq!(gateway.count("pirates"), 1);
}

#[test]
fn test_scenario_01_new_session_loads_a_distinct_reference() {
    // GIVEN a pirate attached, stored and its session closed
    let fixture = Fixture::new();
    let mut gateway = common::gateway();
    let mut session = fixture.session();
    let jack = pirate("Jack", 10_000);
    session.attach(&jack).unwrap();
    session.flush(&mut gateway).unwrap();
    session.close();
    assert_eq!(jack.read(|p| p.id), Some(1));

    // WHEN a new session loads the same identity
    let mut next = fixture.session();
    let loaded = next.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();

    // THEN it manages its own instance, not the closed session's one
    assert!(!loaded.ptr_eq(&jack));
    assert!(next.lookup::<Pirate>(1).unwrap().ptr_eq(&loaded));
    assert_eq!(next.state_of(&loaded), EntityState::Managed);
    assert_eq!(next.state_of(&jack), EntityState::Detached);
}
