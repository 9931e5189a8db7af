//! Property tests: identity map uniqueness and dirty-check precision

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::{BTreeSet, HashSet};

use common::{crew_member, gateway, pirate, seed_pirate, Fixture, Pirate, Ship};
use keel_core::relations::link;
use keel_core::{EntityRef, EntityState, KeelError, Value};
use proptest::prelude::*;

fn arb_nickname() -> impl Strategy<Value = Option<String>> {
    prop_oneof![Just(None), "[a-z]{1,6}".prop_map(Some)]
}

proptest! {
    #[test]
    fn prop_find_returns_one_instance_per_key(keys in prop::collection::vec(1_i64..6, 1..20)) {
        // GIVEN five stored pirates
        let fixture = Fixture::new();
        let mut gateway = gateway();
        for id in 1..6 {
            seed_pirate(&mut gateway, id, "Pirate", id * 100);
        }
        let mut session = fixture.session();

        // WHEN finding keys in any order, with repeats
        let mut first_seen = std::collections::HashMap::new();
        for key in &keys {
            let found = session.find::<Pirate>(&mut gateway, *key).unwrap().unwrap();
            let first = first_seen.entry(*key).or_insert_with(|| found.clone());

            // THEN every repeat is the very same instance
            prop_assert!(first.ptr_eq(&found));
        }
        let distinct: BTreeSet<_> = keys.iter().collect();
        prop_assert_eq!(session.len(), distinct.len());
    }

    #[test]
    fn prop_update_lists_exactly_changed_fields(
        name in "[A-Z][a-z]{0,5}",
        nickname in arb_nickname(),
        bounty in 0_i64..1_000,
    ) {
        // GIVEN Pirate #1 stored as ("Jack", no nickname, 10)
        let fixture = Fixture::new();
        let mut gateway = gateway();
        seed_pirate(&mut gateway, 1, "Jack", 10);
        let mut session = fixture.session();
        let jack = session.find::<Pirate>(&mut gateway, 1).unwrap().unwrap();

        // WHEN assigning arbitrary values
        jack.update(|p| {
            p.name = name.clone();
            p.nickname = nickname.clone();
            p.bounty = bounty;
        });
        let mut expected = Vec::new();
        if bounty != 10 {
            expected.push("bounty".to_string());
        }
        if name != "Jack" {
            expected.push("name".to_string());
        }
        if nickname.is_some() {
            expected.push("nickname".to_string());
        }

        // THEN the flush updates exactly the fields whose value differs
        let summary = session.flush(&mut gateway).unwrap();
        let written: Vec<String> = summary
            .updated
            .first()
            .map(|updated| updated.fields.clone())
            .unwrap_or_default();
        prop_assert_eq!(&written, &expected);

        let stored = gateway.row("pirates", 1).unwrap();
        let expected_version = if expected.is_empty() { 0 } else { 1 };
        prop_assert_eq!(stored.get("version"), Some(&Value::Int(expected_version)));
        prop_assert_eq!(stored.get("bounty"), Some(&Value::Int(bounty)));
    }

    #[test]
    fn prop_attach_never_tracks_two_instances_per_identity(
        presets in prop::collection::vec(prop::option::of(1_i64..6), 1..20),
    ) {
        // GIVEN pirates that are key-less or preset to a small key range
        let fixture = Fixture::new();
        let mut session = fixture.session();

        // WHEN attaching them one after another
        let mut attached = Vec::new();
        for preset in &presets {
            let candidate = pirate("Pirate", 0);
            candidate.update(|p| p.id = *preset);
            match session.attach(&candidate) {
                Ok(identity) => attached.push((identity, candidate)),
                Err(err) => {
                    // THEN a refused instance collided and stays untracked
                    prop_assert!(matches!(err, KeelError::DuplicateIdentity { .. }), "unexpected error: {}", err);
                    prop_assert_eq!(session.state_of(&candidate), EntityState::Transient);
                }
            }
        }

        // THEN identities are distinct and each resolves to its own instance
        let identities: HashSet<_> = attached.iter().map(|(identity, _)| identity.clone()).collect();
        prop_assert_eq!(identities.len(), attached.len());
        prop_assert_eq!(session.len(), attached.len());
        for (identity, instance) in &attached {
            let tracked = session.lookup::<Pirate>(identity.key.clone()).unwrap();
            prop_assert!(tracked.ptr_eq(instance));
        }
    }

    #[test]
    fn prop_persist_graph_is_all_or_nothing(
        presets in prop::collection::vec(prop::option::of(1_i64..5), 1..6),
    ) {
        // GIVEN a new ship whose crew are key-less or preset
        let fixture = Fixture::new();
        let mut session = fixture.session();
        let ship = EntityRef::new(Ship::default());
        let crew: Vec<_> = presets
            .iter()
            .map(|preset| {
                let member = crew_member("Crew");
                member.update(|c| c.id = *preset);
                link(&ship, &member, |s| &mut s.crew, |c| &mut c.ship);
                member
            })
            .collect();

        // Key-less members draw 1, 2, ... from a fresh sequence
        let keyless = presets.iter().filter(|preset| preset.is_none()).count() as i64;
        let mut keys: Vec<i64> = presets.iter().flatten().copied().collect();
        keys.extend(1..=keyless);
        let distinct: HashSet<_> = keys.iter().collect();
        let collides = distinct.len() != keys.len();

        // WHEN persisting the ship
        let result = session.persist(&ship);

        // THEN either the whole graph is tracked or none of it is
        if collides {
            prop_assert!(matches!(result, Err(KeelError::DuplicateIdentity { .. })), "expected DuplicateIdentity, got {:?}", result);
            prop_assert!(session.is_empty());
            prop_assert_eq!(session.state_of(&ship), EntityState::Transient);
            prop_assert!(crew.iter().all(|c| session.state_of(c) == EntityState::Transient));
        } else {
            prop_assert!(result.is_ok());
            prop_assert_eq!(session.len(), crew.len() + 1);
            prop_assert!(crew.iter().all(|c| session.state_of(c) == EntityState::Managed));
        }
    }
}
