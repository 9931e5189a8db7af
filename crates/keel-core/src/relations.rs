//! Two-sided relationship setters
//!
//! Foreign keys are derived from the owning side only, so adding a child to
//! an inverse collection alone never reaches storage. These helpers keep
//! both sides in step.

use crate::model::{Entity, EntityRef, Related};

/// Add `child` to `parent`'s collection and point the child's owning
/// reference at `parent`
///
/// Adding a child that is already a member leaves the collection as is.
pub fn link<P, C>(
    parent: &EntityRef<P>,
    child: &EntityRef<C>,
    collection: impl FnOnce(&mut P) -> &mut Vec<EntityRef<C>>,
    reference: impl FnOnce(&mut C) -> &mut Option<Related<P>>,
) where
    P: Entity,
    C: Entity,
{
    parent.update(|p| {
        let members = collection(p);
        if !members.iter().any(|member| member.ptr_eq(child)) {
            members.push(child.clone());
        }
    });
    child.update(|c| *reference(c) = Some(Related::to(parent)));
}

/// Take `child` out of `parent`'s collection and clear its owning reference
///
/// The reference is left alone when it already points at another loaded
/// parent.
pub fn unlink<P, C>(
    parent: &EntityRef<P>,
    child: &EntityRef<C>,
    collection: impl FnOnce(&mut P) -> &mut Vec<EntityRef<C>>,
    reference: impl FnOnce(&mut C) -> &mut Option<Related<P>>,
) where
    P: Entity,
    C: Entity,
{
    parent.update(|p| collection(p).retain(|member| !member.ptr_eq(child)));
    child.update(|c| {
        let slot = reference(c);
        let elsewhere = matches!(slot, Some(Related::Loaded(other)) if !other.ptr_eq(parent));
        if !elsewhere {
            *slot = None;
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Ship {
        crew: Vec<EntityRef<Sailor>>,
    }

    impl Entity for Ship {
        const ENTITY_TYPE: &'static str = "Ship";
    }

    #[derive(Default)]
    struct Sailor {
        ship: Option<Related<Ship>>,
    }

    impl Entity for Sailor {
        const ENTITY_TYPE: &'static str = "Sailor";
    }

    fn crew(s: &mut Ship) -> &mut Vec<EntityRef<Sailor>> {
        &mut s.crew
    }

    fn ship(s: &mut Sailor) -> &mut Option<Related<Ship>> {
        &mut s.ship
    }

    #[test]
    fn test_link_sets_both_sides_once() {
        let pearl = EntityRef::new(Ship::default());
        let jack = EntityRef::new(Sailor::default());

        link(&pearl, &jack, crew, ship);
        link(&pearl, &jack, crew, ship);

        assert_eq!(pearl.read(|s| s.crew.len()), 1);
        let parent = jack.read(|s| s.ship.as_ref().and_then(|r| r.loaded().cloned()));
        assert!(parent.unwrap().ptr_eq(&pearl));
    }

    #[test]
    fn test_unlink_keeps_reference_to_other_parent() {
        // GIVEN a sailor who already moved to another ship
        let pearl = EntityRef::new(Ship::default());
        let dutchman = EntityRef::new(Ship::default());
        let jack = EntityRef::new(Sailor::default());
        link(&pearl, &jack, crew, ship);
        link(&dutchman, &jack, crew, ship);

        // WHEN the old ship lets go of him
        unlink(&pearl, &jack, crew, ship);

        // THEN only the old collection changes
        assert!(pearl.read(|s| s.crew.is_empty()));
        assert!(jack.read(|s| s.ship.is_some()));

        unlink(&dutchman, &jack, crew, ship);
        assert!(jack.read(|s| s.ship.is_none()));
    }
}
