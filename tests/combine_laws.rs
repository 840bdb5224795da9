//! Algebraic properties of `FlagContainer::combine`.
//!
//! Every shard's container is folded into the country result in whatever
//! order tasks finish, so combine must be associative and commutative and
//! must keep one canonical representative per identity.

use proptest::prelude::*;
use sharded_checks::{Entity, Flag, FlagContainer, Location};

const CHECKS: [&str; 3] = ["OrphanEdge", "OneMemberRelation", "DuplicatePointLocation"];

fn arb_flag() -> impl Strategy<Value = Flag> {
    (0usize..3, 0i64..6, 0u8..3, -10i32..10).prop_map(|(check, id, note, offset)| {
        let check = CHECKS[check];
        let location = Location::new(1.0 + offset as f64 * 1e-4, 2.0);
        Flag::new(check, id.to_string())
            .with_object(&Entity::point(id, location))
            .with_instruction(format!("note {}", note))
    })
}

fn container(flags: &[Flag]) -> FlagContainer {
    let mut container = FlagContainer::new();
    for flag in flags {
        container.add(&flag.check_name, flag);
    }
    container
}

proptest! {
    #[test]
    fn combine_is_commutative(
        a in prop::collection::vec(arb_flag(), 0..12),
        b in prop::collection::vec(arb_flag(), 0..12),
    ) {
        let ab = container(&a).combine(container(&b));
        let ba = container(&b).combine(container(&a));
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn combine_is_associative(
        a in prop::collection::vec(arb_flag(), 0..8),
        b in prop::collection::vec(arb_flag(), 0..8),
        c in prop::collection::vec(arb_flag(), 0..8),
    ) {
        let left = container(&a).combine(container(&b)).combine(container(&c));
        let right = container(&a).combine(container(&b).combine(container(&c)));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn combine_matches_single_container(
        a in prop::collection::vec(arb_flag(), 0..12),
        b in prop::collection::vec(arb_flag(), 0..12),
    ) {
        let all: Vec<Flag> = a.iter().chain(b.iter()).cloned().collect();
        let combined = container(&a).combine(container(&b));
        prop_assert_eq!(combined.fingerprint(), container(&all).fingerprint());
        prop_assert!(combined.len() <= all.len());
    }

    #[test]
    fn reconstructed_events_roundtrip(a in prop::collection::vec(arb_flag(), 0..12)) {
        let original = container(&a);
        let mut rebuilt = FlagContainer::new();
        for event in original.reconstruct_events() {
            if let sharded_checks::CheckEvent::FlagProduced { check_name, flag } = event {
                rebuilt.add(&check_name, &flag);
            }
        }
        prop_assert_eq!(rebuilt, original);
    }
}

#[test]
fn duplicate_identity_keeps_one_flag() {
    let entity = Entity::point(1, Location::new(1.0, 2.0));
    let first = Flag::new("OrphanEdge", "1")
        .with_object(&entity)
        .with_instruction("seen from shard A");
    let second = Flag::new("OrphanEdge", "1")
        .with_object(&entity)
        .with_instruction("seen from shard B");

    let ab = container(&[first.clone()]).combine(container(&[second.clone()]));
    let ba = container(&[second]).combine(container(&[first]));
    assert_eq!(ab.len(), 1);
    assert_eq!(ab, ba);
}
