//! Relations with a single member.

use super::{Candidate, Check, CheckContext, CheckError, CheckScratch, CheckSettings};
use crate::types::{EntityKind, Flag};

/// Flags relations that have exactly one member.
///
/// Relations are copied into every fragment they touch, so several tasks
/// may raise the same flag; the aggregator collapses them.
#[derive(Debug, Clone)]
pub struct OneMemberRelationCheck {
    settings: CheckSettings,
}

impl OneMemberRelationCheck {
    /// Registered name.
    pub const NAME: &'static str = "OneMemberRelation";

    /// Create the check.
    pub fn new(settings: CheckSettings) -> Self {
        Self { settings }
    }
}

impl Check for OneMemberRelationCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn valid_for_country(&self, country: &str) -> bool {
        self.settings.valid_for_country(country)
    }

    fn evaluate(
        &self,
        ctx: &CheckContext<'_>,
        candidate: Candidate<'_>,
        _scratch: &mut CheckScratch,
    ) -> Result<Option<Flag>, CheckError> {
        let Candidate::Entity(relation) = candidate else {
            return Ok(None);
        };
        if relation.id.kind != EntityKind::Relation || relation.members.len() != 1 {
            return Ok(None);
        }

        let member = relation.members[0];
        let mut flag = Flag::new(Self::NAME, relation.id.to_string())
            .with_object(relation)
            .with_instruction(format!("Relation {} contains only one member", relation.id));
        match ctx.graph.get(&member) {
            Some(entity) => {
                if let Some(anchor) = entity.anchor() {
                    flag = flag.with_point(anchor);
                }
            }
            None => {
                flag = flag.with_instruction(format!("Member {} is outside the loaded graph", member));
            }
        }
        Ok(Some(flag))
    }
}
