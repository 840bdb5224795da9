//! Edges that share no endpoint with any other edge.

use super::{Candidate, Check, CheckContext, CheckError, CheckScratch, CheckSettings};
use crate::types::{EntityKind, Flag};

/// Flags edges with no connected neighbor.
///
/// Only meaningful when the graph around the edge is complete, which is
/// why the loader expands each task past its shard border.
#[derive(Debug, Clone)]
pub struct OrphanEdgeCheck {
    settings: CheckSettings,
}

impl OrphanEdgeCheck {
    /// Registered name.
    pub const NAME: &'static str = "OrphanEdge";

    /// Create the check.
    pub fn new(settings: CheckSettings) -> Self {
        Self { settings }
    }
}

impl Check for OrphanEdgeCheck {
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
        let Candidate::Entity(edge) = candidate else {
            return Ok(None);
        };
        if edge.id.kind != EntityKind::Edge {
            return Ok(None);
        }
        if !ctx.graph.connected_edges(edge).is_empty() {
            return Ok(None);
        }
        Ok(Some(
            Flag::new(Self::NAME, edge.id.to_string())
                .with_object(edge)
                .with_instruction(format!("Edge {} is not connected to any other edge", edge.id)),
        ))
    }
}
