//! Points stacked on the same location.

use std::collections::BTreeMap;

use super::{
    Candidate, Check, CheckContext, CheckError, CheckScratch, CheckSettings, ComplexEntity,
    ComplexFinder,
};
use crate::graph::AssembledGraph;
use crate::types::{EntityKind, Flag};

/// Groups points sharing a location (after 1e-7 degree snapping).
#[derive(Debug, Clone, Copy)]
pub struct DuplicatePointFinder {
    min_points: usize,
}

impl ComplexFinder for DuplicatePointFinder {
    fn find(&self, graph: &AssembledGraph) -> Vec<ComplexEntity> {
        let mut by_location: BTreeMap<(i64, i64), Vec<_>> = BTreeMap::new();
        for point in graph.entities_of(EntityKind::Point) {
            if let Some(anchor) = point.anchor() {
                by_location.entry(anchor.grid_key()).or_default().push(point);
            }
        }
        by_location
            .into_values()
            .filter(|points| points.len() >= self.min_points)
            .filter_map(|points| {
                let anchor = points[0].anchor()?.quantized();
                let label = format!("points@{}", anchor);
                Some(ComplexEntity::new(label, points.iter().map(|p| p.id)).at(anchor))
            })
            .collect()
    }
}

/// Flags sets of points sharing a location.
#[derive(Debug, Clone)]
pub struct DuplicatePointLocationCheck {
    settings: CheckSettings,
    finder: DuplicatePointFinder,
}

impl DuplicatePointLocationCheck {
    /// Registered name.
    pub const NAME: &'static str = "DuplicatePointLocation";

    /// Create the check. Option `min_points` (default 2) sets the group size.
    pub fn new(settings: CheckSettings) -> Result<Self, CheckError> {
        let min_points = settings.option_u64(Self::NAME, "min_points", 2)?;
        if min_points < 2 {
            return Err(CheckError::InvalidSettings {
                check: Self::NAME.to_string(),
                message: format!("min_points must be at least 2, got {}", min_points),
            });
        }
        Ok(Self {
            settings,
            finder: DuplicatePointFinder {
                min_points: min_points as usize,
            },
        })
    }
}

impl Check for DuplicatePointLocationCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn valid_for_country(&self, country: &str) -> bool {
        self.settings.valid_for_country(country)
    }

    fn finder(&self) -> Option<&dyn ComplexFinder> {
        Some(&self.finder)
    }

    fn evaluate(
        &self,
        ctx: &CheckContext<'_>,
        candidate: Candidate<'_>,
        scratch: &mut CheckScratch,
    ) -> Result<Option<Flag>, CheckError> {
        let Candidate::Complex(cluster) = candidate else {
            return Ok(None);
        };
        // A point belongs to one cluster; skip clusters already reported.
        let fresh = cluster
            .members
            .iter()
            .fold(false, |fresh, id| scratch.mark(*id) || fresh);
        if !fresh {
            return Ok(None);
        }

        let points: Vec<_> = cluster
            .members
            .iter()
            .filter_map(|id| ctx.graph.get(id))
            .collect();
        if points.len() < self.finder.min_points {
            return Err(CheckError::Evaluation {
                check: Self::NAME.to_string(),
                candidate: cluster.label.clone(),
                message: "cluster member missing from graph".to_string(),
            });
        }

        let mut flag = Flag::new(Self::NAME, cluster.label.clone())
            .with_objects(points)
            .with_instruction(format!("{} points share one location", cluster.members.len()));
        if let Some(location) = cluster.location {
            flag = flag.with_point(location);
        }
        Ok(Some(flag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::testing::graph;
    use crate::types::{Entity, EntityId, Location};

    #[test]
    fn test_finder_groups_stacked_points() {
        let p = Location::new(0.1, 0.1);
        let graph = graph(vec![
            Entity::point(1, p),
            Entity::point(2, Location::new(0.100_000_001, 0.1)),
            Entity::point(3, Location::new(0.2, 0.2)),
        ]);
        let check = DuplicatePointLocationCheck::new(CheckSettings::default()).unwrap();
        let clusters = check.finder().unwrap().find(&graph);

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, vec![EntityId::point(1), EntityId::point(2)]);
    }

    #[test]
    fn test_cluster_flagged_once_until_reset() {
        let p = Location::new(0.1, 0.1);
        let graph = graph(vec![Entity::point(1, p), Entity::point(2, p)]);
        let ctx = CheckContext { country: "XYZ", graph: &graph };
        let check = DuplicatePointLocationCheck::new(CheckSettings::default()).unwrap();
        let cluster = check.finder().unwrap().find(&graph).remove(0);
        let mut scratch = CheckScratch::default();

        let flag = check.evaluate(&ctx, Candidate::Complex(&cluster), &mut scratch).unwrap();
        assert_eq!(flag.unwrap().objects.len(), 2);
        assert!(check.evaluate(&ctx, Candidate::Complex(&cluster), &mut scratch).unwrap().is_none());

        check.reset(&mut scratch);
        assert!(check.evaluate(&ctx, Candidate::Complex(&cluster), &mut scratch).unwrap().is_some());
    }

    #[test]
    fn test_rejects_small_groups() {
        let mut settings = CheckSettings::default();
        settings.options.insert("min_points".into(), serde_json::json!(1));
        assert!(DuplicatePointLocationCheck::new(settings).is_err());
    }
}
