//! Spawn eligibility and placement

pub mod eligibility;
pub mod placement;

pub use eligibility::{SpawnBehaviorRegistry, SpawnPolicy, SpawnRejection};
pub use placement::{ActiveBody, PlacementError, PlacementRequest, PlacementSystem, SpawnCandidate};
