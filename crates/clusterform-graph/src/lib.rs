//! Clusterform Graph - Resource graph builder, planner, and plan rendering

pub mod builder;
pub mod graph;
pub mod outputs;
pub mod plan;
pub mod planner;

pub use builder::GraphBuilder;
pub use graph::{InstanceNode, OutputNode, ResourceGraph};
pub use outputs::{evaluate_outputs, OutputValue};
pub use plan::{Plan, PlanKind, PlanSummary, PlannedOp};
pub use planner::Planner;
