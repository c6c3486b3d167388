//! Route planning: the generic graph and the planner built on it.

pub mod graph;
mod planner;

pub use planner::{EdgeKey, Route, RoutePlanner, RoutingElement, TransitionEdge};
