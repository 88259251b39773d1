//! Integration tests for the storyboard batch orchestrator

mod api_surface;
mod batch_lifecycle;
mod cancellation;
mod dispatch_order;
mod failure_handling;
mod properties;
mod test_utils;
