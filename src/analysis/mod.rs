//! # Graph Analysis
//!
//! Passes that inspect the ASG before it is executed.
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): propagates concrete
//!   shapes from the graph inputs to any set of nodes and reports mismatches
//!   (channel counts, broadcast failures, impossible reshapes).
//!
//! ```ignore
//! let shapes = HashMap::from([("X".to_string(), vec![8, 3, 32, 32])]);
//! let out = ShapeInference::output_shapes(&graph, &[scores.node_id], &shapes)?;
//! ```

pub mod shape_inference;
