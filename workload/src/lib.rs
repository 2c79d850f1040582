//! MapReduce applications, resolved by name on every member.

use common::Workload;

pub mod grep;
pub mod vertex_degree;
pub mod wc;

/// Names accepted by [`try_named`].
pub const NAMES: &[&str] = &["wc", "vertex-degree", "grep"];

pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "wc" => Some(Workload {
            map_fn: wc::map,
            combine_fn: Some(wc::reduce),
            reduce_fn: Some(wc::reduce),
        }),
        "vertex-degree" => Some(Workload {
            map_fn: vertex_degree::map,
            combine_fn: Some(vertex_degree::reduce),
            reduce_fn: Some(vertex_degree::reduce),
        }),
        "grep" => Some(Workload {
            map_fn: grep::map,
            combine_fn: None,
            reduce_fn: None,
        }),
        _ => None,
    }
}
