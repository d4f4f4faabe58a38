//! Node scoring on allocatable capacity
//!
//! A node's score is its allocatable CPU in cores plus its allocatable
//! memory in MiB; the exploration strategy always binds to the best-scoring
//! node not yet visited for the app.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Node;

/// Label marking nodes the scheduler must never use.
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Pick the highest-scoring schedulable node not yet visited, by name.
/// Ties keep the first node in listing order.
pub fn best_node(nodes: &[Node], visited: &HashSet<String>) -> Option<String> {
    let mut best: Option<(&str, f64)> = None;

    for node in nodes {
        let Some(name) = node.metadata.name.as_deref() else {
            continue;
        };
        let is_control_plane = node
            .metadata
            .labels
            .as_ref()
            .is_some_and(|labels| labels.contains_key(CONTROL_PLANE_LABEL));
        if is_control_plane || visited.contains(name) {
            continue;
        }

        let score = node_score(node);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((name, score)),
        }
    }

    best.map(|(name, _)| name.to_string())
}

/// cpu cores + memory MiB, weighted 1:1.
pub fn node_score(node: &Node) -> f64 {
    let allocatable = node.status.as_ref().and_then(|status| status.allocatable.as_ref());

    let cpu = allocatable
        .and_then(|resources| resources.get("cpu"))
        .map(|quantity| parse_cpu_cores(&quantity.0))
        .unwrap_or(0.0);
    let memory = allocatable
        .and_then(|resources| resources.get("memory"))
        .map(|quantity| parse_memory_mib(&quantity.0))
        .unwrap_or(0.0);

    cpu + memory
}

/// Parse a CPU quantity: plain cores ("4") or millicores ("3500m").
fn parse_cpu_cores(quantity: &str) -> f64 {
    match quantity.strip_suffix('m') {
        Some(milli) => milli.parse::<f64>().map(|v| v / 1000.0).unwrap_or(0.0),
        None => quantity.parse::<f64>().unwrap_or(0.0),
    }
}

/// Parse a memory quantity into MiB.
fn parse_memory_mib(quantity: &str) -> f64 {
    parse_quantity_bytes(quantity) / (1024.0 * 1024.0)
}

fn parse_quantity_bytes(quantity: &str) -> f64 {
    const SUFFIXES: [(&str, f64); 12] = [
        ("Ki", 1024.0),
        ("Mi", 1048576.0),
        ("Gi", 1073741824.0),
        ("Ti", 1099511627776.0),
        ("Pi", 1125899906842624.0),
        ("Ei", 1152921504606846976.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    for (suffix, factor) in SUFFIXES {
        if let Some(value) = quantity.strip_suffix(suffix) {
            return value.parse::<f64>().map(|v| v * factor).unwrap_or(0.0);
        }
    }
    quantity.parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn node(name: &str, cpu: &str, memory: &str) -> Node {
        let mut allocatable = BTreeMap::new();
        allocatable.insert("cpu".to_string(), Quantity(cpu.to_string()));
        allocatable.insert("memory".to_string(), Quantity(memory.to_string()));
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                allocatable: Some(allocatable),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn control_plane(name: &str) -> Node {
        let mut n = node(name, "16", "64Gi");
        n.metadata.labels = Some(
            [(CONTROL_PLANE_LABEL.to_string(), "".to_string())]
                .into_iter()
                .collect(),
        );
        n
    }

    #[test]
    fn test_cpu_parsing() {
        assert_eq!(parse_cpu_cores("4"), 4.0);
        assert_eq!(parse_cpu_cores("3500m"), 3.5);
        assert_eq!(parse_cpu_cores("garbage"), 0.0);
    }

    #[test]
    fn test_memory_parsing() {
        assert_eq!(parse_memory_mib("1048576"), 1.0);
        assert_eq!(parse_memory_mib("2048Ki"), 2.0);
        assert_eq!(parse_memory_mib("512Mi"), 512.0);
        assert_eq!(parse_memory_mib("2Gi"), 2048.0);
        assert!((parse_memory_mib("1M") - 0.95367431640625).abs() < 1e-9);
    }

    #[test]
    fn test_best_node_prefers_highest_score() {
        let nodes = vec![node("small", "2", "2Gi"), node("big", "8", "16Gi")];
        let chosen = best_node(&nodes, &HashSet::new());
        assert_eq!(chosen, Some("big".to_string()));
    }

    #[test]
    fn test_best_node_skips_control_plane_and_visited() {
        let nodes = vec![
            control_plane("master"),
            node("w1", "4", "8Gi"),
            node("w2", "4", "4Gi"),
        ];
        let mut visited = HashSet::new();
        visited.insert("w1".to_string());

        assert_eq!(best_node(&nodes, &visited), Some("w2".to_string()));

        visited.insert("w2".to_string());
        assert_eq!(best_node(&nodes, &visited), None);
    }

    #[test]
    fn test_best_node_tie_keeps_listing_order() {
        let nodes = vec![node("first", "4", "8Gi"), node("second", "4", "8Gi")];
        assert_eq!(best_node(&nodes, &HashSet::new()), Some("first".to_string()));
    }

    #[test]
    fn test_exploration_cycle_over_three_nodes() {
        // Scores 10, 8, 8: the cycle must visit the top node first, then the
        // remaining two in listing order, then start over after a reset.
        let nodes = vec![
            node("n1", "10", "0"),
            node("n2", "8", "0"),
            node("n3", "8", "0"),
        ];
        let mut visited = HashSet::new();

        for expected in ["n1", "n2", "n3"] {
            let chosen = best_node(&nodes, &visited).unwrap();
            assert_eq!(chosen, expected);
            visited.insert(chosen);
        }

        assert_eq!(best_node(&nodes, &visited), None);
        visited.clear();
        assert_eq!(best_node(&nodes, &visited), Some("n1".to_string()));
    }
}
