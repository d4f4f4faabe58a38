//! Node classification against the per-app latency thresholds.

/// The class a (app, user, node) sample falls into. A node is in exactly
/// one class at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    /// Above the hard bound, unusable for this user.
    Invalid,
    /// Within the hard bound but not soft-valid.
    HardValid,
    /// Within the soft bound, preferred.
    SoftValid,
}

/// Classify a latency sample. `None` when no threshold is registered for
/// the app, in which case the sample cannot be judged on either axis.
pub fn classify(hard: Option<i64>, soft: Option<i64>, latency: i64) -> Option<NodeClass> {
    match (hard, soft) {
        (Some(hard), Some(soft)) => Some(if latency > hard {
            NodeClass::Invalid
        } else if latency <= soft {
            NodeClass::SoftValid
        } else {
            NodeClass::HardValid
        }),
        (Some(hard), None) => Some(if latency > hard {
            NodeClass::Invalid
        } else {
            NodeClass::HardValid
        }),
        (None, Some(soft)) => Some(if latency <= soft {
            NodeClass::SoftValid
        } else {
            NodeClass::HardValid
        }),
        (None, None) => None,
    }
}

/// Split the hard-only nodes of one (app, user) into eviction victims and
/// survivors.
///
/// `sorted` must be ordered worst-first (highest latency, oldest sample
/// first on ties) and `n_tot` is the schedulable node count. The worst
/// hard-only node is evicted while
/// `n_soft + (n_hard - 1) >= n_tot / 2`
/// still holds afterwards, i.e. while at least half the cluster would stay
/// in the candidate pool. The second element names the first protected
/// node, whose association must be restored in case eviction removed it.
pub fn soft_condition_victims(
    sorted: &[String],
    n_soft: usize,
    n_tot: usize,
) -> (Vec<String>, Option<String>) {
    let mut victims = Vec::new();
    let mut n_hard = sorted.len();

    for node in sorted {
        if n_soft + (n_hard - 1) < n_tot / 2 {
            return (victims, Some(node.clone()));
        }
        victims.push(node.clone());
        n_hard -= 1;
    }

    (victims, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_with_both_thresholds() {
        let hard = Some(100);
        let soft = Some(40);
        assert_eq!(classify(hard, soft, 20), Some(NodeClass::SoftValid));
        assert_eq!(classify(hard, soft, 40), Some(NodeClass::SoftValid));
        assert_eq!(classify(hard, soft, 60), Some(NodeClass::HardValid));
        assert_eq!(classify(hard, soft, 100), Some(NodeClass::HardValid));
        assert_eq!(classify(hard, soft, 101), Some(NodeClass::Invalid));
    }

    #[test]
    fn test_classify_hard_only() {
        assert_eq!(classify(Some(50), None, 30), Some(NodeClass::HardValid));
        assert_eq!(classify(Some(50), None, 70), Some(NodeClass::Invalid));
    }

    #[test]
    fn test_classify_soft_only_never_invalid() {
        assert_eq!(classify(None, Some(40), 20), Some(NodeClass::SoftValid));
        assert_eq!(classify(None, Some(40), 90), Some(NodeClass::HardValid));
    }

    #[test]
    fn test_classify_without_thresholds() {
        assert_eq!(classify(None, None, 10), None);
    }

    #[test]
    fn test_soft_condition_majority_scenario() {
        // Four schedulable nodes, two soft-valid, hard-only n4(90) and
        // n3(60): both hard-only nodes get evicted before the pool would
        // drop below half the cluster.
        let sorted = vec!["n4".to_string(), "n3".to_string()];
        let (victims, protected) = soft_condition_victims(&sorted, 2, 4);
        assert_eq!(victims, vec!["n4", "n3"]);
        assert_eq!(protected, None);
    }

    #[test]
    fn test_soft_condition_protects_last_candidates() {
        // One soft-valid node out of six: evicting more than one hard-only
        // node would leave fewer than three candidates.
        let sorted = vec!["n5".to_string(), "n4".to_string(), "n3".to_string()];
        let (victims, protected) = soft_condition_victims(&sorted, 1, 6);
        assert_eq!(victims, vec!["n5"]);
        assert_eq!(protected, Some("n4".to_string()));
    }

    #[test]
    fn test_soft_condition_stops_immediately_when_pool_is_thin() {
        let sorted = vec!["n2".to_string()];
        let (victims, protected) = soft_condition_victims(&sorted, 0, 4);
        assert!(victims.is_empty());
        assert_eq!(protected, Some("n2".to_string()));
    }

    #[test]
    fn test_soft_condition_eviction_bound() {
        // At most n_soft + n_hard - n_tot / 2 evictions, whatever the input.
        for n_tot in 0..8usize {
            for n_soft in 0..5usize {
                for n_hard in 0..5usize {
                    let sorted: Vec<String> = (0..n_hard).map(|i| format!("n{i}")).collect();
                    let (victims, _) = soft_condition_victims(&sorted, n_soft, n_tot);
                    let bound = (n_hard + n_soft).saturating_sub(n_tot / 2);
                    assert!(victims.len() <= bound.min(n_hard));
                }
            }
        }
    }
}
