//! Quorum arithmetic shared by the candidate and leader roles.

/// The number of affirmative votes needed to win an election (or commit an
/// entry) in a cluster of `cluster_size` nodes: strictly more than half.
pub fn majority_of(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// The highest log index known to be replicated to a quorum, given each
/// node's `next_index` (the index it will next be sent, i.e. one past the
/// highest index the leader believes it holds).
///
/// Sorts the `next_index` values and takes the lower median
/// (`sorted[floor((n - 1) / 2)]`), then subtracts one to turn "next index to
/// send" into "highest index confirmed held". For an odd cluster size this
/// coincides with the plain median; for an even size the lower median is
/// the one backed by a strict majority (`n/2 + 1` nodes) — the upper median
/// (`sorted[n/2]`) would only require `n/2` nodes to have advanced that far.
pub fn quorum_commit_index(next_index: &[u64]) -> u64 {
    if next_index.is_empty() {
        return 0;
    }
    let mut sorted = next_index.to_vec();
    sorted.sort_unstable();
    let lower_median = sorted[(sorted.len() - 1) / 2];
    lower_median.saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_of_odd_and_even() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(5), 3);
        assert_eq!(majority_of(4), 3);
    }

    #[test]
    fn quorum_commit_index_odd_cluster() {
        // three nodes, next_index values 5, 5, 3 -> two nodes hold index 4.
        assert_eq!(quorum_commit_index(&[5, 5, 3]), 4);
    }

    #[test]
    fn quorum_commit_index_even_cluster_uses_lower_median() {
        // four nodes, next_index values 10, 10, 3, 3 -> the upper median
        // (sorted[2]=10) would claim index 9 committed on just two
        // confirmations. The lower median (sorted[1]=3) is the one backed
        // by a strict majority of three nodes, yielding index 2.
        assert_eq!(quorum_commit_index(&[10, 10, 3, 3]), 2);
    }

    #[test]
    fn quorum_commit_index_empty_is_zero() {
        assert_eq!(quorum_commit_index(&[]), 0);
    }
}
