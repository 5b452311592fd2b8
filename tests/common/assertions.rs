// Assertion helpers for cluster integration tests

use strata_raft::NodeId;

/// Poll a condition until it holds or the timeout (in milliseconds) elapses.
#[macro_export]
macro_rules! assert_eventually {
    ($cond:expr, $timeout_ms:expr) => {
        assert_eventually!(@ $cond, $timeout_ms, 20)
    };
    (@ $cond:expr, $timeout_ms:expr, $interval_ms:expr) => {{
        let start = std::time::Instant::now();
        let timeout = std::time::Duration::from_millis($timeout_ms);
        let interval = std::time::Duration::from_millis($interval_ms);

        while start.elapsed() < timeout {
            if $cond {
                break;
            }
            tokio::time::sleep(interval).await;
        }

        assert!(
            $cond,
            "Condition did not become true within {:?}",
            timeout
        );
    }};
}

/// Check that every node applied a prefix of the longest history.
///
/// Nodes may lag, but no two nodes may disagree on what was applied at the
/// same position.
pub fn assert_histories_agree(histories: &[(NodeId, Vec<Vec<u8>>)]) {
    let Some((longest_node, longest)) = histories.iter().max_by_key(|(_, h)| h.len()) else {
        return;
    };
    for (node, history) in histories {
        for (position, command) in history.iter().enumerate() {
            assert_eq!(
                command, &longest[position],
                "Node {} and node {} applied different commands at position {}",
                node, longest_node, position
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes_agree() {
        assert_histories_agree(&[
            (1, vec![b"a".to_vec(), b"b".to_vec()]),
            (2, vec![b"a".to_vec()]),
            (3, vec![]),
        ]);
    }

    #[test]
    #[should_panic(expected = "applied different commands")]
    fn test_divergence_detected() {
        assert_histories_agree(&[
            (1, vec![b"a".to_vec(), b"b".to_vec()]),
            (2, vec![b"a".to_vec(), b"c".to_vec()]),
        ]);
    }
}
