//! Aggregation of per-target results into the post's terminal status.

use chrono::Utc;

use crier_store::{TargetResult, TargetStatus, TerminalUpdate};

/// Terminal update for a post plus its counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub update: TerminalUpdate,
    pub succeeded: usize,
    pub failed: usize,
}

/// Fold terminal per-target results, given in target-set order.
///
/// Any success publishes the post, taking `published_at` and `external_ref` from
/// the first successful target. Otherwise the post fails with every target's
/// detail labeled by target.
pub fn aggregate(results: &[TargetResult]) -> Aggregate {
    let succeeded = results
        .iter()
        .filter(|r| r.status == TargetStatus::Published)
        .count();
    let failed = results.len() - succeeded;

    let update = match results.iter().find(|r| r.status == TargetStatus::Published) {
        Some(first) => TerminalUpdate::published(
            first.published_at.unwrap_or_else(Utc::now),
            first.external_ref.clone(),
        ),
        None => TerminalUpdate::failed(failure_reason(results)),
    };

    Aggregate {
        update,
        succeeded,
        failed,
    }
}

fn failure_reason(results: &[TargetResult]) -> String {
    if results.is_empty() {
        return "no targets published".to_string();
    }
    results
        .iter()
        .map(|r| {
            format!(
                "{}: {}",
                r.target,
                r.failure_detail.as_deref().unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crier_store::{Content, PostStatus};

    fn ok(target: &str, ext: &str, minutes: i64) -> TargetResult {
        TargetResult::pending("p1", target, Content::text("t"))
            .published(ext.to_string(), Utc::now() + Duration::minutes(minutes))
    }

    fn err(target: &str, detail: &str) -> TargetResult {
        TargetResult::pending("p1", target, Content::text("t")).failed(detail.to_string())
    }

    #[test]
    fn partial_success_publishes() {
        let results = vec![err("x", "HTTP 500: down"), ok("y", "y-1", 0)];
        let agg = aggregate(&results);
        assert_eq!(agg.update.status, PostStatus::Published);
        assert_eq!(agg.update.external_ref.as_deref(), Some("y-1"));
        assert_eq!((agg.succeeded, agg.failed), (1, 1));
    }

    #[test]
    fn first_success_by_target_order_wins() {
        // later target finished earlier in wall time
        let results = vec![ok("x", "x-1", 5), ok("y", "y-1", 0)];
        let agg = aggregate(&results);
        assert_eq!(agg.update.external_ref.as_deref(), Some("x-1"));
        assert_eq!(agg.update.published_at, results[0].published_at);
    }

    #[test]
    fn total_failure_labels_each_target() {
        let results = vec![err("x", "HTTP 400: bad"), err("y", "[timeout]: slow")];
        let agg = aggregate(&results);
        assert_eq!(agg.update.status, PostStatus::Failed);
        assert_eq!(
            agg.update.failure_reason.as_deref(),
            Some("x: HTTP 400: bad; y: [timeout]: slow")
        );
        assert_eq!(agg.update.published_at, None);
    }

    proptest! {
        #[test]
        fn published_iff_any_target_succeeded(outcomes in prop::collection::vec(any::<bool>(), 1..8)) {
            let results: Vec<_> = outcomes
                .iter()
                .enumerate()
                .map(|(i, ok_)| {
                    let target = format!("t{}", i);
                    if *ok_ { ok(&target, &format!("ext-{}", i), 0) } else { err(&target, "boom") }
                })
                .collect();

            let agg = aggregate(&results);
            let any_ok = outcomes.iter().any(|o| *o);
            prop_assert_eq!(agg.update.status == PostStatus::Published, any_ok);
            prop_assert_eq!(agg.succeeded + agg.failed, outcomes.len());

            if let Some(first) = outcomes.iter().position(|o| *o) {
                let expected = format!("ext-{}", first);
                prop_assert_eq!(agg.update.external_ref.as_deref(), Some(expected.as_str()));
            } else {
                let reason = agg.update.failure_reason.unwrap_or_default();
                for i in 0..outcomes.len() {
                    let label = format!("t{}: boom", i);
                    prop_assert!(reason.contains(&label));
                }
            }
        }
    }
}
