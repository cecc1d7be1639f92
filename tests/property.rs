//! Property-based tests using proptest
//!
//! These tests verify that the pipeline keeps its ordering and windowing
//! guarantees for randomly generated inputs.

use logfan::payload::default_levels;
use logfan::tail::LineSplitter;
use logfan::transform::{combine, create_formatter, create_modifier, TransformUnit, UnitKind};
use logfan::{DispatchConfig, MemorySink, Payload, Query, QueryOptions, QuerySource, SortOrder, Source, Transport};
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;

fn unit(index: usize, is_modifier: bool) -> TransformUnit {
    if is_modifier {
        create_modifier(format!("m{}", index), |p: Payload, _: &Value| Ok(p)).unit()
    } else {
        create_formatter(format!("f{}", index), |p: &Payload, _: &Value| Ok(p.message.clone())).unit()
    }
}

fn names(units: &[TransformUnit]) -> Vec<String> {
    units.iter().map(|u| u.name().to_string()).collect()
}

// Strategy for generating log levels from the default list
fn level_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(default_levels())
}

// Non-empty lines without line breaks, multi-byte characters included
fn line_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9é漢 {}:\"]{1,24}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Modifiers always run before formatters, each group in given order
    #[test]
    fn test_combine_partitions_units(kinds in prop::collection::vec(any::<bool>(), 0..16)) {
        let units: Vec<TransformUnit> = kinds.iter().enumerate().map(|(i, m)| unit(i, *m)).collect();
        let stack = combine(units.clone());

        let first_formatter = stack
            .units()
            .iter()
            .position(|u| u.kind() == UnitKind::Formatter)
            .unwrap_or(stack.len());
        prop_assert!(stack.units()[first_formatter..].iter().all(|u| u.kind() == UnitKind::Formatter));

        let expected: Vec<String> = units
            .iter()
            .filter(|u| u.kind() == UnitKind::Modifier)
            .chain(units.iter().filter(|u| u.kind() == UnitKind::Formatter))
            .map(|u| u.name().to_string())
            .collect();
        prop_assert_eq!(names(stack.units()), expected);
    }

    /// Combining an already combined stack changes nothing
    #[test]
    fn test_combine_is_idempotent(kinds in prop::collection::vec(any::<bool>(), 0..16)) {
        let units: Vec<TransformUnit> = kinds.iter().enumerate().map(|(i, m)| unit(i, *m)).collect();
        let once = combine(units);
        let twice = combine([&once]);
        prop_assert_eq!(names(once.units()), names(twice.units()));
    }

    /// Lines survive being cut at arbitrary byte offsets
    #[test]
    fn test_splitter_reassembles_lines(
        lines in prop::collection::vec(line_strategy(), 1..12),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let text: String = lines.iter().map(|l| format!("{}\n", l)).collect();
        let bytes = text.as_bytes();

        let mut offsets: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len())).collect();
        offsets.push(0);
        offsets.push(bytes.len());
        offsets.sort_unstable();
        offsets.dedup();

        let mut splitter = LineSplitter::new(Regex::new(r"\n+").unwrap(), 0);
        let mut seen = Vec::new();
        for pair in offsets.windows(2) {
            seen.extend(splitter.push(&bytes[pair[0]..pair[1]]));
        }
        prop_assert_eq!(splitter.flush(), None);
        prop_assert_eq!(seen, lines);
    }

    /// A transport takes a payload exactly when its level is at least as
    /// severe as the configured maximum
    #[test]
    fn test_level_filter_follows_severity(max in level_strategy(), level in level_strategy()) {
        let levels: Arc<[String]> = default_levels().into();
        let transport = Transport::builder("t").level(max.clone()).sink(MemorySink::new()).build().unwrap();
        let payload = Payload::new(Source::new(level.clone(), "m"), DispatchConfig::new("app", levels.clone()));

        let rank = |l: &str| levels.iter().position(|x| x == l).unwrap();
        prop_assert_eq!(transport.accept(&payload), rank(&level) <= rank(&max));
    }

    /// A descending query keeps the most recent `limit` rows in
    /// chronological order
    #[test]
    fn test_descending_window_keeps_latest(count in 0usize..40, limit in 1usize..12) {
        let now = chrono::Utc::now();
        let rows: Vec<Value> = (0..count)
            .map(|i| json!({
                "seq": i,
                "timestamp": (now - chrono::Duration::seconds((count - i) as i64)).to_rfc3339(),
            }))
            .collect();

        let report = tokio_test::block_on(async {
            let mut query = Query::new(QueryOptions { limit, sort: SortOrder::Desc, ..Default::default() });
            query.exec(vec![("rows".to_string(), Some(QuerySource::Rows(rows)))]).await;
            query.into_report()
        });

        let seqs: Vec<usize> = report.rows.iter().filter_map(|r| r["seq"].as_u64()).map(|s| s as usize).collect();
        let expected: Vec<usize> = (count.saturating_sub(limit)..count).collect();
        prop_assert_eq!(seqs, expected);
    }
}
