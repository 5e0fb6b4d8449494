//! Property tests: similarity symmetry and the cluster partition invariant.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;

use insight_engine::types::{ClusterQuery, ErrorData};
use insight_engine::{ClusterEngine, ClusteringAlgorithm, ClusteringConfig, ManualClock, SimilarityCalculator};

const TYPES: &[&str] = &["TypeError", "NetworkError", "SyntaxError", ""];
const WORDS: &[&str] = &[
  "cannot", "read", "property", "of", "undefined", "null", "network", "timeout", "invalid", "json",
];
const FILES: &[&str] = &["app.js", "vendor.min.js", "handler.ts"];

fn word() -> impl Strategy<Value = &'static str> {
  prop::sample::select(WORDS)
}

prop_compose! {
  fn error_data(id: String)(
    ty in prop::sample::select(TYPES),
    message in prop::collection::vec(word(), 0..6),
    frames in prop::option::of(prop::collection::vec((word(), prop::sample::select(FILES), 1u32..200), 1..5)),
    filename in prop::option::of(prop::sample::select(FILES)),
    lineno in prop::option::of(1u32..500),
    context in prop::option::of(prop::collection::btree_map(word(), 0i64..3, 0..4)),
    offset in 0i64..10_000,
  ) -> ErrorData {
    let mut error = ErrorData::new(id.clone(), ty, message.join(" "), 1_700_000_000_000 + offset);
    error.stack_trace = frames.map(|frames| {
      frames
        .iter()
        .map(|(f, file, line)| format!("    at {f} ({file}:{line}:1)"))
        .collect::<Vec<_>>()
        .join("\n")
    });
    error.filename = filename.map(str::to_string);
    error.lineno = lineno;
    error.context = context.map(|ctx| {
      ctx
        .into_iter()
        .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
        .collect::<BTreeMap<_, _>>()
    });
    error
  }
}

#[derive(Debug, Clone)]
enum Op {
  Add(ErrorData),
  MergeFirstTwo,
  Recluster,
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
  prop::collection::vec(
    prop_oneof![
      6 => (0usize..12).prop_flat_map(|i| error_data(format!("e{i}"))).prop_map(Op::Add),
      1 => Just(Op::MergeFirstTwo),
      1 => Just(Op::Recluster),
    ],
    1..30,
  )
}

fn algorithm() -> impl Strategy<Value = ClusteringAlgorithm> {
  prop::sample::select(vec![
    ClusteringAlgorithm::Adaptive,
    ClusteringAlgorithm::Kmeans,
    ClusteringAlgorithm::Dbscan,
    ClusteringAlgorithm::Hierarchical,
  ])
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(48))]

  #[test]
  fn similarity_is_symmetric(a in error_data("a".into()), b in error_data("b".into())) {
    let calc = SimilarityCalculator::default();
    let ab = calc.calculate(&a, &b);
    let ba = calc.calculate(&b, &a);
    prop_assert_eq!(ab.overall, ba.overall);
    prop_assert_eq!(ab.confidence, ba.confidence);
    prop_assert!((0.0..=1.0).contains(&ab.overall));
  }

  #[test]
  fn every_error_lives_in_exactly_one_cluster(sequence in ops(), chosen in algorithm()) {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let config = ClusteringConfig {
      algorithm: chosen,
      auto_recluster: false,
      ..ClusteringConfig::default()
    };
    let engine = ClusterEngine::with_clock(config, Arc::new(ManualClock::new(1_700_000_000_000)));
    let mut added: HashSet<String> = HashSet::new();

    for op in sequence {
      match op {
        Op::Add(error) => {
          let id = error.id.clone();
          let cluster = engine.add_error(error);
          prop_assert!(cluster.contains(&id));
          added.insert(id);
        }
        Op::MergeFirstTwo => {
          let clusters = engine.get_clusters(&ClusterQuery::default());
          if clusters.len() >= 2 {
            engine.merge_clusters(&clusters[0].id, &clusters[1].id).unwrap();
          }
        }
        Op::Recluster => {
          runtime.block_on(engine.perform_reclustering()).unwrap();
        }
      }
    }

    let clusters = engine.get_clusters(&ClusterQuery::default());
    let mut seen: HashSet<String> = HashSet::new();
    for cluster in &clusters {
      for error in &cluster.errors {
        prop_assert!(seen.insert(error.id.clone()), "{} in two clusters", error.id);
      }
    }
    prop_assert_eq!(&seen, &added);
    for id in &added {
      let owner = engine.cluster_for_error(id).unwrap();
      prop_assert!(owner.contains(id));
    }
    prop_assert_eq!(engine.statistics().total_errors, added.len());
  }
}
