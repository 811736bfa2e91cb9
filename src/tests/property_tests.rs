//! Property-based tests: randomized inputs against the parser, the
//! enricher and the correlation window store.

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::detect::expr;
use crate::enrich::{Enricher, PodIndex, PodRecord, PodSnapshot};
use crate::store::{CorrelationStore, MemoryCorrelationStore};
use crate::tests::fixtures::EventBuilder;

proptest! {
    #[test]
    fn condition_compile_never_panics(input in "\\PC*") {
        let _ = expr::compile(&input);
    }

    #[test]
    fn condition_compile_never_panics_on_expression_shaped_input(
        input in "[a-z_.()\\[\\]'&|=! ]{0,80}"
    ) {
        let _ = expr::compile(&input);
    }

    #[test]
    fn compiled_conditions_evaluate_without_panicking(
        field in prop::sample::select(vec!["exe", "cmdline", "cwd"]),
        value in "[a-z/]{0,20}"
    ) {
        let condition = format!("event.process.{} == '{}'", field, value);
        let program = expr::compile(&condition).unwrap();
        let event = EventBuilder::new("e1").exe("/bin/bash").build();
        let _ = expr::evaluate(&program, &event);
    }
}

proptest! {
    #[test]
    fn enrichment_is_idempotent(hex in "[0-9a-f]{16,64}", pod in "[a-z][a-z0-9-]{0,20}") {
        let container_id = format!("containerd://{}", hex);
        let index = Arc::new(PodIndex::new(Duration::from_secs(300)));
        index.upsert(&PodSnapshot {
            container_ids: vec![container_id.clone()],
            record: PodRecord {
                pod: pod.clone(),
                namespace: "prod".to_string(),
                service_account: "default".to_string(),
                labels: HashMap::new(),
            },
        });
        let enricher = Enricher::new(index);

        let event = EventBuilder::new("e1").container(&container_id).build();
        let once = enricher.enrich(event);
        let twice = enricher.enrich(once.clone());
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(once.container.as_ref().unwrap().pod.clone(), pod);
    }
}

proptest! {
    #[test]
    fn window_range_never_returns_members_outside_bounds(
        scores in prop::collection::vec(0i64..1000, 1..40),
        min in 0i64..1000,
        span in 0i64..1000
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let store = MemoryCorrelationStore::new();
            let ttl = Duration::from_secs(600);
            for (i, score) in scores.iter().enumerate() {
                store
                    .window_add("k", *score, format!("m{}:{}", i, score), ttl)
                    .await
                    .unwrap();
            }
            let max = min + span;
            let members = store.window_range("k", min, max).await.unwrap();
            for member in members {
                let score: i64 = member.rsplit(':').next().unwrap().parse().unwrap();
                assert!(score >= min && score <= max);
            }
        });
    }
}
