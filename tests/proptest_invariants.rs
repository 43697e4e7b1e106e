use std::collections::{BTreeSet, HashMap, HashSet};

use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

use rankeval::data::{Interaction, Interactions};
use rankeval::evaluation::{Metric, MetricEngine, MetricSpec};
use rankeval::recommendations::{RecommendationList, Recommendations};
use rankeval::split::{split, SplitConfig, SplitPolicy, TestSize};

const MIN_PROPTEST_CASES: u32 = 64;

fn proptest_cases() -> u32 {
    std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .map(|parsed| parsed.max(MIN_PROPTEST_CASES))
        .unwrap_or(MIN_PROPTEST_CASES)
}

fn log_strategy() -> impl Strategy<Value = Interactions> {
    prop::collection::vec((0usize..12, 0usize..20, 0usize..40), 1..120).prop_map(|rows| {
        let rows: BTreeSet<(usize, usize, usize)> = rows.into_iter().collect();
        Interactions::new(
            rows.into_iter()
                .map(|(user_id, item_id, timestamp)| Interaction::new(user_id, item_id, timestamp))
                .collect(),
        )
        .unwrap()
    })
}

fn sorted_rows(interactions: &Interactions) -> Vec<(usize, usize, usize)> {
    let mut rows: Vec<_> = interactions
        .data()
        .iter()
        .map(|x| (x.user_id(), x.item_id(), x.timestamp()))
        .collect();
    rows.sort();
    rows
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: proptest_cases(),
        .. ProptestConfig::default()
    })]

    #[test]
    fn random_split_is_a_seeded_partition(log in log_strategy(), seed in any::<u64>()) {
        let config = SplitConfig::new(SplitPolicy::Random)
            .test_size(TestSize::Fraction(0.25))
            .seed(seed);

        let first = split(&log, &config).unwrap();
        let second = split(&log, &config).unwrap();

        prop_assert_eq!(first.train.data(), second.train.data());
        prop_assert_eq!(first.test.data(), second.test.data());

        let mut union = sorted_rows(&first.train);
        union.extend(sorted_rows(&first.test));
        union.sort();
        prop_assert_eq!(union, sorted_rows(&log));
        prop_assert_eq!(first.test.len(), log.len() / 4);
    }

    #[test]
    fn temporal_split_respects_cutoff(log in log_strategy(), cutoff in 0usize..40) {
        let config = SplitConfig::new(SplitPolicy::TemporalGlobal { cutoff: Some(cutoff) });

        let result = split(&log, &config).unwrap();

        prop_assert!(result.train.data().iter().all(|x| x.timestamp() < cutoff));
        prop_assert!(result.test.data().iter().all(|x| x.timestamp() >= cutoff));
        prop_assert_eq!(result.train.len() + result.test.len(), log.len());
    }

    #[test]
    fn leave_one_out_holds_out_each_users_latest_row(log in log_strategy()) {
        let result = split(&log, &SplitConfig::new(SplitPolicy::LeaveOneOut)).unwrap();

        let mut history: HashMap<usize, usize> = HashMap::new();
        for interaction in log.data() {
            *history.entry(interaction.user_id()).or_insert(0) += 1;
        }

        let test_users: Vec<usize> = result.test.data().iter().map(|x| x.user_id()).collect();
        let distinct: HashSet<usize> = test_users.iter().cloned().collect();
        prop_assert_eq!(distinct.len(), test_users.len());

        for (user_id, count) in &history {
            prop_assert_eq!(distinct.contains(user_id), *count >= 2);
        }

        for held_out in result.test.data() {
            prop_assert!(result
                .train
                .data()
                .iter()
                .filter(|x| x.user_id() == held_out.user_id())
                .all(|x| x.timestamp() <= held_out.timestamp()));
        }
    }

    #[test]
    fn recommendation_lists_are_ranked_and_bounded(
        scores in prop::collection::vec((0usize..50, -100.0f32..100.0), 0..80),
        k in 1usize..20,
    ) {
        let list = RecommendationList::from_scores(3, k, scores).unwrap();

        prop_assert!(list.len() <= k);

        let items: HashSet<usize> = list.item_ids().collect();
        prop_assert_eq!(items.len(), list.len());

        for pair in list.items().windows(2) {
            let (first, second) = (pair[0], pair[1]);
            prop_assert!(first.1 > second.1 || (first.1 == second.1 && first.0 < second.0));
        }
    }

    #[test]
    fn relevance_metrics_stay_in_unit_range(
        log in log_strategy(),
        ranked in prop::collection::vec(0usize..20, 0..10),
        k in 1usize..10,
    ) {
        let result = split(&log, &SplitConfig::new(SplitPolicy::LeaveOneOut)).unwrap();
        let engine = MetricEngine::new(&result.train);

        let recommendations: Recommendations = result
            .test
            .users()
            .into_iter()
            .map(|user_id| {
                let scores = ranked
                    .iter()
                    .enumerate()
                    .map(|(idx, &item_id)| (item_id, -(idx as f32)))
                    .collect();
                RecommendationList::from_scores(user_id, k, scores).unwrap()
            })
            .collect();

        let specs: Vec<MetricSpec> = Metric::ALL
            .iter()
            .filter(|&&metric| metric != Metric::Novelty)
            .map(|&metric| MetricSpec::new(metric, k))
            .collect();

        let metrics = engine.compute(&recommendations, &result.test, &specs).unwrap();

        for (name, value) in metrics.iter() {
            for user_value in value.per_user.values() {
                prop_assert!(*user_value >= 0.0 && *user_value <= 1.0, "{} = {}", name, user_value);
            }
            if let Some(aggregate) = value.aggregate {
                prop_assert!(aggregate >= 0.0 && aggregate <= 1.0, "{} = {}", name, aggregate);
            }
        }
    }
}
