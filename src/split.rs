//! Train/test (and optionally validation) splitting of interaction logs.
//!
//! Every policy is deterministic: random policies take an explicit seed,
//! temporal policies order rows by timestamp and then by item id.
use std::collections::HashSet;
use std::hash::Hasher;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher;
use tracing::{info, warn};

use crate::data::{Interaction, Interactions};
use crate::{EvaluationError, Timestamp};

/// How many rows (or, for per-user policies, rows per user) go to test.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TestSize {
    /// A fraction in `(0, 1)`.
    Fraction(f64),
    /// An absolute number.
    Count(usize),
}

impl TestSize {
    fn validate(&self) -> Result<(), EvaluationError> {
        match *self {
            TestSize::Fraction(fraction) if !(fraction > 0.0 && fraction < 1.0) => Err(
                EvaluationError::InvalidArgument(format!(
                    "test fraction must lie in (0, 1), got {}",
                    fraction
                )),
            ),
            TestSize::Count(0) => Err(EvaluationError::InvalidArgument(
                "test count must be positive".to_owned(),
            )),
            _ => Ok(()),
        }
    }

    // Rounds fractions down, like slicing a shuffled log.
    fn of(&self, len: usize) -> usize {
        match *self {
            TestSize::Fraction(fraction) => (fraction * len as f64) as usize,
            TestSize::Count(count) => count.min(len),
        }
    }

    // Rounds fractions up so that every qualifying user contributes.
    fn of_user(&self, len: usize) -> usize {
        match *self {
            TestSize::Fraction(fraction) => (fraction * len as f64).ceil() as usize,
            TestSize::Count(count) => count,
        }
    }
}

/// The splitting strategy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Seeded shuffle of individual rows.
    Random,
    /// Whole users go to test, chosen by a seeded hash of their id.
    UserBased,
    /// Rows at or after `cutoff` are test. Without a cutoff, one is
    /// derived from the test size.
    TemporalGlobal {
        /// First timestamp belonging to test.
        #[serde(default)]
        cutoff: Option<Timestamp>,
    },
    /// The latest rows of every user are test.
    TemporalPerUser,
    /// The single latest row of every user is test.
    LeaveOneOut,
}

impl FromStr for SplitPolicy {
    type Err = EvaluationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "random" => Ok(SplitPolicy::Random),
            "user_based" => Ok(SplitPolicy::UserBased),
            "temporal_global" => Ok(SplitPolicy::TemporalGlobal { cutoff: None }),
            "temporal_per_user" => Ok(SplitPolicy::TemporalPerUser),
            "leave_one_out" => Ok(SplitPolicy::LeaveOneOut),
            other => Err(EvaluationError::InvalidArgument(format!(
                "unknown split policy: {}",
                other
            ))),
        }
    }
}

/// What per-user policies do with users that have too little history.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShortHistoryPolicy {
    /// Keep all of the user's rows in train.
    Train,
    /// Drop the user's rows from every split.
    Drop,
}

/// Splitter configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SplitConfig {
    policy: SplitPolicy,
    test_size: TestSize,
    drop_cold_users: bool,
    drop_cold_items: bool,
    min_interactions_per_user: usize,
    short_history: ShortHistoryPolicy,
    seed: u64,
    validation_size: Option<TestSize>,
    strict: bool,
}

impl Default for SplitConfig {
    fn default() -> Self {
        SplitConfig {
            policy: SplitPolicy::Random,
            test_size: TestSize::Fraction(0.2),
            drop_cold_users: false,
            drop_cold_items: false,
            min_interactions_per_user: 2,
            short_history: ShortHistoryPolicy::Train,
            seed: 42,
            validation_size: None,
            strict: false,
        }
    }
}

impl SplitConfig {
    /// Build a configuration for `policy` with default options.
    pub fn new(policy: SplitPolicy) -> Self {
        SplitConfig {
            policy,
            ..SplitConfig::default()
        }
    }

    /// The splitting strategy.
    pub fn policy(&self) -> SplitPolicy {
        self.policy
    }

    /// Set the test size. Per-user policies apply it to every user.
    pub fn test_size(mut self, test_size: TestSize) -> Self {
        self.test_size = test_size;
        self
    }

    /// Remove test rows of users absent from train.
    pub fn drop_cold_users(mut self, drop_cold_users: bool) -> Self {
        self.drop_cold_users = drop_cold_users;
        self
    }

    /// Remove test rows of items absent from train.
    pub fn drop_cold_items(mut self, drop_cold_items: bool) -> Self {
        self.drop_cold_items = drop_cold_items;
        self
    }

    /// Users with fewer interactions never reach test under per-user policies.
    pub fn min_interactions_per_user(mut self, min_interactions_per_user: usize) -> Self {
        self.min_interactions_per_user = min_interactions_per_user;
        self
    }

    /// Set what happens to users below the interaction threshold.
    pub fn short_history(mut self, short_history: ShortHistoryPolicy) -> Self {
        self.short_history = short_history;
        self
    }

    /// Set the seed of the random policies.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Carve a validation split out of train with the same policy. Under
    /// `TemporalGlobal` the validation cutoff is always derived from
    /// `validation_size` and the train timestamps.
    pub fn validation_size(mut self, validation_size: TestSize) -> Self {
        self.validation_size = Some(validation_size);
        self
    }

    /// Fail with `DataLeakage` when train and test share `(user, item)` pairs.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Check option values without touching any data.
    pub fn validate(&self) -> Result<(), EvaluationError> {
        self.test_size.validate()?;
        if let Some(validation_size) = self.validation_size {
            validation_size.validate()?;
        }

        Ok(())
    }
}

/// The outcome of a split.
#[derive(Clone, Debug)]
pub struct SplitResult {
    /// Rows to fit models on.
    pub train: Interactions,
    /// Held-out rows used as ground truth.
    pub test: Interactions,
    /// Rows carved out of train when a validation size is set.
    pub validation: Option<Interactions>,
}

impl SplitResult {
    /// Number of distinct `(user, item)` pairs present in both train and test.
    pub fn check_leakage(&self) -> usize {
        leaked_pairs(&self.train, &self.test)
    }
}

fn leaked_pairs(train: &Interactions, test: &Interactions) -> usize {
    let train_pairs: HashSet<_> = train
        .data()
        .iter()
        .map(|x| (x.user_id(), x.item_id()))
        .collect();

    test.data()
        .iter()
        .map(|x| (x.user_id(), x.item_id()))
        .filter(|pair| train_pairs.contains(pair))
        .collect::<HashSet<_>>()
        .len()
}

/// Split `log` according to `config`.
pub fn split(log: &Interactions, config: &SplitConfig) -> Result<SplitResult, EvaluationError> {
    if log.is_empty() {
        return Err(EvaluationError::InvalidInput(
            "cannot split an empty log".to_owned(),
        ));
    }
    config.validate()?;

    let (train, test) = split_once(log, config.policy, config, config.test_size, config.seed);

    let (train, validation) = match config.validation_size {
        Some(validation_size) => {
            // A fixed cutoff leaves nothing after it in train, so validation
            // gets its own cutoff derived from the train timestamps.
            let policy = match config.policy {
                SplitPolicy::TemporalGlobal { .. } => SplitPolicy::TemporalGlobal { cutoff: None },
                policy => policy,
            };
            let (train, validation) = split_once(
                &train,
                policy,
                config,
                validation_size,
                config.seed.wrapping_add(1),
            );
            (train, Some(validation))
        }
        None => (train, None),
    };

    let test = drop_cold(test, &train, config);
    let validation = validation.map(|validation| drop_cold(validation, &train, config));

    let result = SplitResult {
        train,
        test,
        validation,
    };

    if config.strict {
        let mut pairs = result.check_leakage();
        if let Some(ref validation) = result.validation {
            pairs += leaked_pairs(&result.train, validation);
        }
        if pairs > 0 {
            return Err(EvaluationError::DataLeakage { pairs });
        }
    }

    if result.test.is_empty() {
        warn!(policy = ?config.policy, "Split produced an empty test set");
    }

    info!(
        policy = ?config.policy,
        train = result.train.len(),
        test = result.test.len(),
        validation = result.validation.as_ref().map_or(0, |x| x.len()),
        "Split interactions"
    );

    Ok(result)
}

fn split_once(
    log: &Interactions,
    policy: SplitPolicy,
    config: &SplitConfig,
    test_size: TestSize,
    seed: u64,
) -> (Interactions, Interactions) {
    match policy {
        SplitPolicy::Random => random_split(log, test_size, seed),
        SplitPolicy::UserBased => user_based_split(log, test_size, seed),
        SplitPolicy::TemporalGlobal { cutoff } => {
            let cutoff = cutoff.unwrap_or_else(|| derive_cutoff(log, test_size));
            log.split_by(|x| x.timestamp() < cutoff)
        }
        SplitPolicy::TemporalPerUser => per_user_split(log, config, |len| test_size.of_user(len)),
        SplitPolicy::LeaveOneOut => per_user_split(log, config, |_| 1),
    }
}

fn random_split(log: &Interactions, test_size: TestSize, seed: u64) -> (Interactions, Interactions) {
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..log.len()).collect();
    indices.shuffle(&mut rng);

    let mut is_train = vec![true; log.len()];
    for &idx in indices.iter().take(test_size.of(log.len())) {
        is_train[idx] = false;
    }

    log.split_by_mask(&is_train)
}

fn user_based_split(
    log: &Interactions,
    test_size: TestSize,
    seed: u64,
) -> (Interactions, Interactions) {
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let (key_0, key_1) = (rng.gen::<u64>(), rng.gen::<u64>());

    let mut hashed: Vec<(u64, usize)> = log
        .users()
        .into_iter()
        .map(|user_id| {
            let mut hasher = SipHasher::new_with_keys(key_0, key_1);
            hasher.write_usize(user_id);
            (hasher.finish(), user_id)
        })
        .collect();
    hashed.sort();

    let test_users: HashSet<usize> = hashed
        .iter()
        .take(test_size.of(hashed.len()))
        .map(|&(_, user_id)| user_id)
        .collect();

    log.split_by(|x| !test_users.contains(&x.user_id()))
}

fn derive_cutoff(log: &Interactions, test_size: TestSize) -> Timestamp {
    let mut timestamps: Vec<Timestamp> = log.data().iter().map(|x| x.timestamp()).collect();
    timestamps.sort_unstable();

    let test_count = test_size.of(timestamps.len());

    timestamps
        .get(timestamps.len() - test_count)
        .cloned()
        .unwrap_or(Timestamp::MAX)
}

fn per_user_split<F: Fn(usize) -> usize>(
    log: &Interactions,
    config: &SplitConfig,
    test_count: F,
) -> (Interactions, Interactions) {
    let threshold = config.min_interactions_per_user.max(2);

    let mut train = Vec::with_capacity(log.len());
    let mut test = Vec::new();

    for user in log.to_compressed().iter_users() {
        if user.len() < threshold {
            if config.short_history == ShortHistoryPolicy::Train {
                train.extend((0..user.len()).map(|idx| user.interaction(idx)));
            }
            continue;
        }

        // At least one row always stays in train.
        let num_test = test_count(user.len()).min(user.len() - 1);
        let boundary = user.len() - num_test;

        train.extend((0..boundary).map(|idx| user.interaction(idx)));
        test.extend((boundary..user.len()).map(|idx| user.interaction(idx)));
    }

    (
        Interactions::from_validated(train),
        Interactions::from_validated(test),
    )
}

fn drop_cold(test: Interactions, train: &Interactions, config: &SplitConfig) -> Interactions {
    if !config.drop_cold_users && !config.drop_cold_items {
        return test;
    }

    let train_users: HashSet<_> = train.data().iter().map(Interaction::user_id).collect();
    let train_items: HashSet<_> = train.data().iter().map(Interaction::item_id).collect();

    test.filter(|x| {
        (!config.drop_cold_users || train_users.contains(&x.user_id()))
            && (!config.drop_cold_items || train_items.contains(&x.item_id()))
    })
}
