use crate::argument::{ArgumentVariant, BaselineSet, RoleSet};
use crate::config::FuzzerSettings;
use crate::error::FuzzError;
use crate::oracle::Oracle;
use crate::sequence::{BaselineOptions, FuzzingSequence, Phase};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Baseline,
    Fuzzing,
    Done,
}

/// An argument shown to change the behavior of the target, with how it does so.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub argument: String,
    pub roles: RoleSet,
}

impl From<&ArgumentVariant> for Finding {
    fn from(variant: &ArgumentVariant) -> Self {
        Self {
            argument: variant.command_line(),
            roles: variant.roles().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FuzzReport {
    pub target_digest: Option<String>,
    pub baseline: BaselineSet,
    pub findings: Vec<Finding>,
    pub executions: usize,
    pub vocabulary_size: usize,
}

impl FuzzReport {
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone)]
pub struct FuzzerOptions {
    pub canary_string: String,
    pub baseline: BaselineOptions,
}

impl From<&FuzzerSettings> for FuzzerOptions {
    fn from(settings: &FuzzerSettings) -> Self {
        let random_tokens = if settings.random_baseline_arguments {
            settings.random_arguments_count
        } else {
            0
        };
        Self {
            canary_string: settings.canary_string.clone(),
            baseline: BaselineOptions {
                random_tokens,
                seed: settings.seed,
            },
        }
    }
}

impl Default for FuzzerOptions {
    fn default() -> Self {
        Self::from(&FuzzerSettings::default())
    }
}

/// Drives the fuzzing sequence through an oracle and keeps the arguments that
/// produce behavior distinguishable from the baseline.
///
/// Runs strictly one execution at a time: every run shares the sandbox's
/// trace folder and canary file.
pub struct ArgumentsFuzzer<O: Oracle> {
    oracle: O,
    vocabulary: Vec<String>,
    options: FuzzerOptions,
    state: EngineState,
    /// Hashes already attributed to some argument during this run.
    history: HashSet<u64>,
    executions: usize,
}

impl<O: Oracle> ArgumentsFuzzer<O> {
    pub fn new(oracle: O, vocabulary: Vec<String>, options: FuzzerOptions) -> Self {
        Self {
            oracle,
            vocabulary,
            options,
            state: EngineState::Init,
            history: HashSet::new(),
            executions: 0,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn into_oracle(self) -> O {
        self.oracle
    }

    /// Runs only the baseline sub-sequence and returns its hashes.
    pub fn compute_baseline(&mut self) -> Result<BaselineSet, FuzzError> {
        let mut sequence = self.init_sequence()?;
        self.run_baseline(&mut sequence)
    }

    /// Runs the whole sequence and returns every valid argument, in discovery order.
    pub fn run(&mut self) -> Result<FuzzReport, FuzzError> {
        self.history.clear();
        self.executions = 0;

        let mut sequence = self.init_sequence()?;
        let baseline = self.run_baseline(&mut sequence)?;

        self.state = EngineState::Fuzzing;
        info!("Fuzzing {} tokens", self.vocabulary.len());
        let mut findings = Vec::new();

        while let Some(mut variant) = sequence.next_candidate()? {
            let result = self.oracle.analyze(&variant)?;
            self.executions += 1;

            if result.is_unknown() {
                debug!("No usable trace for {variant}");
            }
            let has_roles = !variant.attach_roles(&result, &baseline).is_empty();
            let is_new = result
                .behavior_hash
                .is_none_or(|hash| !self.history.contains(&hash));
            debug!(
                "{variant}: hash={:?} roles={:?} new={is_new}",
                result.behavior_hash,
                variant.roles()
            );

            if has_roles && is_new {
                info!("Found {variant} ({:?})", variant.roles());
                findings.push(Finding::from(&variant));
            }

            // Keeps `--flag <string>` from being reported again after `--flag`.
            if let Some(hash) = result.behavior_hash {
                self.history.insert(hash);
            }
            sequence.record_result(&result)?;
        }

        self.state = EngineState::Done;
        info!(
            "Fuzzing done after {} executions, {} arguments found",
            self.executions,
            findings.len()
        );

        Ok(FuzzReport {
            target_digest: self.oracle.target_digest().map(str::to_string),
            baseline,
            findings,
            executions: self.executions,
            vocabulary_size: self.vocabulary.len(),
        })
    }

    fn init_sequence(&mut self) -> Result<FuzzingSequence, FuzzError> {
        self.state = EngineState::Init;
        let canary_path = self.oracle.prepare_canary()?;
        if self.vocabulary.is_empty() {
            warn!("Vocabulary is empty, only the non-vocabulary probes will run");
        }
        Ok(FuzzingSequence::new(
            self.vocabulary.clone(),
            canary_path,
            self.options.canary_string.clone(),
            self.options.baseline,
        ))
    }

    fn run_baseline(&mut self, sequence: &mut FuzzingSequence) -> Result<BaselineSet, FuzzError> {
        self.state = EngineState::Baseline;
        let mut baseline = BaselineSet::new();

        while sequence.phase() == Phase::Baseline {
            let Some(variant) = sequence.next_candidate()? else {
                break;
            };
            let result = self.oracle.analyze(&variant)?;
            self.executions += 1;
            match result.behavior_hash {
                Some(hash) => {
                    baseline.insert(hash);
                }
                None => warn!("Baseline run {variant} produced no usable trace"),
            }
            sequence.record_result(&result)?;
        }

        info!("Baseline hashes: {:?}", baseline.hashes());
        Ok(baseline)
    }
}
