use crate::argument::{ArgumentVariant, BaselineSet, Role};
use crate::error::SequenceError;
use crate::oracle::OracleResult;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

const HELP_FLAGS: [&str; 2] = ["-h", "--help"];
/// Token that conventionally makes a program read its input from stdin.
pub const STDIN_DASH: &str = "-";
const GARBAGE_TOKEN_LENGTH: usize = 10;

/// How the baseline phase is extended with random tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineOptions {
    /// Number of random tokens per prefix (`-` and `--`); zero disables them.
    pub random_tokens: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Baseline,
    Fuzzing,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    BaselineNone,
    BaselineHelp(usize),
    BaselineGarbage(usize),
    CanaryFile,
    FlagPlusFile(usize),
    StdinDash,
    FreshNone,
    Flag(usize),
    FlagPlusString(usize),
    Exhausted,
}

/// The ordered stream of candidates for one target.
///
/// Pull-based: every candidate handed out by [`next_candidate`] has to be run
/// and its result passed to [`record_result`] before the next one is
/// requested, because what comes after the canary file probe depends on that
/// probe's result.
///
/// [`next_candidate`]: FuzzingSequence::next_candidate
/// [`record_result`]: FuzzingSequence::record_result
#[derive(Debug)]
pub struct FuzzingSequence {
    vocabulary: Vec<String>,
    canary_path: String,
    canary_string: String,
    garbage: Vec<String>,
    cursor: Cursor,
    pending: Option<Cursor>,
    last_result: Option<OracleResult>,
}

impl FuzzingSequence {
    pub fn new(
        vocabulary: Vec<String>,
        canary_path: impl Into<String>,
        canary_string: impl Into<String>,
        baseline: BaselineOptions,
    ) -> Self {
        let mut sequence = Self {
            vocabulary,
            canary_path: canary_path.into(),
            canary_string: canary_string.into(),
            garbage: garbage_tokens(baseline),
            cursor: Cursor::BaselineNone,
            pending: None,
            last_result: None,
        };
        sequence.cursor = sequence.normalize(Cursor::BaselineNone);
        sequence
    }

    /// Phase of the candidate the next call to `next_candidate` returns.
    pub fn phase(&self) -> Phase {
        match self.cursor {
            Cursor::BaselineNone | Cursor::BaselineHelp(_) | Cursor::BaselineGarbage(_) => {
                Phase::Baseline
            }
            Cursor::Exhausted => Phase::Exhausted,
            _ => Phase::Fuzzing,
        }
    }

    pub fn last_result(&self) -> Option<&OracleResult> {
        self.last_result.as_ref()
    }

    pub fn next_candidate(&mut self) -> Result<Option<ArgumentVariant>, SequenceError> {
        if self.pending.is_some() {
            return Err(SequenceError::ResultPending);
        }
        let variant = match self.cursor {
            Cursor::BaselineNone | Cursor::FreshNone => ArgumentVariant::none(),
            Cursor::BaselineHelp(i) => ArgumentVariant::flag(HELP_FLAGS[i]),
            Cursor::BaselineGarbage(i) => ArgumentVariant::flag(self.garbage[i].clone()),
            Cursor::CanaryFile => ArgumentVariant::file(self.canary_path.clone()),
            Cursor::FlagPlusFile(i) => ArgumentVariant::flag_plus_file(
                self.vocabulary[i].clone(),
                self.canary_path.clone(),
            ),
            Cursor::StdinDash => ArgumentVariant::flag(STDIN_DASH),
            Cursor::Flag(i) => ArgumentVariant::flag(self.vocabulary[i].clone()),
            Cursor::FlagPlusString(i) => ArgumentVariant::flag_plus_string(
                self.vocabulary[i].clone(),
                self.canary_string.clone(),
            ),
            Cursor::Exhausted => return Ok(None),
        };
        self.pending = Some(self.cursor);
        Ok(Some(variant))
    }

    pub fn record_result(&mut self, result: &OracleResult) -> Result<(), SequenceError> {
        let answered = self.pending.take().ok_or(SequenceError::NoPendingCandidate)?;
        let next = match answered {
            Cursor::BaselineNone => Cursor::BaselineHelp(0),
            Cursor::BaselineHelp(i) if i + 1 < HELP_FLAGS.len() => Cursor::BaselineHelp(i + 1),
            Cursor::BaselineHelp(_) => Cursor::BaselineGarbage(0),
            Cursor::BaselineGarbage(i) => Cursor::BaselineGarbage(i + 1),
            Cursor::CanaryFile => {
                // Only the roles matter here, which for a file shape never look at the baseline.
                let roles = ArgumentVariant::file(self.canary_path.clone())
                    .classify(result, &BaselineSet::new());
                if roles.contains(&Role::FileEnabler) {
                    Cursor::StdinDash
                } else {
                    Cursor::FlagPlusFile(0)
                }
            }
            Cursor::FlagPlusFile(i) => Cursor::FlagPlusFile(i + 1),
            Cursor::StdinDash => Cursor::FreshNone,
            Cursor::FreshNone => Cursor::Flag(0),
            Cursor::Flag(i) => Cursor::FlagPlusString(i),
            Cursor::FlagPlusString(i) => Cursor::Flag(i + 1),
            Cursor::Exhausted => Cursor::Exhausted,
        };
        self.cursor = self.normalize(next);
        self.last_result = Some(result.clone());
        Ok(())
    }

    /// Skips past ranges that are empty for this vocabulary and baseline.
    fn normalize(&self, cursor: Cursor) -> Cursor {
        match cursor {
            Cursor::BaselineGarbage(i) if i >= self.garbage.len() => Cursor::CanaryFile,
            Cursor::FlagPlusFile(i) if i >= self.vocabulary.len() => Cursor::StdinDash,
            Cursor::Flag(i) if i >= self.vocabulary.len() => Cursor::Exhausted,
            other => other,
        }
    }
}

fn garbage_tokens(options: BaselineOptions) -> Vec<String> {
    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    let mut tokens = Vec::with_capacity(options.random_tokens * 2);
    for prefix in ["-", "--"] {
        for _ in 0..options.random_tokens {
            let body: String = (0..GARBAGE_TOKEN_LENGTH)
                .map(|_| rng.random_range(b'a'..=b'z') as char)
                .collect();
            tokens.push(format!("{prefix}{body}"));
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANARY: &str = "/tmp/canary.opencrs";

    fn result(touches_file: bool) -> OracleResult {
        OracleResult {
            basic_block_count: Some(1),
            behavior_hash: Some(1),
            touches_file,
            exit_status: Some(0),
            timed_out: false,
            uses_stdin: false,
        }
    }

    fn vocabulary() -> Vec<String> {
        vec!["-v".to_string(), "-x".to_string()]
    }

    /// Drains the sequence, answering the canary file probe with `file_hit`.
    fn drain(mut sequence: FuzzingSequence, file_hit: bool) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(variant) = sequence.next_candidate().unwrap() {
            let is_file = matches!(variant.shape(), crate::argument::ArgumentShape::File { .. });
            lines.push(variant.to_string());
            sequence.record_result(&result(is_file && file_hit)).unwrap();
        }
        assert_eq!(sequence.phase(), Phase::Exhausted);
        lines
    }

    #[test]
    fn full_order_without_file_hit() {
        let sequence =
            FuzzingSequence::new(vocabulary(), CANARY, "string", BaselineOptions::default());
        assert_eq!(
            drain(sequence, false),
            vec![
                "<none>",
                "-h",
                "--help",
                CANARY,
                "-v /tmp/canary.opencrs",
                "-x /tmp/canary.opencrs",
                "-",
                "<none>",
                "-v",
                "-v string",
                "-x",
                "-x string",
            ]
        );
    }

    #[test]
    fn file_hit_skips_flag_plus_file_probes() {
        let sequence =
            FuzzingSequence::new(vocabulary(), CANARY, "string", BaselineOptions::default());
        let lines = drain(sequence, true);
        assert!(!lines.iter().any(|line| line.ends_with(&format!(" {CANARY}"))));
        assert_eq!(lines[3], CANARY);
        assert_eq!(lines[4], "-");
    }

    #[test]
    fn empty_vocabulary_keeps_non_vocabulary_probes() {
        let sequence = FuzzingSequence::new(Vec::new(), CANARY, "string", BaselineOptions::default());
        assert_eq!(
            drain(sequence, false),
            vec!["<none>", "-h", "--help", CANARY, "-", "<none>"]
        );
    }

    #[test]
    fn phase_switches_after_baseline() {
        let mut sequence =
            FuzzingSequence::new(vocabulary(), CANARY, "string", BaselineOptions::default());
        for _ in 0..3 {
            assert_eq!(sequence.phase(), Phase::Baseline);
            sequence.next_candidate().unwrap().unwrap();
            sequence.record_result(&result(false)).unwrap();
        }
        assert_eq!(sequence.phase(), Phase::Fuzzing);
    }

    #[test]
    fn random_baseline_tokens_are_prefixed_and_reproducible() {
        let options = BaselineOptions {
            random_tokens: 3,
            seed: 42,
        };
        let first = drain(
            FuzzingSequence::new(Vec::new(), CANARY, "string", options),
            false,
        );
        let second = drain(
            FuzzingSequence::new(Vec::new(), CANARY, "string", options),
            false,
        );
        assert_eq!(first, second);

        let garbage = &first[3..9];
        for token in &garbage[..3] {
            assert!(token.starts_with('-') && !token.starts_with("--"));
            assert_eq!(token.len(), 1 + GARBAGE_TOKEN_LENGTH);
        }
        for token in &garbage[3..] {
            assert!(token.starts_with("--"));
            assert!(token[2..].bytes().all(|b| b.is_ascii_lowercase()));
        }
        assert_eq!(first[9], CANARY);
    }

    #[test]
    fn protocol_violations_are_reported() {
        let mut sequence =
            FuzzingSequence::new(vocabulary(), CANARY, "string", BaselineOptions::default());
        assert_eq!(
            sequence.record_result(&result(false)),
            Err(SequenceError::NoPendingCandidate)
        );
        sequence.next_candidate().unwrap();
        assert_eq!(
            sequence.next_candidate().unwrap_err(),
            SequenceError::ResultPending
        );
        sequence.record_result(&result(false)).unwrap();
        assert!(sequence.last_result().is_some());
        assert!(sequence.next_candidate().unwrap().is_some());
    }
}
