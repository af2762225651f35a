use crate::argument::ArgumentVariant;
use crate::error::{SandboxError, TraceError};
use crate::sandbox::{ExecutionStatus, SandboxSession, TIMEOUT_EXIT_CODE};
use log::debug;
use std::str::FromStr;
use std::time::Duration;

/// One record written by the instrumentation probe:
/// `<basic_block_count> <behavior_hash> <uses_file:0|1>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub basic_block_count: u64,
    pub behavior_hash: u64,
    pub uses_file: bool,
}

impl FromStr for TraceRecord {
    type Err = TraceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        let [count, hash, uses_file] = fields.as_slice() else {
            return Err(TraceError::Malformed(format!(
                "expected 3 fields, found {}",
                fields.len()
            )));
        };

        let basic_block_count = count
            .parse::<u64>()
            .map_err(|e| TraceError::Malformed(format!("block count {count:?}: {e}")))?;
        let behavior_hash = parse_hash(hash)?;
        let uses_file = match *uses_file {
            "0" => false,
            "1" => true,
            other => {
                return Err(TraceError::Malformed(format!("file flag {other:?}")));
            }
        };

        Ok(Self {
            basic_block_count,
            behavior_hash,
            uses_file,
        })
    }
}

// The probe prints an unsigned long with `%ld`, so large hashes come out negative.
fn parse_hash(raw: &str) -> Result<u64, TraceError> {
    raw.parse::<u64>()
        .or_else(|_| raw.parse::<i64>().map(|signed| signed as u64))
        .map_err(|e| TraceError::Malformed(format!("behavior hash {raw:?}: {e}")))
}

/// What one instrumented execution of the target did.
///
/// `None` in `basic_block_count` or `behavior_hash` means the trace record
/// could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    pub basic_block_count: Option<u64>,
    pub behavior_hash: Option<u64>,
    pub touches_file: bool,
    /// 124 whenever `timed_out` is set, even if the stdin retry exited normally.
    pub exit_status: Option<i32>,
    /// The first attempt hit the wall-clock timeout.
    pub timed_out: bool,
    /// The timeout went away once stdin was fed EOF.
    pub uses_stdin: bool,
}

impl OracleResult {
    pub fn from_record(record: TraceRecord, status: &ExecutionStatus) -> Self {
        Self {
            basic_block_count: Some(record.basic_block_count),
            behavior_hash: Some(record.behavior_hash),
            touches_file: record.uses_file,
            exit_status: status.exit_code(),
            timed_out: *status == ExecutionStatus::Timeout,
            uses_stdin: false,
        }
    }

    pub fn unknown(status: &ExecutionStatus) -> Self {
        Self {
            basic_block_count: None,
            behavior_hash: None,
            touches_file: false,
            exit_status: status.exit_code(),
            timed_out: *status == ExecutionStatus::Timeout,
            uses_stdin: false,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.behavior_hash.is_none()
    }
}

/// Answers "what did running the target with this argument do".
pub trait Oracle {
    /// Creates or truncates the canary file and returns its path as the target sees it.
    fn prepare_canary(&mut self) -> Result<String, SandboxError>;

    /// Runs the target once with `variant`, including the stdin retry on timeout.
    ///
    /// Unreadable traces are folded into the result; only sandbox failures are errors.
    fn analyze(&mut self, variant: &ArgumentVariant) -> Result<OracleResult, SandboxError>;

    /// MD5 digest of the executable under test, if known.
    fn target_digest(&self) -> Option<&str> {
        None
    }
}

/// Runs variants through the probe inside a [`SandboxSession`].
pub struct OracleClient {
    session: SandboxSession,
    timeout: Duration,
}

impl OracleClient {
    pub fn new(session: SandboxSession, timeout: Duration) -> Self {
        Self { session, timeout }
    }

    pub fn session(&self) -> &SandboxSession {
        &self.session
    }

    pub fn into_session(self) -> SandboxSession {
        self.session
    }

    /// A single execution, without any retry.
    pub fn run(
        &mut self,
        variant: &ArgumentVariant,
        suppress_stdin: bool,
    ) -> Result<OracleResult, SandboxError> {
        let trace_id = variant.trace_id();
        self.session.clear_trace(&trace_id);

        let status = self
            .session
            .execute(&variant.arguments(), self.timeout, suppress_stdin)?;

        let record = self
            .session
            .read_trace(&trace_id)
            .and_then(|raw| raw.parse::<TraceRecord>());
        let result = match record {
            Ok(record) => OracleResult::from_record(record, &status),
            Err(e) => {
                debug!("Trace for {variant} unusable ({status:?}): {e}");
                OracleResult::unknown(&status)
            }
        };
        Ok(result)
    }
}

impl Oracle for OracleClient {
    fn prepare_canary(&mut self) -> Result<String, SandboxError> {
        self.session.reset_canary()?;
        Ok(self.session.canary_path().to_string())
    }

    fn analyze(&mut self, variant: &ArgumentVariant) -> Result<OracleResult, SandboxError> {
        let first = self.run(variant, false)?;
        if !first.timed_out {
            return Ok(first);
        }

        debug!("{variant} timed out, retrying with stdin closed");
        let retry = self.run(variant, true)?;
        if retry.timed_out {
            return Ok(first);
        }
        Ok(OracleResult {
            exit_status: Some(TIMEOUT_EXIT_CODE),
            timed_out: true,
            uses_stdin: true,
            ..retry
        })
    }

    fn target_digest(&self) -> Option<&str> {
        Some(self.session.target_digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SandboxBackendType, SandboxConfig};
    use std::fs;
    use std::io::Write;
    use std::path::Path;

    #[test]
    fn parses_well_formed_record() {
        let record: TraceRecord = "1542 8123456789 1".parse().unwrap();
        assert_eq!(
            record,
            TraceRecord {
                basic_block_count: 1542,
                behavior_hash: 8123456789,
                uses_file: true
            }
        );
    }

    #[test]
    fn tolerates_surrounding_whitespace() {
        let record: TraceRecord = "  12\t34 0\n".parse().unwrap();
        assert_eq!(record.behavior_hash, 34);
        assert!(!record.uses_file);
    }

    #[test]
    fn negative_hash_is_reinterpreted_as_unsigned() {
        let record: TraceRecord = "1 -1 0".parse().unwrap();
        assert_eq!(record.behavior_hash, u64::MAX);
    }

    #[test]
    fn rejects_malformed_records() {
        for raw in ["", "1 2", "1 2 3 4", "x 2 0", "1 y 0", "1 2 2", "1 2 yes"] {
            assert!(
                matches!(raw.parse::<TraceRecord>(), Err(TraceError::Malformed(_))),
                "{raw:?} should be malformed"
            );
        }
    }

    #[test]
    fn unknown_result_keeps_exit_status() {
        let result = OracleResult::unknown(&ExecutionStatus::Timeout);
        assert!(result.is_unknown());
        assert!(result.timed_out);
        assert_eq!(result.exit_status, Some(124));
        assert!(!result.touches_file);
    }

    // The target scripts below stand in for the probe: they write their own
    // trace records into `traces/`, relative to the session folder.
    const PROBE_EMULATING_TARGET: &str = r#"#!/bin/sh
case "$*" in
  "") id=none; hash=100 ;;
  "-x") id=2D78; hash=200 ;;
  "-") id=2D; read line; hash=300 ;;
  "-broken") printf 'garbage' > traces/2D62726F6B656E; exit 1 ;;
  *) exit 2 ;;
esac
printf '10 %s 0' "$hash" > "traces/$id"
"#;

    fn client(dir: &Path, timeout: Duration) -> OracleClient {
        let probe = dir.join("libprobe.so");
        fs::write(&probe, b"").unwrap();
        let target = dir.join("target.sh");
        fs::File::create(&target)
            .and_then(|mut file| file.write_all(PROBE_EMULATING_TARGET.as_bytes()))
            .unwrap();

        let config = SandboxConfig {
            backend: SandboxBackendType::Local,
            probe_library: probe,
            work_root: Some(dir.join("sessions")),
            ..SandboxConfig::default()
        };
        let session = SandboxSession::create(&target, &config).unwrap();
        OracleClient::new(session, timeout)
    }

    #[test]
    fn reads_trace_written_for_argument() {
        let dir = tempfile::tempdir().unwrap();
        let mut oracle = client(dir.path(), Duration::from_secs(5));

        let result = oracle.analyze(&ArgumentVariant::none()).unwrap();
        assert_eq!(result.behavior_hash, Some(100));
        assert_eq!(result.exit_status, Some(0));

        let result = oracle.analyze(&ArgumentVariant::flag("-x")).unwrap();
        assert_eq!(result.behavior_hash, Some(200));
        assert_eq!(result.basic_block_count, Some(10));
    }

    #[test]
    fn missing_or_malformed_trace_degrades_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let mut oracle = client(dir.path(), Duration::from_secs(5));

        let result = oracle.analyze(&ArgumentVariant::flag("-unknown")).unwrap();
        assert!(result.is_unknown());
        assert_eq!(result.exit_status, Some(2));

        let result = oracle.analyze(&ArgumentVariant::flag("-broken")).unwrap();
        assert!(result.is_unknown());
    }

    #[test]
    fn timeout_is_retried_once_with_stdin_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut oracle = client(dir.path(), Duration::from_millis(500));

        let result = oracle.analyze(&ArgumentVariant::flag("-")).unwrap();
        assert!(result.timed_out);
        assert!(result.uses_stdin);
        assert_eq!(result.behavior_hash, Some(300));
        assert_eq!(result.exit_status, Some(TIMEOUT_EXIT_CODE));
    }

    #[test]
    fn prepare_canary_returns_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut oracle = client(dir.path(), Duration::from_secs(5));
        let canary = oracle.prepare_canary().unwrap();
        fs::write(&canary, b"stale").unwrap();
        let canary_again = oracle.prepare_canary().unwrap();
        assert_eq!(canary, canary_again);
        assert_eq!(fs::read(&canary).unwrap().len(), 0);
    }
}
