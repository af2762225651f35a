pub mod argument;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod fuzzer;
pub mod oracle;
pub mod sandbox;
pub mod sequence;

pub use argument::{ArgumentShape, ArgumentVariant, BaselineSet, Role, RoleSet};
pub use config::{ArgprobeConfig, FuzzerSettings, SandboxBackendType, SandboxConfig};
pub use dictionary::Dictionary;
pub use error::{DictionaryError, FuzzError, SandboxError, SequenceError, TraceError};
pub use fuzzer::{ArgumentsFuzzer, EngineState, Finding, FuzzReport, FuzzerOptions};
pub use oracle::{Oracle, OracleClient, OracleResult, TraceRecord};
pub use sandbox::{ExecutionStatus, SandboxBackend, SandboxSession, TIMEOUT_EXIT_CODE};
pub use sequence::{BaselineOptions, FuzzingSequence, Phase};
