use crate::oracle::OracleResult;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Trace id used by the probe when the target runs without arguments.
pub const NO_ARGUMENT_TRACE_ID: &str = "none";

/// The effect an argument was shown to have on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Flag,
    StdinEnabler,
    FileEnabler,
    StringEnabler,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Flag => "FLAG",
            Role::StdinEnabler => "STDIN_ENABLER",
            Role::FileEnabler => "FILE_ENABLER",
            Role::StringEnabler => "STRING_ENABLER",
        };
        f.write_str(name)
    }
}

pub type RoleSet = BTreeSet<Role>;

/// Behavior hashes of neutral invocations, in the order they were observed.
///
/// A hash in this set is "uninteresting": an argument producing it did not
/// change the control flow of the target in any way the baseline didn't.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BaselineSet {
    hashes: Vec<u64>,
}

impl BaselineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the hash was already present.
    pub fn insert(&mut self, hash: u64) -> bool {
        if self.hashes.contains(&hash) {
            return false;
        }
        self.hashes.push(hash);
        true
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.hashes.contains(&hash)
    }

    pub fn hashes(&self) -> &[u64] {
        &self.hashes
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

impl FromIterator<u64> for BaselineSet {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        let mut set = BaselineSet::new();
        for hash in iter {
            set.insert(hash);
        }
        set
    }
}

/// The closed set of command-line shapes the fuzzer tries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgumentShape {
    /// No argument at all.
    None,
    /// A bare token, e.g. `-v`.
    Flag { flag: String },
    /// The canary file path on its own.
    File { path: String },
    /// A token followed by the canary file path.
    FlagPlusFile { flag: String, path: String },
    /// A token followed by the canary string.
    FlagPlusString { flag: String, text: String },
}

/// A candidate command line together with the roles it was classified with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentVariant {
    shape: ArgumentShape,
    roles: RoleSet,
}

impl ArgumentVariant {
    pub fn new(shape: ArgumentShape) -> Self {
        Self {
            shape,
            roles: RoleSet::new(),
        }
    }

    pub fn none() -> Self {
        Self::new(ArgumentShape::None)
    }

    pub fn flag(flag: impl Into<String>) -> Self {
        Self::new(ArgumentShape::Flag { flag: flag.into() })
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self::new(ArgumentShape::File { path: path.into() })
    }

    pub fn flag_plus_file(flag: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(ArgumentShape::FlagPlusFile {
            flag: flag.into(),
            path: path.into(),
        })
    }

    pub fn flag_plus_string(flag: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(ArgumentShape::FlagPlusString {
            flag: flag.into(),
            text: text.into(),
        })
    }

    pub fn shape(&self) -> &ArgumentShape {
        &self.shape
    }

    pub fn roles(&self) -> &RoleSet {
        &self.roles
    }

    pub fn primary(&self) -> Option<&str> {
        match &self.shape {
            ArgumentShape::None => None,
            ArgumentShape::Flag { flag }
            | ArgumentShape::FlagPlusFile { flag, .. }
            | ArgumentShape::FlagPlusString { flag, .. } => Some(flag),
            ArgumentShape::File { path } => Some(path),
        }
    }

    pub fn secondary(&self) -> Option<&str> {
        match &self.shape {
            ArgumentShape::None | ArgumentShape::Flag { .. } | ArgumentShape::File { .. } => None,
            ArgumentShape::FlagPlusFile { path, .. } => Some(path),
            ArgumentShape::FlagPlusString { text, .. } => Some(text),
        }
    }

    /// The argv entries passed to the target after its own name.
    pub fn arguments(&self) -> Vec<&str> {
        self.primary().into_iter().chain(self.secondary()).collect()
    }

    /// The command line as one string: `primary`, or `primary secondary`.
    pub fn command_line(&self) -> String {
        match (self.primary(), self.secondary()) {
            (None, _) => String::new(),
            (Some(primary), None) => primary.to_string(),
            (Some(primary), Some(secondary)) => format!("{primary} {secondary}"),
        }
    }

    /// Name of the trace file the probe writes for this command line.
    pub fn trace_id(&self) -> String {
        match self.shape {
            ArgumentShape::None => NO_ARGUMENT_TRACE_ID.to_string(),
            _ => hex::encode_upper(self.command_line().as_bytes()),
        }
    }

    /// Derives the roles this shape earns from one oracle result.
    ///
    /// An unknown behavior hash never counts as being outside the baseline.
    pub fn classify(&self, result: &OracleResult, baseline: &BaselineSet) -> RoleSet {
        let outside_baseline = result
            .behavior_hash
            .is_some_and(|hash| !baseline.contains(hash));

        let mut roles = RoleSet::new();
        match &self.shape {
            ArgumentShape::None => {
                if result.uses_stdin {
                    roles.insert(Role::StdinEnabler);
                }
            }
            ArgumentShape::Flag { .. } => {
                if result.uses_stdin {
                    roles.insert(Role::StdinEnabler);
                }
                if outside_baseline {
                    roles.insert(Role::Flag);
                }
            }
            ArgumentShape::File { .. } | ArgumentShape::FlagPlusFile { .. } => {
                if result.touches_file {
                    roles.insert(Role::FileEnabler);
                }
            }
            ArgumentShape::FlagPlusString { .. } => {
                if outside_baseline {
                    roles.insert(Role::StringEnabler);
                }
            }
        }
        roles
    }

    /// Classifies the variant and keeps the roles on it.
    pub fn attach_roles(&mut self, result: &OracleResult, baseline: &BaselineSet) -> &RoleSet {
        self.roles = self.classify(result, baseline);
        &self.roles
    }
}

impl fmt::Display for ArgumentVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shape {
            ArgumentShape::None => f.write_str("<none>"),
            _ => f.write_str(&self.command_line()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_hash(hash: u64) -> OracleResult {
        OracleResult {
            basic_block_count: Some(10),
            behavior_hash: Some(hash),
            touches_file: false,
            exit_status: Some(0),
            timed_out: false,
            uses_stdin: false,
        }
    }

    fn baseline() -> BaselineSet {
        [100, 101].into_iter().collect()
    }

    #[test]
    fn command_line_joins_primary_and_secondary() {
        assert_eq!(ArgumentVariant::none().command_line(), "");
        assert_eq!(ArgumentVariant::flag("-v").command_line(), "-v");
        assert_eq!(
            ArgumentVariant::file("/tmp/canary.opencrs").command_line(),
            "/tmp/canary.opencrs"
        );
        assert_eq!(
            ArgumentVariant::flag_plus_file("-f", "/tmp/canary.opencrs").command_line(),
            "-f /tmp/canary.opencrs"
        );
        assert_eq!(
            ArgumentVariant::flag_plus_string("-o", "string").command_line(),
            "-o string"
        );
    }

    #[test]
    fn shape_fixes_populated_fields() {
        let none = ArgumentVariant::none();
        assert_eq!((none.primary(), none.secondary()), (None, None));
        let flag = ArgumentVariant::flag("-x");
        assert_eq!((flag.primary(), flag.secondary()), (Some("-x"), None));
        let pair = ArgumentVariant::flag_plus_string("-x", "string");
        assert_eq!(pair.arguments(), vec!["-x", "string"]);
        assert!(pair.roles().is_empty());
    }

    #[test]
    fn trace_id_is_upper_hex_of_command_line() {
        assert_eq!(ArgumentVariant::none().trace_id(), "none");
        assert_eq!(ArgumentVariant::flag("-x").trace_id(), "2D78");
        assert_eq!(
            ArgumentVariant::flag_plus_string("-x", "s").trace_id(),
            "2D782073"
        );
    }

    #[test]
    fn flag_outside_baseline_is_flag() {
        let variant = ArgumentVariant::flag("-x");
        let roles = variant.classify(&result_with_hash(200), &baseline());
        assert_eq!(roles, RoleSet::from([Role::Flag]));
    }

    #[test]
    fn flag_inside_baseline_has_no_role() {
        let variant = ArgumentVariant::flag("-v");
        assert!(variant.classify(&result_with_hash(100), &baseline()).is_empty());
    }

    #[test]
    fn unknown_hash_never_counts_as_new_behavior() {
        let mut result = result_with_hash(0);
        result.behavior_hash = None;
        assert!(ArgumentVariant::flag("-x").classify(&result, &baseline()).is_empty());
        assert!(
            ArgumentVariant::flag_plus_string("-x", "string")
                .classify(&result, &baseline())
                .is_empty()
        );
    }

    #[test]
    fn stdin_retry_marks_none_and_flag_as_stdin_enablers() {
        let mut result = result_with_hash(100);
        result.timed_out = true;
        result.uses_stdin = true;
        assert_eq!(
            ArgumentVariant::none().classify(&result, &baseline()),
            RoleSet::from([Role::StdinEnabler])
        );
        assert_eq!(
            ArgumentVariant::flag("-").classify(&result, &baseline()),
            RoleSet::from([Role::StdinEnabler])
        );
    }

    #[test]
    fn file_shapes_follow_touches_file_only() {
        let mut result = result_with_hash(999);
        assert!(ArgumentVariant::file("c").classify(&result, &baseline()).is_empty());
        result.touches_file = true;
        assert_eq!(
            ArgumentVariant::file("c").classify(&result, &baseline()),
            RoleSet::from([Role::FileEnabler])
        );
        assert_eq!(
            ArgumentVariant::flag_plus_file("-i", "c").classify(&result, &baseline()),
            RoleSet::from([Role::FileEnabler])
        );
    }

    #[test]
    fn flag_plus_string_outside_baseline_is_string_enabler() {
        let variant = ArgumentVariant::flag_plus_string("-o", "string");
        assert_eq!(
            variant.classify(&result_with_hash(300), &baseline()),
            RoleSet::from([Role::StringEnabler])
        );
    }

    #[test]
    fn attach_roles_stores_classification() {
        let mut variant = ArgumentVariant::flag("-x");
        variant.attach_roles(&result_with_hash(200), &baseline());
        assert!(variant.roles().contains(&Role::Flag));
    }

    #[test]
    fn baseline_set_keeps_first_insertion_order() {
        let mut set = BaselineSet::new();
        assert!(set.insert(7));
        assert!(set.insert(3));
        assert!(!set.insert(7));
        assert_eq!(set.hashes(), &[7, 3]);
    }
}
