//! Runner Expressions
//!
//! A runner expression names an execution backend and carries an opaque
//! argument string for it:
//!
//! ```text
//! SimpleJobRunner
//! SimpleJobRunner(nslots=8)
//! GEJobRunner(-q all.q -pe smp.pe 8)
//! ```
//!
//! The argument string may not contain unescaped parentheses. It is kept
//! verbatim; only the backend interprets it.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::config::ConfigError;

/// Execution backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Child process of the dispatching process
    Local,
    /// Batch job on a Grid Engine cluster
    Cluster,
}

impl BackendKind {
    /// Canonical runner identifier written back into settings text.
    pub fn identifier(self) -> &'static str {
        match self {
            BackendKind::Local => "SimpleJobRunner",
            BackendKind::Cluster => "GEJobRunner",
        }
    }

    fn from_identifier(name: &str) -> Option<Self> {
        match name {
            "SimpleJobRunner" | "local" => Some(BackendKind::Local),
            "GEJobRunner" | "cluster" => Some(BackendKind::Cluster),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Cluster => write!(f, "cluster"),
        }
    }
}

/// A resolved backend plus its submission arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerSpec {
    kind: BackendKind,
    args: String,
}

impl RunnerSpec {
    pub fn new(kind: BackendKind, args: impl Into<String>) -> Self {
        Self {
            kind,
            args: args.into(),
        }
    }

    /// Local backend with no arguments.
    pub fn local() -> Self {
        Self::new(BackendKind::Local, "")
    }

    /// Cluster backend with the given submission options.
    pub fn cluster(args: impl Into<String>) -> Self {
        Self::new(BackendKind::Cluster, args)
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// The verbatim argument string.
    pub fn args(&self) -> &str {
        &self.args
    }

    /// Whitespace-separated arguments with `\(` and `\)` unescaped.
    pub fn arg_list(&self) -> Vec<String> {
        self.args
            .split_whitespace()
            .map(|arg| arg.replace("\\(", "(").replace("\\)", ")"))
            .collect()
    }
}

impl FromStr for RunnerSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let invalid = |reason: &str| ConfigError::InvalidRunner {
            expr: s.to_string(),
            reason: reason.to_string(),
        };

        let (name, args) = match text.find('(') {
            Some(open) => {
                let Some(inner) = text[open + 1..].strip_suffix(')') else {
                    return Err(invalid("missing closing parenthesis"));
                };
                (text[..open].trim_end(), inner)
            }
            None => (text, ""),
        };

        if name.is_empty() {
            return Err(invalid("missing runner name"));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("runner name must be an identifier"));
        }
        if has_unescaped_paren(args) {
            return Err(invalid("unescaped parenthesis in arguments"));
        }

        let kind = BackendKind::from_identifier(name).ok_or_else(|| ConfigError::UnknownBackend {
            name: name.to_string(),
        })?;

        Ok(Self::new(kind, args))
    }
}

fn has_unescaped_paren(args: &str) -> bool {
    let mut escaped = false;
    for c in args.chars() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '(' | ')' => return true,
            _ => {}
        }
    }
    false
}

impl fmt::Display for RunnerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.kind.identifier())
        } else {
            write!(f, "{}({})", self.kind.identifier(), self.args)
        }
    }
}

impl Serialize for RunnerSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_identifier() {
        let spec: RunnerSpec = "SimpleJobRunner".parse().unwrap();
        assert_eq!(spec, RunnerSpec::local());

        let spec: RunnerSpec = "GEJobRunner".parse().unwrap();
        assert_eq!(spec.kind(), BackendKind::Cluster);
        assert_eq!(spec.args(), "");
    }

    #[test]
    fn test_parse_with_arguments() {
        let spec: RunnerSpec = "GEJobRunner(-pe smp.pe 8)".parse().unwrap();
        assert_eq!(spec.kind(), BackendKind::Cluster);
        assert_eq!(spec.args(), "-pe smp.pe 8");
        assert_eq!(spec.arg_list(), vec!["-pe", "smp.pe", "8"]);
    }

    #[test]
    fn test_parse_kind_aliases() {
        assert_eq!("local".parse::<RunnerSpec>().unwrap(), RunnerSpec::local());
        assert_eq!(
            "cluster(-q all.q)".parse::<RunnerSpec>().unwrap(),
            RunnerSpec::cluster("-q all.q")
        );
    }

    #[test]
    fn test_round_trip_keeps_kind_and_args() {
        for text in [
            "SimpleJobRunner",
            "SimpleJobRunner(nslots=8)",
            "GEJobRunner(-pe smp.pe 8)",
            "GEJobRunner(-q all.q -l h_rt=24:00:00)",
            "GEJobRunner(-N job\\(1\\))",
        ] {
            let spec: RunnerSpec = text.parse().unwrap();
            let reparsed: RunnerSpec = spec.to_string().parse().unwrap();
            assert_eq!(reparsed.kind(), spec.kind(), "kind changed for '{}'", text);
            assert_eq!(reparsed.args(), spec.args(), "args changed for '{}'", text);
            assert_eq!(spec.to_string(), text);
        }
    }

    #[test]
    fn test_escaped_parentheses_unescaped_in_arg_list() {
        let spec: RunnerSpec = "GEJobRunner(-N job\\(1\\))".parse().unwrap();
        assert_eq!(spec.args(), "-N job\\(1\\)");
        assert_eq!(spec.arg_list(), vec!["-N", "job(1)"]);
    }

    #[test]
    fn test_unknown_backend() {
        let result = "PBSJobRunner(-q batch)".parse::<RunnerSpec>();
        assert!(matches!(
            result,
            Err(ConfigError::UnknownBackend { ref name }) if name == "PBSJobRunner"
        ));
    }

    #[test]
    fn test_malformed_expressions() {
        for text in [
            "",
            "GEJobRunner(-pe smp.pe 8",
            "GEJobRunner(-pe (smp) 8)",
            "GEJobRunner)",
            "(-q all.q)",
            "GE Job Runner",
            "GEJobRunner(a)b",
        ] {
            assert!(
                matches!(text.parse::<RunnerSpec>(), Err(ConfigError::InvalidRunner { .. })),
                "'{}' should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_serialize_as_expression() {
        let json = serde_json::to_string(&RunnerSpec::cluster("-pe smp.pe 8")).unwrap();
        assert_eq!(json, "\"GEJobRunner(-pe smp.pe 8)\"");
    }
}
