//! Immutable result value types for completed subprocesses

use std::fmt;

use serde_json::Value;

/// Result of a terminated subprocess: exit code plus captured output.
///
/// The exit code is an `i32` by construction, so the "exit code must be an
/// integer" contract is enforced by the type system rather than a runtime
/// check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    exitcode: i32,
    stdout: Option<String>,
    stderr: Option<String>,
    cmdline: Option<Vec<String>>,
}

impl ProcessResult {
    /// Create a new result value
    pub fn new(
        exitcode: i32,
        stdout: Option<String>,
        stderr: Option<String>,
        cmdline: Option<Vec<String>>,
    ) -> Self {
        Self {
            exitcode,
            stdout,
            stderr,
            cmdline,
        }
    }

    /// Process exit code
    pub fn exitcode(&self) -> i32 {
        self.exitcode
    }

    /// Captured stdout, if any was produced
    pub fn stdout(&self) -> Option<&str> {
        self.stdout.as_deref()
    }

    /// Captured stderr, if any was produced
    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }

    /// The command line the process was started with, kept for diagnostics
    pub fn cmdline(&self) -> Option<&[String]> {
        self.cmdline.as_deref()
    }
}

impl fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cmdline) = &self.cmdline {
            writeln!(f, " Command Line: {cmdline:?}")?;
        }
        writeln!(f, " Exitcode: {}", self.exitcode)?;
        if self.stdout.is_some() || self.stderr.is_some() {
            writeln!(f, " Process Output:")?;
        }
        if let Some(stdout) = &self.stdout {
            writeln!(f, "   >>>>> STDOUT >>>>>\n{}\n   <<<<< STDOUT <<<<<", stdout.trim_end())?;
        }
        if let Some(stderr) = &self.stderr {
            writeln!(f, "   >>>>> STDERR >>>>>\n{}\n   <<<<< STDERR <<<<<", stderr.trim_end())?;
        }
        Ok(())
    }
}

/// Result of a CLI-style invocation: a [`ProcessResult`] plus the captured
/// stdout decoded as JSON when it parses.
///
/// Equality against foreign values compares the parsed JSON when present and
/// the raw stdout otherwise, which keeps test assertions short:
///
/// ```
/// use saltern_process::ShellResult;
///
/// let res = ShellResult::new(0, Some("foo".into()), None, None, None);
/// assert!(res == "foo");
/// ```
#[derive(Debug, Clone)]
pub struct ShellResult {
    exitcode: i32,
    stdout: Option<String>,
    stderr: Option<String>,
    json: Option<Value>,
    cmdline: Option<Vec<String>>,
}

impl ShellResult {
    /// Create a new shell result value
    pub fn new(
        exitcode: i32,
        stdout: Option<String>,
        stderr: Option<String>,
        json: Option<Value>,
        cmdline: Option<Vec<String>>,
    ) -> Self {
        Self {
            exitcode,
            stdout,
            stderr,
            json,
            cmdline,
        }
    }

    /// Build a shell result from a process result, attempting to decode the
    /// captured stdout as JSON.
    pub fn from_process_result(result: ProcessResult) -> Self {
        let json = result
            .stdout()
            .and_then(|stdout| serde_json::from_str(stdout).ok());
        Self {
            exitcode: result.exitcode,
            stdout: result.stdout,
            stderr: result.stderr,
            json,
            cmdline: result.cmdline,
        }
    }

    /// Process exit code
    pub fn exitcode(&self) -> i32 {
        self.exitcode
    }

    /// Captured stdout, if any was produced
    pub fn stdout(&self) -> Option<&str> {
        self.stdout.as_deref()
    }

    /// Captured stderr, if any was produced
    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }

    /// Captured stdout decoded as JSON, when parseable
    pub fn json(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    /// The command line the process was started with, kept for diagnostics
    pub fn cmdline(&self) -> Option<&[String]> {
        self.cmdline.as_deref()
    }
}

impl PartialEq<Value> for ShellResult {
    fn eq(&self, other: &Value) -> bool {
        match &self.json {
            Some(json) => json == other,
            None => other.as_str() == self.stdout.as_deref(),
        }
    }
}

impl PartialEq<str> for ShellResult {
    fn eq(&self, other: &str) -> bool {
        match &self.json {
            Some(json) => json.as_str() == Some(other),
            None => self.stdout.as_deref() == Some(other),
        }
    }
}

impl PartialEq<&str> for ShellResult {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

impl PartialEq<String> for ShellResult {
    fn eq(&self, other: &String) -> bool {
        self == other.as_str()
    }
}

impl fmt::Display for ShellResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cmdline) = &self.cmdline {
            writeln!(f, " Command Line: {cmdline:?}")?;
        }
        writeln!(f, " Exitcode: {}", self.exitcode)?;
        if self.stdout.is_some() || self.stderr.is_some() {
            writeln!(f, " Process Output:")?;
        }
        if let Some(stdout) = &self.stdout {
            writeln!(f, "   >>>>> STDOUT >>>>>\n{}\n   <<<<< STDOUT <<<<<", stdout.trim_end())?;
        }
        if let Some(stderr) = &self.stderr {
            writeln!(f, "   >>>>> STDERR >>>>>\n{}\n   <<<<< STDERR <<<<<", stderr.trim_end())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exitcode_round_trips() {
        for code in [-1, 0, 1, 2, 127, 255] {
            let result = ProcessResult::new(code, None, None, None);
            assert_eq!(result.exitcode(), code);
        }
    }

    #[test]
    fn shell_result_compares_against_stdout_without_json() {
        let result = ShellResult::new(0, Some("foo".into()), Some(String::new()), None, None);
        assert!(result == "foo");
        assert!(result != "bar");
    }

    #[test]
    fn shell_result_prefers_json_when_present() {
        let result = ShellResult::new(
            0,
            Some("foo".into()),
            Some(String::new()),
            Some(json!({"a": 1})),
            None,
        );
        assert!(result == json!({"a": 1}));
        assert!(result != "foo");
    }

    #[test]
    fn from_process_result_decodes_json_stdout() {
        let proc = ProcessResult::new(0, Some("{\"a\": 1}".into()), None, None);
        let shell = ShellResult::from_process_result(proc);
        assert_eq!(shell.json(), Some(&json!({"a": 1})));
    }

    #[test]
    fn from_process_result_tolerates_non_json_stdout() {
        let proc = ProcessResult::new(0, Some("not json".into()), None, None);
        let shell = ShellResult::from_process_result(proc);
        assert!(shell.json().is_none());
        assert!(shell == "not json");
    }

    #[test]
    fn display_includes_output_blocks() {
        let result = ProcessResult::new(
            1,
            Some("out".into()),
            Some("err".into()),
            Some(vec!["prog".into(), "--flag".into()]),
        );
        let rendered = result.to_string();
        assert!(rendered.contains("Exitcode: 1"));
        assert!(rendered.contains(">>>>> STDOUT >>>>>"));
        assert!(rendered.contains(">>>>> STDERR >>>>>"));
        assert!(rendered.contains("prog"));
    }
}
