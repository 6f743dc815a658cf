//! Static security policy for analysis code
//!
//! Code is screened before any child process exists: a syntax sanity
//! pass, an import walk against a forbidden set, a call walk against
//! forbidden built-ins, and a regex scan for textual patterns that evade
//! the structural checks.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::types::SandboxError;

/// Modules that grant OS, network, serialization-execution, database, or
/// provider-SDK access.
const FORBIDDEN_IMPORTS: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "urllib",
    "requests",
    "http",
    "ftplib",
    "pickle",
    "shelve",
    "dbm",
    "marshal",
    "sqlite3",
    "psycopg2",
    "pymongo",
    "boto3",
    "azure",
    "google",
    "openai",
    "anthropic",
];

/// Built-ins that reach outside the computation or enable reflection.
const FORBIDDEN_CALLS: &[&str] = &[
    "exec",
    "eval",
    "compile",
    "open",
    "input",
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
    "globals",
    "locals",
    "vars",
    "exit",
    "quit",
    "__import__",
    "breakpoint",
];

/// Textual escapes the structural checks can miss.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (r"__import__\s*\(", "dynamic import"),
    (r"importlib", "dynamic import"),
    (r"\.__class__", "class reflection"),
    (r"\.__bases__", "class reflection"),
    (r"\.__subclasses__", "class reflection"),
    (r"\.__globals__", "frame reflection"),
    (r"\.__dict__", "attribute reflection"),
    (r"\bgetattr\s*\(", "attribute reflection"),
    (r"\bsetattr\s*\(", "attribute reflection"),
];

/// Outcome of the static screen: either a fatal policy error or a pass
/// with advisory warnings.
#[derive(Debug, Clone, Default)]
pub struct PolicyReport {
    pub warnings: Vec<String>,
}

fn forbidden_imports() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| FORBIDDEN_IMPORTS.iter().copied().collect())
}

fn forbidden_calls() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| FORBIDDEN_CALLS.iter().copied().collect())
}

fn import_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:import|from)\s+([A-Za-z_][A-Za-z0-9_.]*)").expect("static regex")
    })
}

fn call_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[^\w.])([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("static regex")
    })
}

fn danger_patterns() -> &'static Vec<(Regex, &'static str)> {
    static RES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RES.get_or_init(|| {
        DANGEROUS_PATTERNS
            .iter()
            .map(|(pattern, label)| (Regex::new(pattern).expect("static regex"), *label))
            .collect()
    })
}

/// Screen `code` against the full static policy.
pub fn check(code: &str) -> Result<PolicyReport, SandboxError> {
    let stripped = strip_literals(code);

    check_syntax(&stripped)?;

    for capture in import_pattern().captures_iter(&stripped) {
        let module = &capture[1];
        let root = module.split('.').next().unwrap_or(module);
        if forbidden_imports().contains(root) {
            return Err(SandboxError::ForbiddenImport(root.to_string()));
        }
    }

    for capture in call_pattern().captures_iter(&stripped) {
        let name = &capture[1];
        if forbidden_calls().contains(name) {
            return Err(SandboxError::ForbiddenCall(name.to_string()));
        }
    }

    // Scan the raw code: literals can smuggle payloads into exec-like
    // sinks, so they are not exempt here.
    for (pattern, label) in danger_patterns() {
        if let Some(found) = pattern.find(code) {
            return Err(SandboxError::DangerousPattern(format!(
                "{} ({})",
                label,
                found.as_str().trim()
            )));
        }
    }

    let mut report = PolicyReport::default();
    if stripped.contains("while True") {
        report
            .warnings
            .push("unbounded loop: execution relies on the wall-clock limit".to_string());
    }
    Ok(report)
}

/// Structural sanity: balanced brackets and terminated string literals.
/// Gross malformation is rejected here; finer syntax errors surface from
/// the interpreter itself.
fn check_syntax(stripped: &str) -> Result<(), SandboxError> {
    if stripped.contains('\u{0}') {
        return Err(SandboxError::InvalidSyntax(
            "NUL byte in source".to_string(),
        ));
    }
    let mut stack = Vec::new();
    for (line_no, line) in stripped.lines().enumerate() {
        for ch in line.chars() {
            match ch {
                '(' | '[' | '{' => stack.push((ch, line_no + 1)),
                ')' | ']' | '}' => {
                    let expected = match ch {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        _ => {
                            return Err(SandboxError::InvalidSyntax(format!(
                                "unmatched '{}' on line {}",
                                ch,
                                line_no + 1
                            )))
                        }
                    }
                }
                _ => {}
            }
        }
    }
    if let Some((open, line)) = stack.pop() {
        return Err(SandboxError::InvalidSyntax(format!(
            "unclosed '{}' opened on line {}",
            open, line
        )));
    }
    Ok(())
}

/// Replace string literal contents and comments with spaces so they do
/// not confuse the structural scans. Quotes and newlines are preserved.
fn strip_literals(code: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        Single(char),
        Triple(char),
        Comment,
    }

    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut state = State::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match state {
            State::Code => {
                if c == '#' {
                    state = State::Comment;
                    out.push(' ');
                } else if c == '"' || c == '\'' {
                    if i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c {
                        state = State::Triple(c);
                        out.push_str("\"\"\"");
                        i += 2;
                    } else {
                        state = State::Single(c);
                        out.push('"');
                    }
                } else {
                    out.push(c);
                }
            }
            State::Single(quote) => {
                if c == '\\' {
                    out.push(' ');
                    if i + 1 < chars.len() {
                        out.push(if chars[i + 1] == '\n' { '\n' } else { ' ' });
                        i += 1;
                    }
                } else if c == quote {
                    state = State::Code;
                    out.push('"');
                } else if c == '\n' {
                    // Unterminated single-quoted string; the interpreter
                    // will reject it, keep scanning.
                    state = State::Code;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::Triple(quote) => {
                if c == quote && i + 2 < chars.len() && chars[i + 1] == quote && chars[i + 2] == quote
                {
                    state = State::Code;
                    out.push_str("\"\"\"");
                    i += 2;
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::Comment => {
                if c == '\n' {
                    state = State::Code;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_analysis_code_passes() {
        let code = "import pandas as pd\nimport numpy as np\n\ndf = pd.DataFrame({'a': [1, 2]})\nprint(df.describe())\n";
        let report = check(code).unwrap();
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn rejects_forbidden_import() {
        let err = check("import os\nos.listdir('/')").unwrap_err();
        assert!(matches!(err, SandboxError::ForbiddenImport(ref m) if m == "os"));
    }

    #[test]
    fn rejects_from_import_of_submodule() {
        let err = check("from subprocess import run").unwrap_err();
        assert!(matches!(err, SandboxError::ForbiddenImport(ref m) if m == "subprocess"));
    }

    #[test]
    fn rejects_dotted_forbidden_root() {
        let err = check("import urllib.request").unwrap_err();
        assert!(matches!(err, SandboxError::ForbiddenImport(ref m) if m == "urllib"));
    }

    #[test]
    fn rejects_forbidden_calls() {
        assert!(matches!(
            check("eval('1+1')").unwrap_err(),
            SandboxError::ForbiddenCall(ref c) if c == "eval"
        ));
        assert!(matches!(
            check("x = open('/etc/passwd')").unwrap_err(),
            SandboxError::ForbiddenCall(ref c) if c == "open"
        ));
    }

    #[test]
    fn method_calls_are_not_confused_with_builtins() {
        // df.eval is a pandas method, not the builtin.
        let code = "import pandas as pd\ndf = pd.DataFrame()\ndf.eval('a + b')";
        assert!(check(code).is_ok());
    }

    #[test]
    fn rejects_reflection_patterns() {
        assert!(matches!(
            check("().__class__.__bases__").unwrap_err(),
            SandboxError::DangerousPattern(_)
        ));
        assert!(matches!(
            check("__import__('os')").unwrap_err(),
            SandboxError::DangerousPattern(_) | SandboxError::ForbiddenCall(_)
        ));
    }

    #[test]
    fn literals_do_not_trigger_import_checks() {
        let code = "print('import os is forbidden')";
        assert!(check(code).is_ok());
    }

    #[test]
    fn unbalanced_brackets_are_invalid_syntax() {
        assert!(matches!(
            check("print((1, 2)").unwrap_err(),
            SandboxError::InvalidSyntax(_)
        ));
        assert!(matches!(
            check("x = [1, 2))").unwrap_err(),
            SandboxError::InvalidSyntax(_)
        ));
    }

    #[test]
    fn unbounded_loop_warns_but_passes() {
        let report = check("while True:\n    pass\n").unwrap();
        assert_eq!(report.warnings.len(), 1);
    }
}
