//! Best-effort static screening of Python source before execution.
//!
//! A small tokenizer strips comments and string literals and tracks bracket
//! depth, which is enough to find `import` statements and bare-name calls.
//! It never fails: code that is not valid Python is screened as far as the
//! tokens allow and otherwise passes, so the interpreter reports the syntax
//! error. Dynamic tricks (attribute lookups on builtins, code hidden in
//! f-string expressions) are not caught.

use pyrelay_core::{StaticReport, Violation, ViolationRule};

/// Top-level modules that may not be imported.
pub const DENIED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "socket",
    "ctypes",
    "multiprocessing",
    "signal",
    "pty",
    "importlib",
    "pathlib",
];

/// Builtins that may not be called by bare name.
pub const DENIED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "getattr",
    "setattr",
    "delattr",
    "globals",
    "locals",
    "vars",
    "exit",
    "quit",
];

pub fn screen(code: &str) -> StaticReport {
    let tokens = tokenize(code);
    let mut violations = Vec::new();
    let mut imports: Vec<String> = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        let Tok::Name(name) = &token.tok else {
            continue;
        };
        let prev = i.checked_sub(1).map(|p| &tokens[p].tok);
        let at_stmt_start = matches!(prev, None | Some(Tok::End) | Some(Tok::Punct(':')));

        if at_stmt_start && (name == "import" || name == "from") {
            for module in imported_modules(&tokens[i..]) {
                if DENIED_MODULES.contains(&module.as_str()) {
                    violations.push(Violation {
                        rule: ViolationRule::DeniedImport,
                        message: format!(
                            "import of denylisted module `{module}` (line {})",
                            token.line
                        ),
                        name: module.clone(),
                        line: token.line,
                    });
                }
                if !imports.contains(&module) {
                    imports.push(module);
                }
            }
            continue;
        }

        let is_call = matches!(tokens.get(i + 1).map(|t| &t.tok), Some(Tok::Punct('(')));
        let bare = !matches!(prev, Some(Tok::Punct('.')))
            && !matches!(prev, Some(Tok::Name(kw)) if kw == "def" || kw == "class");
        if is_call && bare && DENIED_CALLS.contains(&name.as_str()) {
            violations.push(Violation {
                rule: ViolationRule::DeniedCall,
                name: name.clone(),
                line: token.line,
                message: format!("call to denylisted builtin `{name}` (line {})", token.line),
            });
        }
    }

    StaticReport {
        safe: violations.is_empty(),
        violations,
        imports,
        line_count: code.lines().count(),
    }
}

/// Top-level module names introduced by the statement starting at
/// `stmt[0]` (`import` or `from`). Relative imports yield nothing.
fn imported_modules(stmt: &[Token]) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = stmt.iter().skip(1).map(|t| &t.tok);
    match &stmt[0].tok {
        Tok::Name(kw) if kw == "from" => {
            if let Some(Tok::Name(first)) = rest.next() {
                out.push(first.clone());
            }
        }
        _ => {
            // import a.b as c, d
            let mut expect_module = true;
            for tok in rest {
                match tok {
                    Tok::End => break,
                    Tok::Name(n) if expect_module => {
                        out.push(n.clone());
                        expect_module = false;
                    }
                    Tok::Punct(',') => expect_module = true,
                    _ => {}
                }
            }
        }
    }
    out
}

// ── Tokenizer ──

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Punct(char),
    /// End of a logical line.
    End,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

const STRING_PREFIXES: &[&str] = &["r", "u", "b", "f", "br", "rb", "fr", "rf"];

fn tokenize(src: &str) -> Vec<Token> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    let mut line = 1;
    let mut depth: usize = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                if depth == 0 {
                    push(&mut out, Tok::End, line);
                }
                line += 1;
                i += 1;
            }
            '\\' if chars.get(i + 1) == Some(&'\n') => {
                line += 1;
                i += 2;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\'' | '"' => i = skip_string(&chars, i, &mut line),
            ';' if depth == 0 => {
                push(&mut out, Tok::End, line);
                i += 1;
            }
            '(' | '[' | '{' => {
                depth += 1;
                push(&mut out, Tok::Punct(c), line);
                i += 1;
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                push(&mut out, Tok::Punct(c), line);
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let quote_follows = matches!(chars.get(i), Some('\'') | Some('"'));
                if quote_follows && STRING_PREFIXES.contains(&word.to_ascii_lowercase().as_str()) {
                    i = skip_string(&chars, i, &mut line);
                } else {
                    push(&mut out, Tok::Name(word), line);
                }
            }
            c if c.is_ascii_digit() => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
            }
            c if c.is_whitespace() => i += 1,
            c => {
                push(&mut out, Tok::Punct(c), line);
                i += 1;
            }
        }
    }
    push(&mut out, Tok::End, line);
    out
}

fn push(out: &mut Vec<Token>, tok: Tok, line: usize) {
    // Collapse runs of line ends.
    if tok == Tok::End && matches!(out.last(), None | Some(Token { tok: Tok::End, .. })) {
        return;
    }
    out.push(Token { tok, line });
}

/// Skip a string literal whose opening quote is at `start`. Returns the
/// index just past the closing quote (or where an unterminated literal
/// gives up).
fn skip_string(chars: &[char], start: usize, line: &mut usize) -> usize {
    let quote = chars[start];
    let triple = chars.get(start + 1) == Some(&quote) && chars.get(start + 2) == Some(&quote);
    let mut i = if triple { start + 3 } else { start + 1 };
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            if chars.get(i + 1) == Some(&'\n') {
                *line += 1;
            }
            i += 2;
            continue;
        }
        if c == '\n' {
            if !triple {
                // Unterminated single-line literal; let the caller see the newline.
                return i;
            }
            *line += 1;
        }
        if c == quote {
            if !triple {
                return i + 1;
            }
            if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                return i + 3;
            }
        }
        i += 1;
    }
    chars.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(report: &StaticReport) -> Vec<(&str, usize)> {
        report
            .violations
            .iter()
            .map(|v| (v.name.as_str(), v.line))
            .collect()
    }

    #[test]
    fn plain_code_is_safe() {
        let report = screen("import math\n\nprint(math.sqrt(4))\n");
        assert!(report.safe);
        assert_eq!(report.imports, vec!["math"]);
        assert_eq!(report.line_count, 3);
    }

    #[test]
    fn denied_imports_are_flagged() {
        let report = screen("import os\nfrom subprocess import run\nimport json, shutil as sh\n");
        assert!(!report.safe);
        assert_eq!(names(&report), vec![("os", 1), ("subprocess", 2), ("shutil", 3)]);
        assert_eq!(report.violations[0].rule, ViolationRule::DeniedImport);
        assert_eq!(report.imports, vec!["os", "subprocess", "json", "shutil"]);
    }

    #[test]
    fn dotted_import_checks_top_level() {
        let report = screen("import os.path\nfrom os.path import join\n");
        assert_eq!(names(&report), vec![("os", 1), ("os", 2)]);
    }

    #[test]
    fn relative_import_is_ignored() {
        assert!(screen("from . import os\nfrom .sys import x\n").safe);
    }

    #[test]
    fn imports_after_semicolon_or_colon() {
        let report = screen("x = 1; import sys\nif True: import socket\n");
        assert_eq!(names(&report), vec![("sys", 1), ("socket", 2)]);
    }

    #[test]
    fn strings_and_comments_are_not_code() {
        let code = r#"
# import os
s = "import os; eval('1')"
t = '''
import subprocess
exec("x")
'''
u = rb'import ctypes'
print(s, t, u)
"#;
        let report = screen(code);
        assert!(report.safe, "{:?}", report.violations);
    }

    #[test]
    fn denied_calls_are_flagged_by_bare_name() {
        let code = "x = eval('1+1')\nobj.exec(1)\ndef compile(a):\n    return a\nvars()\n";
        let report = screen(code);
        assert_eq!(names(&report), vec![("eval", 1), ("vars", 5)]);
        assert!(report.violations.iter().all(|v| v.rule == ViolationRule::DeniedCall));
    }

    #[test]
    fn line_numbers_survive_multiline_constructs() {
        let code = "x = (\n    1,\n    2,\n)\ns = \"\"\"a\nb\"\"\"\nexit(0)\n";
        let report = screen(code);
        assert_eq!(names(&report), vec![("exit", 7)]);
    }

    #[test]
    fn reference_without_call_is_not_flagged() {
        let report = screen("handlers = [\n    eval,\n    exec,\n]\n");
        assert!(report.safe);
    }

    #[test]
    fn syntax_errors_pass_screening() {
        let report = screen("def broken(:\n    print('unterminated\n");
        assert!(report.safe);
        assert_eq!(report.line_count, 2);
    }

    #[test]
    fn summary_names_each_rule() {
        let report = screen("import os\neval('1')\n");
        let summary = report.violation_summary().unwrap();
        assert!(summary.contains("`os`"));
        assert!(summary.contains("`eval`"));
    }
}
