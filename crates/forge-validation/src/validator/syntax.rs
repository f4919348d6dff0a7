use super::{Validator, elapsed_ms};
use crate::source::{SourceFile, load_sources_blocking};
use async_trait::async_trait;
use core::iter::Peekable;
use core::str::Chars;
use forge_core::stage::SYNTAX_VALIDATION;
use forge_core::{Config, Result, RunContext, ValidationResult};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Toolchain-independent syntax check.
///
/// Scans every source file for balanced `()`, `[]` and `{}` while skipping
/// string literals and comments. Comment and string rules follow the file
/// extension. Reported errors carry the `syntax error` marker so diagnostics
/// classify them as such.
pub struct SyntaxValidator {
    config: Arc<Config>,
}

impl SyntaxValidator {
    /// Create a syntax validator.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

/// First structural problem found in a file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SyntaxIssue {
    line: usize,
    column: usize,
    message: String,
}

/// What a single quote opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SingleQuote {
    /// Character literal (`'x'`, `'\n'`); a lone quote is a lifetime or label
    Char,
    /// String delimiter, like `"`
    String,
    /// String only when the closing quote sits on the same line
    SameLine,
}

/// Lexing rules for one family of source languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools, reason = "Independent lexing switches")]
struct Lexicon {
    /// `//` line comments and `/* */` block comments
    slash_comments: bool,
    /// `#` line comments
    hash_comments: bool,
    single_quote: SingleQuote,
    /// Backtick literals, which may span lines
    backticks: bool,
    /// Backslash escapes inside backtick literals (templates, not raw strings)
    backtick_escapes: bool,
    /// Triple-quoted literals spanning lines
    triple_quotes: bool,
}

impl Lexicon {
    const GO: Self = Self {
        slash_comments: true,
        hash_comments: false,
        single_quote: SingleQuote::Char,
        backticks: true,
        backtick_escapes: false,
        triple_quotes: false,
    };

    const C_FAMILY: Self = Self {
        backticks: false,
        ..Self::GO
    };

    const SCRIPT: Self = Self {
        slash_comments: true,
        hash_comments: false,
        single_quote: SingleQuote::String,
        backticks: true,
        backtick_escapes: true,
        triple_quotes: false,
    };

    const PYTHON: Self = Self {
        slash_comments: false,
        hash_comments: true,
        single_quote: SingleQuote::String,
        backticks: false,
        backtick_escapes: false,
        triple_quotes: true,
    };

    const HASH: Self = Self {
        triple_quotes: false,
        ..Self::PYTHON
    };

    const PHP: Self = Self {
        slash_comments: true,
        ..Self::HASH
    };

    const GENERIC: Self = Self {
        slash_comments: true,
        hash_comments: false,
        single_quote: SingleQuote::SameLine,
        backticks: false,
        backtick_escapes: false,
        triple_quotes: false,
    };

    /// Rules for a file extension; unknown extensions get a permissive default.
    fn for_extension(extension: &str) -> Self {
        match extension.to_ascii_lowercase().as_str() {
            "go" => Self::GO,
            "rs" | "c" | "h" | "cc" | "cpp" | "cxx" | "hpp" | "java" | "kt" | "kts" | "cs"
            | "swift" | "scala" | "dart" => Self::C_FAMILY,
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" | "mts" | "cts" => Self::SCRIPT,
            "py" | "pyw" | "pyi" => Self::PYTHON,
            "rb" | "sh" | "bash" | "zsh" | "pl" | "r" | "toml" | "yaml" | "yml" | "ex" | "exs" => {
                Self::HASH
            }
            "php" => Self::PHP,
            _ => Self::GENERIC,
        }
    }

    fn for_path(path: &Path) -> Self {
        path.extension()
            .and_then(OsStr::to_str)
            .map_or(Self::GENERIC, Self::for_extension)
    }
}

/// Tracks the position of the scanner within a file.
struct Cursor<'src> {
    chars: Peekable<Chars<'src>>,
    line: usize,
    column: usize,
}

impl<'src> Cursor<'src> {
    fn new(contents: &'src str) -> Self {
        Self {
            chars: contents.chars().peekable(),
            line: 1,
            column: 0,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let next = self.chars.next()?;
        if next == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(next)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn skip_line(&mut self) {
        while self.peek().is_some_and(|next| next != '\n') {
            self.bump();
        }
    }

    /// Skip to the end of a quoted literal; false when it never closes.
    fn skip_quoted(&mut self, quote: char, multiline: bool, escapes: bool) -> bool {
        while let Some(next) = self.bump() {
            match next {
                '\\' if escapes => {
                    self.bump();
                }
                '\n' if !multiline => return false,
                _ if next == quote => return true,
                _ => {}
            }
        }
        false
    }

    /// Whether the next two characters repeat `quote`.
    fn at_triple(&self, quote: char) -> bool {
        let mut lookahead = self.chars.clone();
        lookahead.next() == Some(quote) && lookahead.next() == Some(quote)
    }

    /// Skip the rest of a triple-quoted literal; false when it never closes.
    fn skip_triple(&mut self, quote: char) -> bool {
        self.bump();
        self.bump();
        let mut run = 0;
        while let Some(next) = self.bump() {
            match next {
                '\\' => {
                    self.bump();
                    run = 0;
                }
                _ if next == quote => {
                    run += 1;
                    if run == 3 {
                        return true;
                    }
                }
                _ => run = 0,
            }
        }
        false
    }

    /// Skip a character literal, or leave a lone quote (lifetime, label) alone.
    fn skip_char_literal(&mut self) {
        let mut lookahead = self.chars.clone();
        let looks_like_literal = match lookahead.next() {
            Some('\\') => true,
            Some(_) => lookahead.next() == Some('\''),
            None => false,
        };
        if looks_like_literal {
            self.skip_quoted('\'', false, true);
        }
    }

    /// Skip a single-quoted string that closes on this line, or leave the quote alone.
    fn skip_same_line_quote(&mut self) {
        let mut lookahead = self.chars.clone();
        let mut closes = false;
        while let Some(next) = lookahead.next() {
            match next {
                '\\' => {
                    lookahead.next();
                }
                '\n' => break,
                '\'' => {
                    closes = true;
                    break;
                }
                _ => {}
            }
        }
        if closes {
            self.skip_quoted('\'', false, true);
        }
    }
}

const fn closing(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn issue(line: usize, column: usize, message: impl Into<String>) -> SyntaxIssue {
    SyntaxIssue {
        line,
        column,
        message: message.into(),
    }
}

fn scan(contents: &str, lexicon: Lexicon) -> Option<SyntaxIssue> {
    let mut cursor = Cursor::new(contents);
    let mut open: Vec<(char, usize, usize)> = Vec::new();

    while let Some(current) = cursor.bump() {
        let (line, column) = (cursor.line, cursor.column);
        match current {
            '/' if lexicon.slash_comments && cursor.peek() == Some('/') => cursor.skip_line(),
            '/' if lexicon.slash_comments && cursor.peek() == Some('*') => {
                cursor.bump();
                let mut previous = '\0';
                let mut closed = false;
                while let Some(next) = cursor.bump() {
                    if previous == '*' && next == '/' {
                        closed = true;
                        break;
                    }
                    previous = next;
                }
                if !closed {
                    return Some(issue(line, column, "unterminated block comment"));
                }
            }
            '#' if lexicon.hash_comments => cursor.skip_line(),
            '"' | '\'' if lexicon.triple_quotes && cursor.at_triple(current) => {
                if !cursor.skip_triple(current) {
                    return Some(issue(line, column, "unterminated string literal"));
                }
            }
            '"' => {
                if !cursor.skip_quoted('"', false, true) {
                    return Some(issue(line, column, "unterminated string literal"));
                }
            }
            '`' if lexicon.backticks => {
                if !cursor.skip_quoted('`', true, lexicon.backtick_escapes) {
                    return Some(issue(line, column, "unterminated raw string literal"));
                }
            }
            '\'' => match lexicon.single_quote {
                SingleQuote::Char => cursor.skip_char_literal(),
                SingleQuote::SameLine => cursor.skip_same_line_quote(),
                SingleQuote::String => {
                    if !cursor.skip_quoted('\'', false, true) {
                        return Some(issue(line, column, "unterminated string literal"));
                    }
                }
            },
            '(' | '[' | '{' => open.push((current, line, column)),
            ')' | ']' | '}' => match open.pop() {
                Some((opener, _, _)) if closing(opener) == current => {}
                Some((opener, open_line, open_column)) => {
                    return Some(issue(
                        line,
                        column,
                        format!(
                            "unexpected '{current}', expected '{}' to close '{opener}' at {open_line}:{open_column}",
                            closing(opener)
                        ),
                    ));
                }
                None => return Some(issue(line, column, format!("unexpected '{current}'"))),
            },
            _ => {}
        }
    }

    open.pop()
        .map(|(opener, line, column)| issue(line, column, format!("unclosed '{opener}'")))
}

fn check_file(source: &SourceFile, result: &mut ValidationResult) {
    if source.contents.trim().is_empty() {
        result.push_warning(format!("{}: empty source file", source.display()));
        return;
    }
    if let Some(found) = scan(&source.contents, Lexicon::for_path(&source.relative)) {
        result.push_error(format!(
            "{}:{}:{}: syntax error: {}",
            source.display(),
            found.line,
            found.column,
            found.message
        ));
    }
}

#[async_trait]
impl Validator for SyntaxValidator {
    fn name(&self) -> &str {
        SYNTAX_VALIDATION
    }

    fn supports_async(&self) -> bool {
        false
    }

    async fn validate(&self, ctx: &RunContext, project: &Path) -> Result<ValidationResult> {
        ctx.check()?;
        let start = Instant::now();
        let sources = load_sources_blocking(project, &self.config).await?;

        let mut result = ValidationResult::passed().with_files_checked(sources.len());
        for source in &sources {
            check_file(source, &mut result);
        }

        tracing::debug!(
            "Syntax scan of {} files found {} errors",
            sources.len(),
            result.errors.len()
        );

        Ok(result.with_duration_ms(elapsed_ms(start)))
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test code is allowed to use expect and unwrap"
)]
mod tests {
    use super::*;
    use core::time::Duration;
    use forge_core::CancelToken;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_balanced_source_has_no_issue() {
        let source = r#"package main

import "fmt"

// main prints a greeting { not a brace
func main() {
    values := []int{1, 2, 3}
    fmt.Println("closing ) inside a string", values[0], '}')
    /* block { comment */
    raw := `multi
line {`
    _ = raw
}
"#;
        assert_eq!(scan(source, Lexicon::GO), None);
    }

    #[test]
    fn test_unclosed_brace_is_reported() {
        let found = scan("func main() {\n    run()\n", Lexicon::GO).expect("issue");
        assert_eq!(found.line, 1);
        assert_eq!(found.message, "unclosed '{'");
    }

    #[test]
    fn test_mismatched_closer_is_reported() {
        let found = scan("func main() {\n    fmt.Println(\"x\"\n}\n", Lexicon::GO).expect("issue");
        assert_eq!(found.line, 3);
        assert!(found.message.starts_with("unexpected '}'"));
    }

    #[test]
    fn test_unterminated_string_is_reported() {
        let found = scan("x := \"open\ny := 1\n", Lexicon::GO).expect("issue");
        assert_eq!(found.message, "unterminated string literal");
    }

    #[test]
    fn test_lifetimes_are_not_char_literals() {
        assert_eq!(
            scan("fn first<'a>(items: &'a [u8]) -> &'a u8 { &items[0] }", Lexicon::C_FAMILY),
            None
        );
    }

    #[test]
    fn test_single_quoted_script_strings() {
        let lexicon = Lexicon::for_extension("js");
        assert_eq!(scan("const s = 'open {';\n", lexicon), None);
        assert_eq!(
            scan("const t = `${a} {`;\nconst u = 'it\\'s [';\n", lexicon),
            None
        );
        let found = scan("const s = 'open;\n", lexicon).expect("issue");
        assert_eq!(found.message, "unterminated string literal");
    }

    #[test]
    fn test_hash_comments_and_triple_quotes() {
        let lexicon = Lexicon::for_extension("py");
        assert_eq!(scan("x = 1  # see [note\n", lexicon), None);
        assert_eq!(
            scan("def f():\n    '''Doc with ( paren\n    over lines'''\n    return {'k': [1]}\n", lexicon),
            None
        );
        assert_eq!(scan("url = 'http://host/path'  # (\n", lexicon), None);
        let found = scan("items = [1, 2\n", lexicon).expect("issue");
        assert_eq!(found.message, "unclosed '['");
    }

    #[test]
    fn test_unknown_extension_accepts_same_line_quotes() {
        let lexicon = Lexicon::for_path(Path::new("server.unknownlang"));
        assert_eq!(lexicon, Lexicon::GENERIC);
        assert_eq!(scan("say('open {')\n", lexicon), None);
        assert_eq!(scan("don't (stop)\n", lexicon), None);
    }

    #[tokio::test]
    async fn test_errors_carry_syntax_marker() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("main.go"), "package main\nfunc main() {\n")?;
        fs::write(dir.path().join("empty.go"), "\n")?;

        let ctx = RunContext::new(CancelToken::new(), Duration::from_secs(5));
        let result = SyntaxValidator::new(Arc::new(Config::default()))
            .validate(&ctx, dir.path())
            .await?;

        assert!(!result.success);
        assert_eq!(result.files_checked, 2);
        assert_eq!(result.errors, vec!["main.go:2:13: syntax error: unclosed '{'".to_owned()]);
        assert_eq!(result.warnings, vec!["empty.go: empty source file".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_mixed_language_project_passes() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("index.js"), "const greeting = 'hello {';\nexport { greeting };\n")?;
        fs::write(dir.path().join("tool.py"), "# handler for [items\ndef run():\n    return 'a ('\n")?;

        let mut config = Config::default();
        config.toolchain.source_extensions = vec!["js".to_owned(), "py".to_owned()];
        let ctx = RunContext::new(CancelToken::new(), Duration::from_secs(5));
        let result = SyntaxValidator::new(Arc::new(config))
            .validate(&ctx, dir.path())
            .await?;

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.files_checked, 2);
        Ok(())
    }
}
