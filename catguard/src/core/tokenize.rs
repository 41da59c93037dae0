//! POSIX-ish shell word splitting.
//!
//! This is smaller than a real shell: it only needs to find the programs and
//! path arguments inside a proposed command so guardrails can inspect them. It
//! never expands variables, globs, or command substitutions.
//!
//! [`tokenize`] is the plain word splitter. [`lex`] additionally recognizes
//! control operators (`;`, newline, `&&`, `||`, `|`, `|&`, `&`, `(`, `)`) and
//! redirections even when they touch neighbouring words, and [`segments`]
//! groups the result into simple commands.

/// What a lexed token is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    /// Control operator ending a simple command.
    Operator,
    /// Redirection operator such as `>`, `2>>`, `&>` or `<<`.
    Redirect,
}

/// A shell word plus whether any part of it was quoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub quoted: bool,
    pub kind: TokenKind,
}

impl Token {
    fn operator(text: &str) -> Self {
        Self {
            text: text.to_string(),
            quoted: false,
            kind: TokenKind::Operator,
        }
    }

    /// True for unquoted control operators that end a simple command.
    pub fn is_separator(&self) -> bool {
        self.kind == TokenKind::Operator
    }
}

/// Split `command` into words.
///
/// - Unquoted whitespace separates words.
/// - Single quotes copy their contents verbatim.
/// - Inside double quotes only `\"`, `\\` and `\$` are escapes; any other
///   backslash sequence keeps the backslash.
/// - Outside quotes a backslash escapes the next character.
pub fn tokenize(command: &str) -> Vec<String> {
    Lexer::new(false)
        .run(command)
        .into_iter()
        .map(|token| token.text)
        .collect()
}

/// Same quoting rules as [`tokenize`], with operators and redirections split
/// into their own tokens.
///
/// A backslash-newline outside quotes is a line continuation. An unquoted `#`
/// at the start of a word comments out the rest of the line.
pub fn lex(command: &str) -> Vec<Token> {
    Lexer::new(true).run(command)
}

struct Lexer {
    operators: bool,
    tokens: Vec<Token>,
    current: String,
    in_word: bool,
    quoted: bool,
}

impl Lexer {
    fn new(operators: bool) -> Self {
        Self {
            operators,
            tokens: Vec::new(),
            current: String::new(),
            in_word: false,
            quoted: false,
        }
    }

    fn flush(&mut self) {
        if self.in_word {
            self.tokens.push(Token {
                text: std::mem::take(&mut self.current),
                quoted: self.quoted,
                kind: TokenKind::Word,
            });
        }
        self.in_word = false;
        self.quoted = false;
    }

    fn push_operator(&mut self, text: &str) {
        self.flush();
        self.tokens.push(Token::operator(text));
    }

    fn run(mut self, command: &str) -> Vec<Token> {
        let mut chars = command.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '\'' => {
                    self.in_word = true;
                    self.quoted = true;
                    for inner in chars.by_ref() {
                        if inner == '\'' {
                            break;
                        }
                        self.current.push(inner);
                    }
                }
                '"' => {
                    self.in_word = true;
                    self.quoted = true;
                    while let Some(inner) = chars.next() {
                        match inner {
                            '"' => break,
                            '\\' => match chars.peek() {
                                Some(&next @ ('"' | '\\' | '$')) => {
                                    self.current.push(next);
                                    chars.next();
                                }
                                _ => self.current.push('\\'),
                            },
                            other => self.current.push(other),
                        }
                    }
                }
                '\\' => match chars.next() {
                    Some('\n') if self.operators => {}
                    Some(next) => {
                        self.in_word = true;
                        self.current.push(next);
                    }
                    None => {
                        self.in_word = true;
                        self.current.push('\\');
                    }
                },
                '\n' if self.operators => self.push_operator("\n"),
                c if c.is_whitespace() => self.flush(),
                _ if !self.operators => {
                    self.in_word = true;
                    self.current.push(ch);
                }
                '#' if !self.in_word => {
                    while chars.next_if(|&next| next != '\n').is_some() {}
                }
                ';' => self.push_operator(";"),
                '&' if chars.peek() == Some(&'>') => {
                    self.flush();
                    let mut op = String::from("&>");
                    chars.next();
                    if chars.next_if_eq(&'>').is_some() {
                        op.push('>');
                    }
                    self.push_redirect(op);
                }
                '&' => {
                    if chars.next_if_eq(&'&').is_some() {
                        self.push_operator("&&");
                    } else {
                        self.push_operator("&");
                    }
                }
                '|' => {
                    if chars.next_if_eq(&'|').is_some() {
                        self.push_operator("||");
                    } else if chars.next_if_eq(&'&').is_some() {
                        self.push_operator("|&");
                    } else {
                        self.push_operator("|");
                    }
                }
                '(' if self.in_word && self.current.ends_with('$') => {
                    self.current.push('(');
                    let mut depth = 1;
                    for inner in chars.by_ref() {
                        self.current.push(inner);
                        match inner {
                            '(' => depth += 1,
                            ')' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                '(' => self.push_operator("("),
                ')' => self.push_operator(")"),
                '`' => {
                    self.in_word = true;
                    self.current.push('`');
                    for inner in chars.by_ref() {
                        self.current.push(inner);
                        if inner == '`' {
                            break;
                        }
                    }
                }
                '<' | '>' => {
                    let fd_prefix = self.in_word
                        && !self.quoted
                        && !self.current.is_empty()
                        && self.current.chars().all(|c| c.is_ascii_digit());
                    let mut op = if fd_prefix {
                        let digits = std::mem::take(&mut self.current);
                        self.in_word = false;
                        digits
                    } else {
                        self.flush();
                        String::new()
                    };
                    op.push(ch);
                    let follow: &[char] = if ch == '>' {
                        &['>', '|', '&']
                    } else {
                        &['<', '&', '>']
                    };
                    if let Some(next) = chars.next_if(|c| follow.contains(c)) {
                        op.push(next);
                        if op.ends_with("<<")
                            && let Some(extra) = chars.next_if(|&c| c == '<' || c == '-')
                        {
                            op.push(extra);
                        }
                    }
                    self.push_redirect(op);
                }
                other => {
                    self.in_word = true;
                    self.current.push(other);
                }
            }
        }

        self.flush();
        self.tokens
    }

    fn push_redirect(&mut self, op: String) {
        self.tokens.push(Token {
            text: op,
            quoted: false,
            kind: TokenKind::Redirect,
        });
    }
}

/// A redirection and the word it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub op: String,
    pub target: Token,
}

impl Redirect {
    /// True if this redirection opens `target` for writing.
    ///
    /// `>&N` and `>&-` duplicate or close a descriptor and write nothing.
    pub fn writes_file(&self) -> bool {
        if !self.op.contains('>') {
            return false;
        }
        let dup = self.op.ends_with('&') && !self.op.starts_with('&');
        let target = self.target.text.as_str();
        !(dup && (target == "-" || target.chars().all(|c| c.is_ascii_digit())))
    }
}

/// One simple command: leading `NAME=value` assignments, redirections, and the
/// remaining words with wrapper programs (`sudo`, `env`, `xargs`, ...) removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub assignments: Vec<(String, String)>,
    pub words: Vec<Token>,
    pub redirects: Vec<Redirect>,
}

impl Segment {
    /// The command name (first word after assignments and wrappers), if any.
    pub fn program(&self) -> Option<&str> {
        self.words.first().map(|token| token.text.as_str())
    }

    /// Arguments after the command name.
    pub fn args(&self) -> &[Token] {
        self.words.get(1..).unwrap_or(&[])
    }

    pub fn assignment(&self, name: &str) -> Option<&str> {
        self.assignments
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Split a token stream into simple commands at unquoted control operators.
pub fn segments(tokens: &[Token]) -> Vec<Segment> {
    let mut out = Vec::new();
    for group in tokens.split(Token::is_separator) {
        let mut words = Vec::new();
        let mut redirects = Vec::new();
        let mut iter = group.iter();
        while let Some(token) = iter.next() {
            if token.kind != TokenKind::Redirect {
                words.push(token.clone());
                continue;
            }
            if let Some(target) = iter.next() {
                redirects.push(Redirect {
                    op: token.text.clone(),
                    target: target.clone(),
                });
            }
        }
        if words.is_empty() && redirects.is_empty() {
            continue;
        }

        let mut assignments = Vec::new();
        let mut start = take_assignments(&words, 0, &mut assignments);
        while let Some(next) = skip_wrapper(&words, start, &mut assignments) {
            start = next;
        }
        out.push(Segment {
            assignments,
            words: words.split_off(start.min(words.len())),
            redirects,
        });
    }
    out
}

/// Collect `NAME=value` words from `start`; returns the index after them.
fn take_assignments(
    words: &[Token],
    mut start: usize,
    assignments: &mut Vec<(String, String)>,
) -> usize {
    while let Some(pair) = words.get(start).and_then(parse_assignment) {
        assignments.push(pair);
        start += 1;
    }
    start
}

/// Options that take a separate argument, per wrapper program.
fn wrapper_options(program: &str) -> Option<&'static [&'static str]> {
    Some(match program {
        "sudo" | "doas" => &["-u", "-g", "-h", "-p", "-C", "-U", "-r", "-t", "-D", "-T", "-R"],
        "env" => &["-u", "-C", "-S", "--unset", "--chdir", "--split-string"],
        "xargs" => &["-I", "-n", "-L", "-d", "-P", "-a", "-E", "-s", "--max-args", "--delimiter"],
        "timeout" => &["-s", "-k", "--signal", "--kill-after"],
        "nice" => &["-n", "--adjustment"],
        "exec" => &["-a"],
        "stdbuf" | "ionice" => &["-i", "-o", "-e", "-c", "-n"],
        "command" | "builtin" | "nohup" | "time" | "then" | "else" | "elif" | "do" | "if"
        | "while" | "until" | "!" | "{" => &[],
        _ => return None,
    })
}

/// If `words[start]` is a wrapper, return the index of the wrapped command.
fn skip_wrapper(
    words: &[Token],
    start: usize,
    assignments: &mut Vec<(String, String)>,
) -> Option<usize> {
    let first = words.get(start)?;
    if first.quoted {
        return None;
    }
    let program = first.text.rsplit('/').next().unwrap_or(&first.text);
    let takes_arg = wrapper_options(program)?;
    let mut index = start + 1;
    while let Some(token) = words.get(index) {
        let text = token.text.as_str();
        if token.quoted || !text.starts_with('-') || text == "-" {
            break;
        }
        index += 1;
        if text == "--" {
            break;
        }
        // `command -v rm` only looks the name up.
        if program == "command" && matches!(text, "-v" | "-V") {
            return Some(words.len());
        }
        if takes_arg.contains(&text) {
            index += 1;
        }
    }
    if program == "env" {
        index = take_assignments(words, index, assignments);
    }
    if program == "timeout" && words.get(index).is_some() {
        index += 1;
    }
    Some(index)
}

fn parse_assignment(token: &Token) -> Option<(String, String)> {
    let (name, value) = token.text.split_once('=')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

/// True if `text` still contains shell expansion that cannot be resolved statically.
pub fn has_unresolved_expansion(text: &str) -> bool {
    text.contains('$') || text.contains('`')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programs(command: &str) -> Vec<String> {
        segments(&lex(command))
            .iter()
            .map(|segment| segment.program().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn empty_input_yields_no_tokens() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   \t ").is_empty());
    }

    #[test]
    fn splits_on_unquoted_whitespace() {
        assert_eq!(tokenize("rm  -rf\t/tmp/x"), vec!["rm", "-rf", "/tmp/x"]);
    }

    #[test]
    fn tokenize_leaves_operators_inside_words() {
        assert_eq!(tokenize("a&&b c|d"), vec!["a&&b", "c|d"]);
    }

    #[test]
    fn single_quotes_are_verbatim() {
        assert_eq!(
            tokenize(r#"echo 'a \" b $HOME'"#),
            vec!["echo", r#"a \" b $HOME"#]
        );
    }

    #[test]
    fn double_quotes_process_three_escapes_only() {
        assert_eq!(
            tokenize(r#"echo "q\" b\\ d\$ n\n""#),
            vec!["echo", r#"q" b\ d$ n\n"#]
        );
    }

    #[test]
    fn adjacent_quoted_spans_join_one_word() {
        assert_eq!(tokenize(r#"a"b c"'d e'f"#), vec!["ab cd ef"]);
    }

    #[test]
    fn tokenize_is_repeatable() {
        let command = r#"CAT_AGENT_ID=s/subagents/x rm -rf "dir with space" && ls"#;
        assert_eq!(tokenize(command), tokenize(command));
    }

    #[test]
    fn lex_marks_quoted_operators() {
        let tokens = lex(r#"echo ">" > out"#);
        assert_eq!(tokens[1].kind, TokenKind::Word);
        assert!(tokens[1].quoted);
        assert_eq!(tokens[2].kind, TokenKind::Redirect);
    }

    #[test]
    fn segments_split_on_operators_and_strip_assignments() {
        let tokens = lex("cd /a && CAT_AGENT_ID=s/subagents/x rm -rf b; echo done | tee log");
        let segs = segments(&tokens);
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0].program(), Some("cd"));
        assert_eq!(segs[1].program(), Some("rm"));
        assert_eq!(segs[1].assignment("CAT_AGENT_ID"), Some("s/subagents/x"));
        assert_eq!(segs[2].program(), Some("echo"));
        assert_eq!(segs[3].program(), Some("tee"));
    }

    #[test]
    fn glued_operators_split_segments() {
        assert_eq!(programs("true&&rm -rf x"), vec!["true", "rm"]);
        assert_eq!(programs("false||rm -rf x"), vec!["false", "rm"]);
        assert_eq!(programs("echo|rm -rf x"), vec!["echo", "rm"]);
        assert_eq!(programs("make|&tee log"), vec!["make", "tee"]);
        assert_eq!(programs("sleep 1&rm -rf x"), vec!["sleep", "rm"]);
        assert_eq!(programs("ls;rm -rf x"), vec!["ls", "rm"]);
        assert_eq!(programs("(rm -rf x)"), vec!["rm"]);
        assert_eq!(programs("ls\nrm -rf x"), vec!["ls", "rm"]);
    }

    #[test]
    fn line_continuation_and_comments() {
        let segs = segments(&lex("rm -rf \\\n  build # && ls"));
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].args().len(), 2);
        assert_eq!(programs("# rm -rf x\nls"), vec!["ls"]);
    }

    #[test]
    fn command_substitution_stays_in_one_word() {
        let segs = segments(&lex("rm -rf $(pwd)/out"));
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].args()[1].text, "$(pwd)/out");
        let segs = segments(&lex("rm -rf `git rev-parse --show-toplevel`"));
        assert_eq!(segs[0].args()[1].text, "`git rev-parse --show-toplevel`");
    }

    #[test]
    fn redirects_are_split_from_words() {
        let segs = segments(&lex("echo x>out 2>>err 2>&1 <in"));
        assert_eq!(segs[0].words.len(), 2);
        let redirects: Vec<(&str, &str)> = segs[0]
            .redirects
            .iter()
            .map(|r| (r.op.as_str(), r.target.text.as_str()))
            .collect();
        assert_eq!(
            redirects,
            vec![(">", "out"), ("2>>", "err"), ("2>&", "1"), ("<", "in")]
        );
        let writes: Vec<bool> = segs[0].redirects.iter().map(Redirect::writes_file).collect();
        assert_eq!(writes, vec![true, true, false, false]);
    }

    #[test]
    fn all_output_redirect_forms_write() {
        let segs = segments(&lex("make &>all &>>more >|clobber"));
        assert!(segs[0].redirects.iter().all(Redirect::writes_file));
        assert_eq!(segs[0].redirects.len(), 3);
    }

    #[test]
    fn quoted_separator_does_not_split() {
        let segs = segments(&lex(r#"echo "a && b""#));
        assert_eq!(segs.len(), 1);
        let segs = segments(&lex("echo 'x>y'"));
        assert!(segs[0].redirects.is_empty());
    }

    #[test]
    fn wrappers_are_looked_through() {
        assert_eq!(programs("sudo -u root rm -rf x"), vec!["rm"]);
        assert_eq!(programs("command rm -rf x"), vec!["rm"]);
        assert_eq!(programs("xargs -n 1 rm -rf"), vec!["rm"]);
        assert_eq!(programs("timeout -s KILL 10 rm -rf x"), vec!["rm"]);
        assert_eq!(programs("if true; then rm -rf x; fi"), vec!["true", "rm", "fi"]);
        assert_eq!(programs("command -v rm"), vec![""]);

        let segs = segments(&lex("env -i CAT_AGENT_ID=a/subagents/b /bin/rm -r x"));
        assert_eq!(segs[0].program(), Some("/bin/rm"));
        assert_eq!(segs[0].assignment("CAT_AGENT_ID"), Some("a/subagents/b"));
    }

    #[test]
    fn unresolved_expansion_detection() {
        assert!(has_unresolved_expansion("$HOME/x"));
        assert!(has_unresolved_expansion("`pwd`/x"));
        assert!(!has_unresolved_expansion("/plain/path"));
    }
}
