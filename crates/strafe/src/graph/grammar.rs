//! Runtime-loaded PEG engine.
//!
//! All of the textual front-end (pass sources, the frame-graph file, the
//! preprocessor and the baked-data format) is driven by grammar files read
//! from disk at startup, not by parsers hardwired into the code. A grammar
//! file is a list of PEG rules:
//!
//! ```text
//! # comment
//! Rule       <- Sub ('+' Sub)*
//! Sub        <- < [0-9]+ >
//! %whitespace <- [ \t\r\n]*
//! ```
//!
//! Supported expressions: sequences, ordered choice `/`, repetition `* + ?`,
//! predicates `& !`, groups `(...)`, token captures `<...>`, literals in
//! single or double quotes, character classes `[a-z_]` (with `^` negation),
//! and the any-character dot.
//!
//! Matching produces a tree of [`ParseNode`]s, one per named rule reference.
//! Semantic passes walk that tree; the engine itself attaches no actions.
//!
//! If a `%whitespace` rule is present it is skipped before every terminal,
//! except inside token captures, which always match the input exactly.

use ahash::AHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("grammar error at offset {offset}: {message}")]
pub struct GrammarError {
    pub offset: usize,
    pub message: String,
}

/// Parse failure, reported at the furthest position the matcher reached.
#[derive(Debug, Clone, Error)]
#[error("syntax error at line {line}, column {column}")]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
enum Expr {
    Seq(Vec<Expr>),
    Choice(Vec<Expr>),
    Star(Box<Expr>),
    Plus(Box<Expr>),
    Opt(Box<Expr>),
    And(Box<Expr>),
    Not(Box<Expr>),
    Capture(Box<Expr>),
    Literal(String),
    /// Ranges plus negation flag.
    Class(Vec<(char, char)>, bool),
    Any,
    Rule(usize),
}

#[derive(Debug)]
struct RuleDef {
    name: String,
    expr: Expr,
}

/// A compiled grammar. The first rule in the file is the start rule.
#[derive(Debug)]
pub struct Grammar {
    rules: Vec<RuleDef>,
    whitespace: Option<usize>,
    start: usize,
}

/// One matched named rule.
#[derive(Debug, Clone)]
pub struct ParseNode {
    pub rule: usize,
    pub start: usize,
    pub end: usize,
    /// Span of the first `<...>` capture inside this rule's own body.
    pub token: Option<(usize, usize)>,
    /// Index of the alternative that matched, when the rule body is a choice.
    pub choice: usize,
    pub children: Vec<ParseNode>,
}

impl ParseNode {
    /// The matched text with surrounding whitespace trimmed.
    pub fn raw<'s>(&self, src: &'s str) -> &'s str {
        src[self.start..self.end].trim()
    }

    /// The captured token if the rule has one, the trimmed match otherwise.
    pub fn token_text<'s>(&self, src: &'s str) -> &'s str {
        match self.token {
            Some((start, end)) => &src[start..end],
            None => self.raw(src),
        }
    }

    pub fn is(&self, grammar: &Grammar, name: &str) -> bool {
        grammar.rule_name(self.rule) == name
    }

    /// First direct child produced by the named rule.
    pub fn find<'a>(&'a self, grammar: &Grammar, name: &str) -> Option<&'a ParseNode> {
        self.children.iter().find(|child| child.is(grammar, name))
    }

    /// All direct children produced by the named rule, in match order.
    pub fn all<'a>(&'a self, grammar: &'a Grammar, name: &'a str) -> impl Iterator<Item = &'a ParseNode> {
        self.children.iter().filter(move |child| child.is(grammar, name))
    }
}

pub fn line_column(src: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut column = 1;
    for (index, ch) in src.char_indices() {
        if index >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

impl Grammar {
    /// Compiles a grammar from its textual form.
    pub fn parse(text: &str) -> Result<Grammar, GrammarError> {
        let mut reader = GrammarReader::new(text);
        let mut rules = Vec::new();
        let mut pending: Vec<(String, RawExpr)> = Vec::new();

        loop {
            reader.skip_trivia();
            if reader.at_end() {
                break;
            }

            let name = reader.read_rule_name()?;
            reader.skip_trivia();
            reader.expect("<-")?;
            let expr = reader.read_expression()?;
            pending.push((name, expr));
        }

        if pending.is_empty() {
            return Err(GrammarError {
                offset: 0,
                message: "grammar defines no rules".into(),
            });
        }

        let mut index = AHashMap::new();
        for (position, (name, _)) in pending.iter().enumerate() {
            if index.insert(name.clone(), position).is_some() {
                return Err(GrammarError {
                    offset: 0,
                    message: format!("rule `{name}` is defined twice"),
                });
            }
        }

        for (name, raw) in pending {
            let expr = resolve(raw, &index)?;
            rules.push(RuleDef { name, expr });
        }

        let whitespace = index.get("%whitespace").copied();
        let start = if rules[0].name == "%whitespace" && rules.len() > 1 {
            1
        } else {
            0
        };

        Ok(Grammar {
            rules,
            whitespace,
            start,
        })
    }

    pub fn rule_name(&self, rule: usize) -> &str {
        &self.rules[rule].name
    }

    pub fn rule_id(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|rule| rule.name == name)
    }

    /// Matches the entire input against the start rule.
    pub fn run(&self, input: &str) -> Result<ParseNode, SyntaxError> {
        let mut matcher = Matcher {
            grammar: self,
            input,
            farthest: 0,
        };

        let result = matcher.match_rule(self.start, 0, false);

        let end = result.as_ref().map(|node| {
            // Allow trailing whitespace after the last rule
            matcher.skip_ws(node.end)
        });

        match (result, end) {
            (Some(node), Some(end)) if end == input.len() => Ok(node),
            _ => {
                let offset = matcher.farthest;
                let (line, column) = line_column(input, offset);
                Err(SyntaxError {
                    line,
                    column,
                    offset,
                })
            }
        }
    }
}

// --- Matching

struct Matcher<'a> {
    grammar: &'a Grammar,
    input: &'a str,
    farthest: usize,
}

struct NodeSink<'n> {
    children: &'n mut Vec<ParseNode>,
    token: &'n mut Option<(usize, usize)>,
}

impl<'a> Matcher<'a> {
    fn match_rule(&mut self, rule: usize, pos: usize, in_capture: bool) -> Option<ParseNode> {
        let mut node = ParseNode {
            rule,
            start: pos,
            end: pos,
            token: None,
            choice: 0,
            children: Vec::new(),
        };

        let grammar = self.grammar;
        let expr = &grammar.rules[rule].expr;
        let end = match expr {
            Expr::Choice(alternatives) => {
                let mut matched = None;
                for (alternative_index, alternative) in alternatives.iter().enumerate() {
                    let mut sink = NodeSink {
                        children: &mut node.children,
                        token: &mut node.token,
                    };
                    if let Some(end) = self.match_expr(alternative, pos, &mut sink, in_capture, false) {
                        node.choice = alternative_index;
                        matched = Some(end);
                        break;
                    }
                    node.children.clear();
                    node.token = None;
                }
                matched?
            }
            expr => {
                let mut sink = NodeSink {
                    children: &mut node.children,
                    token: &mut node.token,
                };
                self.match_expr(expr, pos, &mut sink, in_capture, false)?
            }
        };

        node.end = end;
        Some(node)
    }

    fn match_expr(
        &mut self,
        expr: &Expr,
        pos: usize,
        sink: &mut NodeSink,
        in_capture: bool,
        in_predicate: bool,
    ) -> Option<usize> {
        match expr {
            Expr::Seq(items) => {
                let mut current = pos;
                let rewind_children = sink.children.len();
                for item in items {
                    match self.match_expr(item, current, sink, in_capture, in_predicate) {
                        Some(next) => current = next,
                        None => {
                            sink.children.truncate(rewind_children);
                            return None;
                        }
                    }
                }
                Some(current)
            }
            Expr::Choice(alternatives) => {
                for alternative in alternatives {
                    let rewind_children = sink.children.len();
                    if let Some(end) =
                        self.match_expr(alternative, pos, sink, in_capture, in_predicate)
                    {
                        return Some(end);
                    }
                    sink.children.truncate(rewind_children);
                }
                None
            }
            Expr::Star(inner) => {
                let mut current = pos;
                loop {
                    let rewind_children = sink.children.len();
                    match self.match_expr(inner, current, sink, in_capture, in_predicate) {
                        Some(next) if next > current => current = next,
                        Some(_) => break, // zero-length match, stop
                        None => {
                            sink.children.truncate(rewind_children);
                            break;
                        }
                    }
                }
                Some(current)
            }
            Expr::Plus(inner) => {
                let first = self.match_expr(inner, pos, sink, in_capture, in_predicate)?;
                self.match_expr(&Expr::Star((*inner).clone()), first, sink, in_capture, in_predicate)
            }
            Expr::Opt(inner) => {
                let rewind_children = sink.children.len();
                match self.match_expr(inner, pos, sink, in_capture, in_predicate) {
                    Some(end) => Some(end),
                    None => {
                        sink.children.truncate(rewind_children);
                        Some(pos)
                    }
                }
            }
            Expr::And(inner) => {
                let mut scratch_children = Vec::new();
                let mut scratch_token = None;
                let mut scratch = NodeSink {
                    children: &mut scratch_children,
                    token: &mut scratch_token,
                };
                self.match_expr(inner, pos, &mut scratch, in_capture, true)
                    .map(|_| pos)
            }
            Expr::Not(inner) => {
                let mut scratch_children = Vec::new();
                let mut scratch_token = None;
                let mut scratch = NodeSink {
                    children: &mut scratch_children,
                    token: &mut scratch_token,
                };
                match self.match_expr(inner, pos, &mut scratch, in_capture, true) {
                    Some(_) => None,
                    None => Some(pos),
                }
            }
            Expr::Capture(inner) => {
                let start = if in_capture { pos } else { self.skip_ws(pos) };
                let end = self.match_expr(inner, start, sink, true, in_predicate)?;
                if sink.token.is_none() && !in_predicate {
                    *sink.token = Some((start, end));
                }
                Some(end)
            }
            Expr::Literal(text) => {
                let start = if in_capture { pos } else { self.skip_ws(pos) };
                if self.input[start..].starts_with(text.as_str()) {
                    Some(start + text.len())
                } else {
                    self.record_failure(start, in_predicate);
                    None
                }
            }
            Expr::Class(ranges, negated) => {
                let start = if in_capture { pos } else { self.skip_ws(pos) };
                let ch = match self.input[start..].chars().next() {
                    Some(ch) => ch,
                    None => {
                        self.record_failure(start, in_predicate);
                        return None;
                    }
                };
                let inside = ranges.iter().any(|&(lo, hi)| ch >= lo && ch <= hi);
                if inside != *negated {
                    Some(start + ch.len_utf8())
                } else {
                    self.record_failure(start, in_predicate);
                    None
                }
            }
            Expr::Any => {
                let start = if in_capture { pos } else { self.skip_ws(pos) };
                match self.input[start..].chars().next() {
                    Some(ch) => Some(start + ch.len_utf8()),
                    None => {
                        self.record_failure(start, in_predicate);
                        None
                    }
                }
            }
            Expr::Rule(rule) => {
                if Some(*rule) == self.grammar.whitespace {
                    return Some(self.skip_ws(pos));
                }
                let node = self.match_rule(*rule, pos, in_capture)?;
                let end = node.end;
                if !in_predicate {
                    sink.children.push(node);
                }
                Some(end)
            }
        }
    }

    fn skip_ws(&mut self, pos: usize) -> usize {
        let grammar = self.grammar;
        let Some(whitespace) = grammar.whitespace else {
            return pos;
        };
        let expr = &grammar.rules[whitespace].expr;
        let mut scratch_children = Vec::new();
        let mut scratch_token = None;
        let mut scratch = NodeSink {
            children: &mut scratch_children,
            token: &mut scratch_token,
        };
        // The whitespace rule matches "inside a capture" so it can't recurse
        // into whitespace skipping, and "inside a predicate" so its internal
        // failures never surface as the reported error position.
        self.match_expr(expr, pos, &mut scratch, true, true)
            .unwrap_or(pos)
    }

    fn record_failure(&mut self, pos: usize, in_predicate: bool) {
        if !in_predicate && pos > self.farthest {
            self.farthest = pos;
        }
    }
}

// --- Grammar text reading

/// Expression as read from the grammar text: rule references are still stored
/// by name, smuggled inside a `Literal` with a `\u{1}` prefix. `resolve`
/// rewrites them into `Expr::Rule` indices once all rules are known.
type RawExpr = Expr;

#[derive(Debug)]
struct GrammarReader<'a> {
    text: &'a str,
    pos: usize,
}

fn resolve(expr: RawExpr, index: &AHashMap<String, usize>) -> Result<Expr, GrammarError> {
    Ok(match expr {
        Expr::Seq(items) => Expr::Seq(
            items
                .into_iter()
                .map(|item| resolve(item, index))
                .collect::<Result<_, _>>()?,
        ),
        Expr::Choice(items) => Expr::Choice(
            items
                .into_iter()
                .map(|item| resolve(item, index))
                .collect::<Result<_, _>>()?,
        ),
        Expr::Star(inner) => Expr::Star(Box::new(resolve(*inner, index)?)),
        Expr::Plus(inner) => Expr::Plus(Box::new(resolve(*inner, index)?)),
        Expr::Opt(inner) => Expr::Opt(Box::new(resolve(*inner, index)?)),
        Expr::And(inner) => Expr::And(Box::new(resolve(*inner, index)?)),
        Expr::Not(inner) => Expr::Not(Box::new(resolve(*inner, index)?)),
        Expr::Capture(inner) => Expr::Capture(Box::new(resolve(*inner, index)?)),
        Expr::Literal(name) if name.starts_with('\u{1}') => {
            let name = &name[1..];
            let id = index.get(name).ok_or_else(|| GrammarError {
                offset: 0,
                message: format!("reference to undefined rule `{name}`"),
            })?;
            Expr::Rule(*id)
        }
        other => other,
    })
}

impl<'a> GrammarReader<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn error(&self, message: impl Into<String>) -> GrammarError {
        GrammarError {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(ch) if ch.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(ch) = self.bump() {
                        if ch == '\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn expect(&mut self, text: &str) -> Result<(), GrammarError> {
        if self.text[self.pos..].starts_with(text) {
            self.pos += text.len();
            Ok(())
        } else {
            Err(self.error(format!("expected `{text}`")))
        }
    }

    fn read_rule_name(&mut self) -> Result<String, GrammarError> {
        let mut name = String::new();
        if self.peek() == Some('%') {
            name.push(self.bump().unwrap());
        }
        match self.peek() {
            Some(ch) if ch.is_ascii_alphabetic() || ch == '_' => {}
            _ => return Err(self.error("expected rule name")),
        }
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                name.push(ch);
                self.bump();
            } else {
                break;
            }
        }
        Ok(name)
    }

    fn read_expression(&mut self) -> Result<RawExpr, GrammarError> {
        let mut alternatives = vec![self.read_sequence()?];
        loop {
            self.skip_trivia();
            if self.peek() == Some('/') {
                self.bump();
                alternatives.push(self.read_sequence()?);
            } else {
                break;
            }
        }
        Ok(if alternatives.len() == 1 {
            alternatives.pop().unwrap()
        } else {
            Expr::Choice(alternatives)
        })
    }

    fn read_sequence(&mut self) -> Result<RawExpr, GrammarError> {
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None | Some('/') | Some(')') | Some('>') => break,
                Some(ch) if ch.is_ascii_alphabetic() || ch == '_' || ch == '%' => {
                    // An identifier followed by `<-` starts the next rule
                    let rewind = self.pos;
                    let name = self.read_rule_name()?;
                    self.skip_trivia();
                    if self.text[self.pos..].starts_with("<-") {
                        self.pos = rewind;
                        break;
                    }
                    let reference = Expr::Literal(format!("\u{1}{name}"));
                    items.push(self.read_postfix(reference)?);
                }
                _ => {
                    let item = self.read_prefixed()?;
                    items.push(item);
                }
            }
        }
        if items.is_empty() {
            return Err(self.error("empty sequence"));
        }
        Ok(if items.len() == 1 {
            items.pop().unwrap()
        } else {
            Expr::Seq(items)
        })
    }

    fn read_prefixed(&mut self) -> Result<RawExpr, GrammarError> {
        match self.peek() {
            Some('&') => {
                self.bump();
                let inner = self.read_prefixed()?;
                Ok(Expr::And(Box::new(inner)))
            }
            Some('!') => {
                self.bump();
                let inner = self.read_prefixed()?;
                Ok(Expr::Not(Box::new(inner)))
            }
            _ => {
                let primary = self.read_primary()?;
                self.read_postfix(primary)
            }
        }
    }

    fn read_postfix(&mut self, inner: RawExpr) -> Result<RawExpr, GrammarError> {
        Ok(match self.peek() {
            Some('*') => {
                self.bump();
                Expr::Star(Box::new(inner))
            }
            Some('+') => {
                self.bump();
                Expr::Plus(Box::new(inner))
            }
            Some('?') => {
                self.bump();
                Expr::Opt(Box::new(inner))
            }
            _ => inner,
        })
    }

    fn read_primary(&mut self) -> Result<RawExpr, GrammarError> {
        match self.peek() {
            Some('(') => {
                self.bump();
                let inner = self.read_expression()?;
                self.skip_trivia();
                self.expect(")")?;
                Ok(inner)
            }
            Some('<') => {
                self.bump();
                let inner = self.read_expression()?;
                self.skip_trivia();
                self.expect(">")?;
                Ok(Expr::Capture(Box::new(inner)))
            }
            Some('\'') | Some('"') => self.read_literal(),
            Some('[') => self.read_class(),
            Some('.') => {
                self.bump();
                Ok(Expr::Any)
            }
            Some(ch) if ch.is_ascii_alphabetic() || ch == '_' || ch == '%' => {
                let name = self.read_rule_name()?;
                Ok(Expr::Literal(format!("\u{1}{name}")))
            }
            _ => Err(self.error("expected expression")),
        }
    }

    fn read_literal(&mut self) -> Result<RawExpr, GrammarError> {
        let quote = self.bump().unwrap();
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated literal")),
                Some(ch) if ch == quote => break,
                Some('\\') => value.push(self.read_escape()?),
                Some(ch) => value.push(ch),
            }
        }
        Ok(Expr::Literal(value))
    }

    fn read_class(&mut self) -> Result<RawExpr, GrammarError> {
        self.bump(); // '['
        let negated = if self.peek() == Some('^') {
            self.bump();
            true
        } else {
            false
        };

        let mut ranges = Vec::new();
        loop {
            let lo = match self.bump() {
                None => return Err(self.error("unterminated character class")),
                Some(']') => break,
                Some('\\') => self.read_escape()?,
                Some(ch) => ch,
            };
            if self.peek() == Some('-') && !self.text[self.pos + 1..].starts_with(']') {
                self.bump();
                let hi = match self.bump() {
                    None => return Err(self.error("unterminated character class")),
                    Some('\\') => self.read_escape()?,
                    Some(ch) => ch,
                };
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
        Ok(Expr::Class(ranges, negated))
    }

    fn read_escape(&mut self) -> Result<char, GrammarError> {
        Ok(match self.bump() {
            Some('n') => '\n',
            Some('r') => '\r',
            Some('t') => '\t',
            Some('0') => '\0',
            Some(ch) => ch,
            None => return Err(self.error("dangling escape")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_GRAMMAR: &str = r"
        # sum of integers
        Sum  <- Int ('+' Int)*
        Int  <- < '-'? [0-9]+ >
        %whitespace <- [ \t\r\n]*
    ";

    #[test]
    fn matches_and_collects_children() {
        let grammar = Grammar::parse(LIST_GRAMMAR).unwrap();
        let src = " 1 + 23+-4 ";
        let root = grammar.run(src).unwrap();

        assert!(root.is(&grammar, "Sum"));
        let values: Vec<&str> = root
            .all(&grammar, "Int")
            .map(|node| node.token_text(src))
            .collect();
        assert_eq!(values, ["1", "23", "-4"]);
    }

    #[test]
    fn whitespace_never_joins_tokens() {
        let grammar = Grammar::parse(LIST_GRAMMAR).unwrap();
        // "1 2" is not a valid sum: the first Int must not absorb the second
        assert!(grammar.run("1 2").is_err());
    }

    #[test]
    fn reports_furthest_failure_position() {
        let grammar = Grammar::parse(LIST_GRAMMAR).unwrap();
        let err = grammar.run("1 +\n+ 2").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 1);
    }

    #[test]
    fn choice_index_is_recorded() {
        let grammar = Grammar::parse(
            r"
            Value <- Word / Int
            Word  <- < [a-z]+ >
            Int   <- < [0-9]+ >
            Kind  <- 'a' / 'b'
        ",
        )
        .unwrap();

        let root = grammar.run("hello").unwrap();
        assert_eq!(root.choice, 0);
        let root = grammar.run("42").unwrap();
        assert_eq!(root.choice, 1);
    }

    #[test]
    fn captures_are_exact_inside_whitespace_grammars() {
        let grammar = Grammar::parse(
            r"
            Doc  <- 'src' Body
            Body <- '<[' < (!']>' .)* > ']>'
            %whitespace <- [ \t\r\n]*
        ",
        )
        .unwrap();

        // Leading whitespace is skipped before the capture opens; everything
        // from there to the terminator is preserved exactly
        let src = "src <[ a b\n c ]>";
        let root = grammar.run(src).unwrap();
        let body = root.find(&grammar, "Body").unwrap();
        assert_eq!(body.token_text(src), "a b\n c ");
    }

    #[test]
    fn predicates_do_not_consume() {
        let grammar = Grammar::parse(
            r"
            Tagged <- &'x' Word
            Word   <- < [a-z]+ >
        ",
        )
        .unwrap();

        let root = grammar.run("xyz").unwrap();
        assert_eq!(root.find(&grammar, "Word").unwrap().token_text("xyz"), "xyz");
        assert!(grammar.run("abc").is_err());
    }

    #[test]
    fn negated_class() {
        let grammar = Grammar::parse("Line <- < [^\\n]* > '\\n'").unwrap();
        let src = "abc def\n";
        let root = grammar.run(src).unwrap();
        assert_eq!(root.token_text(src), "abc def");
    }

    #[test]
    fn undefined_rule_reference_is_an_error() {
        let err = Grammar::parse("A <- B").unwrap_err();
        assert!(err.message.contains("undefined rule"));
    }
}
