//! Token-level parser combinators.
//!
//! The automatic undo grammar is data, not code: every primitive is a
//! variant of [`Parser`], and a single interpreter walks the tree over an
//! immutable token slice. A combinator either advances the cursor or reports
//! no-match (`None`), in which case the caller's state is untouched.
//!
//! Matching a form is only half the job; the other half is emitting the
//! reverse statement. [`Capture`](Parser::Capture) tags the tokens a subtree
//! consumed, and a [`Producer`] list attached to a combinator rebuilds the
//! output from those tagged groups plus literal text.

use crate::lex::{Token, TokenKind, ident_eq, lex_significant};

/// A parser variant. Run via [`Combinator::parse`].
enum Parser {
    /// Case-insensitive match on the token's text.
    Str(&'static str),
    /// Match on the token's class.
    Kind(TokenKind),
    /// All in order, reverting wholesale on failure.
    Seq(Vec<Combinator>),
    /// First alternative that matches.
    Either(Vec<Combinator>),
    /// Try the sequence; failure leaves the state untouched.
    Opt(Vec<Combinator>),
    /// Repeat the sequence until it fails or stops consuming.
    ZeroOrMore(Vec<Combinator>),
    /// Succeed, without consuming, iff the inner combinator does not match.
    Not(Box<Combinator>),
    /// Skip tokens until `stop` would match. `accept_eof` decides whether
    /// running out of input is a match or a failure.
    Until {
        stop: Box<Combinator>,
        accept_eof: bool,
    },
    /// Run the body and tag every token it consumed with `group`.
    Capture {
        group: &'static str,
        body: Vec<Combinator>,
    },
}

/// Rebuilds the emitted token list after a combinator matched.
pub enum Producer {
    /// A synthetic token with the given text.
    Lit(&'static str),
    /// Every captured token tagged with this group, in capture order.
    Group(&'static str),
    /// Like [`Producer::Group`], but emits the default as a synthetic token
    /// when the group is empty.
    GroupOrDefault(&'static str, &'static str),
}

/// A token destined for the rendered output. Synthetic tokens have no
/// source offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emitted {
    pub group: &'static str,
    pub value: String,
    pub offset: Option<usize>,
}

pub struct Combinator {
    parser: Parser,
    producers: Vec<Producer>,
}

#[derive(Clone)]
struct State<'t> {
    tokens: &'t [Token],
    pos: usize,
    results: Vec<Emitted>,
}

impl State<'_> {
    fn at_eof(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

impl Combinator {
    /// Attach producers: when this combinator matches, its accumulated
    /// results are replaced by what the producers generate.
    pub fn produce<const N: usize>(mut self, producers: [Producer; N]) -> Self {
        self.producers.extend(producers);
        self
    }

    /// Lex `sql` and run the combinator from the first token. `Ok(None)`
    /// means the grammar does not cover this statement.
    pub fn parse(&self, sql: &str) -> Result<Option<Vec<Emitted>>, crate::lex::LexError> {
        let tokens = lex_significant(sql)?;
        let state = State {
            tokens: &tokens,
            pos: 0,
            results: Vec::new(),
        };
        Ok(self.run(state).map(|s| s.results))
    }

    fn run<'t>(&self, state: State<'t>) -> Option<State<'t>> {
        let mut out = self.run_parser(state)?;
        if !self.producers.is_empty() {
            let captured = std::mem::take(&mut out.results);
            for producer in &self.producers {
                producer.emit(&mut out.results, &captured);
            }
        }
        Some(out)
    }

    fn run_parser<'t>(&self, mut state: State<'t>) -> Option<State<'t>> {
        match &self.parser {
            Parser::Str(word) => {
                let token = state.tokens.get(state.pos)?;
                if ident_eq(&token.value, word) {
                    state.pos += 1;
                    Some(state)
                } else {
                    None
                }
            }

            Parser::Kind(kind) => {
                let token = state.tokens.get(state.pos)?;
                if token.kind == *kind {
                    state.pos += 1;
                    Some(state)
                } else {
                    None
                }
            }

            Parser::Seq(body) => run_seq(body, state),

            Parser::Either(alternatives) => alternatives
                .iter()
                .find_map(|alt| alt.run(state.clone())),

            Parser::Opt(body) => match run_seq(body, state.clone()) {
                Some(next) => Some(next),
                None => Some(state),
            },

            Parser::ZeroOrMore(body) => loop {
                if state.at_eof() {
                    return Some(state);
                }
                match run_seq(body, state.clone()) {
                    Some(next) if next.pos > state.pos => state = next,
                    // No failure, but no progress either; stop rather than
                    // spin forever.
                    Some(_) | None => return Some(state),
                }
            },

            Parser::Not(inner) => {
                if inner.run(state.clone()).is_some() {
                    None
                } else {
                    Some(state)
                }
            }

            Parser::Until { stop, accept_eof } => loop {
                if state.at_eof() {
                    return if *accept_eof { Some(state) } else { None };
                }
                if stop.run(state.clone()).is_some() {
                    return Some(state);
                }
                state.pos += 1;
            },

            Parser::Capture { group, body } => {
                let from = state.pos;
                let mut next = run_seq(body, state)?;
                let (tokens, to) = (next.tokens, next.pos);
                for token in &tokens[from..to] {
                    next.results.push(Emitted {
                        group,
                        value: token.value.clone(),
                        offset: Some(token.offset),
                    });
                }
                Some(next)
            }
        }
    }

    /// Whether this subtree has producers anywhere. Producers inside a
    /// capture would clobber the capture's own results, so the grammar
    /// builder rejects that shape outright.
    fn has_producers(&self) -> bool {
        if !self.producers.is_empty() {
            return true;
        }
        match &self.parser {
            Parser::Str(_) | Parser::Kind(_) => false,
            Parser::Seq(body)
            | Parser::Either(body)
            | Parser::Opt(body)
            | Parser::ZeroOrMore(body)
            | Parser::Capture { body, .. } => body.iter().any(Combinator::has_producers),
            Parser::Not(inner) => inner.has_producers(),
            Parser::Until { stop, .. } => stop.has_producers(),
        }
    }
}

fn run_seq<'t>(body: &[Combinator], state: State<'t>) -> Option<State<'t>> {
    body.iter().try_fold(state, |st, comb| comb.run(st))
}

impl Producer {
    fn emit(&self, out: &mut Vec<Emitted>, captured: &[Emitted]) {
        match self {
            Producer::Lit(text) => out.push(Emitted {
                group: "",
                value: (*text).to_string(),
                offset: None,
            }),
            Producer::Group(name) => {
                out.extend(captured.iter().filter(|r| r.group == *name).cloned());
            }
            Producer::GroupOrDefault(name, default) => {
                let before = out.len();
                out.extend(captured.iter().filter(|r| r.group == *name).cloned());
                if out.len() == before {
                    out.push(Emitted {
                        group: name,
                        value: (*default).to_string(),
                        offset: None,
                    });
                }
            }
        }
    }
}

/// Render emitted tokens back to SQL text. A token that came from the source
/// keeps a leading space iff it had one there; synthetic tokens are emitted
/// as-is (their text bakes in any spacing they need).
pub fn render(src: &str, emitted: &[Emitted]) -> String {
    let bytes = src.as_bytes();
    let mut out = String::new();
    for token in emitted {
        if let Some(offset) = token.offset {
            if offset > 0 && bytes[offset - 1].is_ascii_whitespace() {
                out.push(' ');
            }
        }
        out.push_str(&token.value);
    }
    out
}

// Constructors. The grammar reads best as a tree of these.

pub fn word(w: &'static str) -> Combinator {
    Combinator {
        parser: Parser::Str(w),
        producers: Vec::new(),
    }
}

pub fn kind(k: TokenKind) -> Combinator {
    Combinator {
        parser: Parser::Kind(k),
        producers: Vec::new(),
    }
}

pub fn seq<const N: usize>(body: [Combinator; N]) -> Combinator {
    Combinator {
        parser: Parser::Seq(body.into()),
        producers: Vec::new(),
    }
}

pub fn either<const N: usize>(alternatives: [Combinator; N]) -> Combinator {
    Combinator {
        parser: Parser::Either(alternatives.into()),
        producers: Vec::new(),
    }
}

pub fn opt<const N: usize>(body: [Combinator; N]) -> Combinator {
    Combinator {
        parser: Parser::Opt(body.into()),
        producers: Vec::new(),
    }
}

pub fn zero_or_more<const N: usize>(body: [Combinator; N]) -> Combinator {
    Combinator {
        parser: Parser::ZeroOrMore(body.into()),
        producers: Vec::new(),
    }
}

pub fn not(inner: Combinator) -> Combinator {
    Combinator {
        parser: Parser::Not(Box::new(inner)),
        producers: Vec::new(),
    }
}

pub fn until(stop: Combinator) -> Combinator {
    Combinator {
        parser: Parser::Until {
            stop: Box::new(stop),
            accept_eof: false,
        },
        producers: Vec::new(),
    }
}

pub fn until_opt(stop: Combinator) -> Combinator {
    Combinator {
        parser: Parser::Until {
            stop: Box::new(stop),
            accept_eof: true,
        },
        producers: Vec::new(),
    }
}

/// Tag the tokens consumed by `body` with `group`.
///
/// # Panics
///
/// Panics when any combinator inside `body` carries producers: the inner
/// production would replace the results this capture is about to append to,
/// so that shape is a bug in the grammar, caught while it is being built.
pub fn capture<const N: usize>(group: &'static str, body: [Combinator; N]) -> Combinator {
    assert!(
        !body.iter().any(Combinator::has_producers),
        "capture({group:?}): nested combinators must not carry producers"
    );
    Combinator {
        parser: Parser::Capture {
            group,
            body: body.into(),
        },
        producers: Vec::new(),
    }
}

/// Capture into the anonymous group, the one collected by `group("")`.
pub fn keep<const N: usize>(body: [Combinator; N]) -> Combinator {
    capture("", body)
}

pub fn lit(text: &'static str) -> Producer {
    Producer::Lit(text)
}

pub fn group(name: &'static str) -> Producer {
    Producer::Group(name)
}

pub fn group_or(name: &'static str, default: &'static str) -> Producer {
    Producer::GroupOrDefault(name, default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> Combinator {
        kind(TokenKind::Id)
    }

    fn rendered(c: &Combinator, sql: &str) -> Option<String> {
        c.parse(sql).unwrap().map(|r| render(sql, &r))
    }

    #[test]
    fn test_word_is_case_insensitive() {
        let c = seq([word("create"), word("table")]);
        assert!(c.parse("CREATE TABLE x").unwrap().is_some());
        assert!(c.parse("create Table x").unwrap().is_some());
        assert!(c.parse("create index x").unwrap().is_none());
    }

    #[test]
    fn test_seq_reverts_wholesale() {
        let c = either([seq([word("a"), word("b")]), seq([word("a"), word("c")])]);
        assert!(c.parse("a c").unwrap().is_some());
    }

    #[test]
    fn test_opt_and_not() {
        let c = seq([word("create"), opt([word("unique")]), word("index")]);
        assert!(c.parse("create index i").unwrap().is_some());
        assert!(c.parse("create unique index i").unwrap().is_some());

        let guard = seq([not(word("default")), id()]);
        assert!(guard.parse("integer").unwrap().is_some());
        assert!(guard.parse("default 3").unwrap().is_none());
    }

    #[test]
    fn test_until_stops_before_the_mark() {
        let c = seq([until(word("on")), keep([word("on"), id()])]);
        assert_eq!(rendered(&c, "a b c ON target").unwrap(), " ON target");

        // `until` without the stop token is a failure, `until_opt` is not.
        assert!(until(word("on")).parse("a b c").unwrap().is_none());
        assert!(until_opt(word("on")).parse("a b c").unwrap().is_some());
    }

    #[test]
    fn test_zero_or_more_consumes_list() {
        let c = seq([keep([id()]), zero_or_more([word(","), keep([id()])])]);
        assert_eq!(rendered(&c, "a, b, c").unwrap(), "a b c");
    }

    #[test]
    fn test_capture_and_produce() {
        let c = seq([
            word("create"),
            keep([word("table"), id()]),
            until_opt(word(";")),
        ])
        .produce([lit("DROP"), group(""), lit(";")]);
        assert_eq!(
            rendered(&c, "CREATE TABLE foo (id int);").unwrap(),
            "DROP TABLE foo;"
        );
    }

    #[test]
    fn test_group_or_default() {
        let c = seq([
            word("x"),
            opt([word("left"), capture("l", [id()])]),
            opt([word("right"), capture("r", [id()])]),
        ])
        .produce([lit("("), group_or("l", "none"), lit(","), group("r"), lit(")")]);
        assert_eq!(rendered(&c, "x right b").unwrap(), "(none, b)");
        assert_eq!(rendered(&c, "x left a right b").unwrap(), "( a, b)");
    }

    #[test]
    #[should_panic(expected = "must not carry producers")]
    fn test_capture_rejects_nested_producers() {
        let inner = keep([word("a")]).produce([lit("x")]);
        let _ = capture("outer", [inner]);
    }

    #[test]
    fn test_quoted_identifiers_match_exactly() {
        let c = word("foo");
        assert!(c.parse("FOO").unwrap().is_some());
        assert!(c.parse("\"foo\"").unwrap().is_none());
    }
}
