//! Automatic undo derivation.
//!
//! Most schema mutations use a small vocabulary of CREATE / ALTER TABLE /
//! GRANT forms whose inverse is mechanical, so authors should not have to
//! write the reverse statement by hand. The grammar below matches those
//! forms over the token stream and produces the matching DROP / REVOKE /
//! RENAME-back statement. Anything it does not recognize is a hard
//! [`ParseError::Unsupported`]: the author must then supply the undo
//! explicitly.
//!
//! The grammar is pure data and is built exactly once per process.

use std::sync::LazyLock;

use thiserror::Error;

use crate::combinator::{
    Combinator, capture, either, group, group_or, keep, kind, lit, not, opt, render, seq, until,
    until_opt, word, zero_or_more,
};
use crate::lex::{LexError, TokenKind};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error("no automatic undo for statement: {statement}")]
    Unsupported { statement: String },
}

/// Derive the reverse statement for `sql`.
///
/// Returns the empty string for statements that need no undo (`COMMENT ON`).
/// The emitted text is token-normalized, not a pretty-printed statement;
/// compare it by tokens, not bytes.
pub fn derive_down(sql: &str) -> Result<String, ParseError> {
    match GRAMMAR.parse(sql)? {
        Some(results) => Ok(render(sql, &results)),
        None => Err(ParseError::Unsupported {
            statement: sql.trim().to_string(),
        }),
    }
}

/// Ordering is significant: `CREATE OPERATOR` must run before the generic
/// CREATE forms because operator syntax is a special case, and the grant
/// role form is tried before the grant-on-object form.
static GRAMMAR: LazyLock<Combinator> = LazyLock::new(|| {
    either([
        create_operator(),
        create(),
        alter_table(),
        grant(),
        comment(),
    ])
});

fn id() -> Combinator {
    kind(TokenKind::Id)
}

/// Operator names lex as identifiers when they start with `@`, and as
/// operator runs otherwise; accept both.
fn operator_name() -> Combinator {
    either([kind(TokenKind::Operator), id()])
}

fn create_operator() -> Combinator {
    seq([
        word("create"),
        keep([word("operator")]),
        keep([opt([id(), word(".")])]),
        keep([operator_name()]),
        word("("),
        zero_or_more([
            not(word(")")),
            either([
                seq([word("leftarg"), word("="), capture("left", [id()])]),
                seq([word("rightarg"), word("="), capture("right", [id()])]),
                until(either([word(","), word(")")])),
            ]),
            opt([word(",")]),
        ]),
        word(")"),
        until_opt(word(";")),
    ])
    .produce([
        lit("DROP"),
        group(""),
        lit(" ("),
        group_or("left", "NONE"),
        lit(","),
        group("right"),
        lit(")"),
        lit(";"),
    ])
}

fn create() -> Combinator {
    seq([
        word("create"),
        opt([word("or"), word("replace")]),
        either([
            keep([word("access"), word("method"), id()]),
            // FUNCTION / AGGREGATE / PROCEDURE keep their argument types but
            // lose modifiers and DEFAULT clauses, which DROP does not accept.
            seq([
                keep([
                    either([word("function"), word("aggregate"), word("procedure")]),
                    id(),
                    word("("),
                ]),
                zero_or_more([
                    opt([either([
                        word("in"),
                        word("inout"),
                        word("out"),
                        word("variadic"),
                    ])]),
                    keep([id()]),
                    opt([not(word("default")), keep([id()])]),
                    opt([either([word("="), word("default")])]),
                    until(either([word(","), word(")")])),
                    keep([opt([word(",")])]),
                ]),
                keep([word(")")]),
            ]),
            seq([
                keep([word("operator"), word("class"), id()]),
                opt([word("default")]),
                word("for"),
                word("type"),
                id(),
                keep([word("using"), id()]),
            ]),
            keep([word("foreign"), word("data"), word("wrapper"), id()]),
            keep([word("foreign"), word("table"), id()]),
            keep([word("policy"), id(), word("on"), id()]),
            keep([word("cast"), word("("), id(), word("as"), id(), word(")")]),
            keep([word("event"), word("trigger"), id()]),
            seq([
                opt([word("unique")]),
                keep([word("index")]),
                opt([word("concurrently")]),
                keep([id()]),
            ]),
            seq([
                opt([word("trusted")]),
                keep([opt([word("procedural")]), word("language"), id()]),
            ]),
            keep([word("collation"), id()]),
            seq([
                opt([word("default")]),
                keep([word("conversion"), id()]),
                word("for"),
                id(),
            ]),
            keep([word("type"), id()]),
            keep([word("schema"), id()]),
            keep([word("sequence"), id()]),
            seq([
                opt([either([word("temporary"), word("temp"), word("unlogged")])]),
                keep([word("table")]),
                opt([word("if"), word("not"), word("exists")]),
                keep([id()]),
            ]),
            keep([word("role"), id()]),
            keep([opt([word("materialized")]), word("view"), id()]),
            keep([word("extension"), id()]),
            keep([word("domain"), id()]),
            seq([
                opt([word("constraint")]),
                keep([word("trigger"), id()]),
                either([word("before"), word("after"), seq([word("instead"), word("of")])]),
                either([
                    word("insert"),
                    seq([
                        word("update"),
                        opt([word("of"), id(), zero_or_more([word(","), id()])]),
                    ]),
                    word("delete"),
                    word("truncate"),
                ]),
                keep([word("on"), id()]),
            ]),
        ]),
        until_opt(word(";")),
    ])
    .produce([lit("DROP"), group(""), lit(";")])
}

fn alter_table() -> Combinator {
    let head = || seq([word("alter"), word("table"), capture("table", [id()])]);
    either([
        seq([
            head(),
            word("enable"),
            word("row"),
            word("level"),
            word("security"),
            until_opt(word(";")),
        ])
        .produce([
            lit("ALTER TABLE"),
            group("table"),
            lit(" DISABLE ROW LEVEL SECURITY;"),
        ]),
        seq([
            head(),
            word("add"),
            word("column"),
            capture("column", [id()]),
            until_opt(word(";")),
        ])
        .produce([
            lit("ALTER TABLE"),
            group("table"),
            lit(" DROP COLUMN"),
            group("column"),
            lit(";"),
        ]),
        seq([
            head(),
            word("alter"),
            word("column"),
            capture("column", [id()]),
            word("set"),
            word("default"),
            until_opt(word(";")),
        ])
        .produce([
            lit("ALTER TABLE"),
            group("table"),
            lit(" ALTER COLUMN"),
            group("column"),
            lit(" DROP DEFAULT;"),
        ]),
        seq([
            head(),
            word("add"),
            word("constraint"),
            capture("constraint", [id()]),
            until_opt(word(";")),
        ])
        .produce([
            lit("ALTER TABLE"),
            group("table"),
            lit(" DROP CONSTRAINT"),
            group("constraint"),
            lit(";"),
        ]),
        seq([
            head(),
            word("rename"),
            word("column"),
            capture("from", [id()]),
            word("to"),
            capture("to", [id()]),
            until_opt(word(";")),
        ])
        .produce([
            lit("ALTER TABLE"),
            group("table"),
            lit(" RENAME COLUMN"),
            group("to"),
            lit(" TO"),
            group("from"),
            lit(";"),
        ]),
        seq([
            head(),
            word("rename"),
            word("constraint"),
            capture("from", [id()]),
            word("to"),
            capture("to", [id()]),
            until_opt(word(";")),
        ])
        .produce([
            lit("ALTER TABLE"),
            group("table"),
            lit(" RENAME CONSTRAINT"),
            group("to"),
            lit(" TO"),
            group("from"),
            lit(";"),
        ]),
    ])
}

fn grant() -> Combinator {
    let grantees = || capture("to", [id(), zero_or_more([word(","), id()])]);
    seq([
        word("grant"),
        either([
            // GRANT role TO users
            seq([keep([id()]), word("to"), grantees()]),
            // GRANT privileges ON [kind] object TO users
            seq([
                keep([until(word("on"))]),
                keep([word("on")]),
                keep([opt([either([
                    word("table"),
                    seq([opt([word("materialized")]), word("view")]),
                    word("schema"),
                    seq([word("foreign"), word("server")]),
                    seq([word("foreign"), word("data"), word("wrapper")]),
                    word("tablespace"),
                    word("database"),
                    word("sequence"),
                    word("function"),
                    word("language"),
                    word("parameter"),
                    seq([word("large"), word("object")]),
                    word("type"),
                ])])]),
                keep([id()]),
                word("to"),
                grantees(),
            ]),
        ]),
        until_opt(word(";")),
    ])
    .produce([lit("REVOKE"), group(""), lit(" FROM"), group("to"), lit(";")])
}

/// Comments have no undo: dropping the commented object takes the comment
/// with it, and re-commenting on the way down would be wrong anyway.
fn comment() -> Combinator {
    seq([word("comment"), word("on"), until_opt(word(";"))])
}
