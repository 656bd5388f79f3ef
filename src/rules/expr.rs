//! Expression tree, recursive-descent parser and evaluator.
//!
//! Precedence, lowest to highest: `or`, `and`, `not`.

use std::collections::BTreeSet;
use std::fmt;

use super::token::{tokenize, Token, TokenKind};
use super::{normalize_text, ParseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Const(bool),
    Symbol(String),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    pub fn parse(input: &str) -> Result<Expr, ParseError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ParseError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some(tok) => Err(unexpected(tok)),
        }
    }

    pub fn symbols(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Const(_) => {}
            Expr::Symbol(s) => {
                out.insert(s.as_str());
            }
            Expr::Not(inner) => inner.collect_symbols(out),
            Expr::And(items) | Expr::Or(items) => {
                for item in items {
                    item.collect_symbols(out);
                }
            }
        }
    }

    /// Replace every symbol with the constant returned by `truth`.
    pub fn substitute<F>(&self, truth: &F) -> Expr
    where
        F: Fn(&str) -> bool,
    {
        match self {
            Expr::Const(b) => Expr::Const(*b),
            Expr::Symbol(s) => Expr::Const(truth(s)),
            Expr::Not(inner) => Expr::Not(Box::new(inner.substitute(truth))),
            Expr::And(items) => Expr::And(items.iter().map(|e| e.substitute(truth)).collect()),
            Expr::Or(items) => Expr::Or(items.iter().map(|e| e.substitute(truth)).collect()),
        }
    }

    /// Constant-fold and flatten. A symbol-free expression reduces to `Const`.
    pub fn simplify(self) -> Expr {
        match self {
            Expr::Const(_) | Expr::Symbol(_) => self,
            Expr::Not(inner) => match inner.simplify() {
                Expr::Const(b) => Expr::Const(!b),
                Expr::Not(double) => *double,
                other => Expr::Not(Box::new(other)),
            },
            Expr::And(items) => fold(items, true),
            Expr::Or(items) => fold(items, false),
        }
    }

    /// True when the expression holds for `text`: each symbol is true iff the
    /// whitespace-normalized, lowercased text contains it.
    pub fn evaluate(&self, text: &str) -> bool {
        let haystack = normalize_text(text);
        matches!(
            self.substitute(&|sym: &str| haystack.contains(sym)).simplify(),
            Expr::Const(true)
        )
    }
}

/// Shared folding for `and` (identity `true`) and `or` (identity `false`).
fn fold(items: Vec<Expr>, identity: bool) -> Expr {
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        match item.simplify() {
            Expr::Const(b) if b == identity => {}
            Expr::Const(b) => return Expr::Const(b),
            Expr::And(nested) if identity => kept.extend(nested),
            Expr::Or(nested) if !identity => kept.extend(nested),
            other => kept.push(other),
        }
    }
    match kept.len() {
        0 => Expr::Const(identity),
        1 => kept.pop().unwrap_or(Expr::Const(identity)),
        _ if identity => Expr::And(kept),
        _ => Expr::Or(kept),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(b) => write!(f, "{b}"),
            Expr::Symbol(s) if needs_quotes(s) => write!(f, "\"{s}\""),
            Expr::Symbol(s) => f.write_str(s),
            Expr::Not(inner) => match inner.as_ref() {
                Expr::And(_) | Expr::Or(_) => write!(f, "not ({inner})"),
                _ => write!(f, "not {inner}"),
            },
            Expr::And(items) => join(f, items, " and ", true),
            Expr::Or(items) => join(f, items, " or ", false),
        }
    }
}

fn needs_quotes(symbol: &str) -> bool {
    symbol.contains(' ')
        || matches!(symbol, "and" | "or" | "not" | "true" | "false" | "none")
        || !symbol.starts_with(|c: char| c.is_alphanumeric() || c == '_')
}

fn join(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str, is_and: bool) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        // `or` inside `and` needs parentheses to keep its meaning.
        if is_and && matches!(item, Expr::Or(_)) {
            write!(f, "({item})")?;
        } else {
            write!(f, "{item}")?;
        }
    }
    Ok(())
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().map(|t| &t.kind) == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut items = vec![self.parse_and()?];
        while self.eat(&TokenKind::Or) {
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut items = vec![self.parse_unary()?];
        while self.eat(&TokenKind::And) {
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&TokenKind::Not) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let tok = self.next().ok_or(ParseError::UnexpectedEnd)?;
        match tok.kind {
            TokenKind::Symbol(s) => Ok(Expr::Symbol(s)),
            TokenKind::True => Ok(Expr::Const(true)),
            TokenKind::False => Ok(Expr::Const(false)),
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(inner),
                    Some(other) => Err(unexpected(&other)),
                    None => Err(ParseError::UnexpectedEnd),
                }
            }
            _ => Err(unexpected(&tok)),
        }
    }
}

fn unexpected(tok: &Token) -> ParseError {
    ParseError::UnexpectedToken {
        token: tok.kind.text().to_string(),
        position: tok.position,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Expr {
        Expr::Symbol(s.into())
    }

    #[test]
    fn precedence_not_and_or() {
        let e = Expr::parse("a or b and not c").unwrap();
        assert_eq!(
            e,
            Expr::Or(vec![
                sym("a"),
                Expr::And(vec![sym("b"), Expr::Not(Box::new(sym("c")))]),
            ])
        );
    }

    #[test]
    fn parentheses_group() {
        let e = Expr::parse("ktm and not (duke or sx or rc)").unwrap();
        assert_eq!(
            e,
            Expr::And(vec![
                sym("ktm"),
                Expr::Not(Box::new(Expr::Or(vec![sym("duke"), sym("sx"), sym("rc")]))),
            ])
        );
        assert_eq!(e.symbols().into_iter().collect::<Vec<_>>(), ["duke", "ktm", "rc", "sx"]);
    }

    #[test]
    fn phrase_symbol_matches_only_the_phrase() {
        let e = Expr::parse("tw 200").unwrap();
        assert_eq!(e, sym("tw 200"));
        assert!(e.evaluate("Yamaha TW 200 trail bike"));
        assert!(e.evaluate("Yamaha TW   200\ttrail bike"));
        assert!(!e.evaluate("tw"));
        assert!(!e.evaluate("200cc tw bike"));
    }

    #[test]
    fn simplify_folds_constants() {
        let e = Expr::parse("a and (true or b) and not false").unwrap();
        assert_eq!(e.simplify(), sym("a"));
        assert_eq!(Expr::parse("a and false").unwrap().simplify(), Expr::Const(false));
        assert_eq!(
            Expr::parse("not not a").unwrap().simplify(),
            sym("a")
        );
    }

    #[test]
    fn structural_errors() {
        assert_eq!(Expr::parse("   "), Err(ParseError::Empty));
        assert_eq!(Expr::parse("a and"), Err(ParseError::UnexpectedEnd));
        assert_eq!(Expr::parse("(a or b"), Err(ParseError::UnexpectedEnd));
        assert_eq!(
            Expr::parse("a or b)"),
            Err(ParseError::UnexpectedToken {
                token: ")".into(),
                position: 6
            })
        );
        assert_eq!(
            Expr::parse("and a"),
            Err(ParseError::UnexpectedToken {
                token: "and".into(),
                position: 0
            })
        );
    }

    #[test]
    fn display_round_trips_through_parse() {
        for src in ["ktm and not (duke or sx)", "tw 200 or xt", "not a and (b or c)"] {
            let e = Expr::parse(src).unwrap();
            assert_eq!(Expr::parse(&e.to_string()).unwrap(), e, "{src} -> {e}");
        }
    }
}
