//! Boolean rule algebra over free-text substring tests.
//!
//! A rule such as `ktm and not (duke or sx)` is parsed into an [`Expr`]; each
//! symbol is then replaced by whether the candidate text contains it, and the
//! resulting expression is simplified to a single truth value.

pub mod expr;
pub mod token;

pub use expr::Expr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown token {token:?} at position {position}")]
    UnknownToken { token: String, position: usize },

    #[error("unterminated quote starting at position {position}")]
    UnterminatedQuote { position: usize },

    #[error("unexpected {token:?} at position {position}")]
    UnexpectedToken { token: String, position: usize },

    #[error("rule ended unexpectedly")]
    UnexpectedEnd,

    #[error("rule is empty")]
    Empty,
}

pub fn parse_rule(rule: &str) -> Result<Expr, ParseError> {
    Expr::parse(rule)
}

/// True if any rule holds for `text`. No rules never match.
pub fn apply_rules(rules: &[Expr], text: &str) -> bool {
    rules.iter().any(|rule| rule.evaluate(text))
}

/// Lowercase and collapse whitespace runs to single spaces.
pub fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars().flat_map(char::to_lowercase) {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_condenses() {
        assert_eq!(normalize_text("  KTM \t EXC\n300 "), "ktm exc 300");
    }

    #[test]
    fn dirt_bike_rule_set() {
        let rules: Vec<Expr> = [
            "klx",
            "ktm and not (duke or sx or rc)",
            "exc",
            "husqvarna",
            "wr",
            "yz and not 65 and not 85 and not yzf",
            "yamaha and dual",
            "yamaha and xt",
            "xr",
            "klr",
            "dr and suzuki",
            "drz and not drz50 and not drz 50",
            "crf and not crf80 and not crf 80 and not crf50 and not crf 50",
            "beta",
            "swm",
            "tw200 or tw 200",
        ]
        .iter()
        .map(|r| parse_rule(r).unwrap())
        .collect();

        assert!(apply_rules(&rules, "ktm exc 500"));
        assert!(!apply_rules(&rules, "crf 80"));
        assert!(apply_rules(&rules, "crf250"));
    }

    #[test]
    fn no_rules_never_match() {
        assert!(!apply_rules(&[], "anything"));
    }
}
