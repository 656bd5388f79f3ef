//! Tokenizer for rule expressions.
//!
//! Recognized operators (any case):
//! - and: `and`, `&`, `*`
//! - or:  `or`, `|`, `+`
//! - not: `not`, `~`, `!`
//! - grouping: `(` `)` and `[` `]`
//! - constants: `true`, `false`, `none`
//!
//! A symbol starts with an alphanumeric or `_` and continues with alphanumerics
//! or any of `. : _ -`. Double quotes delimit a literal phrase. Adjacent symbols
//! separated only by whitespace are merged into one multi-word symbol, so
//! `crf 80` is the phrase "crf 80" rather than `crf AND 80`.

use super::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    And,
    Or,
    Not,
    LParen,
    RParen,
    True,
    False,
    Symbol(String),
}

impl TokenKind {
    pub fn text(&self) -> &str {
        match self {
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Not => "not",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Symbol(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Character offset of the token start in the source expression.
    pub position: usize,
}

const ALLOWED_IN_SYMBOL: [char; 4] = ['.', ':', '_', '-'];

fn keyword(word: &str) -> Option<TokenKind> {
    match word {
        "and" => Some(TokenKind::And),
        "or" => Some(TokenKind::Or),
        "not" => Some(TokenKind::Not),
        "true" => Some(TokenKind::True),
        "false" | "none" => Some(TokenKind::False),
        _ => None,
    }
}

fn operator(ch: char) -> Option<TokenKind> {
    match ch {
        '*' | '&' => Some(TokenKind::And),
        '+' | '|' => Some(TokenKind::Or),
        '~' | '!' => Some(TokenKind::Not),
        '(' | '[' => Some(TokenKind::LParen),
        ')' | ']' => Some(TokenKind::RParen),
        _ => None,
    }
}

/// Split `expr` into tokens, merging runs of adjacent symbols into phrases.
pub fn tokenize(expr: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = expr.chars().collect();
    let mut raw = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];

        if ch.is_whitespace() {
            pos += 1;
            continue;
        }

        if ch == '"' {
            let start = pos;
            let end = chars[pos + 1..]
                .iter()
                .position(|&c| c == '"')
                .map(|off| pos + 1 + off)
                .ok_or(ParseError::UnterminatedQuote { position: start })?;
            let phrase: String = chars[pos + 1..end].iter().collect();
            let phrase = super::normalize_text(&phrase);
            if !phrase.is_empty() {
                raw.push(Token {
                    kind: TokenKind::Symbol(phrase),
                    position: start,
                });
            }
            pos = end + 1;
            continue;
        }

        if ch.is_alphanumeric() || ch == '_' {
            let start = pos;
            while pos < chars.len()
                && (chars[pos].is_alphanumeric() || ALLOWED_IN_SYMBOL.contains(&chars[pos]))
            {
                pos += 1;
            }
            let word: String = chars[start..pos].iter().collect::<String>().to_lowercase();
            let kind = keyword(&word).unwrap_or(TokenKind::Symbol(word));
            raw.push(Token {
                kind,
                position: start,
            });
            continue;
        }

        match operator(ch) {
            Some(kind) => raw.push(Token {
                kind,
                position: pos,
            }),
            None => {
                return Err(ParseError::UnknownToken {
                    token: ch.to_string(),
                    position: pos,
                })
            }
        }
        pos += 1;
    }

    Ok(merge_phrases(raw))
}

fn merge_phrases(raw: Vec<Token>) -> Vec<Token> {
    let mut out: Vec<Token> = Vec::with_capacity(raw.len());
    for tok in raw {
        if let TokenKind::Symbol(word) = &tok.kind {
            if let Some(Token {
                kind: TokenKind::Symbol(prev),
                ..
            }) = out.last_mut()
            {
                prev.push(' ');
                prev.push_str(word);
                continue;
            }
        }
        out.push(tok);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(expr: &str) -> Vec<TokenKind> {
        tokenize(expr).unwrap().into_iter().map(|t| t.kind).collect()
    }

    fn sym(s: &str) -> TokenKind {
        TokenKind::Symbol(s.to_string())
    }

    #[test]
    fn adjacent_words_merge_into_one_symbol() {
        assert_eq!(kinds("tw 200"), vec![sym("tw 200")]);
        assert_eq!(
            kinds("drz and not drz 50"),
            vec![sym("drz"), TokenKind::And, TokenKind::Not, sym("drz 50")]
        );
    }

    #[test]
    fn operators_are_case_insensitive_and_symbolic() {
        assert_eq!(
            kinds("A AND b | c & !d"),
            vec![
                sym("a"),
                TokenKind::And,
                sym("b"),
                TokenKind::Or,
                sym("c"),
                TokenKind::And,
                TokenKind::Not,
                sym("d"),
            ]
        );
        assert_eq!(
            kinds("[x + y] * ~z"),
            vec![
                TokenKind::LParen,
                sym("x"),
                TokenKind::Or,
                sym("y"),
                TokenKind::RParen,
                TokenKind::And,
                TokenKind::Not,
                sym("z"),
            ]
        );
    }

    #[test]
    fn digits_are_symbols_not_constants() {
        assert_eq!(kinds("0 or 1"), vec![sym("0"), TokenKind::Or, sym("1")]);
        assert_eq!(kinds("None"), vec![TokenKind::False]);
    }

    #[test]
    fn symbol_may_contain_dots_colons_and_dashes() {
        assert_eq!(kinds("crf250-r v1.2:x"), vec![sym("crf250-r v1.2:x")]);
    }

    #[test]
    fn quoted_phrase_is_literal() {
        assert_eq!(
            kinds(r#""rock and roll" or jazz"#),
            vec![sym("rock and roll"), TokenKind::Or, sym("jazz")]
        );
    }

    #[test]
    fn unknown_character_is_rejected_with_position() {
        let err = tokenize("ktm # exc").unwrap_err();
        assert_eq!(
            err,
            ParseError::UnknownToken {
                token: "#".into(),
                position: 4
            }
        );
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        let err = tokenize(r#"ktm and "exc"#).unwrap_err();
        assert_eq!(err, ParseError::UnterminatedQuote { position: 8 });
    }
}
