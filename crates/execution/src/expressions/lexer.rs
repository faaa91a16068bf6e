//! Logos lexer for expression templates.

use logos::Logos;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub(crate) enum Token {
    #[token("{}")]
    Placeholder,

    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),
    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| unescape(lex.slice()))]
    Str(String),

    #[token("||")]
    Or,
    #[token("&&")]
    And,
    #[token("==")]
    #[token("===")]
    Eq,
    #[token("!=")]
    #[token("!==")]
    Ne,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("!")]
    Bang,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
}

/// Strip the quotes and resolve backslash escapes.
fn unescape(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use logos::Logos;

    use super::Token;

    #[test]
    fn lexes_template() {
        let tokens: Vec<_> = Token::lexer(r#""{}" != 'local\'host' && {}/1024 >= 1.5"#).collect();
        assert_eq!(
            tokens,
            vec![
                Ok(Token::Str("{}".to_string())),
                Ok(Token::Ne),
                Ok(Token::Str("local'host".to_string())),
                Ok(Token::And),
                Ok(Token::Placeholder),
                Ok(Token::Slash),
                Ok(Token::Int(1024)),
                Ok(Token::Ge),
                Ok(Token::Float(1.5)),
            ]
        );
    }

    #[test]
    fn rejects_unknown_characters() {
        assert!(Token::lexer("{} # 2").any(|t| t.is_err()));
        assert!(Token::lexer("99999999999999999999").any(|t| t.is_err()));
    }
}
