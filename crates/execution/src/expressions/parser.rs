//! Recursive-descent parser from template tokens to [`Expr`].

use logos::Logos;

use super::lexer::Token;
use super::ExprError;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

/// A piece of a string literal: literal text or the text of an argument.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StrPart {
    Text(String),
    Arg(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    /// Bare `{}` bound to the argument at this position.
    Arg(usize),
    /// String literal containing at least one `{}`.
    Interpolated(Vec<StrPart>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

/// Parse `template`, returning the tree and its placeholder count.
pub(crate) fn parse(template: &str) -> Result<(Expr, usize), ExprError> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(template);
    while let Some(token) = lexer.next() {
        match token {
            Ok(t) => tokens.push(t),
            Err(()) => {
                return Err(ExprError::Lex {
                    offset: lexer.span().start,
                    found: lexer.slice().to_string(),
                })
            }
        }
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        args: 0,
    };
    let expr = parser.or()?;
    if let Some(extra) = parser.peek() {
        return Err(ExprError::Syntax(format!("unexpected trailing {extra:?}")));
    }
    Ok((expr, parser.args))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    args: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    /// Consume the next token if it maps to one of `ops`.
    fn eat(&mut self, ops: &[(Token, BinaryOp)]) -> Option<BinaryOp> {
        let next = self.peek()?;
        let op = ops.iter().find(|(t, _)| t == next).map(|(_, op)| *op)?;
        self.pos += 1;
        Some(op)
    }

    fn binary_level(
        &mut self,
        ops: &[(Token, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ExprError>,
    ) -> Result<Expr, ExprError> {
        let mut left = next(self)?;
        while let Some(op) = self.eat(ops) {
            let right = next(self)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[(Token::Or, BinaryOp::Or)], Self::and)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[(Token::And, BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            &[(Token::Eq, BinaryOp::Eq), (Token::Ne, BinaryOp::Ne)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            &[
                (Token::Lt, BinaryOp::Lt),
                (Token::Le, BinaryOp::Le),
                (Token::Gt, BinaryOp::Gt),
                (Token::Ge, BinaryOp::Ge),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.bump() {
            Some(Token::Placeholder) => Ok(Expr::Arg(self.next_arg())),
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Str(s)) => Ok(self.string_literal(s)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(ExprError::Syntax(format!("expected ')', found {other:?}"))),
                }
            }
            Some(other) => Err(ExprError::Syntax(format!("unexpected {other:?}"))),
            None => Err(ExprError::Syntax("unexpected end of expression".to_string())),
        }
    }

    fn next_arg(&mut self) -> usize {
        self.args += 1;
        self.args - 1
    }

    fn string_literal(&mut self, s: String) -> Expr {
        if !s.contains("{}") {
            return Expr::Literal(Value::Str(s));
        }
        let mut parts = Vec::new();
        let mut pieces = s.split("{}").peekable();
        while let Some(text) = pieces.next() {
            if !text.is_empty() {
                parts.push(StrPart::Text(text.to_string()));
            }
            if pieces.peek().is_some() {
                parts.push(StrPart::Arg(self.next_arg()));
            }
        }
        Expr::Interpolated(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse, BinaryOp, Expr, StrPart};
    use crate::value::Value;

    #[test]
    fn precedence_and_argument_order() {
        let (expr, arity) = parse("{} + {} * 2 == \"a{}b\"").unwrap();
        assert_eq!(arity, 3);
        let Expr::Binary { op, left, right } = expr else {
            panic!("expected ==");
        };
        assert_eq!(op, BinaryOp::Eq);
        assert_eq!(
            *right,
            Expr::Interpolated(vec![
                StrPart::Text("a".to_string()),
                StrPart::Arg(2),
                StrPart::Text("b".to_string()),
            ])
        );
        let Expr::Binary { op, left, right } = *left else {
            panic!("expected +");
        };
        assert_eq!(op, BinaryOp::Add);
        assert_eq!(*left, Expr::Arg(0));
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn plain_strings_stay_literals() {
        let (expr, arity) = parse("'localhost'").unwrap();
        assert_eq!(arity, 0);
        assert_eq!(expr, Expr::Literal(Value::from("localhost")));
    }

    #[test]
    fn syntax_errors() {
        assert!(parse("").is_err());
        assert!(parse("{} +").is_err());
        assert!(parse("({} + 1").is_err());
        assert!(parse("{} {}").is_err());
        assert!(parse("{} $ 1").is_err());
    }
}
