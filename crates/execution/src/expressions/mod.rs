//! Template expressions used by `let` and `where`.
//!
//! A template is a small closed-grammar expression whose `{}` placeholders
//! are bound positionally to argument values:
//!
//! - bare `{}` binds the value itself; a string that looks numeric binds as a number
//! - `{}` inside a string literal interpolates the value's text
//! - operators: `|| && == != < <= > >= + - * / %`, unary `!` and `-`, parentheses
//! - literals: integers, floats, `"..."`/`'...'` strings, `true`, `false`, `null`
//!
//! `+` concatenates when either side is a string. Integer division stays
//! integral only when exact. Failures are typed [`ExprError`]s, never panics.

mod eval;
mod lexer;
mod parser;

use thiserror::Error;

use crate::value::Value;

/// Failure to parse or evaluate a template expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    /// The template contains text no token matches.
    #[error("unrecognized input '{found}' at offset {offset}")]
    Lex {
        /// Byte offset of the bad input.
        offset: usize,
        /// The unmatched text.
        found: String,
    },
    /// Tokens do not form an expression.
    #[error("syntax error: {0}")]
    Syntax(String),
    /// Argument count differs from the template's placeholder count.
    #[error("template expects {expected} arguments, got {found}")]
    Arity {
        /// Placeholders in the template.
        expected: usize,
        /// Arguments supplied.
        found: usize,
    },
    /// Operand types unsupported by a binary operator.
    #[error("cannot apply '{op}' to {left} and {right}")]
    BinaryType {
        /// Operator symbol.
        op: &'static str,
        /// Left operand type.
        left: &'static str,
        /// Right operand type.
        right: &'static str,
    },
    /// Operand type unsupported by a unary or logical operator.
    #[error("cannot apply '{op}' to {operand}")]
    UnaryType {
        /// Operator symbol.
        op: &'static str,
        /// Operand type.
        operand: &'static str,
    },
    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// Integer arithmetic overflowed.
    #[error("integer overflow")]
    Overflow,
}

/// A parsed template ready for repeated evaluation.
#[derive(Debug, Clone)]
pub struct TemplateExpr {
    source: String,
    expr: parser::Expr,
    arity: usize,
}

impl TemplateExpr {
    /// Parse `template` once; evaluation reuses the tree.
    pub fn parse(template: &str) -> Result<Self, ExprError> {
        let (expr, arity) = parser::parse(template)?;
        Ok(Self {
            source: template.to_string(),
            expr,
            arity,
        })
    }

    /// Number of `{}` placeholders.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// The template text this expression was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate with `args[i]` bound to the i-th placeholder.
    pub fn eval(&self, args: &[&Value]) -> Result<Value, ExprError> {
        if args.len() != self.arity {
            return Err(ExprError::Arity {
                expected: self.arity,
                found: args.len(),
            });
        }
        eval::eval(&self.expr, args)
    }

    /// Evaluate as a predicate; anything but `true` is false.
    pub fn test(&self, args: &[&Value]) -> Result<bool, ExprError> {
        Ok(matches!(self.eval(args)?, Value::Bool(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::{ExprError, TemplateExpr};
    use crate::value::Value;

    fn eval(template: &str, args: &[Value]) -> Result<Value, ExprError> {
        let refs: Vec<&Value> = args.iter().collect();
        TemplateExpr::parse(template)?.eval(&refs)
    }

    #[test]
    fn arithmetic() {
        assert_eq!(eval("{}+{}", &[1.into(), 2.into()]), Ok(Value::Int(3)));
        assert_eq!(eval("{}*{}", &[3.into(), 4.into()]), Ok(Value::Int(12)));
        assert_eq!(eval("{}/1024", &[2048.into()]), Ok(Value::Int(2)));
        assert_eq!(eval("{}/2", &[3.into()]), Ok(Value::Float(1.5)));
        assert_eq!(eval("-{} % 4", &[10.into()]), Ok(Value::Int(-2)));
        assert_eq!(eval("{} + 0.5", &[1.into()]), Ok(Value::Float(1.5)));
        assert_eq!(eval("1*{}*{}", &[2.into(), 5.into()]), Ok(Value::Int(10)));
    }

    #[test]
    fn numeric_strings_bind_as_numbers() {
        assert_eq!(eval("{}+1", &["41".into()]), Ok(Value::Int(42)));
        assert_eq!(eval("{}+1", &["4.5".into()]), Ok(Value::Float(5.5)));
        assert_eq!(eval("\"{}\"+1", &["41".into()]), Ok(Value::from("411")));
    }

    #[test]
    fn strings_and_equality() {
        assert_eq!(
            eval("\"{}\"!=\"localhost\"", &["host1".into()]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            eval("\"{}\"==\"localhost\"", &["localhost".into()]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            eval("{} + '-' + {}", &["a".into(), 7.into()]),
            Ok(Value::from("a-7"))
        );
        assert_eq!(eval("{}==2.0", &[2.into()]), Ok(Value::Bool(true)));
        assert_eq!(eval("{} < 'b'", &["a".into()]), Ok(Value::Bool(true)));
        assert_eq!(eval("{}==null", &[Value::Null]), Ok(Value::Bool(true)));
    }

    #[test]
    fn logic_short_circuits() {
        assert_eq!(
            eval("{} > 0 && {} / {} > 1", &[0.into(), 1.into(), 0.into()]),
            Ok(Value::Bool(false))
        );
        assert_eq!(eval("!({} || false)", &[true.into()]), Ok(Value::Bool(false)));
    }

    #[test]
    fn failures_are_typed() {
        assert_eq!(eval("{}/0", &[1.into()]), Err(ExprError::DivisionByZero));
        assert_eq!(
            eval("{}*2", &[i64::MAX.into()]),
            Err(ExprError::Overflow)
        );
        assert_eq!(
            eval("{}+{}", &[1.into()]),
            Err(ExprError::Arity {
                expected: 2,
                found: 1
            })
        );
        assert!(matches!(
            eval("{} - 1", &["abc".into()]),
            Err(ExprError::BinaryType { op: "-", .. })
        ));
        assert!(matches!(
            eval("{} && true", &[1.into()]),
            Err(ExprError::UnaryType { op: "&&", .. })
        ));
        assert!(TemplateExpr::parse("{} +* 2").is_err());
    }

    #[test]
    fn predicates_treat_non_bool_as_false() {
        let t = TemplateExpr::parse("{}").unwrap();
        assert_eq!(t.test(&[&Value::Int(1)]), Ok(false));
        assert_eq!(t.test(&[&Value::Bool(true)]), Ok(true));
    }
}
