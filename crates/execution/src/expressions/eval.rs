//! Tree-walking evaluator over bound argument values.

use std::cmp::Ordering;

use super::parser::{BinaryOp, Expr, StrPart};
use super::ExprError;
use crate::value::Value;

pub(crate) fn eval(expr: &Expr, args: &[&Value]) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Arg(i) => Ok(bare_arg(args[*i])),
        Expr::Interpolated(parts) => {
            let mut s = String::new();
            for part in parts {
                match part {
                    StrPart::Text(t) => s.push_str(t),
                    StrPart::Arg(i) => s.push_str(&args[*i].to_string()),
                }
            }
            Ok(Value::Str(s))
        }
        Expr::Not(inner) => match eval(inner, args)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExprError::UnaryType {
                op: "!",
                operand: other.type_name(),
            }),
        },
        Expr::Neg(inner) => match eval(inner, args)? {
            Value::Int(i) => i.checked_neg().map(Value::Int).ok_or(ExprError::Overflow),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(ExprError::UnaryType {
                op: "-",
                operand: other.type_name(),
            }),
        },
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And | BinaryOp::Or => logical(*op, left, right, args),
            _ => {
                let l = eval(left, args)?;
                let r = eval(right, args)?;
                binary(*op, &l, &r)
            }
        },
    }
}

/// A bare placeholder bound to a numeric-looking string evaluates as a number.
fn bare_arg(v: &Value) -> Value {
    if let Value::Str(s) = v {
        let t = s.trim();
        if let Ok(i) = t.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = t.parse::<f64>() {
            if f.is_finite() {
                return Value::Float(f);
            }
        }
    }
    v.clone()
}

fn logical(op: BinaryOp, left: &Expr, right: &Expr, args: &[&Value]) -> Result<Value, ExprError> {
    let as_bool = |v: Value| match v {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::UnaryType {
            op: op.symbol(),
            operand: other.type_name(),
        }),
    };
    let l = as_bool(eval(left, args)?)?;
    let short_circuit = match op {
        BinaryOp::And => !l,
        _ => l,
    };
    if short_circuit {
        return Ok(Value::Bool(l));
    }
    Ok(Value::Bool(as_bool(eval(right, args)?)?))
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(l, r).ok_or_else(|| type_error(op, l, r))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::Add if matches!(l, Value::Str(_)) || matches!(r, Value::Str(_)) => {
            Ok(Value::Str(format!("{l}{r}")))
        }
        _ => arithmetic(op, l, r),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExprError> {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        let (a, b) = (*a, *b);
        let checked = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => return Err(ExprError::DivisionByZero),
            BinaryOp::Div if a.checked_rem(b).is_some_and(|rem| rem != 0) => {
                return Ok(Value::Float(a as f64 / b as f64))
            }
            BinaryOp::Div => a.checked_div(b),
            BinaryOp::Rem => a.checked_rem(b),
            _ => return Err(type_error(op, l, r)),
        };
        return checked.map(Value::Int).ok_or(ExprError::Overflow);
    }

    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(type_error(op, l, r));
    };
    let out = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(ExprError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err(type_error(op, l, r)),
    };
    Ok(Value::Float(out))
}

/// Numbers compare by value across int/float, and a string equals a number
/// it parses to.
fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Str(s), n) | (n, Value::Str(s)) if n.as_f64().is_some() => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => l == r,
        },
    }
}

fn compare(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
    }
}

fn type_error(op: BinaryOp, l: &Value, r: &Value) -> ExprError {
    ExprError::BinaryType {
        op: op.symbol(),
        left: l.type_name(),
        right: r.type_name(),
    }
}
