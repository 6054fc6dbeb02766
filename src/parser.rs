use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, digit0, digit1, multispace0, one_of},
    combinator::{all_consuming, map, map_res, opt, recognize, value},
    error::{Error as NomError, ErrorKind},
    multi::{many0, many0_count, separated_list1},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::error::GenerationError;
use crate::expr::{AssignOp, BinaryOp, Expr, Func, Scope, Statement, UnaryOp, VarRef};

pub fn parse_expression(text: &str, context: &str) -> Result<Expr, GenerationError> {
    all_consuming(expr)(text)
        .map(|(_, parsed)| parsed)
        .map_err(|err| to_generation_error(err, context))
}

/// Parses statements separated by newlines or `;`. Text after `#` is a comment.
pub fn parse_statements(text: &str, context: &str) -> Result<Vec<Statement>, GenerationError> {
    let mut statements = Vec::new();

    for line in text.split(|c| c == '\n' || c == ';') {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        let (_, parsed) =
            all_consuming(statement)(line).map_err(|err| to_generation_error(err, context))?;
        statements.push(parsed);
    }

    Ok(statements)
}

fn to_generation_error(err: nom::Err<NomError<&str>>, context: &str) -> GenerationError {
    let message = match err {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            if e.input.trim().is_empty() {
                "unexpected end of input".to_string()
            } else {
                format!("unexpected input at '{}'", e.input.trim())
            }
        }
        nom::Err::Incomplete(_) => "incomplete input".to_string(),
    };

    GenerationError::Parse {
        context: context.to_string(),
        message,
    }
}

fn failure<T>(input: &str) -> IResult<&str, T> {
    Err(nom::Err::Failure(NomError::new(input, ErrorKind::Verify)))
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn statement(input: &str) -> IResult<&str, Statement> {
    let (input, var) = ws(identifier)(input)?;
    let (input, derivative) = opt(char('\''))(input)?;
    let op_start = input;
    let (input, op) = ws(alt((
        value(AssignOp::Add, tag("+=")),
        value(AssignOp::Sub, tag("-=")),
        value(AssignOp::Set, tag("=")),
    )))(input)?;
    let (input, expr) = expr(input)?;

    let var = var.to_string();

    if derivative.is_some() {
        if op != AssignOp::Set {
            return failure(op_start);
        }
        Ok((input, Statement::Derivative { var, expr }))
    } else {
        Ok((input, Statement::Assign { var, op, expr }))
    }
}

fn expr(input: &str) -> IResult<&str, Expr> {
    or_expr(input)
}

fn fold_binary(first: Expr, rest: Vec<(BinaryOp, Expr)>) -> Expr {
    rest.into_iter()
        .fold(first, |lhs, (op, rhs)| Expr::binary(op, lhs, rhs))
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(pair(value(BinaryOp::Or, ws(tag("||"))), and_expr))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = comparison(input)?;
    let (input, rest) = many0(pair(value(BinaryOp::And, ws(tag("&&"))), comparison))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = sum(input)?;
    let (input, rhs) = opt(pair(
        ws(alt((
            value(BinaryOp::Le, tag("<=")),
            value(BinaryOp::Ge, tag(">=")),
            value(BinaryOp::Eq, tag("==")),
            value(BinaryOp::Ne, tag("!=")),
            value(BinaryOp::Lt, tag("<")),
            value(BinaryOp::Gt, tag(">")),
        ))),
        sum,
    ))(input)?;

    let parsed = match rhs {
        Some((op, rhs)) => Expr::binary(op, lhs, rhs),
        None => lhs,
    };
    Ok((input, parsed))
}

fn sum(input: &str) -> IResult<&str, Expr> {
    let (input, first) = product(input)?;
    let (input, rest) = many0(pair(
        ws(map(one_of("+-"), |c| {
            if c == '+' {
                BinaryOp::Add
            } else {
                BinaryOp::Sub
            }
        })),
        product,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn product(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(pair(
        ws(map(one_of("*/"), |c| {
            if c == '*' {
                BinaryOp::Mul
            } else {
                BinaryOp::Div
            }
        })),
        unary,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('-')), unary), |operand| {
            Expr::unary(UnaryOp::Neg, operand)
        }),
        map(preceded(ws(char('!')), unary), |operand| {
            Expr::unary(UnaryOp::Not, operand)
        }),
        power,
    ))(input)
}

fn power(input: &str) -> IResult<&str, Expr> {
    let (input, base) = primary(input)?;
    let (input, exponent) = opt(preceded(ws(char('^')), unary))(input)?;

    let parsed = match exponent {
        Some(exponent) => Expr::binary(BinaryOp::Pow, base, exponent),
        None => base,
    };
    Ok((input, parsed))
}

fn primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        number,
        var_or_call,
        delimited(char('('), expr, char(')')),
    )))(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    map_res(
        recognize(tuple((
            digit1,
            opt(pair(char('.'), digit0)),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        |text: &str| {
            text.parse::<f64>().map(|value| Expr::Number {
                value,
                integral: !text.contains(|c| c == '.' || c == 'e' || c == 'E'),
            })
        },
    )(input)
}

fn var_or_call(input: &str) -> IResult<&str, Expr> {
    let start = input;
    let (input, name) = identifier(input)?;

    let (input, args) = opt(delimited(
        ws(char('(')),
        separated_list1(ws(char(',')), expr),
        ws(char(')')),
    ))(input)?;

    if let Some(args) = args {
        return match Func::from_name(name) {
            Some(func) if func.arity() == args.len() => Ok((input, Expr::Call { func, args })),
            _ => failure(start),
        };
    }

    let (input, member) = opt(preceded(char('.'), identifier))(input)?;

    let var = match member {
        None => VarRef::local(name),
        Some(member) => {
            let scope = match name {
                "pre" => Scope::Pre,
                "post" => Scope::Post,
                _ => return failure(start),
            };
            VarRef {
                scope,
                name: member.to_string(),
            }
        }
    };

    Ok((input, Expr::Var(var)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(value: f64) -> Expr {
        Expr::Number {
            value,
            integral: false,
        }
    }

    fn int(value: f64) -> Expr {
        Expr::Number {
            value,
            integral: true,
        }
    }

    fn var(name: &str) -> Expr {
        Expr::Var(VarRef::local(name))
    }

    #[test]
    fn precedence() {
        let parsed = parse_expression("a + 2 * b ^ 2", "test").unwrap();
        assert_eq!(
            parsed,
            Expr::binary(
                BinaryOp::Add,
                var("a"),
                Expr::binary(
                    BinaryOp::Mul,
                    int(2.0),
                    Expr::binary(BinaryOp::Pow, var("b"), int(2.0))
                )
            )
        );
    }

    #[test]
    fn left_associative_subtraction() {
        let parsed = parse_expression("a - b - c", "test").unwrap();
        assert_eq!(
            parsed,
            Expr::binary(
                BinaryOp::Sub,
                Expr::binary(BinaryOp::Sub, var("a"), var("b")),
                var("c")
            )
        );
    }

    #[test]
    fn literals() {
        assert_eq!(parse_expression("3", "test").unwrap(), int(3.0));
        assert_eq!(parse_expression("0.04", "test").unwrap(), num(0.04));
        assert_eq!(parse_expression("1e-3", "test").unwrap(), num(1e-3));
    }

    #[test]
    fn unary_minus_binds_weaker_than_power() {
        let parsed = parse_expression("-x^2", "test").unwrap();
        assert_eq!(
            parsed,
            Expr::unary(
                UnaryOp::Neg,
                Expr::binary(BinaryOp::Pow, var("x"), int(2.0))
            )
        );
    }

    #[test]
    fn logic_and_comparison() {
        let parsed = parse_expression("V >= 30 && !(u < 1.5)", "test").unwrap();
        assert_eq!(
            parsed,
            Expr::binary(
                BinaryOp::And,
                Expr::binary(BinaryOp::Ge, var("V"), int(30.0)),
                Expr::unary(
                    UnaryOp::Not,
                    Expr::binary(BinaryOp::Lt, var("u"), num(1.5))
                )
            )
        );
    }

    #[test]
    fn calls_and_qualified_vars() {
        let parsed = parse_expression("weight * max(pre.V, post.E)", "test").unwrap();
        assert_eq!(
            parsed,
            Expr::binary(
                BinaryOp::Mul,
                var("weight"),
                Expr::Call {
                    func: Func::Max,
                    args: vec![
                        Expr::Var(VarRef {
                            scope: Scope::Pre,
                            name: "V".to_string()
                        }),
                        Expr::Var(VarRef {
                            scope: Scope::Post,
                            name: "E".to_string()
                        }),
                    ]
                }
            )
        );
    }

    #[test]
    fn statements() {
        let text = "
            # Izhikevich
            V' = 0.04 * V * V + 5 * V + 140 - u + I
            u' = a * (b * V - u); n += 1
        ";

        let statements = parse_statements(text, "test").unwrap();
        assert_eq!(statements.len(), 3);
        assert!(matches!(&statements[0], Statement::Derivative { var, .. } if var == "V"));
        assert!(matches!(&statements[1], Statement::Derivative { var, .. } if var == "u"));
        assert_eq!(
            statements[2],
            Statement::Assign {
                var: "n".to_string(),
                op: AssignOp::Add,
                expr: int(1.0)
            }
        );
    }

    #[test]
    fn errors() {
        assert!(matches!(
            parse_expression("a +", "test"),
            Err(GenerationError::Parse { .. })
        ));
        assert!(matches!(
            parse_expression("frobnicate(a)", "test"),
            Err(GenerationError::Parse { .. })
        ));
        assert!(matches!(
            parse_expression("min(a)", "test"),
            Err(GenerationError::Parse { .. })
        ));
        assert!(matches!(
            parse_expression("self.V", "test"),
            Err(GenerationError::Parse { .. })
        ));
        assert!(matches!(
            parse_statements("V' += 1", "test"),
            Err(GenerationError::Parse { .. })
        ));
    }
}
