//! Calculated-field expressions.
//!
//! Grammar (leading `=` optional):
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('-' | '+') unary | power
//! power   := primary ('^' unary)?
//! primary := number | field | '(' expr ')'
//! field   := bare_name | 'quoted name'
//! ```
//!
//! Field references resolve to the aggregated value of that field in the
//! current pivot cell; evaluation errors surface as Excel error texts.

use std::fmt;

/// Binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumFormulaOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum EnumFormulaExpr {
    Number(f64),
    Field(String),
    Neg(Box<EnumFormulaExpr>),
    Binary {
        op: EnumFormulaOp,
        lhs: Box<EnumFormulaExpr>,
        rhs: Box<EnumFormulaExpr>,
    },
}

/// Evaluation failure, rendered as the matching spreadsheet error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumFormulaEvalError {
    DivZero,
    UnknownField,
    NotANumber,
}

impl fmt::Display for EnumFormulaEvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EnumFormulaEvalError::DivZero => "#DIV/0!",
            EnumFormulaEvalError::UnknownField => "#NAME?",
            EnumFormulaEvalError::NotANumber => "#NUM!",
        })
    }
}

/// A parsed calculated-field formula.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecFormula {
    pub text: String,
    pub expr: EnumFormulaExpr,
}

impl SpecFormula {
    /// Referenced field names in order of first appearance.
    pub fn field_refs(&self) -> Vec<String> {
        let mut l_refs = Vec::new();
        collect_field_refs(&self.expr, &mut l_refs);
        l_refs
    }

    /// Evaluate with `lookup` supplying field values.
    pub fn evaluate<F>(&self, lookup: &F) -> Result<f64, EnumFormulaEvalError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        evaluate_expr(&self.expr, lookup)
    }
}

fn collect_field_refs(expr: &EnumFormulaExpr, l_refs: &mut Vec<String>) {
    match expr {
        EnumFormulaExpr::Number(_) => {}
        EnumFormulaExpr::Field(name) => {
            if !l_refs.iter().any(|r| r == name) {
                l_refs.push(name.clone());
            }
        }
        EnumFormulaExpr::Neg(inner) => collect_field_refs(inner, l_refs),
        EnumFormulaExpr::Binary { lhs, rhs, .. } => {
            collect_field_refs(lhs, l_refs);
            collect_field_refs(rhs, l_refs);
        }
    }
}

fn evaluate_expr<F>(expr: &EnumFormulaExpr, lookup: &F) -> Result<f64, EnumFormulaEvalError>
where
    F: Fn(&str) -> Option<f64>,
{
    let n_value = match expr {
        EnumFormulaExpr::Number(n) => *n,
        EnumFormulaExpr::Field(name) => lookup(name).ok_or(EnumFormulaEvalError::UnknownField)?,
        EnumFormulaExpr::Neg(inner) => -evaluate_expr(inner, lookup)?,
        EnumFormulaExpr::Binary { op, lhs, rhs } => {
            let n_lhs = evaluate_expr(lhs, lookup)?;
            let n_rhs = evaluate_expr(rhs, lookup)?;
            match op {
                EnumFormulaOp::Add => n_lhs + n_rhs,
                EnumFormulaOp::Sub => n_lhs - n_rhs,
                EnumFormulaOp::Mul => n_lhs * n_rhs,
                EnumFormulaOp::Div => {
                    if n_rhs == 0.0 {
                        return Err(EnumFormulaEvalError::DivZero);
                    }
                    n_lhs / n_rhs
                }
                EnumFormulaOp::Pow => n_lhs.powf(n_rhs),
            }
        }
    };
    if n_value.is_finite() {
        Ok(n_value)
    } else {
        Err(EnumFormulaEvalError::NotANumber)
    }
}

////////////////////////////////////////////////////////////////////////////////
// #region Lexer

#[derive(Debug, Clone, PartialEq)]
enum EnumToken {
    Number(f64),
    Name(String),
    Op(EnumFormulaOp),
    LParen,
    RParen,
}

fn is_name_char(chr: char) -> bool {
    chr.is_alphanumeric() || chr == '_' || chr == '.'
}

fn tokenize(text: &str) -> Result<Vec<EnumToken>, String> {
    let l_chars: Vec<char> = text.chars().collect();
    let mut l_tokens = Vec::new();
    let mut n_idx = 0;

    while n_idx < l_chars.len() {
        let chr = l_chars[n_idx];
        match chr {
            c if c.is_whitespace() => n_idx += 1,
            '+' | '-' | '*' | '/' | '^' => {
                l_tokens.push(EnumToken::Op(match chr {
                    '+' => EnumFormulaOp::Add,
                    '-' => EnumFormulaOp::Sub,
                    '*' => EnumFormulaOp::Mul,
                    '/' => EnumFormulaOp::Div,
                    _ => EnumFormulaOp::Pow,
                }));
                n_idx += 1;
            }
            '(' => {
                l_tokens.push(EnumToken::LParen);
                n_idx += 1;
            }
            ')' => {
                l_tokens.push(EnumToken::RParen);
                n_idx += 1;
            }
            '\'' => {
                // '' inside quotes is an escaped apostrophe
                let mut c_name = String::new();
                n_idx += 1;
                loop {
                    match l_chars.get(n_idx) {
                        None => return Err("unterminated quoted field name".to_string()),
                        Some('\'') if l_chars.get(n_idx + 1) == Some(&'\'') => {
                            c_name.push('\'');
                            n_idx += 2;
                        }
                        Some('\'') => {
                            n_idx += 1;
                            break;
                        }
                        Some(c) => {
                            c_name.push(*c);
                            n_idx += 1;
                        }
                    }
                }
                if c_name.trim().is_empty() {
                    return Err("empty quoted field name".to_string());
                }
                l_tokens.push(EnumToken::Name(c_name));
            }
            c if c.is_ascii_digit() => {
                let n_start = n_idx;
                while n_idx < l_chars.len()
                    && (l_chars[n_idx].is_ascii_digit() || l_chars[n_idx] == '.')
                {
                    n_idx += 1;
                }
                let c_num: String = l_chars[n_start..n_idx].iter().collect();
                let n_value = c_num
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number `{c_num}`"))?;
                l_tokens.push(EnumToken::Number(n_value));
            }
            c if is_name_char(c) => {
                let n_start = n_idx;
                while n_idx < l_chars.len() && is_name_char(l_chars[n_idx]) {
                    n_idx += 1;
                }
                l_tokens.push(EnumToken::Name(l_chars[n_start..n_idx].iter().collect()));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }
    Ok(l_tokens)
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Parser

struct FormulaParser {
    l_tokens: Vec<EnumToken>,
    n_pos: usize,
}

impl FormulaParser {
    fn peek(&self) -> Option<&EnumToken> {
        self.l_tokens.get(self.n_pos)
    }

    fn next(&mut self) -> Option<EnumToken> {
        let token = self.l_tokens.get(self.n_pos).cloned();
        self.n_pos += 1;
        token
    }

    fn parse_expr(&mut self) -> Result<EnumFormulaExpr, String> {
        let mut lhs = self.parse_term()?;
        while let Some(EnumToken::Op(op @ (EnumFormulaOp::Add | EnumFormulaOp::Sub))) =
            self.peek()
        {
            let op = *op;
            self.n_pos += 1;
            let rhs = self.parse_term()?;
            lhs = EnumFormulaExpr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<EnumFormulaExpr, String> {
        let mut lhs = self.parse_unary()?;
        while let Some(EnumToken::Op(op @ (EnumFormulaOp::Mul | EnumFormulaOp::Div))) =
            self.peek()
        {
            let op = *op;
            self.n_pos += 1;
            let rhs = self.parse_unary()?;
            lhs = EnumFormulaExpr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<EnumFormulaExpr, String> {
        match self.peek() {
            Some(EnumToken::Op(EnumFormulaOp::Sub)) => {
                self.n_pos += 1;
                Ok(EnumFormulaExpr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(EnumToken::Op(EnumFormulaOp::Add)) => {
                self.n_pos += 1;
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<EnumFormulaExpr, String> {
        let base = self.parse_primary()?;
        if let Some(EnumToken::Op(EnumFormulaOp::Pow)) = self.peek() {
            self.n_pos += 1;
            let exponent = self.parse_unary()?;
            return Ok(EnumFormulaExpr::Binary {
                op: EnumFormulaOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<EnumFormulaExpr, String> {
        match self.next() {
            Some(EnumToken::Number(n)) => Ok(EnumFormulaExpr::Number(n)),
            Some(EnumToken::Name(name)) => Ok(EnumFormulaExpr::Field(name)),
            Some(EnumToken::LParen) => {
                let inner = self.parse_expr()?;
                match self.next() {
                    Some(EnumToken::RParen) => Ok(inner),
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of formula".to_string()),
        }
    }
}

/// Parse formula text such as `= 'orders' / visits`.
pub fn parse_formula(text: &str) -> Result<SpecFormula, String> {
    let c_body = text.trim();
    let c_body = c_body.strip_prefix('=').unwrap_or(c_body);
    let l_tokens = tokenize(c_body)?;
    if l_tokens.is_empty() {
        return Err("empty formula".to_string());
    }

    let mut parser = FormulaParser { l_tokens, n_pos: 0 };
    let expr = parser.parse_expr()?;
    if let Some(token) = parser.peek() {
        return Err(format!("unexpected trailing token {token:?}"));
    }
    Ok(SpecFormula {
        text: text.to_string(),
        expr,
    })
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<f64> {
        match name {
            "orders" => Some(30.0),
            "visits" => Some(120.0),
            "my field" => Some(2.0),
            "zero" => Some(0.0),
            _ => None,
        }
    }

    #[test]
    fn test_parse_and_evaluate_ratio_with_quoted_refs() {
        let formula = parse_formula("= 'orders' / visits").expect("parse");
        assert_eq!(formula.field_refs(), vec!["orders", "visits"]);
        assert_eq!(formula.evaluate(&lookup), Ok(0.25));
    }

    #[test]
    fn test_precedence_and_unary_minus() {
        let formula = parse_formula("=-'my field' + 3 * (orders - 28) ^ 2").expect("parse");
        assert_eq!(formula.evaluate(&lookup), Ok(10.0));
    }

    #[test]
    fn test_division_by_zero_is_excel_error() {
        let formula = parse_formula("orders / zero").expect("parse");
        let err = formula.evaluate(&lookup).expect_err("div zero");
        assert_eq!(err.to_string(), "#DIV/0!");
    }

    #[test]
    fn test_unknown_field_evaluates_to_name_error() {
        let formula = parse_formula("missing * 2").expect("parse");
        assert_eq!(formula.evaluate(&lookup), Err(EnumFormulaEvalError::UnknownField));
    }

    #[test]
    fn test_parse_rejects_malformed_formulas() {
        assert!(parse_formula("=").is_err());
        assert!(parse_formula("(orders / visits").is_err());
        assert!(parse_formula("orders visits").is_err());
        assert!(parse_formula("'unterminated").is_err());
        assert!(parse_formula("orders # 2").is_err());
    }
}
