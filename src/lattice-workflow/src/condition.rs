//! Restricted evaluator for step conditions.
//!
//! After template substitution a condition is a small expression over
//! literals: strings (single or double quoted), numbers, `true`, `false`,
//! `null` and `undefined`, combined with `== != === !== < <= > >=`,
//! `&& || !` and parentheses. Anything else, identifiers and calls included,
//! is rejected.

use thiserror::Error;

/// Deepest allowed nesting of parentheses and `!`.
pub const MAX_NESTING: usize = 64;

/// Longest allowed condition, in tokens.
pub const MAX_TOKENS: usize = 1024;

/// Why a condition could not be evaluated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("identifiers are not allowed in conditions: '{0}'")]
    Identifier(String),

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unexpected end of condition")]
    UnexpectedEnd,

    #[error("condition is empty")]
    Empty,

    #[error("condition nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("condition has more than {0} tokens")]
    TooLong(usize),
}

/// A literal value with loose JavaScript-like comparison semantics.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Literal {
    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::Str(s) => !s.is_empty(),
        }
    }

    fn to_number(&self) -> f64 {
        match self {
            Self::Undefined => f64::NAN,
            Self::Null => 0.0,
            Self::Bool(b) => f64::from(u8::from(*b)),
            Self::Number(n) => *n,
            Self::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    parse_numeric_string(trimmed)
                }
            }
        }
    }

    fn strict_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a == b,
            _ => self == other,
        }
    }

    fn loose_eq(&self, other: &Self) -> bool {
        use Literal::*;
        match (self, other) {
            (Undefined | Null, Undefined | Null) => true,
            (Undefined | Null, _) | (_, Undefined | Null) => false,
            (Str(a), Str(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            _ => self.to_number() == other.to_number(),
        }
    }

    fn compare(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            _ => self.to_number().partial_cmp(&other.to_number()),
        }
    }
}

/// Numeric value of a non-empty trimmed string, `NaN` when it is not a
/// number. Only the exact spelling `Infinity` yields an infinite value.
fn parse_numeric_string(s: &str) -> f64 {
    let unsigned = s.strip_prefix(['+', '-']).unwrap_or(s);
    if unsigned == "Infinity" {
        return if s.starts_with('-') { f64::NEG_INFINITY } else { f64::INFINITY };
    }
    if unsigned.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') {
        return f64::NAN;
    }
    s.parse().unwrap_or(f64::NAN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Parsed condition.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Literal),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self) -> Literal {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Not(inner) => Literal::Bool(!inner.eval().truthy()),
            Self::Binary(BinaryOp::And, lhs, rhs) => {
                let left = lhs.eval();
                if left.truthy() { rhs.eval() } else { left }
            }
            Self::Binary(BinaryOp::Or, lhs, rhs) => {
                let left = lhs.eval();
                if left.truthy() { left } else { rhs.eval() }
            }
            Self::Binary(op, lhs, rhs) => {
                let (left, right) = (lhs.eval(), rhs.eval());
                let ordering = || left.compare(&right);
                let result = match op {
                    BinaryOp::Eq => left.loose_eq(&right),
                    BinaryOp::NotEq => !left.loose_eq(&right),
                    BinaryOp::StrictEq => left.strict_eq(&right),
                    BinaryOp::StrictNotEq => !left.strict_eq(&right),
                    BinaryOp::Lt => ordering().is_some_and(|o| o.is_lt()),
                    BinaryOp::Le => ordering().is_some_and(|o| o.is_le()),
                    BinaryOp::Gt => ordering().is_some_and(|o| o.is_gt()),
                    BinaryOp::Ge => ordering().is_some_and(|o| o.is_ge()),
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                };
                Literal::Bool(result)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Literal),
    Op(BinaryOp),
    Not,
    LParen,
    RParen,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "{value:?}"),
            Self::Op(op) => write!(f, "{op:?}"),
            Self::Not => f.write_str("!"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |i: usize| chars.get(i).map(|&(_, c)| c);

    while let Some(&(offset, ch)) = chars.get(i) {
        match ch {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if peek(i + 1) == Some('&') => {
                tokens.push(Token::Op(BinaryOp::And));
                i += 2;
            }
            '|' if peek(i + 1) == Some('|') => {
                tokens.push(Token::Op(BinaryOp::Or));
                i += 2;
            }
            '=' | '!' if peek(i + 1) == Some('=') => {
                let strict = peek(i + 2) == Some('=');
                let op = match (ch, strict) {
                    ('=', true) => BinaryOp::StrictEq,
                    ('=', false) => BinaryOp::Eq,
                    (_, true) => BinaryOp::StrictNotEq,
                    (_, false) => BinaryOp::NotEq,
                };
                tokens.push(Token::Op(op));
                i += if strict { 3 } else { 2 };
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let inclusive = peek(i + 1) == Some('=');
                let op = match (ch, inclusive) {
                    ('<', false) => BinaryOp::Lt,
                    ('<', true) => BinaryOp::Le,
                    (_, false) => BinaryOp::Gt,
                    (_, true) => BinaryOp::Ge,
                };
                tokens.push(Token::Op(op));
                i += if inclusive { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = ch;
                let mut value = String::new();
                let mut j = i + 1;
                loop {
                    match peek(j) {
                        None => return Err(ConditionError::UnterminatedString(offset)),
                        Some('\\') => {
                            let escaped =
                                peek(j + 1).ok_or(ConditionError::UnterminatedString(offset))?;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => other,
                            });
                            j += 2;
                        }
                        Some(c) if c == quote => break,
                        Some(c) => {
                            value.push(c);
                            j += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Literal::Str(value)));
                i = j + 1;
            }
            c if c.is_ascii_digit() || c == '.' || (c == '-' && starts_number(peek(i + 1))) => {
                let mut j = i + 1;
                while let Some(c) = peek(j) {
                    let exponent_sign =
                        (c == '+' || c == '-') && matches!(peek(j - 1), Some('e' | 'E'));
                    if c.is_ascii_alphanumeric() || c == '.' || exponent_sign {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[i..j].iter().map(|&(_, c)| c).collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::InvalidNumber(text.clone()))?;
                tokens.push(Token::Literal(Literal::Number(number)));
                i = j;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut j = i + 1;
                while let Some(c) = peek(j) {
                    if c.is_alphanumeric() || c == '_' || c == '$' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let word: String = chars[i..j].iter().map(|&(_, c)| c).collect();
                let literal = match word.as_str() {
                    "true" => Literal::Bool(true),
                    "false" => Literal::Bool(false),
                    "null" => Literal::Null,
                    "undefined" => Literal::Undefined,
                    _ => return Err(ConditionError::Identifier(word)),
                };
                tokens.push(Token::Literal(literal));
                i = j;
            }
            other => return Err(ConditionError::UnexpectedChar { ch: other, offset }),
        }
    }
    Ok(tokens)
}

fn starts_number(next: Option<char>) -> bool {
    next.is_some_and(|c| c.is_ascii_digit() || c == '.')
}

/// Recursive-descent parser, lowest precedence first:
/// `||`, `&&`, equality, relational, unary `!`, primary.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn nested(
        &mut self,
        parse: fn(&mut Self) -> Result<Expr, ConditionError>,
    ) -> Result<Expr, ConditionError> {
        if self.depth >= MAX_NESTING {
            return Err(ConditionError::TooDeep(MAX_NESTING));
        }
        self.depth += 1;
        let expr = parse(self);
        self.depth -= 1;
        expr
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_op(&self, accepted: &[BinaryOp]) -> Option<BinaryOp> {
        match self.peek() {
            Some(Token::Op(op)) if accepted.contains(op) => Some(*op),
            _ => None,
        }
    }

    fn binary(
        &mut self,
        accepted: &[BinaryOp],
        operand: fn(&mut Self) -> Result<Expr, ConditionError>,
    ) -> Result<Expr, ConditionError> {
        let mut expr = operand(self)?;
        while let Some(op) = self.peek_op(accepted) {
            self.pos += 1;
            let rhs = operand(self)?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        self.binary(&[BinaryOp::Or], Self::and)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        self.binary(&[BinaryOp::And], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, ConditionError> {
        self.binary(
            &[BinaryOp::Eq, BinaryOp::NotEq, BinaryOp::StrictEq, BinaryOp::StrictNotEq],
            Self::relational,
        )
    }

    fn relational(&mut self) -> Result<Expr, ConditionError> {
        self.binary(&[BinaryOp::Lt, BinaryOp::Le, BinaryOp::Gt, BinaryOp::Ge], Self::unary)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.nested(Self::unary)?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::LParen) => {
                let inner = self.nested(Self::or)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ConditionError::UnexpectedToken(other.to_string())),
                    None => Err(ConditionError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ConditionError::UnexpectedToken(other.to_string())),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }
}

/// Evaluate an already-substituted condition to its truthiness.
pub fn evaluate(condition: &str) -> Result<bool, ConditionError> {
    let tokens = tokenize(condition)?;
    if tokens.is_empty() {
        return Err(ConditionError::Empty);
    }
    if tokens.len() > MAX_TOKENS {
        return Err(ConditionError::TooLong(MAX_TOKENS));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    if let Some(extra) = parser.peek() {
        return Err(ConditionError::UnexpectedToken(extra.to_string()));
    }
    Ok(expr.eval().truthy())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(input: &str) -> bool {
        evaluate(input).unwrap_or_else(|e| panic!("{input}: {e}"))
    }

    #[test]
    fn test_literals_and_truthiness() {
        assert!(eval("true"));
        assert!(!eval("false"));
        assert!(!eval("0"));
        assert!(eval("'x'"));
        assert!(!eval("''"));
        assert!(!eval("null"));
        assert!(!eval("undefined"));
        assert!(eval("-1.5"));
    }

    #[test]
    fn test_equality() {
        assert!(eval("'ok' === 'ok'"));
        assert!(eval("\"ok\" !== 'fail'"));
        assert!(eval("1 == '1'"));
        assert!(!eval("1 === '1'"));
        assert!(eval("null == undefined"));
        assert!(!eval("null === undefined"));
        assert!(!eval("0 == null"));
        assert!(eval("true == 1"));
    }

    #[test]
    fn test_relational() {
        assert!(eval("2 > 1"));
        assert!(eval("2 >= 2"));
        assert!(eval("'10' < 9.5e1"));
        assert!(eval("'apple' < 'banana'"));
        assert!(!eval("'abc' < 1"));
        assert!(!eval("undefined > 0"));
    }

    #[test]
    fn test_non_finite_strings() {
        assert!(!eval("'inf' > 1"));
        assert!(!eval("'infinity' > 1"));
        assert!(!eval("'NaN' == 'NaN' && 'NaN' < 1"));
        assert!(eval("'Infinity' > 1e300"));
        assert!(eval("'-Infinity' < -1e300"));
        assert!(eval("' 42 ' == 42"));
        assert!(eval("'1e3' == 1000"));
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        assert!(eval("1 > 2 || 3 > 2 && 'a' === 'a'"));
        assert!(!eval("(1 > 2 || 3 > 2) && 'a' === 'b'"));
        assert!(eval("!(1 > 2)"));
        assert!(eval("!!'x'"));
        assert!(!eval("!true || false"));
    }

    #[test]
    fn test_rejects_code() {
        assert!(matches!(evaluate("process.exit()"), Err(ConditionError::Identifier(_))));
        assert!(matches!(evaluate("ok === 'ok'"), Err(ConditionError::Identifier(_))));
        assert!(matches!(evaluate("1 + 1"), Err(ConditionError::UnexpectedChar { ch: '+', .. })));
        assert!(matches!(
            evaluate("{\"a\":1}"),
            Err(ConditionError::UnexpectedChar { ch: '{', .. })
        ));
    }

    #[test]
    fn test_malformed() {
        assert_eq!(evaluate(""), Err(ConditionError::Empty));
        assert_eq!(evaluate("(true"), Err(ConditionError::UnexpectedEnd));
        assert_eq!(evaluate("1 >"), Err(ConditionError::UnexpectedEnd));
        assert!(matches!(evaluate("'open"), Err(ConditionError::UnterminatedString(0))));
        assert!(matches!(evaluate("true false"), Err(ConditionError::UnexpectedToken(_))));
    }

    #[test]
    fn test_nesting_limit() {
        let shallow = format!("{}true{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(eval(&shallow));
        assert!(eval(&format!("{}true", "!!".repeat(MAX_NESTING / 2))));

        let deep = format!("{}true{}", "(".repeat(200_000), ")".repeat(200_000));
        assert_eq!(evaluate(&deep), Err(ConditionError::TooLong(MAX_TOKENS)));

        let parens = format!("{}true{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        assert_eq!(evaluate(&parens), Err(ConditionError::TooDeep(MAX_NESTING)));
        let nots = format!("{}true", "!".repeat(MAX_NESTING + 1));
        assert_eq!(evaluate(&nots), Err(ConditionError::TooDeep(MAX_NESTING)));
    }

    #[test]
    fn test_long_chain_is_rejected() {
        let chain = vec!["true"; MAX_TOKENS].join(" && ");
        assert_eq!(evaluate(&chain), Err(ConditionError::TooLong(MAX_TOKENS)));
        let short = vec!["true"; 100].join(" && ");
        assert!(eval(&short));
    }
}
