//! Rule condition syntax.
//!
//! Conditions are small boolean expressions bound to column names:
//!
//! ```text
//! required(lei) && (notional > 0 || side == "SELL")
//! one_of(currency, ["EUR", "USD"]) && !is_null(trade_date)
//! unique(trade_id, venue)
//! ```
//!
//! Supported: `||`, `&&`, prefix `!`, parentheses, `== != < <= > >=`, JSON-style literals
//! (numbers, single or double quoted strings, `true`, `false`, `null`, `[lists]`), bare column
//! identifiers, and calls to named functions. Nothing else; rules stay configuration.

use serde_json::{Number, Value};
use thiserror::Error;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Column(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Column names referenced anywhere in the expression, in order of first appearance.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        self.collect_columns(&mut columns);
        columns
    }

    fn collect_columns(&self, columns: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Column(name) => {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
            Expr::Not(inner) => inner.collect_columns(columns),
            Expr::List(items) | Expr::And(items) | Expr::Or(items) | Expr::Call { args: items, .. } => {
                for item in items {
                    item.collect_columns(columns);
                }
            }
            Expr::Compare { left, right, .. } => {
                left.collect_columns(columns);
                right.collect_columns(columns);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct SyntaxError {
    pub message: String,
    pub offset: usize,
}

impl SyntaxError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Strips whitespace and an optional outer `${{ ... }}` wrapper.
pub fn normalize_condition_expression(raw_expression: &str) -> String {
    let trimmed = raw_expression.trim();
    if let Some(stripped) = trimmed.strip_prefix("${{") {
        let inner = stripped.trim();
        let inner = inner.strip_suffix("}}").unwrap_or(inner);
        inner.trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Parses a condition into an expression tree.
pub fn parse_condition(source: &str) -> Result<Expr, SyntaxError> {
    let normalized = normalize_condition_expression(source);
    if normalized.is_empty() {
        return Err(SyntaxError::new("expression cannot be empty", 0));
    }
    let tokens = tokenize(&normalized)?;
    let mut parser = Parser { tokens, position: 0 };
    let expression = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(SyntaxError::new(format!("unexpected {}", token.kind.describe()), token.offset));
    }
    Ok(expression)
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Identifier(String),
    Number(Number),
    Text(String),
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,
    Comma,
    AndAnd,
    OrOr,
    Bang,
    Compare(CompareOp),
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Identifier(name) => format!("identifier '{name}'"),
            TokenKind::Number(number) => format!("number {number}"),
            TokenKind::Text(text) => format!("string \"{text}\""),
            TokenKind::OpenParen => "'('".into(),
            TokenKind::CloseParen => "')'".into(),
            TokenKind::OpenBracket => "'['".into(),
            TokenKind::CloseBracket => "']'".into(),
            TokenKind::Comma => "','".into(),
            TokenKind::AndAnd => "'&&'".into(),
            TokenKind::OrOr => "'||'".into(),
            TokenKind::Bang => "'!'".into(),
            TokenKind::Compare(_) => "comparison operator".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let characters: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut index = 0usize;

    while index < characters.len() {
        let (offset, character) = characters[index];
        let next = characters.get(index + 1).map(|(_, next)| *next);

        let (kind, consumed) = match character {
            c if c.is_whitespace() => {
                index += 1;
                continue;
            }
            '(' => (TokenKind::OpenParen, 1),
            ')' => (TokenKind::CloseParen, 1),
            '[' => (TokenKind::OpenBracket, 1),
            ']' => (TokenKind::CloseBracket, 1),
            ',' => (TokenKind::Comma, 1),
            '&' if next == Some('&') => (TokenKind::AndAnd, 2),
            '|' if next == Some('|') => (TokenKind::OrOr, 2),
            '=' if next == Some('=') => {
                if characters.get(index + 2).map(|(_, c)| *c) == Some('=') {
                    return Err(SyntaxError::new("strict equality operators are unsupported; use '==' or '!='", offset));
                }
                (TokenKind::Compare(CompareOp::Eq), 2)
            }
            '!' if next == Some('=') => (TokenKind::Compare(CompareOp::Ne), 2),
            '!' => (TokenKind::Bang, 1),
            '<' if next == Some('=') => (TokenKind::Compare(CompareOp::Le), 2),
            '<' => (TokenKind::Compare(CompareOp::Lt), 1),
            '>' if next == Some('=') => (TokenKind::Compare(CompareOp::Ge), 2),
            '>' => (TokenKind::Compare(CompareOp::Gt), 1),
            '"' | '\'' => {
                let (text, consumed) = read_string(&characters[index..], character, offset)?;
                (TokenKind::Text(text), consumed)
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|next| next.is_ascii_digit())) => {
                let (number, consumed) = read_number(&characters[index..], offset)?;
                (TokenKind::Number(number), consumed)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let identifier: String = characters[index..]
                    .iter()
                    .map(|(_, c)| *c)
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                    .collect();
                let consumed = identifier.chars().count();
                (TokenKind::Identifier(identifier), consumed)
            }
            other => return Err(SyntaxError::new(format!("unexpected character '{other}'"), offset)),
        };

        tokens.push(Token { kind, offset });
        index += consumed;
    }

    Ok(tokens)
}

fn read_string(characters: &[(usize, char)], quote: char, offset: usize) -> Result<(String, usize), SyntaxError> {
    let mut text = String::new();
    let mut index = 1usize;
    while let Some((_, character)) = characters.get(index) {
        match character {
            '\\' => {
                let Some((_, escaped)) = characters.get(index + 1) else {
                    break;
                };
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                index += 2;
            }
            c if *c == quote => return Ok((text, index + 1)),
            c => {
                text.push(*c);
                index += 1;
            }
        }
    }
    Err(SyntaxError::new("unterminated string literal", offset))
}

fn read_number(characters: &[(usize, char)], offset: usize) -> Result<(Number, usize), SyntaxError> {
    let literal: String = characters
        .iter()
        .enumerate()
        .take_while(|(index, (_, c))| c.is_ascii_digit() || *c == '.' || (*index == 0 && *c == '-'))
        .map(|(_, (_, c))| *c)
        .collect();
    let consumed = literal.chars().count();

    let number = if literal.contains('.') {
        literal.parse::<f64>().ok().and_then(Number::from_f64)
    } else {
        literal.parse::<i64>().ok().map(Number::from)
    };
    number
        .map(|number| (number, consumed))
        .ok_or_else(|| SyntaxError::new(format!("invalid number '{literal}'"), offset))
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|token| &token.kind)
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map(|token| token.offset + 1).unwrap_or(0)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expect(&mut self, expected: TokenKind) -> Result<(), SyntaxError> {
        match self.advance() {
            Some(token) if token.kind == expected => Ok(()),
            Some(token) => Err(SyntaxError::new(
                format!("expected {} but found {}", expected.describe(), token.kind.describe()),
                token.offset,
            )),
            None => Err(SyntaxError::new(
                format!("expected {} but the expression ended", expected.describe()),
                self.end_offset(),
            )),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        let mut operands = vec![self.parse_and()?];
        while self.peek_kind() == Some(&TokenKind::OrOr) {
            self.advance();
            operands.push(self.parse_and()?);
        }
        Ok(if operands.len() == 1 { operands.remove(0) } else { Expr::Or(operands) })
    }

    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        let mut operands = vec![self.parse_unary()?];
        while self.peek_kind() == Some(&TokenKind::AndAnd) {
            self.advance();
            operands.push(self.parse_unary()?);
        }
        Ok(if operands.len() == 1 { operands.remove(0) } else { Expr::And(operands) })
    }

    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.peek_kind() == Some(&TokenKind::Bang) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.parse_primary()?;
        let Some(TokenKind::Compare(op)) = self.peek_kind().cloned() else {
            return Ok(left);
        };
        self.advance();
        let right = self.parse_primary()?;
        if let Some(TokenKind::Compare(_)) = self.peek_kind() {
            let offset = self.peek().map(|token| token.offset).unwrap_or_default();
            return Err(SyntaxError::new("comparisons cannot be chained; use '&&'", offset));
        }
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        let Some(token) = self.advance() else {
            return Err(SyntaxError::new("expected an operand but the expression ended", self.end_offset()));
        };

        match token.kind {
            TokenKind::Number(number) => Ok(Expr::Literal(Value::Number(number))),
            TokenKind::Text(text) => Ok(Expr::Literal(Value::String(text))),
            TokenKind::OpenParen => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::CloseParen)?;
                Ok(inner)
            }
            TokenKind::OpenBracket => Ok(Expr::List(self.parse_list(TokenKind::CloseBracket)?)),
            TokenKind::Identifier(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek_kind() == Some(&TokenKind::OpenParen) => {
                    self.advance();
                    let args = self.parse_list(TokenKind::CloseParen)?;
                    Ok(Expr::Call { function: name, args })
                }
                _ => Ok(Expr::Column(name)),
            },
            other => Err(SyntaxError::new(format!("unexpected {}", other.describe()), token.offset)),
        }
    }

    /// Parses comma separated expressions up to and including `close`.
    fn parse_list(&mut self, close: TokenKind) -> Result<Vec<Expr>, SyntaxError> {
        let mut items = Vec::new();
        if self.peek_kind() == Some(&close) {
            self.advance();
            return Ok(items);
        }
        loop {
            items.push(self.parse_or()?);
            match self.peek_kind() {
                Some(TokenKind::Comma) => {
                    self.advance();
                }
                _ => {
                    self.expect(close)?;
                    return Ok(items);
                }
            }
        }
    }
}
