//! Parser for the `_filter` expression language.
//!
//! ```text
//! filter    = term ("or" term)*
//! term      = factor ("and" factor)*
//! factor    = "(" filter ")" | paramExp
//! paramExp  = paramPath SP compareOp SP compValue
//! ```
//!
//! `and` binds tighter than `or`. Values may be double-quoted, with `\"`
//! escaping a quote inside the string.

use std::fmt;

use crate::error::{Result, SearchError};
use crate::search_param::CompareOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterValueType {
    Token,
    String,
    NumberOrDate,
}

/// `name[.chain] op value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterParameter {
    pub name: String,
    /// Remainder of a dotted path (`subject.name` -> `name`)
    pub chain: Option<String>,
    pub op: CompareOp,
    pub value: String,
    pub value_type: FilterValueType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Parameter(FilterParameter),
    Logical {
        op: LogicalOp,
        left: Box<Filter>,
        right: Box<Filter>,
    },
    Group(Box<Filter>),
}

impl Filter {
    pub fn parse(expression: &str) -> Result<Filter> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser { tokens, pos: 0 };
        let filter = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(syntax_error(format!("Unexpected token \"{token}\"")));
        }
        Ok(filter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Word(String),
    Quoted(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
            Token::Word(w) => f.write_str(w),
            Token::Quoted(q) => write!(f, "\"{q}\""),
        }
    }
}

fn syntax_error(detail: impl fmt::Display) -> SearchError {
    SearchError::invalid(format!("Error parsing _filter syntax: {detail}"))
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(syntax_error("Unterminated quoted string"));
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn next_is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn parse_or(&mut self) -> Result<Filter> {
        let mut left = self.parse_and()?;
        while self.next_is_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Filter::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Filter> {
        let mut left = self.parse_factor()?;
        while self.next_is_keyword("and") {
            self.pos += 1;
            let right = self.parse_factor()?;
            left = Filter::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Filter> {
        match self.advance() {
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::Close) => Ok(Filter::Group(Box::new(inner))),
                    _ => Err(syntax_error("Expected \")\"")),
                }
            }
            Some(Token::Word(path)) => self.parse_param_exp(path),
            Some(other) => Err(syntax_error(format!("Unexpected token \"{other}\""))),
            None => Err(syntax_error("Unexpected end of expression")),
        }
    }

    fn parse_param_exp(&mut self, path: String) -> Result<Filter> {
        let op = match self.advance() {
            Some(Token::Word(op)) => CompareOp::from_code(&op)
                .ok_or_else(|| syntax_error(format!("Invalid operator \"{op}\"")))?,
            _ => return Err(syntax_error(format!("Expected operator after \"{path}\""))),
        };
        let (value, value_type) = match self.advance() {
            Some(Token::Quoted(value)) => (value, FilterValueType::String),
            Some(Token::Word(value)) => {
                let value_type = if value.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
                    FilterValueType::NumberOrDate
                } else {
                    FilterValueType::Token
                };
                (value, value_type)
            }
            _ => return Err(syntax_error(format!("Expected value after \"{path} {op}\""))),
        };
        let (name, chain) = match path.split_once('.') {
            Some((name, chain)) => (name.to_string(), Some(chain.to_string())),
            None => (path, None),
        };
        if name.is_empty() {
            return Err(syntax_error("Empty parameter name"));
        }
        Ok(Filter::Parameter(FilterParameter {
            name,
            chain,
            op,
            value,
            value_type,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(filter: &Filter) -> &FilterParameter {
        match filter {
            Filter::Parameter(p) => p,
            other => panic!("expected parameter, got {other:?}"),
        }
    }

    #[test]
    fn test_simple_parameter() {
        let filter = Filter::parse("name eq \"peter\"").unwrap();
        let p = param(&filter);
        assert_eq!(p.name, "name");
        assert_eq!(p.op, CompareOp::Eq);
        assert_eq!(p.value, "peter");
        assert_eq!(p.value_type, FilterValueType::String);
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let filter = Filter::parse("a eq x or b eq y and c eq z").unwrap();
        let Filter::Logical { op, left, right } = filter else {
            panic!("expected logical");
        };
        assert_eq!(op, LogicalOp::Or);
        assert_eq!(param(&left).name, "a");
        assert!(matches!(*right, Filter::Logical { op: LogicalOp::And, .. }));
    }

    #[test]
    fn test_group_and_chain() {
        let filter = Filter::parse("(subject.name co smi) and birthdate ge 2020-01-01").unwrap();
        let Filter::Logical { left, right, .. } = filter else {
            panic!("expected logical");
        };
        let Filter::Group(inner) = *left else {
            panic!("expected group");
        };
        let p = param(&inner);
        assert_eq!(p.name, "subject");
        assert_eq!(p.chain.as_deref(), Some("name"));
        assert_eq!(p.op, CompareOp::Co);
        assert_eq!(param(&right).value_type, FilterValueType::NumberOrDate);
    }

    #[test]
    fn test_quoted_escape() {
        let filter = Filter::parse(r#"name eq "say \"hi\"""#).unwrap();
        assert_eq!(param(&filter).value, "say \"hi\"");
    }

    #[test]
    fn test_syntax_errors() {
        for bad in ["name", "name zz x", "(name eq x", "name eq \"x", "name eq x y"] {
            let err = Filter::parse(bad).unwrap_err();
            assert!(
                err.to_string().starts_with("Error parsing _filter syntax"),
                "{bad}: {err}"
            );
        }
    }
}
