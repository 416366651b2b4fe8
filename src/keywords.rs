//! The keyword-expression grammar used by `-k`.
//!
//! A tiny boolean language over bare tokens: `and`, `or`, `not`, and
//! parentheses. A bare token evaluates to true when it is a substring of any
//! of the instance's keywords (its names and tags).

use crate::errors::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Token(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
pub struct KeywordExpr {
    root: Expr,
}

impl KeywordExpr {
    pub fn parse(input: &str) -> Result<KeywordExpr> {
        let tokens = lex(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::KeywordSyntax(format!(
                "unexpected trailing input in {input:?}"
            )));
        }
        Ok(KeywordExpr { root })
    }

    /// Evaluate against the keyword set of one instance.
    pub fn matches(&self, keywords: &[&str]) -> bool {
        eval(&self.root, keywords)
    }
}

fn eval(expr: &Expr, keywords: &[&str]) -> bool {
    match expr {
        Expr::Token(token) => keywords.iter().any(|keyword| keyword.contains(token)),
        Expr::Not(inner) => !eval(inner, keywords),
        Expr::And(lhs, rhs) => eval(lhs, keywords) && eval(rhs, keywords),
        Expr::Or(lhs, rhs) => eval(lhs, keywords) || eval(rhs, keywords),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Not,
    Word(String),
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    fn flush(word: &mut String, tokens: &mut Vec<Token>) {
        if word.is_empty() {
            return;
        }
        let token = if word.as_str() == "and" {
            Token::And
        } else if word.as_str() == "or" {
            Token::Or
        } else if word.as_str() == "not" {
            Token::Not
        } else {
            Token::Word(std::mem::take(word))
        };
        word.clear();
        tokens.push(token);
    }
    for ch in input.chars() {
        match ch {
            '(' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Open);
            }
            ')' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Close);
            }
            c if c.is_whitespace() => flush(&mut word, &mut tokens),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens);
    if tokens.is_empty() {
        return Err(Error::KeywordSyntax("empty expression".to_string()));
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

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.not_expr()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.not_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(Error::KeywordSyntax("missing closing paren".to_string()));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Word(word)) => {
                self.pos += 1;
                Ok(Expr::Token(word))
            }
            other => Err(Error::KeywordSyntax(format!(
                "expected a keyword, got {other:?}"
            ))),
        }
    }
}
