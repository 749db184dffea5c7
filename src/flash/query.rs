//! Device query language.
//!
//! Boolean expressions over device attributes:
//!
//! ```text
//! vendor=Adafruit and removable=true
//! (serial~=GLV80.* or label=NICENANO) and not mounted=true
//! size>=1048576
//! ```
//!
//! Atoms compare one attribute: `=` exact, `!=` negated exact, `~=`
//! unanchored regex, `< <= > >=` numeric when both sides parse as numbers,
//! lexicographic otherwise. Absent attributes fail every atom except `!=`,
//! which succeeds.

use crate::error::{Error, Result};
use crate::flash::device::BlockDevice;
use regex::Regex;

/// A parsed, reusable query.
#[derive(Debug, Clone)]
pub struct Query {
    root: Node,
}

#[derive(Debug, Clone)]
enum Node {
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Atom {
        key: String,
        op: CompareOp,
        value: String,
    },
    /// The empty query matches everything.
    True,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Regex,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Query {
    /// Parses a query string. The empty string matches every device.
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Ok(Self { root: Node::True });
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self { root })
    }

    /// Evaluates the query against one device.
    #[must_use]
    pub fn matches(&self, device: &BlockDevice) -> bool {
        eval(&self.root, device)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Atom {
        key: String,
        op: CompareOp,
        value: String,
    },
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    for raw in split_words(text) {
        let token = match raw.as_str() {
            "(" => Token::LParen,
            ")" => Token::RParen,
            word if word.eq_ignore_ascii_case("and") => Token::And,
            word if word.eq_ignore_ascii_case("or") => Token::Or,
            word if word.eq_ignore_ascii_case("not") => Token::Not,
            word => parse_atom(word, text)?,
        };
        tokens.push(token);
    }
    Ok(tokens)
}

/// Splits on whitespace, treating parentheses as their own words unless
/// they appear inside an atom's value (`serial~=GLV(80)?`): a parenthesis
/// is structural only when the word it would start or end contains no
/// comparison operator.
fn split_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    for chunk in text.split_whitespace() {
        let mut rest = chunk;
        // Leading structural parens.
        while let Some(tail) = rest.strip_prefix('(') {
            words.push("(".to_string());
            rest = tail;
        }
        // Trailing structural parens, but only when the word has balance
        // to spare (regex values may end with ')').
        let mut trailing = 0;
        while rest.ends_with(')')
            && rest.matches(')').count() > rest.matches('(').count() + trailing
        {
            trailing += 1;
            rest = &rest[..rest.len() - 1];
        }
        if !rest.is_empty() {
            words.push(rest.to_string());
        }
        for _ in 0..trailing {
            words.push(")".to_string());
        }
    }
    words
}

fn parse_atom(word: &str, full_query: &str) -> Result<Token> {
    // Two-character operators first so `<=` does not lex as `<`.
    const OPS: &[(&str, CompareOp)] = &[
        ("!=", CompareOp::Ne),
        ("~=", CompareOp::Regex),
        ("<=", CompareOp::Le),
        (">=", CompareOp::Ge),
        ("=", CompareOp::Eq),
        ("<", CompareOp::Lt),
        (">", CompareOp::Gt),
    ];
    for (symbol, op) in OPS {
        if let Some(at) = word.find(symbol) {
            let key = &word[..at];
            let value = &word[at + symbol.len()..];
            if key.is_empty() {
                break;
            }
            return Ok(Token::Atom {
                key: key.to_string(),
                op: *op,
                value: value.to_string(),
            });
        }
    }
    Err(Error::Usage(format!(
        "query '{full_query}': '{word}' is not a comparison or keyword"
    )))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse_or(&mut self) -> Result<Node> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node> {
        let mut left = self.parse_unary()?;
        while self.eat(&Token::And) {
            let right = self.parse_unary()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node> {
        if self.eat(&Token::Not) {
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat(&Token::LParen) {
            let inner = self.parse_or()?;
            if !self.eat(&Token::RParen) {
                return Err(self.error("missing ')'"));
            }
            return Ok(inner);
        }
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Atom { key, op, value }) => {
                self.pos += 1;
                if op == CompareOp::Regex {
                    // Validate the pattern at parse time.
                    Regex::new(&value).map_err(|e| {
                        Error::Usage(format!("invalid regex '{value}': {e}"))
                    })?;
                }
                Ok(Node::Atom { key, op, value })
            }
            _ => Err(self.error("expected an attribute comparison")),
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.tokens.get(self.pos) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, message: &str) -> Error {
        Error::Usage(format!("query parse error at token {}: {message}", self.pos))
    }
}

fn eval(node: &Node, device: &BlockDevice) -> bool {
    match node {
        Node::True => true,
        Node::And(a, b) => eval(a, device) && eval(b, device),
        Node::Or(a, b) => eval(a, device) || eval(b, device),
        Node::Not(inner) => !eval(inner, device),
        Node::Atom { key, op, value } => {
            let actual = device.attribute(key);
            match (op, actual) {
                (CompareOp::Ne, None) => true,
                (_, None) => false,
                (CompareOp::Eq, Some(actual)) => actual == *value,
                (CompareOp::Ne, Some(actual)) => actual != *value,
                (CompareOp::Regex, Some(actual)) => Regex::new(value)
                    .map(|re| re.is_match(&actual))
                    .unwrap_or(false),
                (CompareOp::Lt, Some(actual)) => compare(&actual, value).is_lt(),
                (CompareOp::Le, Some(actual)) => compare(&actual, value).is_le(),
                (CompareOp::Gt, Some(actual)) => compare(&actual, value).is_gt(),
                (CompareOp::Ge, Some(actual)) => compare(&actual, value).is_ge(),
            }
        }
    }
}

/// Numeric comparison when both sides parse as integers, lexicographic
/// otherwise.
fn compare(left: &str, right: &str) -> std::cmp::Ordering {
    match (left.parse::<u64>(), right.parse::<u64>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.cmp(right),
    }
}
