// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Rule Text Parser
//!
//! Turns rule text into a [`RuleExpression`]:
//!
//! ```text
//! FROM <targets> TO <targets> (ALLOW|BLOCK) <protocol> <filter>
//! targets  := target | "(" target (OR target)* ")"
//! target   := any | all vms | ip <addr> | subnet <cidr>
//!           | tag <name> [= <value>] | vm <uuid>
//! filter   := PORT all | PORT <n>[-<m>] | PORTS <n>[-<m>], ...
//!           | "(" PORT <n> (AND PORT <n>)* ")"
//!           | TYPE all | TYPE <n> [CODE <n>] | "(" TYPE <n> [CODE <n>] (AND ...)* ")"
//! ```
//!
//! Keywords are case-insensitive. Tag names and values may be double-quoted.
//! Tag targets of the same name on one side fold into a single [`TagExpr`].

use crate::domain::rule::{
    Action, IcmpType, PortRange, Protocol, ProtocolFilter, RuleExpression, TagExpr, Target,
};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleParseError {
    #[error("unexpected end of rule, expected {0}")]
    UnexpectedEnd(&'static str),

    #[error("unexpected '{found}', expected {expected}")]
    UnexpectedToken { found: String, expected: &'static str },

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("invalid ICMP type or code '{0}'")]
    InvalidIcmp(String),

    #[error("invalid VM uuid '{0}'")]
    InvalidUuid(String),

    #[error("unterminated quoted string")]
    UnterminatedQuote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    LParen,
    RParen,
    Eq,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Word(w) => w.clone(),
            Token::Quoted(q) => format!("\"{}\"", q),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Eq => "=".to_string(),
            Token::Comma => ",".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, RuleParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '"' => {
                chars.next();
                let mut quoted = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => quoted.push(escaped),
                            None => return Err(RuleParseError::UnterminatedQuote),
                        },
                        Some(other) => quoted.push(other),
                        None => return Err(RuleParseError::UnterminatedQuote),
                    }
                }
                tokens.push(Token::Quoted(quoted));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | '=' | ',' | '"') {
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

    fn next(&mut self, expected: &'static str) -> Result<Token, RuleParseError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(RuleParseError::UnexpectedEnd(expected))?;
        self.pos += 1;
        Ok(token)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &'static str) -> Result<(), RuleParseError> {
        match self.next(keyword)? {
            Token::Word(w) if w.eq_ignore_ascii_case(keyword) => Ok(()),
            other => Err(RuleParseError::UnexpectedToken {
                found: other.describe(),
                expected: keyword,
            }),
        }
    }

    fn expect(&mut self, token: Token, expected: &'static str) -> Result<(), RuleParseError> {
        let found = self.next(expected)?;
        if found == token {
            Ok(())
        } else {
            Err(RuleParseError::UnexpectedToken {
                found: found.describe(),
                expected,
            })
        }
    }

    /// A bare word or a quoted string.
    fn value(&mut self, expected: &'static str) -> Result<String, RuleParseError> {
        match self.next(expected)? {
            Token::Word(w) | Token::Quoted(w) => Ok(w),
            other => Err(RuleParseError::UnexpectedToken {
                found: other.describe(),
                expected,
            }),
        }
    }

    fn word(&mut self, expected: &'static str) -> Result<String, RuleParseError> {
        match self.next(expected)? {
            Token::Word(w) => Ok(w),
            other => Err(RuleParseError::UnexpectedToken {
                found: other.describe(),
                expected,
            }),
        }
    }

    fn rule(&mut self) -> Result<RuleExpression, RuleParseError> {
        self.expect_keyword("from")?;
        let from = self.side()?;
        self.expect_keyword("to")?;
        let to = self.side()?;
        let action = self.action()?;
        let (protocol, filter) = self.protocol()?;

        if let Some(extra) = self.peek() {
            return Err(RuleParseError::UnexpectedToken {
                found: extra.describe(),
                expected: "end of rule",
            });
        }

        Ok(RuleExpression {
            from,
            to,
            action,
            protocol,
            filter,
        })
    }

    fn side(&mut self) -> Result<Vec<Target>, RuleParseError> {
        let mut targets = Vec::new();
        if self.eat(&Token::LParen) {
            loop {
                targets.push(self.target()?);
                if self.eat_keyword("or") {
                    continue;
                }
                self.expect(Token::RParen, "OR or )")?;
                break;
            }
        } else {
            targets.push(self.target()?);
        }
        Ok(fold_targets(targets))
    }

    fn target(&mut self) -> Result<Target, RuleParseError> {
        let keyword = self.word("target")?;
        match keyword.to_ascii_lowercase().as_str() {
            "any" => Ok(Target::Any),
            "all" => {
                self.expect_keyword("vms")?;
                Ok(Target::AllVms)
            }
            "ip" => {
                let raw = self.word("IP address")?;
                let ip: IpAddr = raw
                    .parse()
                    .map_err(|_| RuleParseError::InvalidAddress(raw.clone()))?;
                Ok(Target::Address(IpNetwork::from(ip)))
            }
            "subnet" => {
                let raw = self.word("subnet")?;
                if !raw.contains('/') {
                    return Err(RuleParseError::InvalidAddress(raw));
                }
                let net: IpNetwork = raw
                    .parse()
                    .map_err(|_| RuleParseError::InvalidAddress(raw.clone()))?;
                Ok(Target::Address(net))
            }
            "tag" => {
                let name = self.value("tag name")?;
                if self.eat(&Token::Eq) {
                    let value = self.value("tag value")?;
                    Ok(Target::Tag(TagExpr::with_values(name, [value])))
                } else {
                    Ok(Target::Tag(TagExpr::any_value(name)))
                }
            }
            "vm" => {
                let raw = self.value("VM uuid")?;
                let uuid = Uuid::parse_str(&raw).map_err(|_| RuleParseError::InvalidUuid(raw.clone()))?;
                Ok(Target::Vm(uuid))
            }
            _ => Err(RuleParseError::UnexpectedToken {
                found: keyword,
                expected: "any, all vms, ip, subnet, tag or vm",
            }),
        }
    }

    fn action(&mut self) -> Result<Action, RuleParseError> {
        let word = self.word("ALLOW or BLOCK")?;
        match word.to_ascii_lowercase().as_str() {
            "allow" => Ok(Action::Allow),
            "block" => Ok(Action::Block),
            _ => Err(RuleParseError::UnexpectedToken {
                found: word,
                expected: "ALLOW or BLOCK",
            }),
        }
    }

    fn protocol(&mut self) -> Result<(Protocol, ProtocolFilter), RuleParseError> {
        let word = self.word("protocol")?;
        match word.to_ascii_lowercase().as_str() {
            "tcp" => Ok((Protocol::Tcp, self.ports()?)),
            "udp" => Ok((Protocol::Udp, self.ports()?)),
            "icmp" => Ok((Protocol::Icmp, self.icmp_types()?)),
            "icmp6" => Ok((Protocol::Icmp6, self.icmp_types()?)),
            "ah" => Ok((Protocol::Ah, ProtocolFilter::All)),
            "esp" => Ok((Protocol::Esp, ProtocolFilter::All)),
            _ => Err(RuleParseError::UnexpectedToken {
                found: word,
                expected: "tcp, udp, icmp, icmp6, ah or esp",
            }),
        }
    }

    fn ports(&mut self) -> Result<ProtocolFilter, RuleParseError> {
        if self.eat(&Token::LParen) {
            let mut ranges = Vec::new();
            loop {
                self.expect_keyword("port")?;
                ranges.push(parse_port_range(&self.word("port")?)?);
                if self.eat_keyword("and") {
                    continue;
                }
                self.expect(Token::RParen, "AND or )")?;
                break;
            }
            return Ok(ProtocolFilter::Ports(ranges));
        }

        if self.eat_keyword("ports") {
            let mut ranges = vec![parse_port_range(&self.word("port")?)?];
            while self.eat(&Token::Comma) {
                ranges.push(parse_port_range(&self.word("port")?)?);
            }
            return Ok(ProtocolFilter::Ports(ranges));
        }

        self.expect_keyword("port")?;
        let port = self.word("port")?;
        if port.eq_ignore_ascii_case("all") {
            return Ok(ProtocolFilter::All);
        }
        Ok(ProtocolFilter::Ports(vec![parse_port_range(&port)?]))
    }

    fn icmp_types(&mut self) -> Result<ProtocolFilter, RuleParseError> {
        if self.eat(&Token::LParen) {
            let mut types = Vec::new();
            loop {
                self.expect_keyword("type")?;
                let raw = self.word("ICMP type")?;
                types.push(self.icmp_type(&raw)?);
                if self.eat_keyword("and") {
                    continue;
                }
                self.expect(Token::RParen, "AND or )")?;
                break;
            }
            return Ok(ProtocolFilter::IcmpTypes(types));
        }

        self.expect_keyword("type")?;
        let raw = self.word("ICMP type")?;
        if raw.eq_ignore_ascii_case("all") {
            return Ok(ProtocolFilter::All);
        }
        Ok(ProtocolFilter::IcmpTypes(vec![self.icmp_type(&raw)?]))
    }

    fn icmp_type(&mut self, raw: &str) -> Result<IcmpType, RuleParseError> {
        let icmp_type = raw
            .parse::<u8>()
            .map_err(|_| RuleParseError::InvalidIcmp(raw.to_string()))?;
        let code = if self.eat_keyword("code") {
            let raw_code = self.word("ICMP code")?;
            Some(
                raw_code
                    .parse::<u8>()
                    .map_err(|_| RuleParseError::InvalidIcmp(raw_code.clone()))?,
            )
        } else {
            None
        };
        Ok(IcmpType { icmp_type, code })
    }
}

fn parse_port(raw: &str) -> Result<u16, RuleParseError> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(RuleParseError::InvalidPort(raw.to_string())),
        Ok(port) => Ok(port),
    }
}

fn parse_port_range(raw: &str) -> Result<PortRange, RuleParseError> {
    match raw.split_once('-') {
        Some((first, last)) => {
            let first = parse_port(first)?;
            let last = parse_port(last)?;
            if first > last {
                return Err(RuleParseError::InvalidPort(raw.to_string()));
            }
            Ok(PortRange { first, last })
        }
        None => {
            let port = parse_port(raw)?;
            Ok(PortRange {
                first: port,
                last: port,
            })
        }
    }
}

/// Merge same-name tag targets (OR semantics) and drop duplicates.
fn fold_targets(targets: Vec<Target>) -> Vec<Target> {
    let mut folded: Vec<Target> = Vec::with_capacity(targets.len());

    for target in targets {
        match target {
            Target::Tag(tag) => {
                let position = folded
                    .iter()
                    .position(|t| matches!(t, Target::Tag(existing) if existing.name == tag.name));
                match position {
                    Some(index) => {
                        if let Target::Tag(existing) = &mut folded[index] {
                            // An any-value tag absorbs every specific value.
                            if tag.matches_any_value() {
                                existing.values.clear();
                            } else if !existing.matches_any_value() {
                                existing.values.extend(tag.values);
                            }
                        }
                    }
                    None => folded.push(Target::Tag(tag)),
                }
            }
            other => {
                if !folded.contains(&other) {
                    folded.push(other);
                }
            }
        }
    }

    folded
}

/// Parse rule text.
pub fn parse_rule(text: &str) -> Result<RuleExpression, RuleParseError> {
    let tokens = tokenize(text)?;
    Parser { tokens, pos: 0 }.rule()
}
