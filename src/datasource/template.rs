//! Templated header expressions
//!
//! Grammar: terms concatenated with `+`; a term is a quoted literal, a
//! `{{variable}}`, or a function call. Supported variables: method, path,
//! body, timestamp, uuid, nonce, auth_token. Supported functions: md5,
//! sha256, hmac_sha256(key, message), hmac_md5(key, message), base64,
//! upper, lower.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Per-request values available to header templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub method: String,
    pub path: String,
    pub body: String,
    pub auth_token: String,
}

/// Evaluate one header template against the request context.
pub fn render(template: &str, ctx: &TemplateContext) -> Result<String> {
    let mut parser = Parser {
        chars: template.chars().collect(),
        pos: 0,
        ctx,
    };
    let value = parser.expression()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(Error::Remote(format!(
            "trailing input in header template at offset {}",
            parser.pos
        )));
    }
    Ok(value)
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    ctx: &'a TemplateContext,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> Result<()> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            other => Err(Error::Remote(format!(
                "expected '{expected}' in header template, found {other:?}"
            ))),
        }
    }

    /// term ('+' term)*
    fn expression(&mut self) -> Result<String> {
        let mut value = self.term()?;
        loop {
            self.skip_ws();
            if self.peek() == Some('+') {
                self.pos += 1;
                value.push_str(&self.term()?);
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> Result<String> {
        self.skip_ws();
        match self.peek() {
            Some('\'') => self.literal(),
            Some('{') => self.variable(),
            Some(c) if c.is_alphabetic() || c == '_' => self.function(),
            other => Err(Error::Remote(format!(
                "unexpected token in header template: {other:?}"
            ))),
        }
    }

    fn literal(&mut self) -> Result<String> {
        self.eat('\'')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\'') => return Ok(out),
                Some(c) => out.push(c),
                None => {
                    return Err(Error::Remote(
                        "unterminated string literal in header template".into(),
                    ))
                }
            }
        }
    }

    fn variable(&mut self) -> Result<String> {
        self.eat('{')?;
        self.eat('{')?;
        let mut name = String::new();
        loop {
            match self.peek() {
                Some('}') => break,
                Some(c) => {
                    name.push(c);
                    self.pos += 1;
                }
                None => {
                    return Err(Error::Remote("unterminated template variable".into()));
                }
            }
        }
        self.eat('}')?;
        self.eat('}')?;
        Ok(match name.trim() {
            "method" => self.ctx.method.clone(),
            "path" => self.ctx.path.clone(),
            "body" => self.ctx.body.clone(),
            "auth_token" => self.ctx.auth_token.clone(),
            "timestamp" => chrono::Utc::now().timestamp().to_string(),
            "uuid" => uuid::Uuid::new_v4().to_string(),
            "nonce" => format!("{:016x}", rand::random::<u64>()),
            other => {
                return Err(Error::Remote(format!("unknown template variable '{other}'")))
            }
        })
    }

    fn function(&mut self) -> Result<String> {
        let mut name = String::new();
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            name.push(self.bump().expect("peeked"));
        }
        self.eat('(')?;
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() != Some(')') {
            loop {
                args.push(self.expression()?);
                self.skip_ws();
                if self.peek() == Some(',') {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.eat(')')?;
        apply_function(&name, &args)
    }
}

fn apply_function(name: &str, args: &[String]) -> Result<String> {
    let one = |args: &[String]| -> Result<String> {
        args.first()
            .cloned()
            .ok_or_else(|| Error::Remote(format!("{name}() requires one argument")))
    };
    match name {
        "md5" => {
            let mut hasher = Md5::new();
            hasher.update(one(args)?.as_bytes());
            Ok(hex(&hasher.finalize()))
        }
        "sha256" => {
            let mut hasher = Sha256::new();
            hasher.update(one(args)?.as_bytes());
            Ok(hex(&hasher.finalize()))
        }
        "hmac_sha256" => {
            let [key, message] = two(name, args)?;
            let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
                .map_err(|e| Error::Remote(format!("hmac key error: {e}")))?;
            mac.update(message.as_bytes());
            Ok(hex(&mac.finalize().into_bytes()))
        }
        "hmac_md5" => {
            let [key, message] = two(name, args)?;
            let mut mac = Hmac::<Md5>::new_from_slice(key.as_bytes())
                .map_err(|e| Error::Remote(format!("hmac key error: {e}")))?;
            mac.update(message.as_bytes());
            Ok(hex(&mac.finalize().into_bytes()))
        }
        "base64" => Ok(base64::engine::general_purpose::STANDARD.encode(one(args)?)),
        "upper" => Ok(one(args)?.to_uppercase()),
        "lower" => Ok(one(args)?.to_lowercase()),
        other => Err(Error::Remote(format!("unknown template function '{other}'"))),
    }
}

fn two(name: &str, args: &[String]) -> Result<[String; 2]> {
    match args {
        [a, b] => Ok([a.clone(), b.clone()]),
        _ => Err(Error::Remote(format!("{name}() requires two arguments"))),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext {
            method: "POST".into(),
            path: "/query/users".into(),
            body: "{}".into(),
            auth_token: "tok".into(),
        }
    }

    #[test]
    fn test_literal_and_concat() {
        assert_eq!(render("'a' + 'b'", &ctx()).unwrap(), "ab");
    }

    #[test]
    fn test_variables() {
        assert_eq!(render("{{method}}", &ctx()).unwrap(), "POST");
        assert_eq!(
            render("{{method}} + ' ' + {{path}}", &ctx()).unwrap(),
            "POST /query/users"
        );
        assert_eq!(render("{{auth_token}}", &ctx()).unwrap(), "tok");
    }

    #[test]
    fn test_hash_functions() {
        // md5("abc") reference digest
        assert_eq!(
            render("md5('abc')", &ctx()).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            render("sha256('abc')", &ctx()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(render("base64('abc')", &ctx()).unwrap(), "YWJj");
    }

    #[test]
    fn test_hmac() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?"
        assert_eq!(
            render("hmac_sha256('Jefe', 'what do ya want for nothing?')", &ctx()).unwrap(),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_nested_function_calls() {
        assert_eq!(
            render("upper('sig=' + lower('ABC'))", &ctx()).unwrap(),
            "SIG=ABC"
        );
    }

    #[test]
    fn test_errors() {
        assert!(render("'unterminated", &ctx()).is_err());
        assert!(render("{{nope}}", &ctx()).is_err());
        assert!(render("mystery('x')", &ctx()).is_err());
        assert!(render("'a' 'b'", &ctx()).is_err());
    }
}
