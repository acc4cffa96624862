//! Just enough XML-RPC to talk to Cobbler: method calls with scalar, array
//! and struct parameters, and responses (including faults) of the same
//! shapes.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::error::{LabError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
    Nil,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(members) => Some(members),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_struct()?.get(key)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let entity = &rest[start + 1..];
        let decoded = entity.find(';').and_then(|end| {
            let c = match &entity[..end] {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                code => code
                    .strip_prefix("#x")
                    .or_else(|| code.strip_prefix("#X"))
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .or_else(|| code.strip_prefix('#').map(str::parse))
                    .and_then(|n| n.ok())
                    .and_then(char::from_u32),
            }?;
            Some((c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &entity[end + 1..];
            }
            // Unknown entities are kept as written.
            None => {
                out.push('&');
                rest = entity;
            }
        }
    }
    out.push_str(rest);
    out
}

fn encode_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Int(i) => {
            let _ = write!(out, "<int>{i}</int>");
        }
        Value::Bool(b) => {
            let _ = write!(out, "<boolean>{}</boolean>", u8::from(*b));
        }
        Value::Double(d) => {
            let _ = write!(out, "<double>{d}</double>");
        }
        Value::String(s) => {
            let _ = write!(out, "<string>{}</string>", escape(s));
        }
        Value::Array(values) => {
            out.push_str("<array><data>");
            for value in values {
                encode_value(out, value);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, value) in members {
                let _ = write!(out, "<member><name>{}</name>", escape(name));
                encode_value(out, value);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
        Value::Nil => out.push_str("<nil/>"),
    }
    out.push_str("</value>");
}

pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodCall>");
    let _ = write!(out, "<methodName>{}</methodName><params>", escape(method));
    for param in params {
        out.push_str("<param>");
        encode_value(&mut out, param);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>\n");
    out
}

/// Encode a response; used by test servers.
pub fn encode_response(value: &Value) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodResponse><params><param>");
    encode_value(&mut out, value);
    out.push_str("</param></params></methodResponse>\n");
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Open(&'a str),
    Close(&'a str),
    Empty(&'a str),
    Text(&'a str),
    /// CDATA content, never unescaped.
    Raw(&'a str),
}

fn tag_name(tag: &str) -> &str {
    tag.split_whitespace().next().unwrap_or_default()
}

/// Split `rest` after the first `terminator`.
fn skip_past<'a>(rest: &'a str, terminator: &str, what: &str) -> Result<(&'a str, &'a str)> {
    let end = rest
        .find(terminator)
        .ok_or_else(|| LabError::backend("xmlrpc", format!("unterminated {what}")))?;
    Ok((&rest[..end], &rest[end + terminator.len()..]))
}

fn tokenize(xml: &str) -> Result<Vec<Token<'_>>> {
    let mut tokens = vec![];
    let mut rest = xml;
    while !rest.is_empty() {
        if let Some(comment) = rest.strip_prefix("<!--") {
            rest = skip_past(comment, "-->", "comment")?.1;
        } else if let Some(cdata) = rest.strip_prefix("<![CDATA[") {
            let (raw, after) = skip_past(cdata, "]]>", "CDATA section")?;
            tokens.push(Token::Raw(raw));
            rest = after;
        } else if let Some(pi) = rest.strip_prefix("<?") {
            rest = skip_past(pi, "?>", "declaration")?.1;
        } else if let Some(tag) = rest.strip_prefix('<') {
            let end = tag
                .find('>')
                .ok_or_else(|| LabError::backend("xmlrpc", "unterminated tag"))?;
            let inner = &tag[..end];
            rest = &tag[end + 1..];
            if inner.starts_with('!') {
                continue;
            }
            if let Some(closing) = inner.strip_prefix('/') {
                tokens.push(Token::Close(tag_name(closing)));
            } else if let Some(empty) = inner.strip_suffix('/') {
                tokens.push(Token::Empty(tag_name(empty)));
            } else {
                tokens.push(Token::Open(tag_name(inner)));
            }
        } else {
            let end = rest.find('<').unwrap_or(rest.len());
            tokens.push(Token::Text(&rest[..end]));
            rest = &rest[end..];
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    at: usize,
}

impl<'a> Parser<'a> {
    fn malformed(&self, what: &str) -> LabError {
        LabError::backend("xmlrpc", format!("malformed response: {what} at token {}", self.at))
    }

    /// Skip whitespace between elements.
    fn skip_blank(&mut self) {
        while let Some(Token::Text(text)) = self.tokens.get(self.at) {
            if !text.trim().is_empty() {
                break;
            }
            self.at += 1;
        }
    }

    fn peek(&mut self) -> Option<Token<'a>> {
        self.skip_blank();
        self.tokens.get(self.at).cloned()
    }

    fn open(&mut self, tag: &str) -> Result<()> {
        match self.peek() {
            Some(Token::Open(t)) if t == tag => {
                self.at += 1;
                Ok(())
            }
            _ => Err(self.malformed(&format!("expected <{tag}>"))),
        }
    }

    fn close(&mut self, tag: &str) -> Result<()> {
        match self.peek() {
            Some(Token::Close(t)) if t == tag => {
                self.at += 1;
                Ok(())
            }
            _ => Err(self.malformed(&format!("expected </{tag}>"))),
        }
    }

    /// Raw text up to the closing `tag`, which is consumed.
    fn text_until(&mut self, tag: &str) -> Result<String> {
        let mut text = String::new();
        loop {
            match self.tokens.get(self.at) {
                Some(Token::Text(t)) => text.push_str(&unescape(t)),
                Some(Token::Raw(t)) => text.push_str(t),
                _ => break,
            }
            self.at += 1;
        }
        self.close(tag)?;
        Ok(text)
    }

    fn value(&mut self) -> Result<Value> {
        self.open("value")?;
        // A value without a type tag is a string.
        let value = match self.tokens.get(self.at).cloned() {
            Some(Token::Close("value")) => {
                self.at += 1;
                return Ok(Value::String(String::new()));
            }
            Some(Token::Raw(_)) => {
                let text = self.text_until("value")?;
                return Ok(Value::String(text));
            }
            Some(Token::Text(t)) if !t.trim().is_empty() || self.untyped_text_follows() => {
                let text = self.text_until("value")?;
                return Ok(Value::String(text));
            }
            _ => self.typed()?,
        };
        self.close("value")?;
        Ok(value)
    }

    fn untyped_text_follows(&self) -> bool {
        matches!(
            self.tokens.get(self.at + 1),
            Some(Token::Close("value") | Token::Raw(_))
        )
    }

    fn typed(&mut self) -> Result<Value> {
        match self.peek() {
            Some(Token::Empty("nil")) => {
                self.at += 1;
                Ok(Value::Nil)
            }
            Some(Token::Empty("string")) => {
                self.at += 1;
                Ok(Value::String(String::new()))
            }
            Some(Token::Open(tag)) => {
                self.at += 1;
                match tag {
                    "int" | "i4" | "i8" => {
                        let text = self.text_until(tag)?;
                        text.trim()
                            .parse()
                            .map(Value::Int)
                            .map_err(|_| self.malformed("bad integer"))
                    }
                    "boolean" => Ok(Value::Bool(self.text_until(tag)?.trim() == "1")),
                    "double" => {
                        let text = self.text_until(tag)?;
                        text.trim()
                            .parse()
                            .map(Value::Double)
                            .map_err(|_| self.malformed("bad double"))
                    }
                    "string" | "dateTime.iso8601" | "base64" => {
                        Ok(Value::String(self.text_until(tag)?))
                    }
                    "array" => {
                        let mut values = vec![];
                        if let Some(Token::Empty("data")) = self.peek() {
                            self.at += 1;
                        } else {
                            self.open("data")?;
                            while let Some(Token::Open("value")) = self.peek() {
                                values.push(self.value()?);
                            }
                            self.close("data")?;
                        }
                        self.close("array")?;
                        Ok(Value::Array(values))
                    }
                    "struct" => {
                        let mut members = BTreeMap::new();
                        while let Some(Token::Open("member")) = self.peek() {
                            self.at += 1;
                            self.open("name")?;
                            let name = self.text_until("name")?;
                            let value = self.value()?;
                            self.close("member")?;
                            members.insert(name, value);
                        }
                        self.close("struct")?;
                        Ok(Value::Struct(members))
                    }
                    other => Err(self.malformed(&format!("unknown type <{other}>"))),
                }
            }
            _ => Err(self.malformed("expected a typed value")),
        }
    }
}

fn parse_value_in(xml: &str, outer: &[&str]) -> Result<Value> {
    let mut parser = Parser {
        tokens: tokenize(xml)?,
        at: 0,
    };
    for tag in outer {
        parser.open(tag)?;
    }
    parser.value()
}

/// Decode a method response. Faults become [`LabError::Backend`] errors
/// attributed to `backend`.
pub fn decode_response(backend: &str, xml: &str) -> Result<Value> {
    let tokens = tokenize(xml)?;
    if tokens.contains(&Token::Open("fault")) {
        let fault = parse_value_in(xml, &["methodResponse", "fault"])?;
        let message = fault
            .get("faultString")
            .and_then(Value::as_str)
            .unwrap_or("unknown fault")
            .to_string();
        return Err(LabError::backend(backend, message));
    }
    parse_value_in(xml, &["methodResponse", "params", "param"])
}

/// The method name and parameters of a call; used by test servers.
pub fn decode_call(xml: &str) -> Result<(String, Vec<Value>)> {
    let mut parser = Parser {
        tokens: tokenize(xml)?,
        at: 0,
    };
    parser.open("methodCall")?;
    parser.open("methodName")?;
    let method = parser.text_until("methodName")?;
    let mut params = vec![];
    if let Some(Token::Open("params")) = parser.peek() {
        parser.at += 1;
        while let Some(Token::Open("param")) = parser.peek() {
            parser.at += 1;
            params.push(parser.value()?);
            parser.close("param")?;
        }
    }
    Ok((method.trim().to_string(), params))
}
