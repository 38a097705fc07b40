//! ドキュメントからキー素材・検証素材を取り出すパス式。

use std::borrow::Cow;

use serde_json::Value;

use crate::error::{IdempotencyError, Result};

/// ドキュメントとパス式から値を取り出す。
///
/// 見つからなければ `Ok(None)`、明示的な null は `Ok(Some(Value::Null))` を返す。
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, document: &Value, path: &str) -> Result<Option<Value>>;
}

/// 標準のパス式実装。
///
/// - `a.b.c` フィールドアクセス
/// - `items[0]` 配列インデックス
/// - `"x.y"` ドットを含むフィールド名
/// - `json(body).id` 文字列にエンコードされた JSON をデコードしてから射影する
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPathExtractor;

impl JsonPathExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl KeyExtractor for JsonPathExtractor {
    fn extract(&self, document: &Value, path: &str) -> Result<Option<Value>> {
        let steps = parse(path)?;
        Ok(walk(Cow::Borrowed(document), &steps)?.map(Cow::into_owned))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Field(String),
    Index(usize),
    Decode(Vec<Step>),
}

const DECODE_FUNCTION: &str = "json";

fn parse(path: &str) -> Result<Vec<Step>> {
    let mut parser = Parser {
        chars: path.chars().collect(),
        pos: 0,
        path,
    };
    let steps = parser.parse_path(None)?;
    if steps.is_empty() {
        return Err(parser.syntax_error());
    }
    Ok(steps)
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    path: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn syntax_error(&self) -> IdempotencyError {
        IdempotencyError::Config(format!(
            "キー抽出パスが不正です: {} (位置 {})",
            self.path, self.pos
        ))
    }

    fn parse_path(&mut self, closing: Option<char>) -> Result<Vec<Step>> {
        let mut steps = Vec::new();
        loop {
            self.parse_segment(&mut steps)?;
            while self.peek() == Some('[') {
                self.pos += 1;
                let index = self.read_index()?;
                steps.push(Step::Index(index));
            }
            match self.peek() {
                Some('.') => self.pos += 1,
                None if closing.is_none() => return Ok(steps),
                Some(c) if Some(c) == closing => {
                    self.pos += 1;
                    return Ok(steps);
                }
                _ => return Err(self.syntax_error()),
            }
        }
    }

    fn parse_segment(&mut self, steps: &mut Vec<Step>) -> Result<()> {
        if self.peek() == Some('"') {
            self.pos += 1;
            let start = self.pos;
            while self.peek().is_some_and(|c| c != '"') {
                self.pos += 1;
            }
            if self.peek().is_none() {
                return Err(self.syntax_error());
            }
            let name: String = self.chars[start..self.pos].iter().collect();
            self.pos += 1;
            steps.push(Step::Field(name));
            return Ok(());
        }

        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '$' | '@'))
        {
            self.pos += 1;
        }
        let ident: String = self.chars[start..self.pos].iter().collect();

        if ident == DECODE_FUNCTION && self.peek() == Some('(') {
            self.pos += 1;
            let inner = self.parse_path(Some(')'))?;
            steps.push(Step::Decode(inner));
        } else if !ident.is_empty() {
            steps.push(Step::Field(ident));
        } else if self.peek() != Some('[') {
            return Err(self.syntax_error());
        }
        Ok(())
    }

    fn read_index(&mut self) -> Result<usize> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        if self.peek() != Some(']') {
            return Err(self.syntax_error());
        }
        self.pos += 1;
        digits.parse().map_err(|_| self.syntax_error())
    }
}

fn walk<'v>(current: Cow<'v, Value>, steps: &[Step]) -> Result<Option<Cow<'v, Value>>> {
    let Some((step, rest)) = steps.split_first() else {
        return Ok(Some(current));
    };

    let next = match step {
        Step::Field(name) => match current {
            Cow::Borrowed(value) => value.get(name.as_str()).map(Cow::Borrowed),
            Cow::Owned(Value::Object(mut map)) => map.remove(name.as_str()).map(Cow::Owned),
            Cow::Owned(_) => None,
        },
        Step::Index(index) => match current {
            Cow::Borrowed(value) => value.get(*index).map(Cow::Borrowed),
            Cow::Owned(Value::Array(mut items)) if *index < items.len() => {
                Some(Cow::Owned(items.swap_remove(*index)))
            }
            Cow::Owned(_) => None,
        },
        Step::Decode(inner) => match walk(current, inner)? {
            Some(encoded) => match &*encoded {
                Value::String(text) => Some(Cow::Owned(serde_json::from_str(text)?)),
                _ => None,
            },
            None => None,
        },
    };

    match next {
        Some(value) => walk(value, rest),
        None => Ok(None),
    }
}

/// キー素材が「存在しない」とみなせるかどうか。
///
/// null、および全要素が null の配列も欠落として扱う。
pub fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => !items.is_empty() && items.iter().all(Value::is_null),
        Some(_) => false,
    }
}
