//! Reader for the quoted key/value manifest format used by the workshop
//! client (`appworkshop_<appid>.acf`).
//!
//! ```text
//! "AppWorkshop"
//! {
//!     "WorkshopItemDetails"
//!     {
//!         "123456" { "manifest" "8812" }
//!     }
//! }
//! ```

use std::{collections::BTreeMap, fs, io, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("line {line}: expected {expected}, found {found}")]
    Unexpected {
        line: usize,
        found: String,
        expected: &'static str,
    },
    #[error("line {line}: unterminated string")]
    UnterminatedString { line: usize },
    #[error("read manifest: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    String(String),
    Map(KeyValueTree),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueTree {
    values: BTreeMap<String, KeyValue>,
}

static EMPTY_TREE: KeyValueTree = KeyValueTree {
    values: BTreeMap::new(),
};

impl KeyValueTree {
    pub fn parse(input: &str) -> Result<Self, ManifestError> {
        let mut parser = Parser::new(input);
        let tree = parser.parse_list(false)?;
        parser.skip_whitespace();
        if let Some(ch) = parser.peek() {
            return Err(ManifestError::Unexpected {
                line: parser.line,
                found: ch.to_string(),
                expected: "end of input",
            });
        }
        Ok(tree)
    }

    pub fn read(path: &Path) -> Result<Self, ManifestError> {
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// String value under `key`; empty when the key is missing or nested.
    pub fn get_string(&self, key: &str) -> &str {
        match self.values.get(key) {
            Some(KeyValue::String(value)) => value,
            _ => "",
        }
    }

    /// Nested map under `key`; empty when the key is missing or a string.
    pub fn get_map(&self, key: &str) -> &KeyValueTree {
        match self.values.get(key) {
            Some(KeyValue::Map(map)) => map,
            _ => &EMPTY_TREE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
        }
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if !ch.is_whitespace() {
                break;
            }
            self.bump();
        }
    }

    fn parse_list(&mut self, nested: bool) -> Result<KeyValueTree, ManifestError> {
        let mut tree = KeyValueTree::default();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None if nested => {
                    return Err(ManifestError::Unexpected {
                        line: self.line,
                        found: "end of input".to_string(),
                        expected: "'}'",
                    })
                }
                None => return Ok(tree),
                Some('}') if nested => {
                    self.bump();
                    return Ok(tree);
                }
                Some('}') => return Ok(tree),
                Some('"') => {
                    let key = self.parse_string()?;
                    let value = self.parse_value()?;
                    tree.values.insert(key, value);
                }
                Some(other) => {
                    return Err(ManifestError::Unexpected {
                        line: self.line,
                        found: other.to_string(),
                        expected: "quoted key",
                    })
                }
            }
        }
    }

    fn parse_value(&mut self) -> Result<KeyValue, ManifestError> {
        self.skip_whitespace();
        match self.peek() {
            Some('"') => Ok(KeyValue::String(self.parse_string()?)),
            Some('{') => {
                self.bump();
                Ok(KeyValue::Map(self.parse_list(true)?))
            }
            other => Err(ManifestError::Unexpected {
                line: self.line,
                found: other.map_or_else(|| "end of input".to_string(), |ch| ch.to_string()),
                expected: "quoted value or '{'",
            }),
        }
    }

    fn parse_string(&mut self) -> Result<String, ManifestError> {
        let start = self.line;
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(ManifestError::UnterminatedString { line: start }),
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(escaped) => out.push(escaped),
                    None => return Err(ManifestError::UnterminatedString { line: start }),
                },
                Some(ch) => out.push(ch),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
"AppWorkshop"
{
	"appid"		"22330"
	"WorkshopItemDetails"
	{
		"11111"
		{
			"manifest"		"-1"
		}
		"22222"
		{
			"manifest"		"5522"
			"timeupdated"	"1400000000"
		}
	}
}
"#;

    #[test]
    fn parses_nested_workshop_manifest() {
        let tree = KeyValueTree::parse(SAMPLE).unwrap();
        let app = tree.get_map("AppWorkshop");
        assert_eq!(app.get_string("appid"), "22330");
        let items = app.get_map("WorkshopItemDetails");
        assert_eq!(items.keys().collect::<Vec<_>>(), vec!["11111", "22222"]);
        assert_eq!(items.get_map("11111").get_string("manifest"), "-1");
        assert_eq!(items.get_map("22222").get_string("manifest"), "5522");
    }

    #[test]
    fn missing_keys_are_empty() {
        let tree = KeyValueTree::parse(r#""a" "b""#).unwrap();
        assert_eq!(tree.get_string("missing"), "");
        assert!(tree.get_map("a").is_empty());
        assert!(tree.get_map("missing").get_map("deeper").is_empty());
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            KeyValueTree::parse(r#""a" { "b" "c" "#),
            Err(ManifestError::Unexpected { .. })
        ));
        assert!(matches!(
            KeyValueTree::parse(r#""a" "unterminated"#),
            Err(ManifestError::UnterminatedString { line: 1 })
        ));
        assert!(KeyValueTree::parse(r#""a" "b" }"#).is_err());
        assert!(KeyValueTree::parse("bare words").is_err());
    }
}
