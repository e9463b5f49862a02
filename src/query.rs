//! Blob index tag queries: `"key" OP 'value'` clauses joined by `AND`.
//!
//! The same parsed form is used to validate an expression before it is sent
//! to Find Blobs by Tags and, in the emulator, to evaluate it.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::BlobError;
use crate::models::TagMap;

const CONTAINER_KEY: &str = "@container";

/// Comparison operator of one clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "=" => Some(Comparison::Eq),
            ">" => Some(Comparison::Gt),
            ">=" => Some(Comparison::Ge),
            "<" => Some(Comparison::Lt),
            "<=" => Some(Comparison::Le),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Ge => ordering != Ordering::Less,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Le => ordering != Ordering::Greater,
        }
    }
}

/// One `"key" OP 'value'` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPredicate {
    pub key: String,
    pub op: Comparison,
    pub value: String,
}

impl TagPredicate {
    /// Tag values compare as plain strings.
    pub fn matches(&self, tags: &TagMap) -> bool {
        tags.get(&self.key)
            .map(|actual| self.op.holds(actual.cmp(self.value.as_str())))
            .unwrap_or(false)
    }
}

/// A parsed tag query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagQuery {
    expression: String,
    container: Option<String>,
    predicates: Vec<TagPredicate>,
}

impl TagQuery {
    pub fn parse(expression: &str) -> Result<Self, BlobError> {
        Parser::new(expression).parse()
    }

    /// The expression as written, which is what gets forwarded to the service.
    pub fn as_str(&self) -> &str {
        &self.expression
    }

    /// Container named by an `@container` clause.
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    pub fn predicates(&self) -> &[TagPredicate] {
        &self.predicates
    }

    /// Evaluates the tag clauses; an `@container` clause is ignored here.
    pub fn matches(&self, tags: &TagMap) -> bool {
        self.predicates.iter().all(|p| p.matches(tags))
    }

    /// Evaluates every clause against one blob.
    pub fn matches_blob(&self, container: &str, tags: &TagMap) -> bool {
        self.container.as_deref().map_or(true, |c| c == container) && self.matches(tags)
    }
}

impl fmt::Display for TagQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for TagQuery {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TagQuery::parse(s)
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn error(&self, position: usize, message: impl Into<String>) -> BlobError {
        BlobError::QuerySyntax {
            expression: self.src.to_string(),
            position,
            message: message.into(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.pos >= self.src.len()
    }

    fn parse(mut self) -> Result<TagQuery, BlobError> {
        if self.at_end() {
            return Err(self.error(0, "empty expression"));
        }

        let mut container: Option<String> = None;
        let mut predicates = Vec::new();

        loop {
            let clause_start = self.pos;
            let (key, is_container) = self.parse_key()?;
            let op_pos = {
                self.skip_ws();
                self.pos
            };
            let op = self.parse_operator()?;
            let value = self.parse_value()?;

            if is_container {
                if op != Comparison::Eq {
                    return Err(self.error(op_pos, "@container only supports '='"));
                }
                if container.is_some() {
                    return Err(self.error(clause_start, "duplicate @container clause"));
                }
                container = Some(value);
            } else {
                predicates.push(TagPredicate { key, op, value });
            }

            if self.at_end() {
                break;
            }
            self.expect_and()?;
            if self.at_end() {
                return Err(self.error(self.src.len(), "expression ends with a dangling AND"));
            }
        }

        Ok(TagQuery {
            expression: self.src.to_string(),
            container,
            predicates,
        })
    }

    /// `"key"` or `@container`.
    fn parse_key(&mut self) -> Result<(String, bool), BlobError> {
        self.skip_ws();
        let start = self.pos;
        if self.rest().starts_with(CONTAINER_KEY) {
            self.pos += CONTAINER_KEY.len();
            return Ok((CONTAINER_KEY.to_string(), true));
        }
        if !self.rest().starts_with('"') {
            return Err(self.error(start, "expected a double-quoted tag key"));
        }
        let key = self.quoted('"')?;
        if key.is_empty() {
            return Err(self.error(start, "tag key is empty"));
        }
        Ok((key, false))
    }

    fn parse_operator(&mut self) -> Result<Comparison, BlobError> {
        self.skip_ws();
        let start = self.pos;
        let len = self
            .rest()
            .find(|c: char| !matches!(c, '=' | '<' | '>' | '!' | '~'))
            .unwrap_or(self.rest().len());
        if len == 0 {
            return Err(self.error(start, "expected a comparison operator"));
        }
        let op = &self.rest()[..len];
        let parsed = Comparison::parse(op)
            .ok_or_else(|| self.error(start, format!("unknown operator {op:?}")))?;
        self.pos += len;
        Ok(parsed)
    }

    fn parse_value(&mut self) -> Result<String, BlobError> {
        self.skip_ws();
        if !self.rest().starts_with('\'') {
            return Err(self.error(self.pos, "expected a single-quoted value"));
        }
        self.quoted('\'')
    }

    /// Reads a quoted string starting at the opening quote.
    fn quoted(&mut self, quote: char) -> Result<String, BlobError> {
        let open = self.pos;
        let body_start = open + quote.len_utf8();
        match self.src[body_start..].find(quote) {
            Some(len) => {
                self.pos = body_start + len + quote.len_utf8();
                Ok(self.src[body_start..body_start + len].to_string())
            }
            None => Err(self.error(open, format!("unbalanced {quote} quote"))),
        }
    }

    fn expect_and(&mut self) -> Result<(), BlobError> {
        self.skip_ws();
        let start = self.pos;
        let word_len = self
            .rest()
            .find(char::is_whitespace)
            .unwrap_or(self.rest().len());
        let word = &self.rest()[..word_len];
        if !word.eq_ignore_ascii_case("and") {
            return Err(self.error(start, format!("unexpected token {word:?}, expected AND")));
        }
        self.pos += word_len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        TagMap::try_from_pairs(pairs.iter().copied()).unwrap()
    }

    fn syntax_position(expression: &str) -> usize {
        match TagQuery::parse(expression) {
            Err(BlobError::QuerySyntax { position, .. }) => position,
            other => panic!("expected syntax error for {expression:?}, got {other:?}"),
        }
    }

    #[test]
    fn evaluates_conjunction() {
        let query = TagQuery::parse(r#""Content" = 'image' AND "Date" >= '2022-01-01'"#).unwrap();
        assert_eq!(query.predicates().len(), 2);
        assert!(query.matches(&tags(&[("Content", "image"), ("Date", "2022-03-01")])));
        assert!(!query.matches(&tags(&[("Content", "image"), ("Date", "2021-12-31")])));
        assert!(!query.matches(&tags(&[("Content", "text"), ("Date", "2022-03-01")])));
        assert!(!query.matches(&tags(&[("Content", "image")])));
    }

    #[test]
    fn operators_compare_strings() {
        let t = tags(&[("n", "5")]);
        assert!(TagQuery::parse(r#""n" > '10'"#).unwrap().matches(&t));
        assert!(TagQuery::parse(r#""n" <= '5'"#).unwrap().matches(&t));
        assert!(!TagQuery::parse(r#""n" < '5'"#).unwrap().matches(&t));
    }

    #[test]
    fn and_is_case_insensitive_and_whitespace_is_free() {
        let query = TagQuery::parse(r#"  "a"='1'   and"b" ='2' "#);
        // `and"b"` has no separating whitespace, which reads as one token.
        assert!(query.is_err());
        let query = TagQuery::parse(r#""a"='1' and "b"='2'"#).unwrap();
        assert!(query.matches(&tags(&[("a", "1"), ("b", "2")])));
    }

    #[test]
    fn container_clause_scopes_matches() {
        let query = TagQuery::parse(r#"@container = 'photos' AND "kind" = 'cat'"#).unwrap();
        assert_eq!(query.container(), Some("photos"));
        let t = tags(&[("kind", "cat")]);
        assert!(query.matches_blob("photos", &t));
        assert!(!query.matches_blob("docs", &t));
        assert!(TagQuery::parse(r#"@container > 'a'"#).is_err());
    }

    #[test]
    fn empty_value_is_allowed() {
        let query = TagQuery::parse(r#""k" = ''"#).unwrap();
        assert!(query.matches(&tags(&[("k", "")])));
    }

    #[test]
    fn syntax_errors_carry_positions() {
        assert_eq!(syntax_position(r#""a" = 'unterminated"#), 6);
        assert_eq!(syntax_position(r#""a = 'x'"#), 0);
        assert_eq!(syntax_position(r#""a" != 'x'"#), 4);
        assert_eq!(syntax_position(r#""a" <> 'x'"#), 4);
        assert_eq!(syntax_position(r#""" = 'x'"#), 0);
        assert_eq!(syntax_position(r#""a" = 'x' AND"#), 13);
        assert_eq!(syntax_position(r#""a" = 'x' OR "b" = 'y'"#), 10);
        assert_eq!(syntax_position(r#""a" = 'x' 'y'"#), 10);
        assert_eq!(syntax_position(""), 0);
    }

    #[test]
    fn display_keeps_original_text() {
        let text = r#""Content" = 'image'"#;
        let query: TagQuery = text.parse().unwrap();
        assert_eq!(query.to_string(), text);
    }
}
