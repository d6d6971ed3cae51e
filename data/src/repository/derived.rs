//! Queries derived from method names.
//!
//! A method name such as `findTop3ByAgeGreaterThanAndActiveIsTrue` is split into a subject
//! (`findTop3`) and a predicate (`AgeGreaterThanAndActiveIsTrue`). The subject determines what the
//! query does with the matching entities and how many it considers; the predicate is a list of
//! parts joined by `And`, each naming a property and a comparison.
//!
//! Properties are named in `PascalCase`, whatever the case of the underlying field, so both
//! `article_id` and `articleId` are written `ArticleId`.

use crate::error::{Error, Result};
use crate::mapping::Entity;
use crate::query::{Operator, Query};
use convert_case::{Case, Casing};
use rmpv::Value;
use strum::Display;

/// What a derived query does with the entities it matches.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Execution {
    /// Count matching entities.
    Count,
    /// Check whether any entity matches.
    Exists,
    /// Delete matching entities.
    Delete,
    /// Return all matching entities.
    Collection,
    /// Return the first matching entity.
    Single,
}

/// A comparison in a part of a derived query.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Keyword {
    #[strum(serialize = "SIMPLE_PROPERTY")]
    Equals,
    #[strum(serialize = "GREATER_THAN")]
    GreaterThan,
    #[strum(serialize = "GREATER_THAN_EQUAL")]
    GreaterThanEqual,
    #[strum(serialize = "LESS_THAN")]
    LessThan,
    #[strum(serialize = "LESS_THAN_EQUAL")]
    LessThanEqual,
    #[strum(serialize = "BETWEEN")]
    Between,
    #[strum(serialize = "TRUE")]
    True,
    #[strum(serialize = "FALSE")]
    False,
}

impl Keyword {
    /// The number of method parameters consumed by this keyword.
    pub fn parameters(self) -> usize {
        match self {
            Self::True | Self::False => 0,
            Self::Between => 2,
            _ => 1,
        }
    }
}

/// Keywords understood in method names, after an optional `Is`.
const KEYWORDS: &[(&str, Keyword)] = &[
    ("", Keyword::Equals),
    ("Equals", Keyword::Equals),
    ("GreaterThan", Keyword::GreaterThan),
    ("After", Keyword::GreaterThan),
    ("GreaterThanEqual", Keyword::GreaterThanEqual),
    ("LessThan", Keyword::LessThan),
    ("Before", Keyword::LessThan),
    ("LessThanEqual", Keyword::LessThanEqual),
    ("Between", Keyword::Between),
    ("True", Keyword::True),
    ("False", Keyword::False),
];

/// Keywords which are recognized in method names but cannot be evaluated by Tarantool.
const UNSUPPORTED: &[&str] = &[
    "Not",
    "In",
    "NotIn",
    "Null",
    "NotNull",
    "Empty",
    "NotEmpty",
    "Like",
    "NotLike",
    "StartingWith",
    "StartsWith",
    "EndingWith",
    "EndsWith",
    "Containing",
    "Contains",
    "NotContaining",
    "Matches",
    "MatchesRegex",
    "Regex",
    "Near",
    "Within",
    "Exists",
    "IgnoreCase",
    "IgnoringCase",
];

const PREFIXES: &[(&str, Execution)] = &[
    ("find", Execution::Collection),
    ("read", Execution::Collection),
    ("get", Execution::Collection),
    ("query", Execution::Collection),
    ("search", Execution::Collection),
    ("stream", Execution::Collection),
    ("count", Execution::Count),
    ("exists", Execution::Exists),
    ("delete", Execution::Delete),
    ("remove", Execution::Delete),
];

/// A condition on one property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    /// The stored name of the field.
    pub field: String,
    pub keyword: Keyword,
}

/// A query parsed from a method name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedQuery {
    method: String,
    execution: Execution,
    limit: Option<usize>,
    parts: Vec<Part>,
}

impl DerivedQuery {
    /// Parse a method name into a query on an entity with the given stored `fields`.
    pub fn parse(method: &str, fields: &[&str]) -> Result<Self> {
        let (prefix, execution) = PREFIXES
            .iter()
            .find(|(prefix, _)| {
                method.strip_prefix(prefix).map_or(false, |rest| {
                    rest.is_empty() || rest.starts_with(|c: char| c.is_ascii_uppercase())
                })
            })
            .ok_or_else(|| {
                Error::invalid_usage(format!("cannot derive a query from method {method}"))
            })?;
        let rest = &method[prefix.len()..];
        let (subject, predicate) = match rest.find("By") {
            Some(i) => (&rest[..i], &rest[i + 2..]),
            None => (rest, ""),
        };

        let limit = parse_limit(subject);
        let execution = match (execution, limit) {
            (Execution::Collection, Some(1)) => Execution::Single,
            (execution, _) => *execution,
        };

        let mut alternatives = split_keyword(predicate, "Or");
        if alternatives.len() > 1 {
            return Err(Error::invalid_usage(
                "Tarantool does not support an OR operator",
            ));
        }
        let parts = match alternatives.pop() {
            Some(predicate) if !predicate.is_empty() => split_keyword(predicate, "And")
                .into_iter()
                .map(|part| parse_part(part, fields))
                .collect::<Result<_>>()?,
            _ => vec![],
        };

        Ok(Self {
            method: method.to_string(),
            execution,
            limit,
            parts,
        })
    }

    /// Parse a method name into a query on entities of type `T`.
    pub fn for_entity<T: Entity>(method: &str) -> Result<Self> {
        Self::parse(method, T::fields())
    }

    /// Return only the first matching entity.
    pub fn single(mut self) -> Self {
        if self.execution == Execution::Collection {
            self.execution = Execution::Single;
        }
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn execution(&self) -> Execution {
        self.execution
    }

    /// The maximum number of entities considered, from a `First<n>` or `Top<n>` subject.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// The number of parameters this query takes.
    pub fn parameter_count(&self) -> usize {
        self.parts.iter().map(|p| p.keyword.parameters()).sum()
    }

    /// Bind `params` to the parts of this query.
    ///
    /// # Errors
    ///
    /// This method fails if the number of parameters does not match [`parameter_count`].
    ///
    /// [`parameter_count`]: Self::parameter_count
    pub fn bind(&self, params: Vec<Value>) -> Result<Query> {
        if params.len() != self.parameter_count() {
            return Err(Error::invalid_usage(format!(
                "query {} takes {} parameters, but {} were given",
                self.method,
                self.parameter_count(),
                params.len()
            )));
        }
        let query = match self.limit {
            Some(limit) => Query::limited(limit),
            None => Query::new(),
        };

        let mut params = params.into_iter();
        let mut next = || params.next().unwrap_or(Value::Nil);
        Ok(self.parts.iter().fold(query, |query, part| {
            let field = part.field.as_str();
            query.map(|c| match part.keyword {
                Keyword::Equals => c.and(field, Operator::Eq, next()),
                Keyword::GreaterThan => c.and(field, Operator::Gt, next()),
                Keyword::GreaterThanEqual => c.and(field, Operator::Ge, next()),
                Keyword::LessThan => c.and(field, Operator::Lt, next()),
                Keyword::LessThanEqual => c.and(field, Operator::Le, next()),
                Keyword::Between => {
                    let (low, high) = (next(), next());
                    c.and(field, Operator::Ge, low).and(field, Operator::Le, high)
                }
                Keyword::True => c.and_equals(field, true),
                Keyword::False => c.and_equals(field, false),
            })
        }))
    }
}

/// The limit requested by a subject like `First`, `Top10` or `DistinctFirst3`.
fn parse_limit(subject: &str) -> Option<usize> {
    ["First", "Top"].into_iter().find_map(|word| {
        let rest = &subject[subject.find(word)? + word.len()..];
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .map_or(rest, |end| &rest[..end]);
        if rest[digits.len()..].starts_with(|c: char| c.is_ascii_lowercase()) {
            // Part of a word, like `Topics`.
            return None;
        }
        Some(digits.parse().unwrap_or(1))
    })
}

/// Split `s` at each occurrence of `keyword` which is followed by an uppercase letter.
fn split_keyword<'a>(s: &'a str, keyword: &str) -> Vec<&'a str> {
    let mut parts = vec![];
    let mut start = 0;
    let mut search = 0;
    while let Some(i) = s[search..].find(keyword).map(|i| i + search) {
        let after = i + keyword.len();
        if i > start && s[after..].starts_with(|c: char| c.is_ascii_uppercase()) {
            parts.push(&s[start..i]);
            start = after;
        }
        search = after;
    }
    parts.push(&s[start..]);
    parts
}

fn parse_part(part: &str, fields: &[&str]) -> Result<Part> {
    let mut candidates = fields
        .iter()
        .map(|field| (field.to_case(Case::Pascal), *field))
        .collect::<Vec<_>>();
    candidates.sort_by_key(|(property, _)| std::cmp::Reverse(property.len()));

    let (keyword, field) = candidates
        .iter()
        .find_map(|(property, field)| Some((part.strip_prefix(property.as_str())?, *field)))
        .ok_or_else(|| {
            Error::invalid_usage(format!("No property found for part [{part}]"))
        })?;
    let keyword = keyword.strip_prefix("Is").unwrap_or(keyword);
    match KEYWORDS.iter().find(|(name, _)| *name == keyword) {
        Some((_, keyword)) => Ok(Part {
            field: field.to_string(),
            keyword: *keyword,
        }),
        None if UNSUPPORTED.contains(&keyword) => Err(Error::invalid_usage(format!(
            "Unsupported keyword [{keyword}] in part [{part}]"
        ))),
        None => Err(Error::invalid_usage(format!(
            "No property found for part [{part}]"
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::query::Conditions;

    const FIELDS: &[&str] = &["id", "name", "nameSuffix", "age", "active", "created_at"];

    fn parse(method: &str) -> Result<DerivedQuery> {
        DerivedQuery::parse(method, FIELDS)
    }

    #[test]
    fn test_subjects() {
        let q = parse("findByName").unwrap();
        assert_eq!(q.execution(), Execution::Collection);
        assert_eq!(q.limit(), None);

        assert_eq!(parse("countByAge").unwrap().execution(), Execution::Count);
        assert_eq!(parse("existsById").unwrap().execution(), Execution::Exists);
        assert_eq!(parse("removeByAge").unwrap().execution(), Execution::Delete);
        assert!(parse("count").unwrap().parts().is_empty());

        let q = parse("findFirstByName").unwrap();
        assert_eq!(q.execution(), Execution::Single);
        assert_eq!(q.limit(), Some(1));
        let q = parse("queryTop10ByAge").unwrap();
        assert_eq!(q.execution(), Execution::Collection);
        assert_eq!(q.limit(), Some(10));
        assert_eq!(
            parse("getUsersByAge").unwrap().single().execution(),
            Execution::Single
        );
        assert_eq!(parse("findTopicsByAge").unwrap().limit(), None);

        assert!(matches!(
            parse("findingByName"),
            Err(Error::InvalidApiUsage { .. })
        ));
        assert!(matches!(parse("save"), Err(Error::InvalidApiUsage { .. })));
    }

    #[test]
    fn test_parts() {
        let q = parse("findByNameSuffixAndAgeIsGreaterThanEqualAndCreatedAtBefore").unwrap();
        assert_eq!(
            q.parts(),
            [
                Part {
                    field: "nameSuffix".into(),
                    keyword: Keyword::Equals
                },
                Part {
                    field: "age".into(),
                    keyword: Keyword::GreaterThanEqual
                },
                Part {
                    field: "created_at".into(),
                    keyword: Keyword::LessThan
                },
            ]
        );

        let q = parse("findByActiveIsTrueAndAgeBetweenAndNameIs").unwrap();
        assert_eq!(
            q.parts().iter().map(|p| p.keyword).collect::<Vec<_>>(),
            [Keyword::True, Keyword::Between, Keyword::Equals]
        );
        assert_eq!(q.parameter_count(), 3);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            parse("findByNameOrAge").unwrap_err(),
            Error::invalid_usage("Tarantool does not support an OR operator")
        );
        assert_eq!(
            parse("findByNameStartingWith").unwrap_err(),
            Error::invalid_usage("Unsupported keyword [StartingWith] in part [NameStartingWith]")
        );
        assert!(matches!(
            parse("findByEmail"),
            Err(Error::InvalidApiUsage { .. })
        ));
        assert!(matches!(
            parse("findByAge").unwrap().bind(vec![]),
            Err(Error::InvalidApiUsage { .. })
        ));
    }

    #[test]
    fn test_bind() {
        let q = parse("findTop2ByAgeBetweenAndActiveFalseAndName").unwrap();
        let query = q
            .bind(vec![Value::from(18), Value::from(65), Value::from("bob")])
            .unwrap();
        assert_eq!(
            query.into_conditions(),
            Conditions::any()
                .and_greater_or_equals("age", 18)
                .and_less_or_equals("age", 65)
                .and_equals("active", false)
                .and_equals("name", "bob")
                .with_limit(2)
        );
    }

    #[test]
    fn test_split_keyword() {
        assert_eq!(split_keyword("NameAndAge", "And"), ["Name", "Age"]);
        assert_eq!(split_keyword("BrandAndAge", "And"), ["Brand", "Age"]);
        assert_eq!(split_keyword("Android", "And"), ["Android"]);
        assert_eq!(split_keyword("OrderIdOrColor", "Or"), ["OrderId", "Color"]);
    }
}
