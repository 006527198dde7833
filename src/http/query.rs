//! Query segment splitting.
//!
//! The request parser leaves the query segment raw. [`Query`] splits it on
//! `&` and `=` first, then [`Query::decode`] turns `%XY` escapes back into
//! bytes, so an encoded `&` or `=` stays inside its key or value.
//!
//! Borrowing collectors receive the raw pieces; the owned
//! `HashMap<String, String>` decodes them.

use crate::http::uri::decode_pair;
use memchr::memchr;
use std::{borrow::Cow, collections::HashMap};

/// Splitter for `key=value&key2=value2` strings.
///
/// # Examples
/// ```rust
/// use trellis_web::query::Query;
/// use std::collections::HashMap;
///
/// let params: Vec<(&str, &str)> = Query::parse("name=john&age=25&city");
/// assert_eq!(params, [("name", "john"), ("age", "25"), ("city", "")]);
///
/// // Last value wins
/// let map: HashMap<&str, &str> = Query::parse("a=1&a=2");
/// assert_eq!(map["a"], "2");
///
/// // Owned maps are decoded after splitting
/// let map: HashMap<String, String> = Query::parse("q=a%26b");
/// assert_eq!(map["q"], "a&b");
/// ```
pub struct Query;

impl Query {
    /// Parses a query string into a new collection.
    ///
    /// A leading `?` is ignored. Keys without `=` get an empty value, and
    /// empty pairs between two `&` are skipped.
    #[inline]
    pub fn parse<'a, C: QueryCollector<'a>>(query: &'a str) -> C {
        let mut result = C::default();
        Self::parse_into(&mut result, query);
        result
    }

    /// Appends the parameters of `query` to an existing collection.
    pub fn parse_into<'a, C: QueryCollector<'a>>(result: &mut C, query: &'a str) {
        let data = query.strip_prefix('?').unwrap_or(query);
        let bytes = data.as_bytes();

        let mut start = 0;
        while start < bytes.len() {
            let end = memchr(b'&', &bytes[start..])
                .map(|pos| start + pos)
                .unwrap_or(bytes.len());

            if end > start {
                let pair = &data[start..end];
                match pair.split_once('=') {
                    Some((key, value)) => result.add_param(key, value),
                    None => result.add_param(pair, ""),
                }
            }

            start = end + 1;
        }
    }

    /// Decodes the `%XY` escapes of one key or value.
    ///
    /// Only ASCII bytes are decoded; any other escape is kept as written,
    /// which keeps the result valid UTF-8.
    pub fn decode(part: &str) -> Cow<'_, str> {
        let bytes = part.as_bytes();
        let Some(first) = memchr(b'%', bytes) else {
            return Cow::Borrowed(part);
        };

        let mut out = String::with_capacity(part.len());
        out.push_str(&part[..first]);

        let mut i = first;
        while i < bytes.len() {
            let next = memchr(b'%', &bytes[i..]).map_or(bytes.len(), |pos| i + pos);
            out.push_str(&part[i..next]);
            if next == bytes.len() {
                break;
            }

            match decode_pair(bytes.get(next + 1..next + 3)) {
                Some(decoded) => {
                    out.push(decoded as char);
                    i = next + 3;
                }
                None => {
                    out.push('%');
                    i = next + 1;
                }
            }
        }

        Cow::Owned(out)
    }
}

/// Collections that [`Query`] can fill.
///
/// # Examples
/// ```rust
/// use trellis_web::query::{Query, QueryCollector};
///
/// #[derive(Default)]
/// struct Keys(Vec<String>);
///
/// impl<'a> QueryCollector<'a> for Keys {
///     fn add_param(&mut self, key: &'a str, _: &'a str) {
///         self.0.push(key.to_uppercase());
///     }
/// }
///
/// let keys: Keys = Query::parse("a=1&b=2");
/// assert_eq!(keys.0, ["A", "B"]);
/// ```
pub trait QueryCollector<'a>: Default {
    fn add_param(&mut self, key: &'a str, value: &'a str);
}

// Preserves order and duplicates
impl<'a> QueryCollector<'a> for Vec<(&'a str, &'a str)> {
    #[inline(always)]
    fn add_param(&mut self, key: &'a str, value: &'a str) {
        self.push((key, value));
    }
}

// Last value wins
impl<'a> QueryCollector<'a> for HashMap<&'a str, &'a str> {
    #[inline(always)]
    fn add_param(&mut self, key: &'a str, value: &'a str) {
        self.insert(key, value);
    }
}

// Decoded, last value wins
impl<'a> QueryCollector<'a> for HashMap<String, String> {
    #[inline(always)]
    fn add_param(&mut self, key: &'a str, value: &'a str) {
        self.insert(Query::decode(key).into_owned(), Query::decode(value).into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic() {
        for line in ["a=1&b=2", "?a=1&b=2"] {
            let params: Vec<(&str, &str)> = Query::parse(line);
            assert_eq!(params, [("a", "1"), ("b", "2")]);
        }
    }

    #[test]
    fn full() {
        let params: Vec<(&str, &str)> = Query::parse("flag&empty=&=val&&key=value=x");

        #[rustfmt::skip]
        assert_eq!(params, [
            ("flag", ""),
            ("empty", ""),
            ("", "val"),
            ("key", "value=x"),
        ]);
    }

    #[test]
    fn owned_map() {
        let map: HashMap<String, String> = Query::parse("x=1&y=two&x=3");

        assert_eq!(map.len(), 2);
        assert_eq!(map["x"], "3");
        assert_eq!(map["y"], "two");
    }

    #[test]
    fn encoded_delimiters() {
        let map: HashMap<String, String> = Query::parse("q=a%26b&k%3D1=x%3Dy&path=%2Fa/b?c");

        assert_eq!(map.len(), 3);
        assert_eq!(map["q"], "a&b");
        assert_eq!(map["k=1"], "x=y");
        assert_eq!(map["path"], "/a/b?c");

        let raw: Vec<(&str, &str)> = Query::parse("q=a%26b");
        assert_eq!(raw, [("q", "a%26b")]);
    }

    #[test]
    fn decode() {
        #[rustfmt::skip]
        let cases = [
            ("plain",     "plain"),
            ("a%20b",     "a b"),
            ("%41%42%43", "ABC"),
            ("%e2%82%ac", "%e2%82%ac"),
            ("100%",      "100%"),
            ("%4",        "%4"),
            ("%zz%21",    "%zz!"),
        ];

        for (part, expected) in cases {
            assert_eq!(Query::decode(part), expected, "{part}");
        }
        assert!(matches!(Query::decode("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn empty() {
        assert!(Query::parse::<Vec<(&str, &str)>>("").is_empty());
        assert!(Query::parse::<Vec<(&str, &str)>>("?").is_empty());
        assert!(Query::parse::<Vec<(&str, &str)>>("&&").is_empty());
    }
}
