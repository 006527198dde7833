//! Request target decomposition.

use crate::{
    errors::{ErrorKind, ProtocolError},
    http::types::hex_value,
};

/// A request path split into segments.
///
/// `path[..divided]` are the path segments, `path[divided..]` holds at
/// most one query segment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Decomposed {
    pub(crate) path: Vec<String>,
    pub(crate) divided: Option<usize>,
}

/// Splits a target like `/a/b%20c/?x=1` into segments.
///
/// * segments are separated by `/`;
/// * the first `?` closes the path; after it `/` and `?` are plain bytes;
/// * in the path, `%XY` decodes when the byte is ASCII, otherwise it is kept
///   as written; the query segment stays raw so that an encoded `&` or `=`
///   survives until [`Query`](crate::query::Query) splits it;
/// * trailing empty path segments are dropped, so `/a/b/` equals `/a/b`.
pub(crate) fn decompose(target: &[u8]) -> Result<Decomposed, ErrorKind> {
    let rest = match target.split_first() {
        Some((b'/', rest)) => rest,
        _ => return Err(ProtocolError::InvalidUri.into()),
    };

    let mut result = Decomposed::default();
    let mut segment = Vec::new();
    let mut in_query = false;

    let mut i = 0;
    while i < rest.len() {
        let byte = rest[i];
        match byte {
            b'/' if !in_query => {
                result.path.push(into_string(&mut segment)?);
            }
            b'?' if !in_query => {
                result.path.push(into_string(&mut segment)?);
                trim_trailing(&mut result.path);

                result.divided = Some(result.path.len());
                in_query = true;
            }
            b'%' if !in_query => match decode_pair(rest.get(i + 1..i + 3)) {
                Some(decoded) => {
                    segment.push(decoded);
                    i += 2;
                }
                None => segment.push(b'%'),
            },
            _ => segment.push(byte),
        }
        i += 1;
    }

    match in_query {
        true => {
            if !segment.is_empty() {
                result.path.push(into_string(&mut segment)?);
            }
        }
        false => {
            result.path.push(into_string(&mut segment)?);
            trim_trailing(&mut result.path);
        }
    }

    Ok(result)
}

#[inline]
pub(crate) fn decode_pair(pair: Option<&[u8]>) -> Option<u8> {
    let value = match pair? {
        [hi, lo] => hex_value(*hi)? << 4 | hex_value(*lo)?,
        _ => return None,
    };

    (value <= 127).then_some(value)
}

#[inline]
fn into_string(segment: &mut Vec<u8>) -> Result<String, ErrorKind> {
    String::from_utf8(std::mem::take(segment)).map_err(|_| ProtocolError::InvalidUri.into())
}

#[inline]
fn trim_trailing(path: &mut Vec<String>) {
    while path.last().is_some_and(|s| s.is_empty()) {
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(target: &str) -> (Vec<String>, Option<usize>) {
        let d = decompose(target.as_bytes()).unwrap();
        (d.path, d.divided)
    }

    #[test]
    fn segments() {
        #[rustfmt::skip]
        let cases: [(&str, &[&str], Option<usize>); 14] = [
            ("/",                 &[],                     None),
            ("/a/b",              &["a", "b"],             None),
            ("/a/b/",             &["a", "b"],             None),
            ("/a/b//",            &["a", "b"],             None),
            ("/a//b",             &["a", "", "b"],         None),
            ("/hello/world?x=1",  &["hello", "world", "x=1"], Some(2)),
            ("/hello/world/?x=1", &["hello", "world", "x=1"], Some(2)),
            ("/?",                &[],                     Some(0)),
            ("/a?b/c?d",          &["a", "b/c?d"],         Some(1)),
            ("/a%2Fb",            &["a/b"],                None),
            ("/%7e%41",           &["~A"],                 None),
            ("/s?q=a%26b&k=x%3Dy", &["s", "q=a%26b&k=x%3Dy"], Some(1)),
            ("/a%3F?b=%2F/?",     &["a?", "b=%2F/?"],       Some(1)),
            ("/%2F?",             &["/"],                  Some(1)),
        ];

        for (target, path, divided) in cases {
            let (got, got_divided) = parts(target);
            assert_eq!(got, path, "{target}");
            assert_eq!(got_divided, divided, "{target}");
        }
    }

    #[test]
    fn trailing_slash_is_idempotent() {
        for target in ["/a", "/a/b", "/x/y/z", "/q?k=v"] {
            let slashed = match target.split_once('?') {
                Some((p, q)) => format!("{p}/?{q}"),
                None => format!("{target}/"),
            };
            assert_eq!(decompose(target.as_bytes()), decompose(slashed.as_bytes()));
        }
    }

    #[test]
    fn percent_round_trip() {
        for byte in 0u8..=127 {
            let encoded = format!("/%{byte:02X}");
            let decoded = decompose(encoded.as_bytes()).unwrap();

            assert_eq!(decoded.path, vec![(byte as char).to_string()], "byte {byte}");
        }

        #[rustfmt::skip]
        let kept = [
            ("/%80",  "%80"),
            ("/%FF",  "%FF"),
            ("/%zz",  "%zz"),
            ("/%4",   "%4"),
            ("/%",    "%"),
        ];

        for (target, segment) in kept {
            assert_eq!(parts(target).0, vec![segment.to_string()], "{target}");
        }
    }

    #[test]
    fn invalid_targets() {
        for target in ["", "a/b", "*", "http://host/"] {
            assert_eq!(
                decompose(target.as_bytes()),
                Err(ProtocolError::InvalidUri.into())
            );
        }
        assert_eq!(
            decompose(b"/\xff"),
            Err(ProtocolError::InvalidUri.into())
        );
    }
}
