//! URI trie with regex parameter segments.
//!
//! A pattern is split on `/`. Plain segments are literal children; a segment
//! holding one or more `[name]` parameters becomes an anchored regex in the
//! parent's regex table. A final `+error` or `+layer` segment registers an
//! error page or a layer on the parent node instead of a route.
//!
//! ```text
//! "/users/[id]/posts/post-[slug].html"
//!
//!   root ── users ──(^(.+)$ : id)── posts ──(^post\-(.+)\.html$ : slug)
//! ```

use crate::{
    errors::ErrorKind,
    http::{request::RequestData, types::Method},
    mask::Mask,
    server::handler::ErasedHandler,
};
use regex::Regex;
use std::{
    collections::{btree_map::Entry, BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
};
use tracing::warn;

/// A handler with the masks checked around it.
#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) handler: Arc<dyn ErasedHandler>,
    pub(crate) req_mask: Option<Arc<Mask>>,
    pub(crate) resp_mask: Option<Arc<Mask>>,
    pub(crate) pattern: Arc<str>,
}

impl Route {
    pub(crate) fn new(pattern: &str, handler: Arc<dyn ErasedHandler>) -> Self {
        Self {
            handler,
            req_mask: None,
            resp_mask: None,
            pattern: pattern.into(),
        }
    }
}

/// What a registration attaches to a node.
pub(crate) enum Target {
    Handler(Route),
    Static(PathBuf),
}

#[derive(Clone, Copy, PartialEq)]
enum Special {
    None,
    Error,
    Layer,
}

#[derive(Default)]
pub(crate) struct UriPart {
    children: HashMap<String, UriPart>,
    params: Vec<String>,

    handlers: HashMap<Method, Route>,
    errors: HashMap<Method, Route>,
    layers: HashMap<Method, Route>,
    statics: HashMap<Method, PathBuf>,

    regexes: BTreeMap<String, (Regex, UriPart)>,
}

/// Result of a lookup: everything dispatch needs for one request.
#[derive(Default)]
pub(crate) struct Page {
    pub(crate) route: Option<Route>,
    pub(crate) layers: Vec<Route>,

    pub(crate) error: Option<Route>,
    /// How many of `layers` also run before the error page.
    pub(crate) error_layers: usize,

    /// Static root and the depth it was registered at.
    pub(crate) statics: Option<(PathBuf, usize)>,
}

/// Bytes that make a `[name]` a literal: anything a regex would escape.
#[inline]
fn needs_escape(byte: u8) -> bool {
    !(byte.is_ascii_alphanumeric() || byte == b'_')
}

/// Splits a segment into an anchored regex and its parameter names.
///
/// Returns `None` for a segment without a valid `[name]`.
fn segment_regex(segment: &str) -> Option<(String, Vec<String>)> {
    let bytes = segment.as_bytes();
    let mut pattern = String::new();
    let mut literal = String::new();
    let mut names = Vec::new();

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            let rest = &segment[i + 1..];
            let name = rest
                .find(']')
                .map(|end| &rest[..end])
                .filter(|name| !name.is_empty() && !name.bytes().any(needs_escape));

            if let Some(name) = name {
                pattern.push_str(&regex::escape(&literal));
                pattern.push_str("(.+)");
                literal.clear();
                names.push(name.to_string());

                i += name.len() + 2;
                continue;
            }
        }

        let ch = segment[i..].chars().next()?;
        literal.push(ch);
        i += ch.len_utf8();
    }

    match names.is_empty() {
        true => None,
        false => {
            pattern.push_str(&regex::escape(&literal));
            Some((format!("^{pattern}$"), names))
        }
    }
}

impl UriPart {
    /// Registers `target` for `method` under `pattern`.
    pub(crate) fn set_handler(
        &mut self,
        method: Method,
        pattern: &str,
        target: Target,
    ) -> Result<(), ErrorKind> {
        let (node, special) = self.build(pattern)?;

        let exists = || {
            ErrorKind::Config(format!(
                "The method {} already exists in the url {pattern}",
                method.as_str()
            ))
        };

        match (special, target) {
            (Special::None, Target::Handler(route)) => {
                if node.handlers.contains_key(&method) {
                    return Err(exists());
                }
                node.handlers.insert(method, route);
            }
            (Special::Error, Target::Handler(route)) => {
                if node.errors.contains_key(&method) {
                    return Err(exists());
                }
                node.errors.insert(method, route);
            }
            (Special::Layer, Target::Handler(route)) => {
                if node.layers.contains_key(&method) {
                    return Err(exists());
                }
                node.layers.insert(method, route);
            }
            (Special::None, Target::Static(dir)) => {
                if node.statics.contains_key(&method) {
                    return Err(ErrorKind::Config(format!(
                        "The method {} already exists in the static url {pattern}",
                        method.as_str()
                    )));
                }
                node.statics.insert(method, dir);
            }
            (_, Target::Static(_)) => {
                return Err(ErrorKind::Config(format!(
                    "static files cannot be served from the special page {pattern}"
                )));
            }
        }

        Ok(())
    }

    /// Walks `pattern`, creating nodes on the way.
    fn build(&mut self, pattern: &str) -> Result<(&mut UriPart, Special), ErrorKind> {
        let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        let mut seen: Vec<String> = Vec::new();
        let mut cur = self;

        for (i, segment) in segments.iter().enumerate() {
            let is_last = i + 1 == segments.len();

            if is_last && segment.starts_with('+') {
                match *segment {
                    "+error" => return Ok((cur, Special::Error)),
                    "+layer" => return Ok((cur, Special::Layer)),
                    _ => {
                        warn!(
                            "the first char '+' is reserved for special pages in {segment} ({pattern})"
                        );
                        return Ok((cur, Special::None));
                    }
                }
            }

            cur = match segment_regex(segment) {
                Some((source, names)) => {
                    for name in &names {
                        if seen.contains(name) {
                            warn!("a param with the title '{name}' is already in use ({pattern})");
                        }
                    }
                    seen.extend(names.iter().cloned());

                    let (_, child) = match cur.regexes.entry(source) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => {
                            let regex = Regex::new(entry.key()).map_err(|err| {
                                ErrorKind::Config(format!("bad route segment {segment}: {err}"))
                            })?;
                            let child = UriPart {
                                params: names,
                                ..UriPart::default()
                            };
                            entry.insert((regex, child))
                        }
                    };
                    child
                }
                None => cur.children.entry(segment.to_string()).or_default(),
            };
        }

        Ok((cur, Special::None))
    }

    /// Looks up the page for `data`, binding route parameters into it.
    pub(crate) fn get_handler(&self, data: &mut RequestData) -> Page {
        let mut page = Page::default();
        let method = data.method;
        let path_size = data.path_size();

        let mut cur = self;
        let mut found = true;

        for i in 0..=path_size {
            if let Some(dir) = cur.statics.get(&method) {
                page.statics = Some((dir.clone(), i));
            }
            if let Some(layer) = cur.layers.get(&method) {
                page.layers.push(layer.clone());
            }
            if let Some(error) = cur.errors.get(&method) {
                page.error = Some(error.clone());
                page.error_layers = page.layers.len();
            }

            if i == path_size {
                break;
            }

            let segment = &data.path[i];
            match cur.children.get(segment) {
                Some(child) => cur = child,
                None => match cur.match_regex(segment, &mut data.params) {
                    Some(child) => cur = child,
                    None => {
                        found = false;
                        break;
                    }
                },
            }
        }

        if found {
            page.route = cur.handlers.get(&method).cloned();
            data.has_body = page.route.is_some() && method.has_body();
        }
        page
    }

    /// First regex, in pattern order, matching the whole segment.
    fn match_regex(&self, segment: &str, params: &mut HashMap<String, String>) -> Option<&UriPart> {
        self.regexes.values().find_map(|(regex, child)| {
            let captures = regex.captures(segment)?;
            if captures.len() - 1 != child.params.len() {
                return None;
            }

            for (name, value) in child.params.iter().zip(captures.iter().skip(1)) {
                params.insert(name.clone(), value?.as_str().to_string());
            }
            Some(child)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::{types::Version, uri},
        Handler, Request, Response,
    };

    struct Nop;

    impl Handler for Nop {
        async fn handle(&self, _: &mut Request<'_>, _: &mut Response) -> Result<(), ErrorKind> {
            Ok(())
        }
    }

    fn route(pattern: &str) -> Target {
        Target::Handler(Route::new(pattern, Arc::new(Nop)))
    }

    fn data(method: Method, uri: &str) -> RequestData {
        RequestData::new(method, Version::Http11, uri.into(), uri::decompose(uri.as_bytes()).unwrap())
    }

    fn router(patterns: &[(Method, &str)]) -> UriPart {
        let mut root = UriPart::default();
        for (method, pattern) in patterns {
            root.set_handler(*method, pattern, route(pattern)).unwrap();
        }
        root
    }

    #[test]
    fn segment_regexes() {
        #[rustfmt::skip]
        let cases: [(&str, Option<(&str, &[&str])>); 7] = [
            ("users",            None),
            ("[id]",             Some((r"^(.+)$", &["id"]))),
            ("post-[slug].html", Some((r"^post\-(.+)\.html$", &["slug"]))),
            ("[a]_[b]",          Some((r"^(.+)_(.+)$", &["a", "b"]))),
            ("[a-b]",            None),
            ("[]",               None),
            ("x[y",              None),
        ];

        for (segment, expected) in cases {
            let got = segment_regex(segment);
            let got = got.as_ref().map(|(p, n)| (p.as_str(), n.iter().map(String::as_str).collect::<Vec<_>>()));
            let expected = expected.map(|(p, n)| (p, n.to_vec()));

            assert_eq!(got, expected, "{segment}");
        }
    }

    #[test]
    fn lookup_and_params() {
        let root = router(&[
            (Method::Get, "/"),
            (Method::Get, "/users"),
            (Method::Get, "/users/[id]"),
            (Method::Get, "/users/[id]/posts/post-[slug].html"),
            (Method::Post, "/users/[id]"),
            (Method::Get, "/users/me"),
        ]);

        #[rustfmt::skip]
        let cases: [(Method, &str, Option<&str>, &[(&str, &str)]); 10] = [
            (Method::Get,    "/",                           Some("/"),           &[]),
            (Method::Get,    "/users",                      Some("/users"),      &[]),
            (Method::Get,    "/users/",                     Some("/users"),      &[]),
            (Method::Get,    "/users/me",                   Some("/users/me"),   &[]),
            (Method::Get,    "/users/42",                   Some("/users/[id]"), &[("id", "42")]),
            (Method::Post,   "/users/42?x=1",               Some("/users/[id]"), &[("id", "42")]),
            (Method::Get,    "/users/7/posts/post-a-b.html",
                Some("/users/[id]/posts/post-[slug].html"),                      &[("id", "7"), ("slug", "a-b")]),
            (Method::Get,    "/users/7/posts/a.html",       None,                &[("id", "7")]),
            (Method::Delete, "/users/42",                   None,                &[("id", "42")]),
            (Method::Get,    "/nothing",                    None,                &[]),
        ];

        for (method, uri, pattern, params) in cases {
            let mut data = data(method, uri);
            let page = root.get_handler(&mut data);

            assert_eq!(page.route.as_ref().map(|r| &*r.pattern), pattern, "{uri}");
            let expected: HashMap<String, String> =
                params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            assert_eq!(data.params, expected, "{uri}");
        }
    }

    #[test]
    fn body_routes() {
        let root = router(&[(Method::Post, "/echo"), (Method::Get, "/echo")]);

        let mut post = data(Method::Post, "/echo");
        root.get_handler(&mut post);
        assert!(post.has_body);

        let mut get = data(Method::Get, "/echo");
        root.get_handler(&mut get);
        assert!(!get.has_body);

        let mut missing = data(Method::Post, "/nope");
        root.get_handler(&mut missing);
        assert!(!missing.has_body);
    }

    #[test]
    fn first_regex_wins() {
        let root = router(&[(Method::Get, "/f/[name].txt"), (Method::Get, "/f/[all]")]);

        let mut data = data(Method::Get, "/f/a.txt");
        let page = root.get_handler(&mut data);

        // `^(.+)$` sorts before `^(.+)\.txt$`
        assert_eq!(page.route.map(|r| r.pattern), Some("/f/[all]".into()));
        assert_eq!(data.params["all"], "a.txt");
    }

    #[test]
    fn duplicate_method() {
        let mut root = router(&[(Method::Get, "/a/[x]")]);

        assert_eq!(
            root.set_handler(Method::Get, "/a/[x]/", route("/a/[x]/")),
            Err(ErrorKind::Config("The method GET already exists in the url /a/[x]/".into()))
        );
        assert!(root.set_handler(Method::Put, "/a/[x]", route("/a/[x]")).is_ok());
        assert!(root.set_handler(Method::Get, "/a/+error", route("/a/+error")).is_ok());
        assert!(root.set_handler(Method::Get, "/a/+error", route("/a/+error")).is_err());
    }

    #[test]
    fn special_pages() {
        let root = router(&[
            (Method::Get, "/+error"),
            (Method::Get, "/+layer"),
            (Method::Get, "/api/+layer"),
            (Method::Get, "/api/v1/+error"),
            (Method::Get, "/api/v1/+layer"),
            (Method::Get, "/api/v1/items"),
            (Method::Get, "/api/+other"),
        ]);

        let mut data = data(Method::Get, "/api/v1/items");
        let page = root.get_handler(&mut data);
        assert_eq!(page.route.map(|r| r.pattern), Some("/api/v1/items".into()));
        assert_eq!(page.layers.len(), 3);
        assert_eq!(page.error.map(|r| r.pattern), Some("/api/v1/+error".into()));
        assert_eq!(page.error_layers, 2);

        // `+other` is a plain route on `/api`
        let mut data = super::tests::data(Method::Get, "/api");
        let page = root.get_handler(&mut data);
        assert_eq!(page.route.map(|r| r.pattern), Some("/api/+other".into()));
        assert_eq!(page.error.map(|r| r.pattern), Some("/+error".into()));

        // No literal route is created for the special segments
        let mut data = super::tests::data(Method::Get, "/+error");
        assert!(root.get_handler(&mut data).route.is_none());
    }

    #[test]
    fn statics() {
        let mut root = UriPart::default();
        root.set_handler(Method::Get, "/assets", Target::Static("/srv/www".into())).unwrap();

        let mut data = data(Method::Get, "/assets/css/site.css");
        let page = root.get_handler(&mut data);
        assert!(page.route.is_none());
        assert_eq!(page.statics, Some(("/srv/www".into(), 1)));

        assert!(root
            .set_handler(Method::Get, "/assets/+error", Target::Static("/x".into()))
            .is_err());
        assert!(root.set_handler(Method::Get, "/assets", Target::Static("/y".into())).is_err());
    }
}
