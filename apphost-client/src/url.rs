/// A query parameter value: either a single scalar or a list that should expand into one
/// `key=value` pair per element, preserving order (frontik `make_qs`'s `doseq=True`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for QueryValue {
    fn from(s: &str) -> Self {
        QueryValue::One(s.to_owned())
    }
}

impl From<String> for QueryValue {
    fn from(s: String) -> Self {
        QueryValue::One(s)
    }
}

pub type QueryParams = Vec<(String, QueryValue)>;

/// Percent-encode `params` into a query string, expanding list-valued entries into repeated keys
/// in order.
pub fn make_qs(params: &[(String, QueryValue)]) -> String {
    let mut parts = Vec::new();
    for (key, value) in params {
        let encoded_key = urlencoding::encode(key);
        match value {
            QueryValue::One(v) => {
                parts.push(format!("{}={}", encoded_key, urlencoding::encode(v)));
            }
            QueryValue::Many(values) => {
                for v in values {
                    parts.push(format!("{}={}", encoded_key, urlencoding::encode(v)));
                }
            }
        }
    }
    parts.join("&")
}

/// Split `query` into an ordered list of `(key, raw value)` pairs, one entry per key, values
/// joined the way `urllib.parse.parse_qs` groups repeated keys into a list.
fn parse_qs(query: &str) -> QueryParams {
    let mut ordered: QueryParams = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (raw_key, raw_value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key = urlencoding::decode(raw_key)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| raw_key.to_owned());
        let value = urlencoding::decode(raw_value)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| raw_value.to_owned());

        match ordered.iter_mut().find(|(k, _)| k == &key) {
            Some((_, slot)) => {
                let prev = std::mem::replace(slot, QueryValue::Many(vec![]));
                *slot = match prev {
                    QueryValue::One(p) => QueryValue::Many(vec![p, value]),
                    QueryValue::Many(mut values) => {
                        values.push(value);
                        QueryValue::Many(values)
                    }
                };
            }
            None => ordered.push((key, QueryValue::One(value))),
        }
    }
    ordered
}

/// Build a URL from a base URL plus additional query parameters, preserving every pre-existing
/// parameter and appending/overwriting with the new ones in the order given (frontik
/// `make_url`).
pub fn make_url(url: &str, query_args: &[(String, QueryValue)]) -> String {
    let (before_fragment, fragment) = match url.split_once('#') {
        Some((b, f)) => (b, Some(f)),
        None => (url, None),
    };
    let (base, query) = match before_fragment.split_once('?') {
        Some((b, q)) => (b, q),
        None => (before_fragment, ""),
    };

    let mut params = parse_qs(query);
    for (key, value) in query_args {
        match params.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.clone(),
            None => params.push((key.clone(), value.clone())),
        }
    }

    let qs = make_qs(&params);
    let mut result = base.to_owned();
    if !qs.is_empty() {
        result.push('?');
        result.push_str(&qs);
    }
    if let Some(fragment) = fragment {
        result.push('#');
        result.push_str(fragment);
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn make_qs_skips_nothing_but_expands_lists() {
        let params = vec![
            ("a".to_owned(), QueryValue::One("1".to_owned())),
            (
                "b".to_owned(),
                QueryValue::Many(vec!["x".to_owned(), "y".to_owned()]),
            ),
        ];
        assert_eq!(make_qs(&params), "a=1&b=x&b=y");
    }

    #[test]
    fn make_url_preserves_existing_and_appends_new() {
        let url = make_url(
            "http://host/path?existing=1",
            &[("new".to_owned(), QueryValue::from("2"))],
        );
        assert_eq!(url, "http://host/path?existing=1&new=2");
    }

    #[test]
    fn make_url_overwrites_same_key() {
        let url = make_url(
            "http://host/path?a=old",
            &[("a".to_owned(), QueryValue::from("new"))],
        );
        assert_eq!(url, "http://host/path?a=new");
    }

    #[test]
    fn make_url_with_no_existing_query() {
        let url = make_url("http://host/path", &[("a".to_owned(), QueryValue::from("1"))]);
        assert_eq!(url, "http://host/path?a=1");
    }
}
