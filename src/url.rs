//! URL rewriting helpers used by the transport during negotiate and connect.

use url::Url;

/// Rewrite a URL's scheme between the http(s) and ws(s) families.
///
/// `ws = true` maps `http -> ws` and `https -> wss`; `ws = false` maps the
/// reverse. A scheme already in the target family, or any other scheme, is
/// left untouched.
pub fn replace_scheme(url: &str, ws: bool) -> Result<String, url::ParseError> {
    let parsed = Url::parse(url)?;
    let new_scheme = match (parsed.scheme(), ws) {
        ("http", true) => "ws",
        ("https", true) => "wss",
        ("ws", false) => "http",
        ("wss", false) => "https",
        (other, _) => other,
    };
    // `Url::set_scheme` refuses special<->special-but-different-family
    // transitions (e.g. http -> ws), so rebuild the string by hand instead.
    let rest = url
        .splitn(2, "://")
        .nth(1)
        .ok_or(url::ParseError::RelativeUrlWithoutBase)?;
    Ok(format!("{new_scheme}://{rest}"))
}

/// Build the negotiate endpoint URL: strip a trailing slash, coerce the
/// scheme to http(s), and append `/negotiate`, preserving query and fragment.
pub fn negotiate_url(url: &str) -> Result<String, url::ParseError> {
    let http_url = replace_scheme(url, false)?;
    let mut parsed = Url::parse(&http_url)?;
    let query = parsed.query().map(str::to_owned);
    let fragment = parsed.fragment().map(str::to_owned);
    parsed.set_query(None);
    parsed.set_fragment(None);

    let mut path = parsed.path().trim_end_matches('/').to_owned();
    path.push_str("/negotiate");
    parsed.set_path(&path);

    if let Some(q) = query {
        parsed.set_query(Some(&q));
    }
    if let Some(f) = fragment {
        parsed.set_fragment(Some(&f));
    }
    Ok(parsed.into())
}

/// Build the connection URL: coerce the scheme to ws(s) and set the `id`
/// query parameter to `ids`, replacing any `id` pairs already present and
/// preserving every other existing query parameter.
pub fn connection_url(url: &str, ids: &[String]) -> Result<String, url::ParseError> {
    let ws_url = replace_scheme(url, true)?;
    let mut parsed = Url::parse(&ws_url)?;
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != "id")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut pairs = parsed.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        for id in ids {
            pairs.append_pair("id", id);
        }
    }
    Ok(parsed.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_scheme_http_to_ws() {
        assert_eq!(
            replace_scheme("http://h:8080", true).unwrap(),
            "ws://h:8080"
        );
    }

    #[test]
    fn replace_scheme_wss_to_https() {
        assert_eq!(replace_scheme("wss://h", false).unwrap(), "https://h");
    }

    #[test]
    fn replace_scheme_noop_when_already_target_family() {
        assert_eq!(replace_scheme("ws://h", true).unwrap(), "ws://h");
    }

    #[test]
    fn negotiate_url_strips_trailing_slash_and_appends_path() {
        assert_eq!(
            negotiate_url("ws://h/hub/").unwrap(),
            "http://h/hub/negotiate"
        );
    }

    #[test]
    fn negotiate_url_preserves_query() {
        assert_eq!(
            negotiate_url("wss://h/hub?foo=bar").unwrap(),
            "https://h/hub/negotiate?foo=bar"
        );
    }

    #[test]
    fn connection_url_appends_multiple_ids() {
        let got = connection_url(
            "http://h/ev?foo=bar",
            &["1".to_string(), "2".to_string(), "3".to_string()],
        )
        .unwrap();
        assert_eq!(got, "ws://h/ev?foo=bar&id=1&id=2&id=3");
    }

    #[test]
    fn connection_url_coerces_scheme() {
        let got = connection_url("https://h/ev", &["abc".to_string()]).unwrap();
        assert_eq!(got, "wss://h/ev?id=abc");
    }

    #[test]
    fn connection_url_overwrites_existing_id() {
        let got = connection_url("http://h/ev?id=old&foo=bar", &["new".to_string()]).unwrap();
        assert_eq!(got, "ws://h/ev?foo=bar&id=new");
    }
}
