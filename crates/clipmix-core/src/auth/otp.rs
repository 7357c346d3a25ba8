//! Detection and removal of one-time login payloads in URLs.
//!
//! Login emails link back to the app with `otp=<payload>` either in the
//! query string or inside the hash route (`/#/login?otp=...`).

use url::Url;

/// Query parameter carrying the one-time payload
pub const OTP_PARAM: &str = "otp";

/// Split `url` into the one-time payload it carries and the same URL with
/// the payload removed. Returns `None` if there is no non-empty payload.
pub fn take_otp_payload(url: &Url) -> Option<(String, Url)> {
    if let Some(payload) = find_param(url.query_pairs()) {
        let mut cleaned = url.clone();
        let kept = retained_pairs(url.query_pairs());
        if kept.is_empty() {
            cleaned.set_query(None);
        } else {
            cleaned.query_pairs_mut().clear().extend_pairs(kept);
        }
        return Some((payload, cleaned));
    }

    let fragment = url.fragment()?;
    let (route, query) = fragment.split_once('?')?;
    let pairs = || url::form_urlencoded::parse(query.as_bytes());
    let payload = find_param(pairs())?;

    let kept = retained_pairs(pairs());
    let new_fragment = if kept.is_empty() {
        route.to_string()
    } else {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        format!("{}?{}", route, query)
    };

    let mut cleaned = url.clone();
    cleaned.set_fragment(Some(&new_fragment));
    Some((payload, cleaned))
}

fn find_param<'a>(mut pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>) -> Option<String> {
    pairs
        .find(|(key, value)| key == OTP_PARAM && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

fn retained_pairs<'a>(
    pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
) -> Vec<(String, String)> {
    pairs
        .filter(|(key, _)| key != OTP_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}
