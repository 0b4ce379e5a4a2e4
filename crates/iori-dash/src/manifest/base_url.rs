use url::Url;

use crate::error::DashResult;

fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://")
        || s.starts_with("https://")
        || s.starts_with("file://")
        || s.starts_with("ftp://")
}

/// Resolves `new` against `current`, carrying the query string of `current`
/// when `new` has none.
///
/// `merge_baseurls(https://example.com/manifest.mpd?auth=secret, /video42.mp4)`
/// gives `https://example.com/video42.mp4?auth=secret`.
pub(crate) fn merge_baseurls(current: &Url, new: &str) -> DashResult<Url> {
    if is_absolute_url(new) {
        return Ok(Url::parse(new)?);
    }

    let mut merged = current.join(new)?;
    if merged.query().is_none() {
        merged.set_query(current.query());
    }
    Ok(merged)
}

/// Applies a chain of optional `BaseURL` values, outermost first.
pub(crate) fn resolve_base<'a, I>(root: &Url, levels: I) -> DashResult<Url>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    levels
        .into_iter()
        .flatten()
        .try_fold(root.clone(), |base, next| merge_baseurls(&base, next))
}
