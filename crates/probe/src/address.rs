//! Target address parsing and scheme handling.
//!
//! Addresses are plain [`Url`]s. The scheme may carry a variant introduced by
//! `-` (a mode, such as the HTTP method in `http-head`) or `+` (a
//! sub-protocol, such as the transport in `source+http`).

use std::path::Path;

use url::Url;

use crate::error::ProbeError;

/// Separator between a base scheme and its variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// `-`: selects a mode of the base protocol
    Mode,
    /// `+`: selects the sub-protocol used underneath
    SubProtocol,
}

impl Separator {
    pub fn as_char(&self) -> char {
        match self {
            Separator::Mode => '-',
            Separator::SubProtocol => '+',
        }
    }
}

/// A scheme split at its first `-` or `+`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheme<'a> {
    pub base: &'a str,
    pub separator: Option<Separator>,
    pub variant: &'a str,
}

impl<'a> Scheme<'a> {
    pub fn parse(scheme: &'a str) -> Self {
        match scheme.find(['-', '+']) {
            Some(pos) => {
                let separator = if scheme.as_bytes()[pos] == b'-' {
                    Separator::Mode
                } else {
                    Separator::SubProtocol
                };
                Self {
                    base: &scheme[..pos],
                    separator: Some(separator),
                    variant: &scheme[pos + 1..],
                }
            }
            None => Self { base: scheme, separator: None, variant: "" },
        }
    }

    /// Variant text when introduced by `sep`; `Ok("")` when there is none.
    pub fn variant_for(&self, sep: Separator, whole: &str) -> Result<&'a str, ProbeError> {
        match self.separator {
            None => Ok(""),
            Some(s) if s == sep => Ok(self.variant),
            Some(_) => Err(ProbeError::UnsupportedScheme(whole.to_string())),
        }
    }

    /// Fail unless the scheme is exactly its base.
    pub fn require_plain(&self, whole: &str) -> Result<(), ProbeError> {
        if self.separator.is_some() {
            return Err(ProbeError::UnsupportedScheme(whole.to_string()));
        }
        Ok(())
    }
}

/// Executable names a plugin for `scheme` may be installed under, most
/// specific first: `foo-bar+baz` yields `foo-bar+baz-probe`, `foo-bar-probe`
/// and `foo-probe`.
pub fn plugin_candidates(scheme: &str, suffix: &str) -> Vec<String> {
    let mut names = vec![format!("{scheme}-{suffix}")];
    for (pos, _) in scheme.char_indices().rev().filter(|(_, c)| *c == '-' || *c == '+') {
        if pos > 0 {
            names.push(format!("{}-{suffix}", &scheme[..pos]));
        }
    }
    names
}

/// Parse a raw address string.
///
/// `file:` addresses with a relative path are resolved against the current
/// directory since the URL grammar would silently make them absolute.
pub fn parse_target(raw: &str) -> Result<Url, ProbeError> {
    let raw = raw.trim();

    let Some((scheme, body)) = raw.split_once(':') else {
        return Err(ProbeError::MissingScheme(raw.to_string()));
    };
    if scheme.is_empty() {
        return Err(ProbeError::MissingScheme(raw.to_string()));
    }

    if scheme.eq_ignore_ascii_case("file") && !body.is_empty() && !body.starts_with('/') {
        let (path, rest) = split_path(body);
        let absolute = std::env::current_dir().map_err(|_| ProbeError::MissingFile)?.join(path);
        let mut url = Url::from_file_path(&absolute).map_err(|_| ProbeError::MissingFile)?;
        apply_query_and_fragment(&mut url, rest);
        return Ok(url);
    }

    Url::parse(raw).map_err(|e| match e {
        url::ParseError::RelativeUrlWithoutBase => ProbeError::MissingScheme(raw.to_string()),
        other => ProbeError::InvalidUrl(other),
    })
}

fn split_path(body: &str) -> (&Path, &str) {
    let end = body.find(['?', '#']).unwrap_or(body.len());
    (Path::new(&body[..end]), &body[end..])
}

fn apply_query_and_fragment(url: &mut Url, rest: &str) {
    let (query, fragment) = match rest.split_once('#') {
        Some((q, f)) => (q, Some(f)),
        None => (rest, None),
    };
    if let Some(q) = query.strip_prefix('?') {
        url.set_query(Some(q));
    }
    url.set_fragment(fragment);
}

/// Host of a hierarchical URL, without IPv6 brackets.
pub(crate) fn host_of(url: &Url) -> Option<String> {
    match url.host()? {
        url::Host::Domain(d) if d.is_empty() => None,
        url::Host::Domain(d) => Some(d.to_string()),
        url::Host::Ipv4(ip) => Some(ip.to_string()),
        url::Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

/// First value of a query parameter.
pub(crate) fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs().find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
}

/// Rebuild `url` with a different scheme, keeping everything else verbatim.
pub(crate) fn replace_scheme(url: &Url, scheme: &str) -> Result<Url, ProbeError> {
    let rest = &url.as_str()[url.scheme().len()..];
    Ok(Url::parse(&format!("{scheme}{rest}"))?)
}

/// Decode `%XX` escapes, leaving malformed escapes untouched.
pub(crate) fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Address under which alert delivery outcomes are reported.
///
/// Already prefixed addresses and the internal `ayd:` scheme are kept as is
/// so alert failures never look like ordinary health-check results.
pub fn alert_target(target: &Url) -> Url {
    match target.scheme() {
        "alert" | "ayd" => target.clone(),
        _ => Url::parse(&format!("alert:{target}")).unwrap_or_else(|_| target.clone()),
    }
}
