// 会话浏览：/browse/<id>/... 前缀编码与响应改写。
//
// HTML 改写基于正则替换而非 DOM 解析：内联脚本或运行时拼接的 URL 不会被改写。
use crate::lan_url::LanTarget;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use regex::bytes::{Captures, Regex};
use std::sync::OnceLock;
use url::Url;

pub const BROWSE_ROOT: &str = "/browse";

pub fn encode_origin(target: &LanTarget) -> String {
    URL_SAFE_NO_PAD.encode(target.origin())
}

/// 解码后的字符串仍需重新走一遍校验，编码本身不代表可信。
pub fn decode_origin(id: &str) -> Option<String> {
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(id)
        .or_else(|_| URL_SAFE.decode(id))
        .ok()?;
    String::from_utf8(bytes).ok()
}

pub fn browse_prefix(id: &str) -> String {
    format!("{BROWSE_ROOT}/{id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowsePath<'a> {
    pub id: &'a str,
    /// `None` 表示请求的是 `/browse/<id>`（缺少结尾斜杠）。
    pub suffix: Option<&'a str>,
}

pub fn split_browse_path(path: &str) -> Option<BrowsePath<'_>> {
    let rest = path.strip_prefix(BROWSE_ROOT)?.strip_prefix('/')?;
    let (id, suffix) = match rest.find('/') {
        Some(index) => (&rest[..index], Some(&rest[index..])),
        None => (rest, None),
    };
    if id.is_empty() {
        return None;
    }
    Some(BrowsePath { id, suffix })
}

/// 根相对路径（单个 `/` 开头）才需要加前缀；协议相对、绝对与已代理的地址保持原样。
fn needs_prefix(value: &[u8]) -> bool {
    value.starts_with(b"/")
        && !value.starts_with(b"//")
        && value != BROWSE_ROOT.as_bytes()
        && !value.starts_with(b"/browse/")
}

// 按字节匹配（`-u`），非 UTF-8 页面的原始编码原样保留。
fn attribute_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i-u)(\b(?:href|src|action)\s*=\s*["']?)(/[^"'\s>]*)"#).ok()
    })
    .as_ref()
}

fn srcset_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i-u)(\bsrcset\s*=\s*)(?:"([^"]*)"|'([^']*)')"#).ok())
        .as_ref()
}

fn css_url_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i-u)(url\(\s*["']?)(/[^)"'\s]*)"#).ok())
        .as_ref()
}

/// 对原始 HTML 字节做改写，不做字符集转换。
pub fn rewrite_html(html: &[u8], prefix: &str) -> Vec<u8> {
    let prefix = prefix.as_bytes();
    let mut output = html.to_vec();
    if let Some(re) = attribute_regex() {
        output = re
            .replace_all(&output, |caps: &Captures| prefixed(caps, prefix))
            .into_owned();
    }
    if let Some(re) = srcset_regex() {
        output = re
            .replace_all(&output, |caps: &Captures| {
                let (quote, value) = match caps.get(2) {
                    Some(value) => (b'"', value.as_bytes()),
                    None => (b'\'', caps.get(3).map(|m| m.as_bytes()).unwrap_or_default()),
                };
                let mut replaced = caps[1].to_vec();
                replaced.push(quote);
                replaced.extend_from_slice(&rewrite_srcset(value, prefix));
                replaced.push(quote);
                replaced
            })
            .into_owned();
    }
    if let Some(re) = css_url_regex() {
        output = re
            .replace_all(&output, |caps: &Captures| prefixed(caps, prefix))
            .into_owned();
    }
    output
}

fn prefixed(caps: &Captures, prefix: &[u8]) -> Vec<u8> {
    let value = &caps[2];
    if needs_prefix(value) {
        [&caps[1], prefix, value].concat()
    } else {
        caps[0].to_vec()
    }
}

fn rewrite_srcset(value: &[u8], prefix: &[u8]) -> Vec<u8> {
    value
        .split(|byte| *byte == b',')
        .map(|candidate| {
            let leading = candidate
                .iter()
                .take_while(|byte| byte.is_ascii_whitespace())
                .count();
            let (space, rest) = candidate.split_at(leading);
            if needs_prefix(rest) {
                [space, prefix, rest].concat()
            } else {
                candidate.to_vec()
            }
        })
        .collect::<Vec<_>>()
        .join(&b","[..])
}

/// 同源跳转改写回代理前缀，跨源跳转原样透传。
pub fn rewrite_location(location: &str, upstream: &Url, prefix: &str) -> String {
    let Ok(resolved) = upstream.join(location) else {
        return location.to_string();
    };
    let same_authority = resolved.scheme() == upstream.scheme()
        && resolved.host() == upstream.host()
        && resolved.port_or_known_default() == upstream.port_or_known_default();
    if !same_authority {
        return location.to_string();
    }
    let mut rewritten = format!("{prefix}{}", resolved.path());
    if let Some(query) = resolved.query() {
        rewritten.push('?');
        rewritten.push_str(query);
    }
    if let Some(fragment) = resolved.fragment() {
        rewritten.push('#');
        rewritten.push_str(fragment);
    }
    rewritten
}

pub fn is_html(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("text/html")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanPolicy;
    use crate::lan_url::tests::StaticResolver;
    use crate::lan_url::LanUrlValidator;
    use std::sync::Arc;

    async fn validated(raw: &str) -> LanTarget {
        LanUrlValidator::new(LanPolicy::browse(), ".local", Arc::new(StaticResolver::default()))
            .validate(raw)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn origin_id_round_trips_without_path() {
        let target = validated("http://192.168.1.50/some/page?q=1").await;
        let id = encode_origin(&target);
        assert!(!id.contains('='));
        assert!(!id.contains('/'));
        assert_eq!(decode_origin(&id).as_deref(), Some("http://192.168.1.50"));

        let with_port = validated("192.168.1.50:8080").await;
        assert_eq!(
            decode_origin(&encode_origin(&with_port)).as_deref(),
            Some("http://192.168.1.50:8080")
        );
        assert_eq!(decode_origin("***"), None);
        assert_eq!(decode_origin(""), None);
    }

    fn rewrite(html: &str, prefix: &str) -> String {
        String::from_utf8(rewrite_html(html.as_bytes(), prefix)).expect("utf8 output")
    }

    #[test]
    fn keeps_non_utf8_bytes_untouched() {
        let page = b"<p>caf\xe9</p><a href=\"/men\xfa\">m</a>";
        assert_eq!(
            rewrite_html(page, "/browse/aWQ"),
            b"<p>caf\xe9</p><a href=\"/browse/aWQ/men\xfa\">m</a>".to_vec()
        );
    }

    #[test]
    fn splits_browse_paths() {
        assert_eq!(
            split_browse_path("/browse/abc/x/y.png"),
            Some(BrowsePath {
                id: "abc",
                suffix: Some("/x/y.png")
            })
        );
        assert_eq!(
            split_browse_path("/browse/abc/"),
            Some(BrowsePath {
                id: "abc",
                suffix: Some("/")
            })
        );
        assert_eq!(
            split_browse_path("/browse/abc"),
            Some(BrowsePath {
                id: "abc",
                suffix: None
            })
        );
        assert_eq!(split_browse_path("/browse/"), None);
        assert_eq!(split_browse_path("/browsex/abc"), None);
        assert_eq!(split_browse_path("/scan"), None);
    }

    #[test]
    fn rewrites_root_relative_attributes() {
        let prefix = "/browse/aWQ";
        assert_eq!(
            rewrite(r#"<img src="/x.png">"#, prefix),
            r#"<img src="/browse/aWQ/x.png">"#
        );
        assert_eq!(
            rewrite(r#"<a HREF='/status'>s</a><form action=/save method=post>"#, prefix),
            r#"<a HREF='/browse/aWQ/status'>s</a><form action=/browse/aWQ/save method=post>"#
        );
        assert_eq!(
            rewrite(r#"<link href="/">"#, prefix),
            r#"<link href="/browse/aWQ/">"#
        );
    }

    #[test]
    fn leaves_absolute_protocol_relative_and_proxied_urls() {
        let prefix = "/browse/aWQ";
        for html in [
            r#"<script src="//cdn.example.com/a.js"></script>"#,
            r#"<a href="http://192.168.1.50/x">x</a>"#,
            r#"<a href="relative/page">x</a>"#,
            r#"<a href="/browse/aWQ/already">x</a>"#,
            r##"<a href="#top">x</a>"##,
            r#"<div style="background: url(//cdn.example.com/bg.png)"></div>"#,
        ] {
            assert_eq!(rewrite(html, prefix), html);
        }
    }

    #[test]
    fn rewrites_srcset_and_css_urls() {
        let prefix = "/browse/aWQ";
        assert_eq!(
            rewrite(r#"<img srcset="/a.png 1x, /b.png 2x, //cdn/c.png 3x">"#, prefix),
            r#"<img srcset="/browse/aWQ/a.png 1x, /browse/aWQ/b.png 2x, //cdn/c.png 3x">"#
        );
        assert_eq!(
            rewrite(r#"<style>body { background: url('/bg.png') } .a { background: url(/i.svg) }</style>"#, prefix),
            r#"<style>body { background: url('/browse/aWQ/bg.png') } .a { background: url(/browse/aWQ/i.svg) }</style>"#
        );
    }

    #[test]
    fn rewrites_same_origin_locations_only() {
        let upstream = Url::parse("http://192.168.1.50/index.html").unwrap();
        let prefix = "/browse/aWQ";
        assert_eq!(
            rewrite_location("/login", &upstream, prefix),
            "/browse/aWQ/login"
        );
        assert_eq!(
            rewrite_location("http://192.168.1.50:80/a?b=1#c", &upstream, prefix),
            "/browse/aWQ/a?b=1#c"
        );
        assert_eq!(
            rewrite_location("next", &upstream, prefix),
            "/browse/aWQ/next"
        );
        assert_eq!(
            rewrite_location("http://other.example/", &upstream, prefix),
            "http://other.example/"
        );
        assert_eq!(
            rewrite_location("http://192.168.1.50:8080/", &upstream, prefix),
            "http://192.168.1.50:8080/"
        );
        assert_eq!(
            rewrite_location("https://192.168.1.50/", &upstream, prefix),
            "https://192.168.1.50/"
        );
    }

    #[test]
    fn detects_html_content_type() {
        assert!(is_html("text/html; charset=utf-8"));
        assert!(is_html("Text/HTML"));
        assert!(!is_html("application/json"));
        assert!(!is_html("text/plain"));
    }
}
