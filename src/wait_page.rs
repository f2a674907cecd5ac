//! The "please wait" page served while a tenant's workload starts

use crate::pool::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::Path;

const BUILTIN_TEMPLATE: &str = include_str!("../templates/wait_page.html");

/// Rendered with `{{identity}}` and `{{reload}}` substituted
#[derive(Debug, Clone)]
pub struct WaitPage {
    template: String,
    reload_secs: u64,
}

impl Default for WaitPage {
    fn default() -> Self {
        Self::new(5)
    }
}

impl WaitPage {
    pub fn new(reload_secs: u64) -> Self {
        Self {
            template: BUILTIN_TEMPLATE.to_string(),
            reload_secs,
        }
    }

    /// Use a template file instead of the built-in page
    pub fn from_file(path: impl AsRef<Path>, reload_secs: u64) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let template = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read wait page template '{}': {}", path.display(), e)
        })?;
        Ok(Self {
            template,
            reload_secs,
        })
    }

    pub fn render(&self, identity: &str) -> String {
        self.template
            .replace("{{identity}}", &escape_html(identity))
            .replace("{{reload}}", &self.reload_secs.to_string())
    }

    pub fn response(&self, identity: &str) -> Response<ProxyBody> {
        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
            .header(hyper::header::CACHE_CONTROL, "no-store")
            .header(hyper::header::RETRY_AFTER, self.reload_secs.to_string())
            .body(
                Full::new(Bytes::from(self.render(identity)))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .expect("valid response with static headers")
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_placeholders() {
        let page = WaitPage::new(7);
        let html = page.render("alice");
        assert!(html.contains("~alice"));
        assert!(html.contains(r#"content="7""#));
        assert!(!html.contains("{{"));
    }

    #[test]
    fn test_render_escapes_identity() {
        let page = WaitPage::new(5);
        let html = page.render("<b>");
        assert!(html.contains("&lt;b&gt;"));
        assert!(!html.contains("~<b>"));
    }

    #[test]
    fn test_response_headers() {
        let response = WaitPage::new(3).response("alice");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("retry-after").unwrap(), "3");
        assert_eq!(response.headers().get("cache-control").unwrap(), "no-store");
    }

    #[test]
    fn test_custom_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wait.html");
        std::fs::write(&path, "wait for {{identity}} ({{reload}}s)").unwrap();

        let page = WaitPage::from_file(&path, 2).unwrap();
        assert_eq!(page.render("bob"), "wait for bob (2s)");
        assert!(WaitPage::from_file(dir.path().join("nope.html"), 2).is_err());
    }
}
