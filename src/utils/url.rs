//! URL helpers for provider endpoints

use url::Url;

use crate::errors::{SourceError, SourceResult};

pub struct UrlUtils;

impl UrlUtils {
    /// Prefix `http://` when the caller left the scheme off
    ///
    /// ```rust
    /// use epg_linker::utils::UrlUtils;
    ///
    /// assert_eq!(UrlUtils::normalize_scheme("example.com"), "http://example.com");
    /// assert_eq!(UrlUtils::normalize_scheme("https://example.com"), "https://example.com");
    /// ```
    pub fn normalize_scheme(url: &str) -> String {
        let trimmed = url.trim();

        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        }
    }

    pub fn parse(url: &str) -> SourceResult<Url> {
        Url::parse(&Self::normalize_scheme(url))
            .map_err(|e| SourceError::connection(url, format!("invalid URL: {e}")))
    }

    /// Scheme, host and port of a provider URL, without path or trailing slash
    pub fn base(url: &str) -> SourceResult<String> {
        let parsed = Self::parse(url)?;
        let host = parsed
            .host_str()
            .ok_or_else(|| SourceError::connection(url, "URL has no host"))?;
        Ok(match parsed.port() {
            Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
            None => format!("{}://{}", parsed.scheme(), host),
        })
    }

    /// `{base}/player_api.php?username=..&password=..[&action=..]`
    pub fn build_player_api_url(
        base_url: &str,
        username: &str,
        password: &str,
        action: Option<&str>,
    ) -> SourceResult<String> {
        let mut url = format!(
            "{}/player_api.php?username={}&password={}",
            Self::base(base_url)?,
            urlencoding::encode(username),
            urlencoding::encode(password)
        );
        if let Some(action) = action {
            url.push_str("&action=");
            url.push_str(action);
        }
        Ok(url)
    }

    pub fn build_live_stream_url(
        base_url: &str,
        username: &str,
        password: &str,
        stream_id: &str,
    ) -> SourceResult<String> {
        Ok(format!(
            "{}/live/{}/{}/{}.ts",
            Self::base(base_url)?,
            urlencoding::encode(username),
            urlencoding::encode(password),
            stream_id
        ))
    }

    /// The URL with any password-looking query parameters masked, for logs
    pub fn redact(url: &str) -> String {
        match Url::parse(url) {
            Ok(mut parsed) => {
                let pairs: Vec<(String, String)> = parsed
                    .query_pairs()
                    .map(|(k, v)| {
                        let masked = matches!(k.as_ref(), "password" | "pass" | "pwd");
                        (k.into_owned(), if masked { "***".to_string() } else { v.into_owned() })
                    })
                    .collect();
                if !pairs.is_empty() {
                    parsed.query_pairs_mut().clear().extend_pairs(pairs);
                }
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                }
                parsed.to_string()
            }
            Err(_) => url.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_strips_path() {
        assert_eq!(
            UrlUtils::base("http://provider.example:8080/get.php?x=1").unwrap(),
            "http://provider.example:8080"
        );
        assert_eq!(UrlUtils::base("provider.example/").unwrap(), "http://provider.example");
    }

    #[test]
    fn test_player_api_url() {
        let url = UrlUtils::build_player_api_url(
            "http://provider.example/",
            "alice",
            "p&ss",
            Some("get_live_streams"),
        )
        .unwrap();
        assert_eq!(
            url,
            "http://provider.example/player_api.php?username=alice&password=p%26ss&action=get_live_streams"
        );
    }

    #[test]
    fn test_live_stream_url() {
        let url = UrlUtils::build_live_stream_url("http://provider.example:80", "u", "p", "42").unwrap();
        assert_eq!(url, "http://provider.example/live/u/p/42.ts");
    }

    #[test]
    fn test_redact_masks_password() {
        let redacted = UrlUtils::redact("http://p.example/get.php?username=a&password=secret");
        assert!(!redacted.contains("secret"));
        assert!(redacted.contains("username=a"));
    }
}
