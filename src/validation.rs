// src/validation.rs

use reqwest::Url;
use thiserror::Error;

/// Fallback file name when the URL path ends with a slash.
const DEFAULT_FILE_NAME: &str = "download";

/// Reasons a URL is refused before a download is created.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("only http:// URLs are supported: {0}")]
    NotHttp(String),
    #[error("malformed url: {0}")]
    Malformed(#[from] url::ParseError),
    #[error("url does not name a file: {0}")]
    MissingFile(String),
}

/// Checks a user supplied download URL.
///
/// The scheme must be plain `http://` (matched case-insensitively) and the
/// path plus query must be at least two characters long, so a bare host
/// root such as `http://example.com/` is refused.
pub fn validate_url(input: &str) -> Result<Url, UrlError> {
    let trimmed = input.trim();
    let is_http = trimmed
        .get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("http://"));
    if !is_http {
        return Err(UrlError::NotHttp(trimmed.to_string()));
    }

    let url = Url::parse(trimmed)?;
    let file_len = url.path().len() + url.query().map_or(0, |q| q.len() + 1);
    if file_len < 2 {
        return Err(UrlError::MissingFile(trimmed.to_string()));
    }
    Ok(url)
}

/// Returns the last path segment of `url`, used as the local file name.
pub fn file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_FILE_NAME)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_file_urls() {
        let url = validate_url("http://example.com/files/archive.zip").unwrap();
        assert_eq!(url.path(), "/files/archive.zip");
        assert!(validate_url("HTTP://Example.com/a").is_ok());
        assert!(validate_url("http://example.com/?id=7").is_ok());
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(validate_url("ftp://x"), Err(UrlError::NotHttp(_))));
        assert!(matches!(
            validate_url("https://example.com/a.bin"),
            Err(UrlError::NotHttp(_))
        ));
        assert!(matches!(validate_url("not a url"), Err(UrlError::NotHttp(_))));
    }

    #[test]
    fn rejects_host_root() {
        assert!(matches!(validate_url("http://host"), Err(UrlError::MissingFile(_))));
        assert!(matches!(validate_url("http://host/"), Err(UrlError::MissingFile(_))));
    }

    #[test]
    fn rejects_malformed_syntax() {
        assert!(matches!(validate_url("http://"), Err(UrlError::Malformed(_))));
        assert!(matches!(validate_url("http://exa mple.com/a"), Err(UrlError::Malformed(_))));
    }

    #[test]
    fn file_name_is_last_segment() {
        let url = validate_url("http://example.com/dir/movie.mkv?token=1").unwrap();
        assert_eq!(file_name(&url), "movie.mkv");

        let url = validate_url("http://example.com/dir/").unwrap();
        assert_eq!(file_name(&url), "download");
    }
}
