//! Session-URL resolution.
//!
//! The page is served from `<origin>/<prefix>/index.html` and carries a
//! session token in its query string. The socket endpoint lives one level up
//! at `<origin>/<token>`, reached over `wss` when the page itself was loaded
//! securely and `ws` otherwise.

use core::fmt;

use url::Url;

/// Errors from [`session_socket_url`].
#[derive(Debug)]
pub enum AddrError {
    Parse(url::ParseError),
    /// The page URL's scheme cannot be mapped to a WebSocket scheme.
    Scheme(String),
}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "invalid URL: {e}"),
            Self::Scheme(scheme) => write!(f, "cannot derive socket scheme from {scheme:?}"),
        }
    }
}

impl std::error::Error for AddrError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<url::ParseError> for AddrError {
    fn from(e: url::ParseError) -> Self {
        Self::Parse(e)
    }
}

/// Resolve a session token against the page's own location.
///
/// The token is joined as the relative reference `../<token>`, and the scheme
/// follows the page's: `https` becomes `wss`, anything else becomes `ws`.
pub fn session_socket_url(page_url: &str, token: &str) -> Result<Url, AddrError> {
    let page = Url::parse(page_url)?;
    let mut socket = page.join(&format!("../{token}"))?;

    let scheme = if page.scheme() == "https" { "wss" } else { "ws" };
    socket
        .set_scheme(scheme)
        .map_err(|()| AddrError::Scheme(page.scheme().to_string()))?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_page_yields_wss() {
        let url = session_socket_url(
            "https://trace.example.com/recorder/index.html?ws=abc-123",
            "abc-123",
        )
        .unwrap();
        assert_eq!(url.as_str(), "wss://trace.example.com/abc-123");
    }

    #[test]
    fn insecure_page_yields_ws() {
        let url = session_socket_url("http://127.0.0.1:8080/recorder/index.html", "guid").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/guid");
    }

    #[test]
    fn token_resolves_one_level_up() {
        let url = session_socket_url("http://host/a/b/page.html", "tok").unwrap();
        assert_eq!(url.path(), "/a/tok");
    }

    #[test]
    fn query_string_is_not_carried_over() {
        let url = session_socket_url("http://host/ui/index.html?ws=tok&x=1", "tok").unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn relative_page_url_is_rejected() {
        assert!(matches!(
            session_socket_url("recorder/index.html", "tok"),
            Err(AddrError::Parse(_))
        ));
    }
}
