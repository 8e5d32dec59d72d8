//! Anti-forgery token sources.
//!
//! The server issues the CSRF token; the queue only reads it at replay time.
//! Hosts pick a source: the OS credential store (via the `keyring` crate,
//! DPAPI on Windows, Keychain on macOS, Secret Service on Linux), a cookie
//! jar string, or a fixed value.

use cookie::Cookie;
use keyring::Entry;
use std::sync::RwLock;
use tracing::warn;

const SERVICE_NAME: &str = "pharmapp-sync";

/// Default cookie and credential name for the anti-forgery token.
pub const CSRF_COOKIE_NAME: &str = "csrftoken";

/// Supplies the anti-forgery token for outgoing replays.
pub trait TokenSource: Send + Sync {
    fn csrf_token(&self) -> Option<String>;
}

/// No token; requests go out without the header.
pub struct NoToken;

impl TokenSource for NoToken {
    fn csrf_token(&self) -> Option<String> {
        None
    }
}

/// A fixed token.
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn csrf_token(&self) -> Option<String> {
        let token = self.0.trim();
        (!token.is_empty()).then(|| token.to_string())
    }
}

// ---------------------------------------------------------------------------
// Cookie jar
// ---------------------------------------------------------------------------

/// Reads the token out of a `Cookie`-style header string that the host
/// keeps up to date as the session rotates it.
pub struct CookieJarToken {
    cookie_name: String,
    jar: RwLock<String>,
}

impl CookieJarToken {
    pub fn new(cookie_name: &str) -> Self {
        Self {
            cookie_name: cookie_name.to_string(),
            jar: RwLock::new(String::new()),
        }
    }

    /// Replace the cookie string, e.g. after a login or token rotation.
    pub fn set_cookies(&self, header: &str) {
        match self.jar.write() {
            Ok(mut guard) => *guard = header.to_string(),
            Err(e) => warn!(error = %e, "cookie jar lock poisoned; keeping previous cookies"),
        }
    }
}

impl TokenSource for CookieJarToken {
    fn csrf_token(&self) -> Option<String> {
        let jar = self.jar.read().ok()?;
        token_from_cookie_header(&jar, &self.cookie_name)
    }
}

/// Find `name` in a `k1=v1; k2=v2` cookie string and URL-decode its value.
/// Empty values count as absent; unparseable pairs are skipped.
pub fn token_from_cookie_header(header: &str, name: &str) -> Option<String> {
    Cookie::split_parse_encoded(header)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
        .filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// OS keyring
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Token kept in the OS credential store under `key`.
pub struct KeyringToken {
    key: String,
}

impl KeyringToken {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
        }
    }
}

impl TokenSource for KeyringToken {
    fn csrf_token(&self) -> Option<String> {
        get_credential(&self.key)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_lookup_finds_named_cookie() {
        let header = "sessionid=abc; csrftoken=tok123; theme=dark";
        assert_eq!(
            token_from_cookie_header(header, "csrftoken").as_deref(),
            Some("tok123")
        );
        assert_eq!(token_from_cookie_header(header, "missing"), None);
    }

    #[test]
    fn test_cookie_lookup_requires_exact_name() {
        let header = "xcsrftoken=nope; csrftoken2=nope";
        assert_eq!(token_from_cookie_header(header, "csrftoken"), None);
    }

    #[test]
    fn test_cookie_value_is_url_decoded() {
        let header = "csrftoken=a%2Bb%3Dc; other=1";
        assert_eq!(
            token_from_cookie_header(header, "csrftoken").as_deref(),
            Some("a+b=c")
        );
    }

    #[test]
    fn test_escape_at_end_of_value_is_decoded() {
        assert_eq!(
            token_from_cookie_header("csrftoken=%41", "csrftoken").as_deref(),
            Some("A")
        );
        assert_eq!(
            token_from_cookie_header("a=1; csrftoken=tok%3D", "csrftoken").as_deref(),
            Some("tok=")
        );
    }

    #[test]
    fn test_malformed_escape_is_kept_verbatim() {
        assert_eq!(
            token_from_cookie_header("csrftoken=50%", "csrftoken").as_deref(),
            Some("50%")
        );
        assert_eq!(
            token_from_cookie_header("csrftoken=%zz1", "csrftoken").as_deref(),
            Some("%zz1")
        );
    }

    #[test]
    fn test_pairs_without_equals_are_skipped() {
        assert_eq!(
            token_from_cookie_header("garbage; csrftoken=ok", "csrftoken").as_deref(),
            Some("ok")
        );
    }

    #[test]
    fn test_empty_cookie_value_is_absent() {
        assert_eq!(token_from_cookie_header("csrftoken=; a=b", "csrftoken"), None);
        assert_eq!(token_from_cookie_header("", "csrftoken"), None);
    }

    #[test]
    fn test_cookie_jar_tracks_rotation() {
        let jar = CookieJarToken::new(CSRF_COOKIE_NAME);
        assert_eq!(jar.csrf_token(), None);
        jar.set_cookies("csrftoken=first");
        assert_eq!(jar.csrf_token().as_deref(), Some("first"));
        jar.set_cookies("csrftoken=second; sessionid=s");
        assert_eq!(jar.csrf_token().as_deref(), Some("second"));
    }

    #[test]
    fn test_static_token_trims_and_treats_blank_as_absent() {
        assert_eq!(StaticToken(" t ".into()).csrf_token().as_deref(), Some("t"));
        assert_eq!(StaticToken("  ".into()).csrf_token(), None);
        assert_eq!(NoToken.csrf_token(), None);
    }
}
