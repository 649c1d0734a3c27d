//! Request authentication against the JupyterHub identity service.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use kbatch_core::namespace::namespace_for_username;
use reqwest::{StatusCode, header::AUTHORIZATION};
use serde::Deserialize;
use snafu::{ResultExt, Snafu, ensure};
use url::Url;

/// How long a successful token lookup may be served from the cache.
pub const TOKEN_CACHE_MAX_AGE: Duration = Duration::from_secs(60);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing or malformed authorization credentials"))]
    MissingCredentials,

    #[snafu(display("the identity service does not recognize the token"))]
    InvalidToken,

    #[snafu(display("token lacks the required scope {scope:?}"))]
    MissingScope { scope: String },

    #[snafu(display("identity service lookup failed"))]
    Hub { source: reqwest::Error },

    #[snafu(display("identity service returned status {status}"))]
    HubStatus { status: u16 },
}

/// An authenticated caller. Lives for the duration of one request and is
/// never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub groups: Vec<String>,
    /// The caller's own short-lived token, forwarded into the job
    /// environment as `JUPYTERHUB_API_TOKEN`.
    pub api_token: Option<String>,
}

impl User {
    /// The namespace all of this user's resources live in.
    pub fn namespace(&self) -> String {
        namespace_for_username(&self.name)
    }
}

/// Turns a bearer token into a [`User`], or refuses. Object-safe so the
/// HTTP layer can be exercised against a stub.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<User>;
}

/// Pulls the token out of an `Authorization` header value. Both the
/// `Bearer` and the `Token` scheme are accepted, case-insensitively.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    let token = token.trim();
    let scheme_matches =
        scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("token");
    (scheme_matches && !token.is_empty()).then_some(token)
}

/// True when `required` is present in `scopes`, either verbatim or as a
/// `scope!filter` refinement.
pub fn has_scope(scopes: &[String], required: &str) -> bool {
    scopes.iter().any(|scope| {
        scope == required
            || scope
                .strip_prefix(required)
                .is_some_and(|rest| rest.starts_with('!'))
    })
}

/// The user model the Hub returns for a token lookup.
#[derive(Clone, Debug, Deserialize)]
struct HubUser {
    name: String,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    scopes: Vec<String>,
}

struct CacheEntry {
    expires_at: Instant,
    user: HubUser,
}

/// [`Authenticator`] backed by the JupyterHub Hub API.
///
/// Lookups hit `GET {api_url}/authorizations/token/{token}` authenticated
/// with the proxy's own service token, and successful answers are cached for
/// [`TOKEN_CACHE_MAX_AGE`] per token behind one short-lived lock.
pub struct HubAuthenticator {
    http: reqwest::Client,
    api_url: Url,
    api_token: String,
    required_scope: String,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl HubAuthenticator {
    pub fn new(api_url: Url, api_token: String, required_scope: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url,
            api_token,
            required_scope,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, token: &str) -> Option<HubUser> {
        let Ok(mut cache) = self.cache.lock() else {
            return None;
        };
        match cache.get(token) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.user.clone()),
            Some(_) => {
                cache.remove(token);
                None
            }
            None => None,
        }
    }

    fn remember(&self, token: &str, user: &HubUser) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                token.to_owned(),
                CacheEntry {
                    expires_at: Instant::now() + TOKEN_CACHE_MAX_AGE,
                    user: user.clone(),
                },
            );
        }
    }

    async fn lookup(&self, token: &str) -> Result<HubUser> {
        if let Some(user) = self.cached(token) {
            return Ok(user);
        }

        let url = format!(
            "{}/authorizations/token/{token}",
            self.api_url.as_str().trim_end_matches('/'),
        );
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, format!("token {}", self.api_token))
            .send()
            .await
            .context(HubSnafu)?;
        match response.status() {
            StatusCode::OK => {
                let user: HubUser = response.json().await.context(HubSnafu)?;
                self.remember(token, &user);
                Ok(user)
            }
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Err(Error::InvalidToken),
            status => Err(Error::HubStatus {
                status: status.as_u16(),
            }),
        }
    }
}

#[async_trait]
impl Authenticator for HubAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<User> {
        let hub_user = self.lookup(token).await?;
        ensure!(
            has_scope(&hub_user.scopes, &self.required_scope),
            MissingScopeSnafu {
                scope: self.required_scope.clone(),
            }
        );
        Ok(User {
            name: hub_user.name,
            groups: hub_user.groups,
            api_token: Some(token.to_owned()),
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("Bearer abc", Some("abc"))]
    #[case("bearer abc", Some("abc"))]
    #[case("Token abc", Some("abc"))]
    #[case("token abc", Some("abc"))]
    #[case("TOKEN abc", Some("abc"))]
    #[case("Basic abc", None)]
    #[case("Bearer ", None)]
    #[case("abc", None)]
    #[case("", None)]
    fn parses_authorization_headers(#[case] header: &str, #[case] expected: Option<&str>) {
        assert_eq!(bearer_token(header), expected);
    }

    #[rstest]
    #[case(&["access:services"], true)]
    #[case(&["access:services!service=kbatch"], true)]
    #[case(&["read:users", "access:services"], true)]
    #[case(&["access:servers!user=testuser2"], false)]
    #[case(&["access:servicesextra"], false)]
    #[case(&[], false)]
    fn checks_scopes(#[case] scopes: &[&str], #[case] expected: bool) {
        let scopes: Vec<String> = scopes.iter().map(|scope| (*scope).to_owned()).collect();
        assert_eq!(has_scope(&scopes, "access:services"), expected);
    }

    #[test]
    fn namespace_follows_the_identity_mapping() {
        let user = User {
            name: "Alice@Example.COM".to_owned(),
            groups: vec![],
            api_token: None,
        };
        assert_eq!(user.namespace(), "kbatch-alice-example-com--a404476");
    }

    #[test]
    fn expired_cache_entries_are_dropped() {
        let authenticator = HubAuthenticator::new(
            Url::parse("http://hub.invalid/hub/api").expect("static URL"),
            "service-token".to_owned(),
            "access:services".to_owned(),
        );
        let user = HubUser {
            name: "alice".to_owned(),
            groups: vec![],
            scopes: vec!["access:services".to_owned()],
        };

        authenticator.remember("abc", &user);
        assert!(authenticator.cached("abc").is_some());

        if let Ok(mut cache) = authenticator.cache.lock() {
            if let Some(entry) = cache.get_mut("abc") {
                entry.expires_at = Instant::now() - Duration::from_secs(1);
            }
        }
        assert!(authenticator.cached("abc").is_none());
        assert!(authenticator.cached("abc").is_none(), "stays evicted");
    }
}
