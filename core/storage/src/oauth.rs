//! OAuth2 authorization and token refresh for Google and Microsoft.

use chrono::{Duration, Utc};
use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    EndpointNotSet, EndpointSet, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};

use storegate_common::{Credential, CredentialSecret, Error, Result, SensitiveString};

/// Redirect URL for the OAuth2 flow (localhost for desktop use).
pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:8080/callback";

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

const MICROSOFT_LOGIN_BASE: &str = "https://login.microsoftonline.com";
const MICROSOFT_SCOPES: &[&str] = &["Files.ReadWrite.All", "offline_access"];

/// Token lifetime assumed when the provider omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Authorization server endpoints and scopes for one identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    /// Extra query parameters for the authorization URL.
    #[serde(default)]
    pub extra_params: Vec<(String, String)>,
}

impl OAuthEndpoints {
    /// Google accounts with full Drive scope and offline access.
    pub fn google() -> Self {
        Self {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            scopes: vec![GOOGLE_DRIVE_SCOPE.to_string()],
            extra_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
        }
    }

    /// Microsoft identity platform for the given tenant ("common" for any account).
    pub fn microsoft(tenant: &str) -> Self {
        Self {
            auth_url: format!("{}/{}/oauth2/v2.0/authorize", MICROSOFT_LOGIN_BASE, tenant),
            token_url: format!("{}/{}/oauth2/v2.0/token", MICROSOFT_LOGIN_BASE, tenant),
            scopes: MICROSOFT_SCOPES.iter().map(|s| s.to_string()).collect(),
            extra_params: Vec::new(),
        }
    }
}

/// Registered OAuth2 application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthAppConfig {
    pub client_id: String,
    /// Absent for public clients.
    #[serde(default)]
    pub client_secret: Option<SensitiveString>,
    #[serde(default = "default_redirect_url")]
    pub redirect_url: String,
}

fn default_redirect_url() -> String {
    DEFAULT_REDIRECT_URL.to_string()
}

/// OAuth2 client for one identity provider.
pub struct OAuthClient {
    client: ConfiguredClient,
    endpoints: OAuthEndpoints,
    http: oauth2::reqwest::Client,
}

impl OAuthClient {
    /// Create a new OAuth client.
    ///
    /// # Errors
    /// - Invalid endpoint or redirect URL
    pub fn new(endpoints: OAuthEndpoints, app: &OAuthAppConfig) -> Result<Self> {
        let mut client = BasicClient::new(ClientId::new(app.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new(endpoints.auth_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(endpoints.token_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(app.redirect_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            );

        if let Some(secret) = &app.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.expose().to_string()));
        }

        // Token endpoints must not be followed through redirects.
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Unknown(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints,
            http,
        })
    }

    /// Generate the authorization URL for the user to visit.
    ///
    /// Returns the URL and a CSRF token that should be verified on callback.
    pub fn authorization_url(&self) -> (String, String) {
        let mut request = self.client.authorize_url(CsrfToken::new_random);
        for scope in &self.endpoints.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        for (key, value) in &self.endpoints.extra_params {
            request = request.add_extra_param(key.clone(), value.clone());
        }
        let (auth_url, csrf_token) = request.url();

        (auth_url.to_string(), csrf_token.secret().clone())
    }

    /// Exchange an authorization code for a credential.
    ///
    /// # Errors
    /// - `Authentication` if the code was rejected or no refresh token was issued
    pub async fn exchange_code(&self, code: &str) -> Result<Credential> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::Authentication(format!("Token exchange failed: {}", e)))?;

        let refresh_token = token.refresh_token().ok_or_else(|| {
            Error::Authentication(
                "No refresh token received; offline access must be granted".to_string(),
            )
        })?;

        Ok(to_credential(
            token.access_token().secret(),
            Some(refresh_token.secret()),
            token.expires_in(),
        ))
    }

    /// Refresh an access token.
    ///
    /// The refresh token is kept when the provider does not rotate it.
    ///
    /// # Errors
    /// - `Authentication` if the refresh token is invalid or revoked
    pub async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        let token = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::Authentication(format!("Token refresh failed: {}", e)))?;

        let rotated = token.refresh_token().map(|t| t.secret().as_str());
        Ok(to_credential(
            token.access_token().secret(),
            Some(rotated.unwrap_or(refresh_token)),
            token.expires_in(),
        ))
    }
}

fn to_credential(
    access_token: &str,
    refresh_token: Option<&str>,
    expires_in: Option<std::time::Duration>,
) -> Credential {
    let lifetime = expires_in
        .and_then(|d| Duration::from_std(d).ok())
        .unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));

    Credential::new(
        CredentialSecret::OAuth {
            access_token: SensitiveString::new(access_token),
            refresh_token: refresh_token.map(SensitiveString::new),
        },
        Some(Utc::now() + lifetime),
    )
}
