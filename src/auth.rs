use std::sync::Arc;

use reqwest::multipart::Form;
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::join_url;
use crate::credentials::CredentialStore;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{ErrorBody, RefreshResponse};

const REFRESH_PATH: &str = "/auth/refresh";

/// Invoked once stored credentials have been cleared after an unrecoverable
/// auth failure. Stands in for navigating to the login entry point.
pub type SessionExpiredHook = Arc<dyn Fn() + Send + Sync>;

pub fn login_redirect(login_url: impl Into<String>) -> SessionExpiredHook {
    let login_url = login_url.into();
    Arc::new(move || {
        warn!(login_url = %login_url, "session expired; sign in again");
    })
}

pub fn is_auth_challenge(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::UNPROCESSABLE_ENTITY
}

/// Issues requests with the stored bearer token and performs at most one
/// refresh-and-retry cycle when the backend rejects it.
pub struct AuthorizedTransport {
    http: HttpClient,
    base_url: String,
    store: Arc<dyn CredentialStore>,
    on_session_expired: SessionExpiredHook,
}

impl AuthorizedTransport {
    pub fn new(
        base_url: &str,
        store: Arc<dyn CredentialStore>,
        on_session_expired: SessionExpiredHook,
    ) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: crate::config::normalize_base_url(base_url),
            store,
            on_session_expired,
        }
    }

    pub fn with_http_client(mut self, http: HttpClient) -> Self {
        self.http = http;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// `build` is called once per attempt, so bodies that cannot be cloned
    /// (multipart forms) are rebuilt for the retry. The bearer header is
    /// attached here, not by `build`.
    ///
    /// Returns `ClientError::SessionExpired` when neither the stored token
    /// nor a refreshed one is accepted; by then both stored tokens are gone.
    pub async fn send<F>(&self, build: F) -> ClientResult<Response>
    where
        F: Fn(&HttpClient) -> ClientResult<RequestBuilder>,
    {
        let token = self.blocking_store(|store| store.load()).await?.access_token;
        let response = self.dispatch(&build, token.as_deref()).await?;
        if !is_auth_challenge(response.status()) {
            return Ok(response);
        }

        debug!(status = %response.status(), "auth challenge, refreshing access token");
        match self.refresh().await {
            Ok(token) => {
                let retried = self.dispatch(&build, Some(&token)).await?;
                if !is_auth_challenge(retried.status()) {
                    return Ok(retried);
                }
                warn!(status = %retried.status(), "refreshed access token was rejected");
            }
            Err(err) => warn!(error = %err, "access token refresh failed"),
        }

        self.expire_session().await;
        Err(ClientError::SessionExpired)
    }

    /// Exchanges the stored refresh token for a new access token and
    /// persists it. Only a `200` with an `access_token` counts as success.
    pub async fn refresh(&self) -> ClientResult<String> {
        let refresh_token = self
            .blocking_store(|store| store.load())
            .await?
            .refresh_token
            .ok_or(ClientError::MissingRefreshToken)?;

        let response = self
            .http
            .post(self.url(REFRESH_PATH))
            .bearer_auth(&refresh_token)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(error_from_response(response).await);
        }

        let body: RefreshResponse = response.json().await?;
        let access_token = body.access_token.clone();
        self.blocking_store(move |store| store.set_access_token(&access_token))
            .await?;
        info!("access token refreshed");
        Ok(body.access_token)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let url = self.url(path);
        let response = self.send(|http| Ok(http.get(&url))).await?;
        read_json(response).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> ClientResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let response = self.send(|http| Ok(http.post(&url).json(body))).await?;
        read_json(response).await
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> ClientResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let response = self.send(|http| Ok(http.patch(&url).json(body))).await?;
        read_json(response).await
    }

    pub async fn post_empty(&self, path: &str) -> ClientResult<()> {
        let url = self.url(path);
        let response = self.send(|http| Ok(http.post(&url))).await?;
        ensure_success(response).await
    }

    pub async fn delete(&self, path: &str) -> ClientResult<()> {
        let url = self.url(path);
        let response = self.send(|http| Ok(http.delete(&url))).await?;
        ensure_success(response).await
    }

    pub async fn post_multipart_json<F, T>(&self, path: &str, form: F) -> ClientResult<T>
    where
        F: Fn() -> ClientResult<Form>,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let response = self
            .send(|http| Ok(http.post(&url).multipart(form()?)))
            .await?;
        read_json(response).await
    }

    async fn dispatch<F>(&self, build: &F, token: Option<&str>) -> ClientResult<Response>
    where
        F: Fn(&HttpClient) -> ClientResult<RequestBuilder>,
    {
        let mut request = build(&self.http)?;
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    /// Runs a credential store call on the blocking pool; file-backed
    /// stores do synchronous IO.
    async fn blocking_store<T, F>(&self, op: F) -> ClientResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CredentialStore) -> ClientResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|err| {
                ClientError::Credentials(format!("credential store task failed: {}", err))
            })?
    }

    async fn expire_session(&self) {
        if let Err(err) = self.blocking_store(|store| store.clear()).await {
            warn!(error = %err, "failed to clear stored credentials");
        }
        (self.on_session_expired)();
    }
}

/// Builds a `Status` error, passing the server's `error` field through
/// when the body carries one.
pub async fn error_from_response(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(ErrorBody::into_message);
    ClientError::status(status, message)
}

async fn read_json<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    Ok(response.json().await?)
}

async fn ensure_success(response: Response) -> ClientResult<()> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    Ok(())
}
