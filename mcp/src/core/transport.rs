//! HTTP client for remote backends that attaches a rotating credential to
//! every request.
//!
//! Static credentials are baked into the `reqwest::Client` default headers when
//! the session is opened. An OAuth2 token expires during a long session, so
//! [`AuthorizedHttpClient`] asks its [`AuthProvider`] for the current token on
//! each POST and GET issued by the SSE or streamable HTTP transport.

use std::sync::Arc;

use http::Uri;
use rmcp::{
    model::ClientJsonRpcMessage,
    transport::{
        common::client_side_sse::BoxedSseResponse,
        sse_client::{SseClient, SseTransportError},
        streamable_http_client::{
            StreamableHttpClient, StreamableHttpError, StreamableHttpPostResponse,
        },
    },
};
use tracing::warn;

use super::auth::{AuthProvider, Credential};
use crate::error::{McpError, McpResult};

#[derive(Clone)]
pub struct AuthorizedHttpClient {
    http: reqwest::Client,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl AuthorizedHttpClient {
    /// `auth` is consulted per request; pass `None` when the client already
    /// carries its credential.
    pub fn new(http: reqwest::Client, auth: Option<Arc<dyn AuthProvider>>) -> Self {
        Self { http, auth }
    }

    async fn access_token(&self, explicit: Option<String>) -> McpResult<Option<String>> {
        if explicit.is_some() {
            return Ok(explicit);
        }
        let Some(auth) = &self.auth else {
            return Ok(None);
        };
        let credential = auth.credential().await?;
        let token = credential
            .as_ref()
            .and_then(Credential::bearer_token)
            .map(str::to_string);
        if credential.is_some() && token.is_none() {
            warn!(
                scheme = auth.scheme(),
                "Rotating credential is not a bearer token; sending request without it"
            );
        }
        Ok(token)
    }
}

fn credential_io_error(e: McpError) -> std::io::Error {
    std::io::Error::other(e.to_string())
}

impl StreamableHttpClient for AuthorizedHttpClient {
    type Error = reqwest::Error;

    async fn post_message(
        &self,
        uri: Arc<str>,
        message: ClientJsonRpcMessage,
        session_id: Option<Arc<str>>,
        auth_token: Option<String>,
    ) -> Result<StreamableHttpPostResponse, StreamableHttpError<Self::Error>> {
        let token = self
            .access_token(auth_token)
            .await
            .map_err(|e| StreamableHttpError::Io(credential_io_error(e)))?;
        StreamableHttpClient::post_message(&self.http, uri, message, session_id, token).await
    }

    async fn delete_session(
        &self,
        uri: Arc<str>,
        session_id: Arc<str>,
        auth_token: Option<String>,
    ) -> Result<(), StreamableHttpError<Self::Error>> {
        let token = self
            .access_token(auth_token)
            .await
            .map_err(|e| StreamableHttpError::Io(credential_io_error(e)))?;
        self.http.delete_session(uri, session_id, token).await
    }

    async fn get_stream(
        &self,
        uri: Arc<str>,
        session_id: Arc<str>,
        last_event_id: Option<String>,
        auth_token: Option<String>,
    ) -> Result<BoxedSseResponse, StreamableHttpError<Self::Error>> {
        let token = self
            .access_token(auth_token)
            .await
            .map_err(|e| StreamableHttpError::Io(credential_io_error(e)))?;
        StreamableHttpClient::get_stream(&self.http, uri, session_id, last_event_id, token).await
    }
}

impl SseClient for AuthorizedHttpClient {
    type Error = reqwest::Error;

    async fn post_message(
        &self,
        uri: Uri,
        message: ClientJsonRpcMessage,
        auth_token: Option<String>,
    ) -> Result<(), SseTransportError<Self::Error>> {
        let token = self
            .access_token(auth_token)
            .await
            .map_err(|e| SseTransportError::Io(credential_io_error(e)))?;
        SseClient::post_message(&self.http, uri, message, token).await
    }

    async fn get_stream(
        &self,
        uri: Uri,
        last_event_id: Option<String>,
        auth_token: Option<String>,
    ) -> Result<BoxedSseResponse, SseTransportError<Self::Error>> {
        let token = self
            .access_token(auth_token)
            .await
            .map_err(|e| SseTransportError::Io(credential_io_error(e)))?;
        SseClient::get_stream(&self.http, uri, last_event_id, token).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::core::auth::BearerAuth;

    struct Sequence {
        tokens: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl AuthProvider for Sequence {
        fn scheme(&self) -> &'static str {
            "sequence"
        }

        fn rotates(&self) -> bool {
            true
        }

        async fn credential(&self) -> McpResult<Option<Credential>> {
            let token = self.tokens.lock().remove(0);
            Ok(Some(Credential::authorization(format!("Bearer {}", token))))
        }
    }

    struct Failing;

    #[async_trait]
    impl AuthProvider for Failing {
        fn scheme(&self) -> &'static str {
            "failing"
        }

        async fn credential(&self) -> McpResult<Option<Credential>> {
            Err(McpError::TokenFetch("token endpoint down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_token_resolved_per_request() {
        let provider = Arc::new(Sequence {
            tokens: Mutex::new(vec!["tok-1", "tok-2"]),
        });
        let client = AuthorizedHttpClient::new(reqwest::Client::new(), Some(provider));
        assert_eq!(client.access_token(None).await.unwrap().as_deref(), Some("tok-1"));
        assert_eq!(client.access_token(None).await.unwrap().as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn test_explicit_token_and_no_provider() {
        let client = AuthorizedHttpClient::new(
            reqwest::Client::new(),
            Some(Arc::new(BearerAuth::new("configured"))),
        );
        assert_eq!(
            client.access_token(Some("given".into())).await.unwrap().as_deref(),
            Some("given")
        );
        assert_eq!(
            client.access_token(None).await.unwrap().as_deref(),
            Some("configured")
        );

        let bare = AuthorizedHttpClient::new(reqwest::Client::new(), None);
        assert_eq!(bare.access_token(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_credential_failure_surfaces_before_sending() {
        let client = AuthorizedHttpClient::new(reqwest::Client::new(), Some(Arc::new(Failing)));
        let err = StreamableHttpClient::delete_session(
            &client,
            "http://127.0.0.1:1/mcp".into(),
            "session".into(),
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("token endpoint down"), "got {}", err);
    }
}
