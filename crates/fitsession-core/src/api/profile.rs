use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::auth::SessionManager;
use crate::models::UserProfileDetails;

use super::{ApiError, AuthApi, RequestOptions};

const PROFILE_PATH: &str = "/api/v1/fitness/profile";

/// Client for the signed-in user's fitness profile.
pub struct ProfileClient<'a> {
    session: &'a SessionManager,
}

impl<'a> ProfileClient<'a> {
    pub fn new(session: &'a SessionManager) -> Self {
        Self { session }
    }

    pub async fn get(&self) -> Result<UserProfileDetails, ApiError> {
        self.call(RequestOptions::get()).await
    }

    pub async fn create(&self, details: &UserProfileDetails) -> Result<UserProfileDetails, ApiError> {
        let body = serde_json::to_value(details)?;
        self.call(RequestOptions::new(Method::POST).json(body)).await
    }

    pub async fn update(&self, details: &UserProfileDetails) -> Result<UserProfileDetails, ApiError> {
        let body = serde_json::to_value(details)?;
        self.call(RequestOptions::new(Method::PATCH).json(body)).await
    }

    async fn call<T: DeserializeOwned>(&self, options: RequestOptions) -> Result<T, ApiError> {
        debug!(method = %options.method, "Calling profile endpoint");
        let response = self
            .session
            .authenticated_request(PROFILE_PATH, options)
            .await?;
        let response = AuthApi::check_response(response).await?;

        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse profile response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, NaiveDate};
    use mockito::{Matcher, Server};
    use url::Url;

    use crate::auth::jwt::test_token;
    use crate::auth::{MemoryStore, RecordingNavigator, SessionSettings, SessionStore, TOKENS_KEY};
    use crate::models::{PersonalDetails, TokenPair};

    async fn session(base_url: &str, access: &str) -> SessionManager {
        let store = Arc::new(MemoryStore::new());
        store
            .set(TOKENS_KEY, &serde_json::to_string(&TokenPair::new(access, "r1")).unwrap())
            .unwrap();
        let api = AuthApi::new(Url::parse(base_url).unwrap(), None).unwrap();
        let session = SessionManager::new(
            api,
            store,
            Arc::new(RecordingNavigator::default()),
            SessionSettings::default(),
        );
        session.initialize().await;
        session
    }

    fn profile() -> UserProfileDetails {
        UserProfileDetails {
            user_id: 42,
            personal_details: PersonalDetails {
                weight: 72.5,
                height: 180.0,
                date_of_birth: NaiveDate::from_ymd_opt(1990, 4, 12).unwrap(),
            },
            goals: None,
            preferences: None,
        }
    }

    #[tokio::test]
    async fn test_update_profile() {
        let mut server = Server::new_async().await;
        let access = test_token(Duration::hours(1));
        let body = serde_json::to_string(&profile()).unwrap();
        let mock = server
            .mock("PATCH", PROFILE_PATH)
            .match_header("authorization", format!("Bearer {}", access).as_str())
            .match_body(Matcher::JsonString(body.clone()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let session = session(&server.url(), &access).await;
        let updated = ProfileClient::new(&session).update(&profile()).await.unwrap();

        assert_eq!(updated, profile());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_profile_is_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", PROFILE_PATH)
            .with_status(404)
            .with_body("no profile")
            .create_async()
            .await;

        let session = session(&server.url(), &test_token(Duration::hours(1))).await;
        let err = ProfileClient::new(&session).get().await.unwrap_err();

        assert!(matches!(err, ApiError::NotFound(_)));
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn test_signed_out_profile_call_is_session_error() {
        let server = Server::new_async().await;
        let session = session(&server.url(), &test_token(Duration::hours(1))).await;
        session.logout();

        let err = ProfileClient::new(&session).get().await.unwrap_err();
        assert!(matches!(err, ApiError::Session(crate::error::SessionError::NoToken)));
    }
}
