use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use crate::AppState;
use crate::config::AppConfig;
use crate::db;
use crate::db::Db;
use crate::db::models::timestamp_to_datetime;
use crate::error::AppError;
use crate::types::UserId;

/// Authorizationヘッダー（またはWSハンドシェイク）から解決された認証済みユーザ。
///
/// トークンの発行は認証サービスの責務で、ここでは検証のみ行う:
/// 署名と有効期限、アカウントの有効状態、発行後にパスワードが
/// 変更されていないこと。
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct Claims {
    pub(crate) sub: String,
    pub(crate) iat: i64,
    pub(crate) exp: i64,
}

/// Bearerトークンを検証し、認証されたユーザ情報を返す。
/// REST のエクストラクタとWSゲートウェイのハンドシェイクの両方から呼ばれる。
pub(crate) async fn authenticate(
    pool: &Db,
    config: &AppConfig,
    token: &str,
) -> Result<AuthenticatedUser, AppError> {
    let key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
    let data = jsonwebtoken::decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256))
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                AppError::Unauthorized("session expired".into())
            }
            _ => AppError::Unauthorized("invalid token".into()),
        })?;

    let user_id = UserId(data.claims.sub.clone());
    let user = db::users::get_user(pool, &user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("unknown user".into()))?;

    if !user.is_active {
        return Err(AppError::Unauthorized("account disabled".into()));
    }

    // トークン発行後にパスワードが変更されていれば失効扱い
    if let Some(changed_at) = user.password_changed_at.as_ref().and_then(timestamp_to_datetime)
        && let Some(issued_at) = chrono::DateTime::from_timestamp(data.claims.iat, 0)
        && issued_at < changed_at
    {
        return Err(AppError::Unauthorized("session expired".into()));
    }

    Ok(AuthenticatedUser { user_id })
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("missing authorization header".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Unauthorized("expected bearer token".into()))?;

        authenticate(&state.pool, &state.config, token).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::testing;
    use jsonwebtoken::EncodingKey;

    pub(crate) fn test_config() -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".into(),
            listen_addr: "127.0.0.1:0".into(),
            jwt_secret: "test-secret".into(),
            s3_bucket: "test".into(),
            s3_endpoint: None,
            s3_region: "auto".into(),
            vapid_public_key: None,
            vapid_private_key: None,
        }
    }

    /// テスト用にトークンを発行する（本番では認証サービスが発行する）。
    pub(crate) fn mint_token(config: &AppConfig, sub: &str, iat: i64, exp: i64) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &Claims {
                sub: sub.to_string(),
                iat,
                exp,
            },
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn valid_token_resolves_user() {
        let pool = testing::pool().await;
        let config = test_config();
        testing::seed_user(&pool, "alice", "Alice").await;

        let now = chrono::Utc::now().timestamp();
        let token = mint_token(&config, "alice", now, now + 3600);
        let user = authenticate(&pool, &config, &token).await.unwrap();
        assert_eq!(user.user_id.as_str(), "alice");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let pool = testing::pool().await;
        let config = test_config();
        testing::seed_user(&pool, "alice", "Alice").await;

        let now = chrono::Utc::now().timestamp();
        let token = mint_token(&config, "alice", now - 7200, now - 3600);
        let err = authenticate(&pool, &config, &token).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn unknown_or_disabled_user_is_rejected() {
        let pool = testing::pool().await;
        let config = test_config();

        let now = chrono::Utc::now().timestamp();
        let token = mint_token(&config, "ghost", now, now + 3600);
        assert!(authenticate(&pool, &config, &token).await.is_err());

        testing::seed_user(&pool, "carol", "Carol").await;
        sqlx::query("UPDATE users SET is_active = FALSE WHERE id = 'carol'")
            .execute(&pool)
            .await
            .unwrap();
        let token = mint_token(&config, "carol", now, now + 3600);
        assert!(authenticate(&pool, &config, &token).await.is_err());
    }

    #[tokio::test]
    async fn password_change_invalidates_older_tokens() {
        let pool = testing::pool().await;
        let config = test_config();
        testing::seed_user(&pool, "alice", "Alice").await;

        let now = chrono::Utc::now();
        let changed = crate::db::bind_time(now);
        sqlx::query("UPDATE users SET password_changed_at = ? WHERE id = 'alice'")
            .bind(&changed)
            .execute(&pool)
            .await
            .unwrap();

        // 変更より前に発行されたトークンは拒否
        let stale = mint_token(
            &config,
            "alice",
            (now - chrono::Duration::hours(1)).timestamp(),
            (now + chrono::Duration::hours(1)).timestamp(),
        );
        assert!(authenticate(&pool, &config, &stale).await.is_err());

        // 変更より後に発行されたトークンは有効
        let fresh = mint_token(
            &config,
            "alice",
            (now + chrono::Duration::minutes(1)).timestamp(),
            (now + chrono::Duration::hours(2)).timestamp(),
        );
        assert!(authenticate(&pool, &config, &fresh).await.is_ok());
    }
}
