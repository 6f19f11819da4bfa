//! JWT 认证模块
//!
//! 身份解析协作者：从请求凭证中解析调用者的用户标识。
//! 注册/登录签发 token 属于外部系统，这里只负责验证。

use axum::http::HeaderMap;
use config::JwtConfig;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token（测试和本地工具使用；生产 token 由认证服务签发）
    pub fn generate_token(&self, user_id: Uuid) -> Result<String, ApiError> {
        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::hours(self.config.expiration_hours);

        let claims = Claims {
            user_id,
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ApiError::unauthorized(format!("Token generation failed: {}", err)))
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| ApiError::unauthorized(format!("Invalid token: {}", err)))
    }

    /// 从 headers 中提取和验证 token
    pub fn extract_user_from_headers(&self, headers: &HeaderMap) -> Result<Uuid, ApiError> {
        let auth_header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("Invalid authorization header format"))?;

        let claims = self.verify_token(token)?;
        Ok(claims.user_id)
    }

    /// 可选认证：凭证缺失或无效时按匿名处理，用于公开查询端点
    pub fn try_extract_user(&self, headers: &HeaderMap) -> Option<Uuid> {
        self.extract_user_from_headers(headers).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> JwtService {
        JwtService::new(JwtConfig {
            secret: "test-secret-key-at-least-32-characters".to_string(),
            expiration_hours: 1,
        })
    }

    #[test]
    fn token_round_trip() {
        let jwt = service();
        let user_id = Uuid::new_v4();

        let token = jwt.generate_token(user_id).unwrap();
        let claims = jwt.verify_token(&token).unwrap();
        assert_eq!(claims.user_id, user_id);
    }

    #[test]
    fn invalid_token_is_rejected() {
        let jwt = service();
        assert!(jwt.verify_token("not-a-token").is_err());
    }

    #[test]
    fn optional_extraction_falls_back_to_anonymous() {
        let jwt = service();
        let headers = HeaderMap::new();
        assert!(jwt.try_extract_user(&headers).is_none());
    }

    #[test]
    fn bearer_header_is_parsed() {
        let jwt = service();
        let user_id = Uuid::new_v4();
        let token = jwt.generate_token(user_id).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );

        assert_eq!(jwt.extract_user_from_headers(&headers).unwrap(), user_id);
        assert_eq!(jwt.try_extract_user(&headers), Some(user_id));
    }
}
