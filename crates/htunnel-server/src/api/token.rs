//! Session identity of a request.
//!
//! The token is read from the `x-tunnel-session` header, then from the
//! `tunnel_session` cookie. A request carrying neither gets a freshly minted
//! token, which the reply hands back in both places.

use super::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};

pub const SESSION_HEADER: &str = "x-tunnel-session";
pub const SESSION_COOKIE: &str = "tunnel_session";

const MAX_TOKEN_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub id: String,
    /// `true` if the request carried no token and this one was minted.
    pub minted: bool,
}

impl SessionToken {
    fn mint() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self {
            id: hex::encode(bytes),
            minted: true,
        }
    }

    /// Response headers that carry the token back to the client.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.id) {
            headers.insert(SESSION_HEADER, value);
        }
        if self.minted {
            let cookie = format!("{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax", self.id);
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.insert(SET_COOKIE, value);
            }
        }
        headers
    }
}

fn valid_token(token: &str) -> bool {
    (1..=MAX_TOKEN_LEN).contains(&token.len())
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn header_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

fn cookie_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}

impl<S> FromRequestParts<S> for SessionToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let presented = header_token(&parts.headers).or_else(|| cookie_token(&parts.headers));

        match presented {
            Some(token) if valid_token(token) => Ok(Self {
                id: token.to_string(),
                minted: false,
            }),
            Some(_) => Err(ApiError::bad_request(
                "invalid_session_token",
                "session token must be 1-128 characters of [A-Za-z0-9_-]",
            )),
            None => Ok(Self::mint()),
        }
    }
}
