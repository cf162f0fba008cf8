//! Session cookie middleware.
//!
//! Every request carries an opaque session identifier in an encrypted
//! cookie. The identifier is the routing key between a live event stream and
//! any queued result addressed to it. The cookie key is generated at
//! startup, so sessions do not survive API restarts; losing the mapping only
//! drops in-flight results for that session.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, PrivateCookieJar, SameSite};
use uuid::Uuid;

use crate::server::AppState;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "MANIMATIC_S";

/// Session cookie lifetime.
const SESSION_LIFETIME: time::Duration = time::Duration::hours(24);

/// The request's session identifier, injected by [`ensure_session`].
#[derive(Debug, Clone)]
pub struct SessionId(pub String);

/// Middleware ensuring every request has a session identifier.
///
/// Reads the encrypted session cookie, minting a fresh identifier (and
/// setting the cookie) on first contact, and injects [`SessionId`] into the
/// request extensions.
pub async fn ensure_session(
    State(_state): State<AppState>,
    jar: PrivateCookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let existing = jar
        .get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string());

    let (jar, session_id) = match existing {
        Some(session_id) => (jar, session_id),
        None => {
            let session_id = Uuid::new_v4().to_string();
            tracing::debug!(session_id = %session_id, "issued new session");

            let cookie = Cookie::build((SESSION_COOKIE, session_id.clone()))
                .path("/")
                .secure(true)
                .http_only(true)
                .same_site(SameSite::Lax)
                .max_age(SESSION_LIFETIME)
                .build();
            (jar.add(cookie), session_id)
        }
    };

    request.extensions_mut().insert(SessionId(session_id));
    let response = next.run(request).await;
    (jar, response).into_response()
}
