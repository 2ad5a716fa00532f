// Route guard: decides, from the current path and session, whether a
// navigation is allowed, redirected, or falls through to not-found.

use crate::protocol::AccountStatus;
use crate::session::{CurrentSession, Session};

pub const LANDING_PATH: &str = "/";
pub const TERMS_PATH: &str = "/terms";
pub const PREFERENCES_PATH: &str = "/preferences";
pub const BLOCKED_PATH: &str = "/blocked";
pub const MAIN_PATH: &str = "/main";

/// Paths reachable without signing in.
const PUBLIC_PATHS: &[&str] = &[LANDING_PATH, TERMS_PATH, PREFERENCES_PATH];

/// Main-application routes open to ACTIVE users. `:name` matches one
/// segment, a trailing `*` matches one or more. The `-temp` entries are
/// legacy screens kept reachable on purpose.
const ACTIVE_ROUTES: &[&str] = &[
    "/",
    "/main",
    "/main-temp",
    "/mypage",
    "/meetings/new",
    "/meetings/:id",
    "/meetings/:id/edit",
    "/meetings/:id/vote",
    "/meetings/:id/vote/*",
    "/meetings/:id/chat",
    "/meetings/:id/settlement/*",
    "/meetings-temp/*",
];

/// Outcome of evaluating a navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// The profile fetch has not settled; render a placeholder, do not redirect.
    Loading,
    Allow,
    Redirect(&'static str),
    NotFound,
}

/// Evaluate `path` against `session`.
pub fn decide(path: &str, session: &Session) -> RouteDecision {
    if session.loading {
        return RouteDecision::Loading;
    }

    let path = normalize(path);

    let Some(status) = session.status() else {
        return if PUBLIC_PATHS.contains(&path) {
            RouteDecision::Allow
        } else {
            RouteDecision::Redirect(LANDING_PATH)
        };
    };

    match status {
        AccountStatus::Deleted => only(path, BLOCKED_PATH),
        AccountStatus::Pending => only(path, TERMS_PATH),
        AccountStatus::Onboarding => only(path, PREFERENCES_PATH),
        AccountStatus::Active => {
            if ACTIVE_ROUTES.iter().any(|pattern| matches_pattern(pattern, path)) {
                RouteDecision::Allow
            } else {
                RouteDecision::NotFound
            }
        }
    }
}

/// Convenience for consumers holding an injected session context.
pub fn decide_for(path: &str, ctx: &impl CurrentSession) -> RouteDecision {
    decide(path, &ctx.session())
}

/// The single path a non-ACTIVE status is confined to, if any.
pub fn mandated_path(status: AccountStatus) -> Option<&'static str> {
    match status {
        AccountStatus::Pending => Some(TERMS_PATH),
        AccountStatus::Onboarding => Some(PREFERENCES_PATH),
        AccountStatus::Deleted => Some(BLOCKED_PATH),
        AccountStatus::Active => None,
    }
}

fn only(path: &str, mandated: &'static str) -> RouteDecision {
    if path == mandated {
        RouteDecision::Allow
    } else {
        RouteDecision::Redirect(mandated)
    }
}

/// Strip query, fragment and trailing slash; empty becomes `/`.
fn normalize(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    let trimmed = path[..end].trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

fn matches_pattern(pattern: &str, path: &str) -> bool {
    let mut pattern_segments = pattern.split('/').filter(|s| !s.is_empty());
    let mut path_segments = path.split('/').filter(|s| !s.is_empty());

    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => return true,
            (Some(p), Some(s)) if p.starts_with(':') || p == s => continue,
            _ => return false,
        }
    }
}
