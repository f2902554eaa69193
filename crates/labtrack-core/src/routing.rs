//! Role to landing-route mapping.
//!
//! The table is plain data: adding a role means adding a row to
//! `ROLE_ROUTES`, callers never match on role names themselves.

use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::SessionStatus;
use crate::models::UserProfile;

/// Navigation targets the session layer can hand to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Login,
    AdminHome,
    ClerkHome,
    StudentHome,
    AcademicStaffHome,
    TechnicianHome,
}

impl Route {
    pub fn path(self) -> &'static str {
        match self {
            Route::Login => "/login",
            Route::AdminHome => "/admin/home",
            Route::ClerkHome => "/clerk/home",
            Route::StudentHome => "/student/home",
            Route::AcademicStaffHome => "/staff/home",
            Route::TechnicianHome => "/technician/home",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Known roles and their home routes.
pub const ROLE_ROUTES: &[(&str, Route)] = &[
    ("SystemAdmin", Route::AdminHome),
    ("Clerk", Route::ClerkHome),
    ("Student", Route::StudentHome),
    ("AcademicStaff", Route::AcademicStaffHome),
    ("Technician", Route::TechnicianHome),
];

/// Home route for `role`. Unknown, empty or missing roles land on login.
pub fn route(role: Option<&str>) -> Route {
    let Some(role) = role.map(str::trim) else {
        return Route::Login;
    };
    ROLE_ROUTES
        .iter()
        .find(|(name, _)| *name == role)
        .map(|(_, route)| *route)
        .unwrap_or(Route::Login)
}

/// Where the UI should start once the credential store has loaded.
pub fn initial_route(status: SessionStatus, profile: Option<&UserProfile>) -> Route {
    match (status, profile) {
        (SessionStatus::LoggedIn, Some(profile)) => route(Some(&profile.role)),
        _ => Route::Login,
    }
}

/// The UI's navigation stack, as seen from the session layer.
///
/// Only terminal logout and explicit logout call `present`.
pub trait Navigator: Send + Sync {
    fn present(&self, route: Route);
}

/// Navigator for headless use: records nothing, only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNavigator;

impl Navigator for NoopNavigator {
    fn present(&self, route: Route) {
        debug!(%route, "Navigation requested with no UI attached");
    }
}

/// Forwards navigation requests over a channel to whoever drives the UI.
#[derive(Debug, Clone)]
pub struct ChannelNavigator {
    tx: mpsc::UnboundedSender<Route>,
}

impl ChannelNavigator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Route>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Navigator for ChannelNavigator {
    fn present(&self, route: Route) {
        if self.tx.send(route).is_err() {
            debug!(%route, "Navigation receiver closed");
        }
    }
}
