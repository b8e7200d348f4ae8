//! Per-process session: the identified user, the active screen and its navigation token.
use std::{
    sync::RwLock,
    time::{Duration, Instant},
};

use crate::transport::FetchRequest;

/// Opaque identifier regenerated every time the active screen changes.
///
/// Tokens are strictly increasing within a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationToken {
    seq: u64,
    issued_at: Instant,
}

impl NavigationToken {
    /// Whether a selection tagged with `self` is outdated given the `current` token.
    ///
    /// Both conditions are required: the token changed, and the two tokens were issued more than
    /// `tolerance` apart. Near-instant transitions keep both screens fresh.
    pub fn is_stale(&self, current: &NavigationToken, tolerance: Duration) -> bool {
        self.seq != current.seq
            && current.issued_at.saturating_duration_since(self.issued_at) > tolerance
    }

    /// Monotonic sequence number of this token.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Debug)]
struct SessionState {
    user_id: Option<String>,
    screen: Option<String>,
    token: NavigationToken,
}

/// Session state shared between the matching path and background refreshes.
#[derive(Debug)]
pub struct Session {
    state: RwLock<SessionState>,
}

impl Session {
    /// Create a session with no active screen.
    pub fn new(user_id: Option<String>, now: Instant) -> Session {
        Session {
            state: RwLock::new(SessionState {
                user_id,
                screen: None,
                token: NavigationToken {
                    seq: 0,
                    issued_at: now,
                },
            }),
        }
    }

    #[allow(missing_docs)]
    pub fn user_id(&self) -> Option<String> {
        self.read().user_id.clone()
    }

    #[allow(missing_docs)]
    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.write().user_id = Some(user_id.into());
    }

    #[allow(missing_docs)]
    pub fn current_screen(&self) -> Option<String> {
        self.read().screen.clone()
    }

    /// Token of the currently active screen.
    pub fn navigation_token(&self) -> NavigationToken {
        self.read().token
    }

    /// Active screen together with its token, read atomically.
    pub fn screen_and_token(&self) -> (Option<String>, NavigationToken) {
        let state = self.read();
        (state.screen.clone(), state.token)
    }

    /// Make `screen` the active screen. A new token is issued only if the screen changed.
    pub fn set_screen(&self, screen: impl Into<String>, now: Instant) -> NavigationToken {
        let screen = screen.into();
        let mut state = self.write();
        if state.screen.as_deref() != Some(screen.as_str()) {
            log::trace!(target: "nudge", screen = screen.as_str(); "screen changed");
            state.screen = Some(screen);
            state.token = NavigationToken {
                seq: state.token.seq + 1,
                issued_at: now,
            };
        }
        state.token
    }

    /// Forget the active screen and issue a fresh token. The user is kept.
    pub fn reset_navigation(&self, now: Instant) {
        let mut state = self.write();
        state.screen = None;
        state.token = NavigationToken {
            seq: state.token.seq + 1,
            issued_at: now,
        };
    }

    /// Parameters for the next campaigns fetch.
    pub fn fetch_request(&self) -> FetchRequest {
        let state = self.read();
        FetchRequest {
            user_id: state.user_id.clone(),
            screen_name: state.screen.clone(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state
            .read()
            .expect("thread holding session lock should not panic")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state
            .write()
            .expect("thread holding session lock should not panic")
    }
}
