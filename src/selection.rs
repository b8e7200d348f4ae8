//! Choosing one campaign among the matches, and suppressing stale or repeated displays.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    campaign::{Campaign, Timestamp},
    events::SuppressReason,
    session::NavigationToken,
};

/// A campaign picked for display, tagged with the navigation token current at selection time.
#[derive(Debug, Clone)]
pub struct Selection {
    #[allow(missing_docs)]
    pub campaign: Arc<Campaign>,
    #[allow(missing_docs)]
    pub token: NavigationToken,
    /// Event that triggered the selection.
    pub event_name: String,
    /// Screen the selection was made on.
    pub screen_name: Option<String>,
}

/// Outcome of [`SelectionCoordinator::check_display`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayDecision {
    #[allow(missing_docs)]
    Allow,
    #[allow(missing_docs)]
    Suppress(SuppressReason),
}

#[derive(Debug, Default)]
struct SelectionState {
    /// Last index picked for each `(event, screen)` pair.
    rotation: HashMap<(String, String), usize>,
    shown_this_session: HashSet<String>,
    last_shown: HashMap<String, Timestamp>,
}

/// Round-robin selection plus session-level suppression.
#[derive(Debug)]
pub struct SelectionCoordinator {
    tolerance: Duration,
    state: Mutex<SelectionState>,
}

impl SelectionCoordinator {
    /// `tolerance` is the navigation token tolerance window.
    pub fn new(tolerance: Duration) -> SelectionCoordinator {
        SelectionCoordinator {
            tolerance,
            state: Mutex::new(SelectionState::default()),
        }
    }

    /// Pick the next campaign for this `(event_name, screen_name)` pair.
    ///
    /// Repeated identical events cycle through all matches instead of always returning the
    /// first one.
    pub fn select(
        &self,
        event_name: &str,
        screen_name: Option<&str>,
        matches: &[Arc<Campaign>],
        token: NavigationToken,
    ) -> Option<Selection> {
        if matches.is_empty() {
            return None;
        }

        let key = (
            event_name.to_owned(),
            screen_name.unwrap_or_default().to_owned(),
        );
        let index = {
            let mut state = self.lock();
            let next = match state.rotation.get(&key) {
                Some(last) => (last + 1) % matches.len(),
                None => 0,
            };
            state.rotation.insert(key, next);
            next
        };

        let campaign = matches[index].clone();
        log::trace!(target: "nudge",
                    event_name,
                    campaign_id = campaign.id.as_str(),
                    index,
                    of = matches.len();
                    "selected campaign");

        Some(Selection {
            campaign,
            token,
            event_name: event_name.to_owned(),
            screen_name: screen_name.map(str::to_owned),
        })
    }

    /// Decide, right before rendering, whether `selection` may still be shown.
    pub fn check_display(
        &self,
        selection: &Selection,
        current_token: &NavigationToken,
    ) -> DisplayDecision {
        if selection.campaign.display_rules.allow_repeat() {
            return DisplayDecision::Allow;
        }

        if selection.token.is_stale(current_token, self.tolerance) {
            return DisplayDecision::Suppress(SuppressReason::NavigatedAway);
        }

        if self.was_shown(&selection.campaign.id) {
            return DisplayDecision::Suppress(SuppressReason::AlreadyShown);
        }

        DisplayDecision::Allow
    }

    /// Record a successful display.
    pub fn record_display(&self, campaign_id: &str, at: Timestamp) {
        let mut state = self.lock();
        state.shown_this_session.insert(campaign_id.to_owned());
        state.last_shown.insert(campaign_id.to_owned(), at);
    }

    /// Whether the campaign was displayed during this session.
    pub fn was_shown(&self, campaign_id: &str) -> bool {
        self.lock().shown_this_session.contains(campaign_id)
    }

    /// When the campaign was last displayed.
    pub fn last_shown(&self, campaign_id: &str) -> Option<Timestamp> {
        self.lock().last_shown.get(campaign_id).copied()
    }

    /// Forget rotation indices and display history.
    pub fn reset(&self) {
        *self.lock() = SelectionState::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SelectionState> {
        self.state
            .lock()
            .expect("thread holding selection lock should not panic")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chrono::Utc;

    use super::*;
    use crate::{
        campaign::{DisplayRules, Frequency, InteractionLimit},
        session::Session,
        testing::active_campaign,
    };

    const TOLERANCE: Duration = Duration::from_millis(1000);

    fn campaigns(ids: &[&str]) -> Vec<Arc<Campaign>> {
        ids.iter()
            .map(|id| Arc::new(active_campaign(id, "app_open")))
            .collect()
    }

    fn repeatable(id: &str) -> Arc<Campaign> {
        let mut campaign = active_campaign(id, "app_open");
        campaign.display_rules = DisplayRules {
            frequency: Frequency::EveryTime,
            interaction_limit: InteractionLimit::Once,
        };
        Arc::new(campaign)
    }

    /// Id of the campaign picked for `event` with no active screen.
    fn pick(
        coordinator: &SelectionCoordinator,
        event: &str,
        matches: &[Arc<Campaign>],
        token: NavigationToken,
    ) -> String {
        let selection = coordinator.select(event, None, matches, token).unwrap();
        selection.campaign.id.clone()
    }

    #[test]
    fn empty_matches_select_nothing() {
        let coordinator = SelectionCoordinator::new(TOLERANCE);
        let token = Session::new(None, Instant::now()).navigation_token();

        let selection = coordinator.select("app_open", Some("home"), &[], token);
        assert!(selection.is_none());
    }

    #[test]
    fn round_robin_cycles_through_all_matches() {
        let coordinator = SelectionCoordinator::new(TOLERANCE);
        let token = Session::new(None, Instant::now()).navigation_token();
        let matches = campaigns(&["a", "b", "c"]);

        let picked: Vec<String> = (0..4)
            .map(|_| pick(&coordinator, "app_open", &matches, token))
            .collect();

        assert_eq!(picked, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn rotation_is_per_event_and_screen() {
        let coordinator = SelectionCoordinator::new(TOLERANCE);
        let token = Session::new(None, Instant::now()).navigation_token();
        let matches = campaigns(&["a", "b"]);

        let pick = |event: &str, screen: &str| {
            coordinator
                .select(event, Some(screen), &matches, token)
                .unwrap()
                .campaign
                .id
                .clone()
        };

        assert_eq!(pick("app_open", "home"), "a");
        assert_eq!(pick("app_open", "home"), "b");
        assert_eq!(pick("app_open", "cart"), "a");
        assert_eq!(pick("purchase", "home"), "a");
    }

    #[test]
    fn rotation_wraps_when_match_list_shrinks() {
        let coordinator = SelectionCoordinator::new(TOLERANCE);
        let token = Session::new(None, Instant::now()).navigation_token();
        let three = campaigns(&["a", "b", "c"]);
        let two = campaigns(&["a", "b"]);

        for _ in 0..3 {
            pick(&coordinator, "e", &three, token);
        }

        // Last index was 2, the next one wraps to 3 % 2.
        assert_eq!(pick(&coordinator, "e", &two, token), "b");
        assert_eq!(pick(&coordinator, "e", &two, token), "a");
    }

    #[test]
    fn rotation_index_past_shorter_list_stays_in_bounds() {
        let coordinator = SelectionCoordinator::new(TOLERANCE);
        let token = Session::new(None, Instant::now()).navigation_token();
        let five = campaigns(&["a", "b", "c", "d", "e"]);
        let two = campaigns(&["a", "b"]);

        for _ in 0..5 {
            pick(&coordinator, "e", &five, token);
        }

        // Last index was 4, beyond the end of the two-element list.
        assert_eq!(pick(&coordinator, "e", &two, token), "b");
        assert_eq!(pick(&coordinator, "e", &campaigns(&["x"]), token), "x");
    }

    #[test]
    fn already_shown_is_suppressed() {
        let coordinator = SelectionCoordinator::new(TOLERANCE);
        let session = Session::new(None, Instant::now());
        let token = session.navigation_token();

        let selection = coordinator
            .select("app_open", None, &campaigns(&["a"]), token)
            .unwrap();
        assert_eq!(
            coordinator.check_display(&selection, &token),
            DisplayDecision::Allow
        );

        let now = Utc::now();
        coordinator.record_display("a", now);
        assert_eq!(coordinator.last_shown("a"), Some(now));
        assert_eq!(
            coordinator.check_display(&selection, &session.navigation_token()),
            DisplayDecision::Suppress(SuppressReason::AlreadyShown)
        );
    }

    #[test]
    fn navigation_beyond_tolerance_is_suppressed() {
        let coordinator = SelectionCoordinator::new(TOLERANCE);
        let start = Instant::now();
        let session = Session::new(None, start);
        let token = session.set_screen("home", start);

        let selection = coordinator
            .select("app_open", Some("home"), &campaigns(&["a"]), token)
            .unwrap();
        let current = session.set_screen("cart", start + Duration::from_millis(1500));

        assert_eq!(
            coordinator.check_display(&selection, &current),
            DisplayDecision::Suppress(SuppressReason::NavigatedAway)
        );
    }

    #[test]
    fn navigation_within_tolerance_is_allowed() {
        let coordinator = SelectionCoordinator::new(TOLERANCE);
        let start = Instant::now();
        let session = Session::new(None, start);
        let token = session.set_screen("home", start);

        let selection = coordinator
            .select("app_open", Some("home"), &campaigns(&["a"]), token)
            .unwrap();
        let current = session.set_screen("cart", start + Duration::from_millis(300));

        assert_eq!(
            coordinator.check_display(&selection, &current),
            DisplayDecision::Allow
        );
    }

    #[test]
    fn repeatable_campaign_skips_both_checks() {
        let coordinator = SelectionCoordinator::new(TOLERANCE);
        let start = Instant::now();
        let session = Session::new(None, start);
        let token = session.set_screen("home", start);

        let selection = coordinator
            .select("app_open", Some("home"), &[repeatable("r")], token)
            .unwrap();
        coordinator.record_display("r", Utc::now());
        let current = session.set_screen("cart", start + Duration::from_secs(5));

        assert_eq!(
            coordinator.check_display(&selection, &current),
            DisplayDecision::Allow
        );
    }

    #[test]
    fn reset_clears_history_and_rotation() {
        let coordinator = SelectionCoordinator::new(TOLERANCE);
        let token = Session::new(None, Instant::now()).navigation_token();
        let matches = campaigns(&["a", "b"]);

        pick(&coordinator, "e", &matches, token);
        coordinator.record_display("a", Utc::now());
        coordinator.reset();

        assert!(!coordinator.was_shown("a"));
        assert!(coordinator.last_shown("a").is_none());
        assert_eq!(pick(&coordinator, "e", &matches, token), "a");
    }
}
