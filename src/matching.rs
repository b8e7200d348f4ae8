//! Matching application events to eligible campaigns.
//!
//! Everything here is a pure function of its arguments: no shared state is read or written, so it
//! is safe to call from any number of concurrent triggers.
use std::sync::Arc;

use regex::Regex;

use crate::{
    campaign::{Campaign, Operator, TargetingRule},
    events::Properties,
};

/// Return the campaigns eligible for `event_name` on `current_screen`, in cache order.
///
/// No ranking is applied here. Choosing among the matches is the job of
/// [`SelectionCoordinator`](crate::selection::SelectionCoordinator).
pub fn match_campaigns(
    event_name: &str,
    properties: &Properties,
    current_screen: Option<&str>,
    campaigns: &[Arc<Campaign>],
) -> Vec<Arc<Campaign>> {
    let matches: Vec<_> = campaigns
        .iter()
        .filter(|campaign| campaign.is_active())
        .filter(|campaign| campaign.is_triggered_by(event_name))
        .filter(|campaign| is_allowed_on_screen(campaign, current_screen))
        .filter(|campaign| is_allowed_by_properties(campaign, properties))
        .cloned()
        .collect();

    log::trace!(target: "nudge",
                event_name,
                screen = current_screen,
                matched = matches.len();
                "matched campaigns");

    matches
}

/// A campaign without page rules is global. Otherwise at least one page rule must hold.
fn is_allowed_on_screen(campaign: &Campaign, current_screen: Option<&str>) -> bool {
    let mut rules = campaign.page_rules().peekable();
    if rules.peek().is_none() {
        return true;
    }
    let Some(screen) = current_screen else {
        return false;
    };
    rules.any(|rule| rule.operator.eval(screen, &rule.value))
}

/// Every event-property rule must hold. A missing property fails the rule.
fn is_allowed_by_properties(campaign: &Campaign, properties: &Properties) -> bool {
    campaign
        .property_rules()
        .all(|rule| property_rule_holds(rule, properties))
}

fn property_rule_holds(rule: &TargetingRule, properties: &Properties) -> bool {
    let Some(value) = rule.key.as_ref().and_then(|key| properties.get(key)) else {
        return false;
    };
    let value = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => return false,
        other => other.to_string(),
    };
    rule.operator.eval(&value, &rule.value)
}

impl Operator {
    /// Apply the operator to `subject`. Unknown operators compare for equality.
    pub fn eval(&self, subject: &str, value: &str) -> bool {
        match self {
            Operator::Equals | Operator::Unknown => subject == value,
            Operator::Contains => subject.contains(value),
            Operator::StartsWith => subject.starts_with(value),
            Operator::EndsWith => subject.ends_with(value),
            Operator::Matches => Regex::new(value).is_ok_and(|regex| regex.is_match(subject)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::campaign::CampaignStatus;

    fn campaign(value: serde_json::Value) -> Arc<Campaign> {
        Arc::new(serde_json::from_value(value).unwrap())
    }

    fn ids(campaigns: &[Arc<Campaign>]) -> Vec<String> {
        campaigns.iter().map(|c| c.id.clone()).collect()
    }

    /// Ids matching `app_open` without properties on `screen`.
    fn on_screen(screen: Option<&str>, campaigns: &[Arc<Campaign>]) -> Vec<String> {
        let matches = match_campaigns("app_open", &Properties::new(), screen, campaigns);
        ids(&matches)
    }

    fn page_campaign(id: &str, operator: &str, value: &str) -> Arc<Campaign> {
        campaign(json!({
            "id": id,
            "trigger": "app_open",
            "status": "active",
            "targeting": [{"type": "page", "operator": operator, "value": value}],
        }))
    }

    fn properties(pairs: &[(&str, serde_json::Value)]) -> Properties {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn inactive_campaigns_never_match() {
        let mut inactive = (*page_campaign("c1", "equals", "home")).clone();
        inactive.status = CampaignStatus::Inactive;

        assert!(on_screen(Some("home"), &[Arc::new(inactive)]).is_empty());
    }

    #[test]
    fn matches_single_trigger_or_trigger_list() {
        let campaigns = [
            campaign(json!({"id": "single", "trigger": "purchase", "status": "active"})),
            campaign(json!({
                "id": "list",
                "triggers": [{"event": "purchase"}],
                "status": "active",
            })),
            campaign(json!({"id": "other", "trigger": "app_open", "status": "active"})),
            campaign(json!({"id": "none", "status": "active"})),
        ];

        let matches = match_campaigns("purchase", &Properties::new(), None, &campaigns);

        assert_eq!(ids(&matches), vec!["single", "list"]);
    }

    #[test]
    fn equals_matches_exact_screen_only() {
        let campaigns = [page_campaign("c1", "equals", "home")];

        assert_eq!(on_screen(Some("home"), &campaigns), vec!["c1"]);
        assert!(on_screen(Some("home2"), &campaigns).is_empty());
        assert!(on_screen(Some("Home"), &campaigns).is_empty());
        assert!(on_screen(None, &campaigns).is_empty());
    }

    #[test]
    fn contains_and_starts_with() {
        let campaigns = [
            page_campaign("contains", "contains", "check"),
            page_campaign("prefix", "starts_with", "settings/"),
        ];

        let on_checkout = on_screen(Some("cart_checkout"), &campaigns);
        assert_eq!(on_checkout, vec!["contains"]);
        let on_settings = on_screen(Some("settings/profile"), &campaigns);
        assert_eq!(on_settings, vec!["prefix"]);
        assert!(on_screen(Some("my/settings/"), &campaigns).is_empty());
    }

    #[test]
    fn unknown_operator_defaults_to_equals() {
        let campaigns = [page_campaign("c1", "fuzzy", "home")];

        assert_eq!(on_screen(Some("home"), &campaigns), vec!["c1"]);
        assert!(on_screen(Some("homepage"), &campaigns).is_empty());
    }

    #[test]
    fn any_page_rule_suffices() {
        let campaigns = [campaign(json!({
            "id": "c1",
            "trigger": "app_open",
            "status": "active",
            "targeting": [
                {"type": "page", "operator": "equals", "value": "home"},
                {"type": "page", "operator": "equals", "value": "cart"},
            ],
        }))];

        assert_eq!(on_screen(Some("cart"), &campaigns), vec!["c1"]);
        assert!(on_screen(Some("profile"), &campaigns).is_empty());
    }

    #[test]
    fn campaign_without_page_rules_is_global() {
        let campaigns = [campaign(json!({
            "id": "c1",
            "trigger": "app_open",
            "status": "active",
            "targeting": [{"type": "geo", "value": "NL"}],
        }))];

        assert_eq!(on_screen(Some("anything"), &campaigns), vec!["c1"]);
        assert_eq!(on_screen(None, &campaigns), vec!["c1"]);
    }

    #[test]
    fn result_keeps_cache_order() {
        let campaigns = [
            campaign(json!({"id": "b", "trigger": "e", "status": "active", "priority": 1})),
            campaign(json!({"id": "a", "trigger": "e", "status": "active", "priority": 100})),
            campaign(json!({"id": "c", "trigger": "e", "status": "active", "priority": 50})),
        ];

        let matches = match_campaigns("e", &Properties::new(), None, &campaigns);

        assert_eq!(ids(&matches), vec!["b", "a", "c"]);
    }

    #[test]
    fn event_property_rules_must_all_hold() {
        let campaigns = [campaign(json!({
            "id": "c1",
            "trigger": "purchase",
            "status": "active",
            "targeting": [
                {"type": "event_property", "key": "plan", "operator": "equals", "value": "pro"},
                {"type": "event_property", "key": "amount", "operator": "starts_with", "value": "9"},
            ],
        }))];

        let matching = properties(&[("plan", json!("pro")), ("amount", json!(99))]);
        let wrong_plan = properties(&[("plan", json!("free")), ("amount", json!(99))]);
        let missing = properties(&[("plan", json!("pro"))]);

        let purchase = |properties: &Properties| {
            ids(&match_campaigns("purchase", properties, None, &campaigns))
        };

        assert_eq!(purchase(&matching), vec!["c1"]);
        assert!(purchase(&wrong_plan).is_empty());
        assert!(purchase(&missing).is_empty());
    }

    #[test]
    fn regex_operator() {
        assert!(Operator::Matches.eval("product/123", r"^product/\d+$"));
        assert!(!Operator::Matches.eval("product/abc", r"^product/\d+$"));
        // Invalid pattern never matches.
        assert!(!Operator::Matches.eval("(", "("));
        assert!(Operator::EndsWith.eval("cart_checkout", "checkout"));
    }
}
