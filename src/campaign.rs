//! Campaign definitions as served by the backend.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// A targeted nudge that may be shown in response to an application event.
///
/// Campaigns are immutable once fetched. A refresh replaces the whole list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    /// Unique identifier. Campaign identity is decided by `id` alone.
    pub id: String,
    #[serde(default)]
    #[allow(missing_docs)]
    pub title: String,
    /// Single event name this campaign listens for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Additional event names this campaign listens for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Vec<TriggerRef>>,
    /// Where (and for which event properties) the campaign may appear.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting: Option<Vec<TargetingRule>>,
    /// Missing status is treated as not active.
    #[serde(default)]
    pub status: CampaignStatus,
    #[serde(default)]
    #[allow(missing_docs)]
    pub priority: i64,
    /// Renderer-specific content. Opaque to the engine.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, alias = "displayRules")]
    #[allow(missing_docs)]
    pub display_rules: DisplayRules,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub created_at: Option<Timestamp>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub updated_at: Option<Timestamp>,
}

impl Campaign {
    /// Whether the campaign may be shown at all.
    pub fn is_active(&self) -> bool {
        self.status == CampaignStatus::Active
    }

    /// Returns `true` if `event_name` is one of the campaign triggers.
    pub fn is_triggered_by(&self, event_name: &str) -> bool {
        self.trigger.as_deref() == Some(event_name)
            || self
                .triggers
                .iter()
                .flatten()
                .any(|trigger| trigger.event == event_name)
    }

    /// Page rules restricting the screens this campaign may appear on.
    pub fn page_rules(&self) -> impl Iterator<Item = &TargetingRule> {
        self.rules_of_kind(RuleKind::Page)
    }

    /// Rules over the properties of the triggering event.
    pub fn property_rules(&self) -> impl Iterator<Item = &TargetingRule> {
        self.rules_of_kind(RuleKind::EventProperty)
    }

    fn rules_of_kind(&self, kind: RuleKind) -> impl Iterator<Item = &TargetingRule> {
        self.targeting
            .iter()
            .flatten()
            .filter(move |rule| rule.kind == kind)
    }

    /// Timestamp used to order campaigns by age. Prefers `updated_at`.
    pub(crate) fn last_modified(&self) -> Option<Timestamp> {
        self.updated_at.or(self.created_at)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRef {
    pub event: String,
}

/// Publication status of a campaign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum CampaignStatus {
    Active,
    #[default]
    Inactive,
    Draft,
    Archived,
    #[serde(other)]
    Unknown,
}

/// A predicate restricting where a campaign may appear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetingRule {
    #[serde(rename = "type")]
    #[allow(missing_docs)]
    pub kind: RuleKind,
    #[serde(default)]
    #[allow(missing_docs)]
    pub operator: Operator,
    #[allow(missing_docs)]
    pub value: String,
    /// Event property name. Only used by [`RuleKind::EventProperty`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl TargetingRule {
    /// Build a page rule.
    pub fn page(operator: Operator, value: impl Into<String>) -> TargetingRule {
        TargetingRule {
            kind: RuleKind::Page,
            operator,
            value: value.into(),
            key: None,
        }
    }
}

/// What a [`TargetingRule`] is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Current screen name.
    Page,
    /// A property of the triggering event.
    EventProperty,
    /// Rule types this version does not understand. They are ignored.
    #[serde(other)]
    Other,
}

/// String comparison applied by a [`TargetingRule`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Operator {
    #[default]
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    /// Regular expression match. Invalid patterns never match.
    Matches,
    /// Unknown operators are evaluated as [`Operator::Equals`].
    #[serde(other)]
    Unknown,
}

/// Per-campaign policy that decides whether a campaign may be shown more than once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRules {
    #[serde(default)]
    #[allow(missing_docs)]
    pub frequency: Frequency,
    #[serde(default, alias = "interactionLimit")]
    #[allow(missing_docs)]
    pub interaction_limit: InteractionLimit,
}

impl DisplayRules {
    /// Repeatable campaigns skip both the navigation and the shown-this-session checks.
    ///
    /// Either sub-field is sufficient on its own.
    pub fn allow_repeat(&self) -> bool {
        self.frequency == Frequency::EveryTime
            || self.interaction_limit == InteractionLimit::Unlimited
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frequency {
    EveryTime,
    #[default]
    OncePerSession,
    #[serde(other)]
    Other,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractionLimit {
    Unlimited,
    #[default]
    Once,
    #[serde(other)]
    Other,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
///
/// One malformed campaign must not prevent the rest of the batch from being served.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Response of the campaigns endpoint.
///
/// Both `{"campaigns": [...]}` and a bare array are accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CampaignsResponse {
    #[allow(missing_docs)]
    Wrapped {
        campaigns: Vec<TryParse<Campaign>>,
    },
    #[allow(missing_docs)]
    Bare(Vec<TryParse<Campaign>>),
}

impl CampaignsResponse {
    /// Keep successfully parsed campaigns, logging and skipping the rest.
    pub fn into_campaigns(self) -> Vec<Arc<Campaign>> {
        let records = match self {
            CampaignsResponse::Wrapped { campaigns } => campaigns,
            CampaignsResponse::Bare(campaigns) => campaigns,
        };
        parse_records(records)
    }
}

impl From<Vec<Campaign>> for CampaignsResponse {
    fn from(campaigns: Vec<Campaign>) -> Self {
        CampaignsResponse::Bare(campaigns.into_iter().map(TryParse::Parsed).collect())
    }
}

pub(crate) fn parse_records(records: Vec<TryParse<Campaign>>) -> Vec<Arc<Campaign>> {
    records
        .into_iter()
        .filter_map(|record| match record {
            TryParse::Parsed(campaign) => Some(Arc::new(campaign)),
            TryParse::ParseFailed(raw) => {
                let campaign_id = raw.get("id").and_then(|id| id.as_str()).unwrap_or("<none>");
                log::warn!(target: "nudge", campaign_id; "skipping campaign that failed to parse");
                None
            }
        })
        .collect()
}
