use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::settings::PlanConfig;
use crate::error::QuotaError;

/// `limit` value meaning "no bookkeeping at all".
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    None,
    Starter,
    Pro,
}

impl PlanType {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanType::None => "none",
            PlanType::Starter => "starter",
            PlanType::Pro => "pro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(PlanType::None),
            "starter" => Some(PlanType::Starter),
            "pro" => Some(PlanType::Pro),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    DraftReply,
    EmailSummary,
    SmartCategorize,
    AiChat,
    BulkActions,
}

impl FeatureType {
    pub const ALL: [FeatureType; 5] = [
        FeatureType::DraftReply,
        FeatureType::EmailSummary,
        FeatureType::SmartCategorize,
        FeatureType::AiChat,
        FeatureType::BulkActions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureType::DraftReply => "draft_reply",
            FeatureType::EmailSummary => "email_summary",
            FeatureType::SmartCategorize => "smart_categorize",
            FeatureType::AiChat => "ai_chat",
            FeatureType::BulkActions => "bulk_actions",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    Daily,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDef {
    pub limit: i64,
    pub period: QuotaPeriod,
}

impl QuotaDef {
    pub const fn new(limit: i64, period: QuotaPeriod) -> Self {
        Self { limit, period }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit == UNLIMITED
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: PlanType,
    pub price: f64,
    pub features: BTreeMap<FeatureType, QuotaDef>,
}

impl Plan {
    pub fn quota(&self, feature: FeatureType) -> Option<QuotaDef> {
        self.features.get(&feature).copied()
    }
}

/// Immutable plan table. Built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<PlanType, Plan>,
    /// Payment-provider product id to plan.
    products: HashMap<String, PlanType>,
}

impl PlanCatalog {
    pub fn builtin() -> Self {
        use FeatureType::*;
        use QuotaPeriod::*;

        let starter = Plan {
            id: PlanType::Starter,
            price: 9.99,
            features: BTreeMap::from([
                (DraftReply, QuotaDef::new(30, Monthly)),
                (EmailSummary, QuotaDef::new(10, Daily)),
                (SmartCategorize, QuotaDef::new(UNLIMITED, Monthly)),
                (AiChat, QuotaDef::new(20, Daily)),
            ]),
        };
        let pro = Plan {
            id: PlanType::Pro,
            price: 29.99,
            features: BTreeMap::from([
                (DraftReply, QuotaDef::new(UNLIMITED, Monthly)),
                (EmailSummary, QuotaDef::new(UNLIMITED, Daily)),
                (SmartCategorize, QuotaDef::new(UNLIMITED, Monthly)),
                (AiChat, QuotaDef::new(200, Daily)),
                (BulkActions, QuotaDef::new(500, Monthly)),
            ]),
        };

        Self {
            plans: HashMap::from([(PlanType::Starter, starter), (PlanType::Pro, pro)]),
            products: HashMap::new(),
        }
    }

    /// Built-in table with per-plan overrides from configuration applied on top.
    /// An override replaces the whole plan it names.
    pub fn with_overrides(
        overrides: &HashMap<String, PlanConfig>,
        products: &HashMap<String, String>,
    ) -> Result<Self, QuotaError> {
        let mut catalog = Self::builtin();
        for (product_id, plan_name) in products {
            let plan = PlanType::parse(plan_name)
                .filter(|p| *p != PlanType::None)
                .ok_or_else(|| {
                    QuotaError::Config(format!("product {product_id} maps to unknown plan {plan_name}"))
                })?;
            catalog.products.insert(product_id.clone(), plan);
        }
        for (name, cfg) in overrides {
            let id = PlanType::parse(name)
                .filter(|p| *p != PlanType::None)
                .ok_or_else(|| QuotaError::Config(format!("unknown plan in config: {name}")))?;
            let mut features = BTreeMap::new();
            for (feature_name, quota) in &cfg.features {
                let feature = FeatureType::parse(feature_name).ok_or_else(|| {
                    QuotaError::Config(format!("unknown feature in plan {name}: {feature_name}"))
                })?;
                if quota.limit < UNLIMITED {
                    return Err(QuotaError::Config(format!(
                        "invalid limit {} for {name}.{feature_name}",
                        quota.limit
                    )));
                }
                features.insert(feature, *quota);
            }
            catalog.plans.insert(
                id,
                Plan {
                    id,
                    price: cfg.price,
                    features,
                },
            );
        }
        Ok(catalog)
    }

    pub fn resolve(&self, plan: PlanType) -> Option<&Plan> {
        self.plans.get(&plan)
    }

    pub fn plan_for_product(&self, product_id: &str) -> Option<PlanType> {
        self.products.get(product_id).copied()
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
