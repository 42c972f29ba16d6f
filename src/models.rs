use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a closed set of lowercase string values stored as TEXT columns.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// Every marketplace a user can cross-list to.
    Marketplace {
        Ebay => "ebay",
        Facebook => "facebook",
        Gumtree => "gumtree",
        Etsy => "etsy",
        Vinted => "vinted",
        Depop => "depop",
        Poshmark => "poshmark",
    }
);

impl Marketplace {
    /// Marketplaces published through their REST APIs rather than the browser extension.
    pub fn is_api_based(&self) -> bool {
        matches!(self, Marketplace::Ebay | Marketplace::Etsy)
    }
}

text_enum!(Condition {
    New => "new",
    UsedLikeNew => "used_like_new",
    UsedGood => "used_good",
    UsedFair => "used_fair",
});

text_enum!(ListingStatus {
    Draft => "draft",
    Active => "active",
    Sold => "sold",
    Archived => "archived",
});

text_enum!(MarketplaceListingStatus {
    Pending => "pending",
    Active => "active",
    Sold => "sold",
    Ended => "ended",
    Error => "error",
});

impl MarketplaceListingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MarketplaceListingStatus::Sold | MarketplaceListingStatus::Ended
        )
    }
}

text_enum!(ConnectionStatus {
    Connected => "connected",
    Disconnected => "disconnected",
    Error => "error",
});

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub name: String,
    pub subscription_tier: String,
    pub onboarding_completed_at: Option<DateTime<Utc>>,
    pub cross_list_reminders: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The account fields a client is allowed to see.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    pub subscription_tier: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
            subscription_tier: Some(self.subscription_tier.clone()),
            created_at: self.created_at,
        }
    }

    pub fn summary(&self) -> UserProfile {
        UserProfile {
            subscription_tier: None,
            ..self.profile()
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub price: f64,
    pub condition: Option<Condition>,
    pub brand: Option<String>,
    pub material: Option<String>,
    pub color: Option<String>,
    pub dimensions_length_cm: Option<f64>,
    pub dimensions_width_cm: Option<f64>,
    pub dimensions_height_cm: Option<f64>,
    pub sku: Option<String>,
    pub cost_price: Option<f64>,
    pub notes: Option<String>,
    pub category: Option<String>,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub images: Vec<ListingImage>,
    #[serde(default)]
    pub marketplace_listings: Vec<MarketplaceListing>,
}

impl Listing {
    pub fn has_dimensions(&self) -> bool {
        self.dimensions_length_cm.is_some()
            || self.dimensions_width_cm.is_some()
            || self.dimensions_height_cm.is_some()
    }

    pub fn marketplace_listing(&self, marketplace: Marketplace) -> Option<&MarketplaceListing> {
        self.marketplace_listings
            .iter()
            .find(|ml| ml.marketplace == marketplace)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingImage {
    pub id: String,
    pub listing_id: String,
    pub url: String,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceListing {
    pub id: String,
    pub listing_id: String,
    pub marketplace: Marketplace,
    pub status: MarketplaceListingStatus,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub error_message: Option<String>,
    pub platform_data: Option<Value>,
    pub listed_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user's link to one marketplace. Tokens never leave the server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceConnection {
    pub id: String,
    pub user_id: String,
    pub marketplace: Marketplace,
    pub status: ConnectionStatus,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OAuthState {
    pub state: String,
    pub user_id: String,
    pub marketplace: Marketplace,
    pub code_verifier: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthState {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}
