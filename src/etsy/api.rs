use crate::marketplace::{MarketplaceError, ensure_success};
use reqwest::{Client, RequestBuilder, multipart};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use urlencoding::encode;

/// Authenticated Etsy v3 calls for one access token.
pub struct EtsyApi<'a> {
    pub client: &'a Client,
    pub root: &'a str,
    pub api_key: &'a str,
    pub access_token: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateListingRequest {
    pub title: String,
    pub description: String,
    pub price: f64,
    pub quantity: u32,
    pub taxonomy_id: u32,
    pub who_made: &'static str,
    pub when_made: &'static str,
    pub is_supply: bool,
    pub shipping_profile_id: i64,
    pub tags: Vec<String>,
}

#[derive(Deserialize)]
struct Me {
    shop_id: i64,
}

#[derive(Deserialize)]
struct ShippingProfiles {
    #[serde(default)]
    results: Vec<ShippingProfile>,
}

#[derive(Deserialize)]
struct ShippingProfile {
    shipping_profile_id: i64,
}

#[derive(Deserialize)]
struct CreatedListing {
    listing_id: i64,
}

#[derive(Deserialize)]
struct ListingState {
    state: Option<String>,
}

impl EtsyApi<'_> {
    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(self.access_token)
            .header("x-api-key", self.api_key)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, MarketplaceError> {
        ensure_success("etsy", self.authed(request).send().await?)
    }

    pub async fn shop_id(&self) -> Result<i64, MarketplaceError> {
        let me: Me = self
            .send(self.client.get(format!("{}/application/users/me", self.root)))
            .await?
            .json()
            .await?;
        Ok(me.shop_id)
    }

    pub async fn shipping_profile_id(&self, shop_id: i64) -> Result<i64, MarketplaceError> {
        let profiles: ShippingProfiles = self
            .send(
                self.client
                    .get(format!("{}/application/shops/{shop_id}/shipping-profiles", self.root)),
            )
            .await?
            .json()
            .await?;
        profiles
            .results
            .first()
            .map(|p| p.shipping_profile_id)
            .ok_or_else(|| {
                MarketplaceError::Rejected(
                    "No shipping profile found on Etsy. Please create one in your Etsy shop settings."
                        .into(),
                )
            })
    }

    pub async fn create_listing(
        &self,
        shop_id: i64,
        request: &CreateListingRequest,
    ) -> Result<i64, MarketplaceError> {
        let created: CreatedListing = self
            .send(
                self.client
                    .post(format!("{}/application/shops/{shop_id}/listings", self.root))
                    .json(request),
            )
            .await?
            .json()
            .await?;
        Ok(created.listing_id)
    }

    pub async fn upload_image(
        &self,
        shop_id: i64,
        listing_id: i64,
        bytes: Vec<u8>,
    ) -> Result<(), MarketplaceError> {
        let part = multipart::Part::bytes(bytes)
            .file_name("image.jpg")
            .mime_str("image/jpeg")?;
        let form = multipart::Form::new().part("image", part);
        self.send(
            self.client
                .post(format!(
                    "{}/application/shops/{shop_id}/listings/{listing_id}/images",
                    self.root
                ))
                .multipart(form),
        )
        .await?;
        Ok(())
    }

    pub async fn update_listing(&self, listing_id: &str, changes: &Value) -> Result<(), MarketplaceError> {
        self.send(
            self.client
                .patch(format!("{}/application/listings/{}", self.root, encode(listing_id)))
                .json(changes),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_listing(&self, listing_id: &str) -> Result<(), MarketplaceError> {
        self.send(
            self.client
                .delete(format!("{}/application/listings/{}", self.root, encode(listing_id))),
        )
        .await?;
        Ok(())
    }

    pub async fn listing_state(&self, listing_id: &str) -> Result<Option<String>, MarketplaceError> {
        let listing: ListingState = self
            .send(
                self.client
                    .get(format!("{}/application/listings/{}", self.root, encode(listing_id))),
            )
            .await?
            .json()
            .await?;
        Ok(listing.state)
    }
}

/// Downloads an image so it can be re-uploaded to Etsy.
pub async fn fetch_image(client: &Client, url: &str) -> Result<Vec<u8>, MarketplaceError> {
    let response = ensure_success("etsy", client.get(url).send().await?)?;
    Ok(response.bytes().await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::Path,
        http::{HeaderMap, StatusCode},
        routing::get,
    };
    use serde_json::json;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn calls_carry_api_key_and_bearer_token() {
        async fn me(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
            let key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
            let auth = headers.get("authorization").and_then(|v| v.to_str().ok());
            if key == Some("keystring") && auth == Some("Bearer tok") {
                Ok(Json(json!({"user_id": 1, "shop_id": 777})))
            } else {
                Err(StatusCode::UNAUTHORIZED)
            }
        }
        let root = serve(Router::new().route("/application/users/me", get(me))).await;
        let client = Client::new();
        let api = EtsyApi {
            client: &client,
            root: &root,
            api_key: "keystring",
            access_token: "tok",
        };
        assert_eq!(api.shop_id().await.expect("shop"), 777);

        let wrong = EtsyApi {
            access_token: "other",
            ..api
        };
        let err = wrong.shop_id().await.expect_err("unauthorized");
        assert!(matches!(err, MarketplaceError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn empty_shipping_profiles_are_rejected() {
        let root = serve(Router::new().route(
            "/application/shops/{shop}/shipping-profiles",
            get(|Path(_shop): Path<i64>| async { Json(json!({"count": 0, "results": []})) }),
        ))
        .await;
        let client = Client::new();
        let api = EtsyApi {
            client: &client,
            root: &root,
            api_key: "k",
            access_token: "t",
        };
        let err = api.shipping_profile_id(5).await.expect_err("none");
        assert!(err.to_string().starts_with("No shipping profile found on Etsy"));
    }

    #[tokio::test]
    async fn listing_state_is_read() {
        let root = serve(Router::new().route(
            "/application/listings/{id}",
            get(|Path(id): Path<String>| async move { Json(json!({"listing_id": id, "state": "sold_out"})) }),
        ))
        .await;
        let client = Client::new();
        let api = EtsyApi {
            client: &client,
            root: &root,
            api_key: "k",
            access_token: "t",
        };
        assert_eq!(api.listing_state("42").await.expect("state").as_deref(), Some("sold_out"));
    }
}
