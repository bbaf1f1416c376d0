use crate::domain::ports::{PhotoService, PriceRequest};
use crate::domain::transaction::{PriceQuote, PricedPhoto};
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// A photo on sale, as listed in a static catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogPhoto {
    pub photo_id: Uuid,
    pub creator_id: Uuid,
    pub price: Decimal,
    pub discount: Decimal,
    pub discount_id: Option<Uuid>,
}

impl CatalogPhoto {
    fn priced(&self) -> PricedPhoto {
        PricedPhoto {
            photo_id: self.photo_id,
            creator_id: self.creator_id,
            price: self.price,
            discount: self.discount,
            final_price: (self.price - self.discount).max(Decimal::ZERO),
            discount_id: self.discount_id,
        }
    }
}

/// Prices photos from a fixed list. Photos missing from the catalog are not
/// purchasable and are left out of the quote.
#[derive(Default)]
pub struct StaticPhotoCatalog {
    photos: RwLock<HashMap<Uuid, CatalogPhoto>>,
}

impl StaticPhotoCatalog {
    pub fn from_photos(photos: impl IntoIterator<Item = CatalogPhoto>) -> Self {
        let catalog = Self::default();
        for photo in photos {
            catalog.insert(photo);
        }
        catalog
    }

    pub fn insert(&self, photo: CatalogPhoto) {
        self.photos
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(photo.photo_id, photo);
    }

    /// Lists a new photo and returns its id.
    pub fn add(&self, creator_id: Uuid, price: Decimal, discount: Decimal) -> Uuid {
        let photo_id = Uuid::new_v4();
        self.insert(CatalogPhoto {
            photo_id,
            creator_id,
            price,
            discount,
            discount_id: None,
        });
        photo_id
    }

    pub fn creators(&self) -> BTreeSet<Uuid> {
        self.photos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|photo| photo.creator_id)
            .collect()
    }
}

#[async_trait]
impl PhotoService for StaticPhotoCatalog {
    async fn calculate_price(&self, request: &PriceRequest) -> Result<PriceQuote> {
        let photos = self.photos.read().unwrap_or_else(PoisonError::into_inner);
        let items: Vec<PricedPhoto> = request
            .photo_ids
            .iter()
            .filter_map(|id| photos.get(id))
            .map(CatalogPhoto::priced)
            .collect();
        let total = items.iter().map(|item| item.final_price).sum();
        Ok(PriceQuote { items, total })
    }
}

/// JSON client for the remote photo service.
#[derive(Clone)]
pub struct HttpPhotoService {
    http: Client,
    base_url: String,
}

impl HttpPhotoService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| SettlementError::internal(format!("photo service client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PhotoService for HttpPhotoService {
    async fn calculate_price(&self, request: &PriceRequest) -> Result<PriceQuote> {
        let response = self
            .http
            .post(format!("{}/photos/price", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| SettlementError::internal(format!("photo service unreachable: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(SettlementError::Validation(format!("photo pricing rejected: {body}")));
        }
        if !status.is_success() {
            return Err(SettlementError::internal(format!(
                "photo service answered {status}"
            )));
        }
        response
            .json::<PriceQuote>()
            .await
            .map_err(|e| SettlementError::internal(format!("photo service response: {e}")))
    }
}
