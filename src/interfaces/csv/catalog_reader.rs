use crate::error::{Result, SettlementError};
use crate::infrastructure::photo::CatalogPhoto;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct CatalogRow {
    photo_id: Uuid,
    creator_id: Uuid,
    price: Decimal,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    discount: Option<Decimal>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    discount_id: Option<Uuid>,
}

impl TryFrom<CatalogRow> for CatalogPhoto {
    type Error = SettlementError;

    fn try_from(row: CatalogRow) -> Result<Self> {
        let discount = row.discount.unwrap_or_default();
        if row.price.is_sign_negative() || discount.is_sign_negative() {
            return Err(SettlementError::Validation(format!(
                "photo {} has a negative price or discount",
                row.photo_id
            )));
        }
        Ok(CatalogPhoto {
            photo_id: row.photo_id,
            creator_id: row.creator_id,
            price: row.price,
            discount,
            discount_id: row.discount_id,
        })
    }
}

/// Reads a photo catalog from CSV (`photo_id,creator_id,price,discount,discount_id`).
///
/// Whitespace is trimmed and the two discount columns may be empty or absent.
pub struct CatalogReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CatalogReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and validates catalog rows.
    pub fn photos(self) -> impl Iterator<Item = Result<CatalogPhoto>> {
        self.reader
            .into_deserialize::<CatalogRow>()
            .map(|row| row.map_err(SettlementError::from).and_then(CatalogPhoto::try_from))
    }
}
