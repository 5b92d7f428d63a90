//! Request and response bodies of the admin API.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use vintage_db::{ImageReference, Product, ProductFilter};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ProductListQuery {
    /// Exact category match.
    pub categoria: Option<String>,
    /// Exact gender match.
    pub genere: Option<String>,
    /// `true` or `false`; any other value is ignored.
    pub disponibile: Option<String>,
    /// Exact era match.
    pub epoca: Option<String>,
}

impl From<ProductListQuery> for ProductFilter {
    fn from(query: ProductListQuery) -> Self {
        let disponibile = match query.disponibile.as_deref() {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        };
        ProductFilter {
            categoria: query.categoria.filter(|value| !value.is_empty()),
            genere: query.genere.filter(|value| !value.is_empty()),
            disponibile,
            epoca: query.epoca.filter(|value| !value.is_empty()),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProductResponse {
    pub id: i64,
    pub nome: String,
    pub prezzo: f64,
    pub descrizione: Option<String>,
    pub categoria: String,
    pub genere: String,
    pub taglia: Option<String>,
    pub epoca: Option<String>,
    pub condizione: String,
    pub disponibile: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Product> for ProductResponse {
    fn from(product: Product) -> Self {
        Self {
            id: product.id,
            nome: product.nome,
            prezzo: product.prezzo,
            descrizione: product.descrizione,
            categoria: product.categoria.as_str().to_string(),
            genere: product.genere.as_str().to_string(),
            taglia: product.taglia,
            epoca: product.epoca.map(|era| era.as_str().to_string()),
            condizione: product.condizione.as_str().to_string(),
            disponibile: product.disponibile,
            created_at: product.created_at.to_rfc3339(),
            updated_at: product.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ImageResponse {
    pub id: i64,
    pub product_id: i64,
    pub url: String,
    pub is_primary: bool,
    pub created_at: String,
}

impl From<ImageReference> for ImageResponse {
    fn from(image: ImageReference) -> Self {
        Self {
            id: image.id,
            product_id: image.product_id,
            url: image.url,
            is_primary: image.is_primary,
            created_at: image.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProductListEnvelope {
    pub success: bool,
    pub products: Vec<ProductResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProductEnvelope {
    pub success: bool,
    pub product: ProductResponse,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreatedEnvelope {
    pub success: bool,
    pub id: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SuccessEnvelope {
    pub success: bool,
}

impl SuccessEnvelope {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ImageListEnvelope {
    pub success: bool,
    pub images: Vec<ImageResponse>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadEnvelope {
    pub success: bool,
    pub image_id: i64,
    /// Public locator stored on the image reference.
    pub url: String,
    /// Object storage key of the binary.
    pub key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PrimaryEnvelope {
    pub success: bool,
    /// False when the image does not belong to the product; the product is
    /// then left without a primary image.
    pub promoted: bool,
}

/// Error payload. Store failures carry `success: false`; routing and
/// authentication failures only carry `error`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub error: String,
}
