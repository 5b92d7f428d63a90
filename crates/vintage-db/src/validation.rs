//! Field rules for product records.
//!
//! Validation is pure: it inspects a [`ProductDraft`] as received from a
//! client and either returns the typed [`ProductPatch`] it describes or every
//! problem found, in a stable order. Required-field checks only run in
//! [`ValidationMode::Create`]; any field that is present is checked in both
//! modes, so partial updates are validated only for what they touch.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use utoipa::ToSchema;

macro_rules! vocabulary {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Case-insensitive lookup.
            pub fn parse(raw: &str) -> Option<Self> {
                let lowered = raw.to_lowercase();
                Self::ALL.iter().copied().find(|value| value.as_str() == lowered)
            }

            fn choices() -> String {
                Self::ALL
                    .iter()
                    .map(|value| value.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    };
}

vocabulary! {
    /// Garment category.
    Category {
        Giacche => "giacche",
        Vestiti => "vestiti",
        Camicie => "camicie",
        Gonne => "gonne",
        Maglieria => "maglieria",
        Accessori => "accessori",
    }
}

vocabulary! {
    /// Target audience of a garment.
    Gender {
        Donna => "donna",
        Uomo => "uomo",
        Unisex => "unisex",
    }
}

vocabulary! {
    Condition {
        Eccellente => "eccellente",
        Buona => "buona",
    }
}

vocabulary! {
    /// Decade a garment comes from.
    Era {
        Sixties => "60",
        Seventies => "70",
        Eighties => "80",
        Nineties => "90",
    }
}

impl Default for Condition {
    fn default() -> Self {
        Condition::Buona
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Create,
    Update,
}

/// A single problem with one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub problem: String,
}

impl FieldError {
    fn new(field: &'static str, problem: impl Into<String>) -> Self {
        Self {
            field,
            problem: problem.into(),
        }
    }

    fn required(field: &'static str) -> Self {
        Self::new(field, "is required")
    }

    fn one_of(field: &'static str, choices: String) -> Self {
        Self::new(field, format!("must be one of: {choices}"))
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.problem)
    }
}

/// Ordered, non-empty list of field problems. Renders as a single
/// comma-joined message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<FieldError> {
        self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for error in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{error}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Product fields as supplied by a client, kept as raw JSON so that a value
/// of the wrong type surfaces as a [`FieldError`] instead of a decode failure.
/// An absent key is `None`; an explicit `null` is `Some(Value::Null)`, which
/// clears `descrizione`, `taglia` or `epoca`.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ProductDraft {
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<String>, example = "Blazer Vintage")]
    pub nome: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<f64>, example = 85)]
    pub prezzo: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<String>)]
    pub descrizione: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<String>, example = "giacche")]
    pub categoria: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<String>, example = "donna")]
    pub genere: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<String>)]
    pub taglia: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<String>, example = "80")]
    pub epoca: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<String>, example = "buona")]
    pub condizione: Option<Value>,
    /// Any JSON value; read by truthiness (`0`, `""`, `false` and `null` are false).
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<bool>)]
    pub disponibile: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Normalized, typed view of a draft that passed validation. Only fields the
/// client supplied are `Some`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductPatch {
    pub nome: Option<String>,
    pub prezzo: Option<f64>,
    pub descrizione: Option<Option<String>>,
    pub categoria: Option<Category>,
    pub genere: Option<Gender>,
    pub taglia: Option<Option<String>>,
    pub epoca: Option<Option<Era>>,
    pub condizione: Option<Condition>,
    pub disponibile: Option<bool>,
}

impl ProductPatch {
    pub fn is_empty(&self) -> bool {
        self.nome.is_none()
            && self.prezzo.is_none()
            && self.descrizione.is_none()
            && self.categoria.is_none()
            && self.genere.is_none()
            && self.taglia.is_none()
            && self.epoca.is_none()
            && self.condizione.is_none()
            && self.disponibile.is_none()
    }
}

/// Fully populated insert payload with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProduct {
    pub nome: String,
    pub prezzo: f64,
    pub descrizione: Option<String>,
    pub categoria: Category,
    pub genere: Gender,
    pub taglia: Option<String>,
    pub epoca: Option<Era>,
    pub condizione: Condition,
    pub disponibile: bool,
}

impl TryFrom<ProductPatch> for NewProduct {
    type Error = ValidationErrors;

    fn try_from(patch: ProductPatch) -> Result<Self, Self::Error> {
        match (patch.nome, patch.prezzo, patch.categoria, patch.genere) {
            (Some(nome), Some(prezzo), Some(categoria), Some(genere)) => Ok(NewProduct {
                nome,
                prezzo,
                descrizione: patch.descrizione.flatten(),
                categoria,
                genere,
                taglia: patch.taglia.flatten(),
                epoca: patch.epoca.flatten(),
                condizione: patch.condizione.unwrap_or_default(),
                disponibile: patch.disponibile.unwrap_or(true),
            }),
            (nome, prezzo, categoria, genere) => {
                let missing = [
                    ("nome", nome.is_none()),
                    ("prezzo", prezzo.is_none()),
                    ("categoria", categoria.is_none()),
                    ("genere", genere.is_none()),
                ];
                Err(ValidationErrors(
                    missing
                        .into_iter()
                        .filter(|(_, absent)| *absent)
                        .map(|(field, _)| FieldError::required(field))
                        .collect(),
                ))
            }
        }
    }
}

impl ProductDraft {
    /// Checks the draft and returns its normalized form. Errors accumulate; the
    /// required-field problems come first, followed by per-field problems in
    /// declaration order.
    pub fn check(&self, mode: ValidationMode) -> Result<ProductPatch, ValidationErrors> {
        let mut errors = Vec::new();
        let nome = self.nome.as_ref().map(Text::from_value);
        let categoria = Text::optional(&self.categoria);
        let genere = Text::optional(&self.genere);
        let condizione = Text::optional(&self.condizione);

        if mode == ValidationMode::Create {
            if !matches!(nome, Some(Text::Str(name)) if !name.is_empty()) {
                errors.push(FieldError::required("nome"));
            }
            if self.prezzo.is_none() {
                errors.push(FieldError::required("prezzo"));
            }
            if categoria.is_none() {
                errors.push(FieldError::required("categoria"));
            }
            if genere.is_none() {
                errors.push(FieldError::required("genere"));
            }
        }

        let mut patch = ProductPatch::default();

        match nome {
            Some(Text::Str(name)) if !name.is_empty() => patch.nome = Some(name.to_string()),
            Some(Text::Str(_)) if mode == ValidationMode::Update => {
                errors.push(FieldError::new("nome", "must not be blank"));
            }
            Some(Text::Other) if mode == ValidationMode::Update => {
                errors.push(FieldError::new("nome", "must be a string"));
            }
            _ => {}
        }

        if let Some(raw) = &self.prezzo {
            match raw.as_f64() {
                Some(price) if price.is_finite() && price > 0.0 => patch.prezzo = Some(price),
                _ => errors.push(FieldError::new("prezzo", "must be a positive number")),
            }
        }

        if let Some(raw) = &self.descrizione {
            match optional_text(raw) {
                Ok(text) => patch.descrizione = Some(text),
                Err(()) => errors.push(FieldError::new("descrizione", "must be a string")),
            }
        }

        if let Some(raw) = categoria {
            match raw.parse_with(Category::parse) {
                Some(value) => patch.categoria = Some(value),
                None => errors.push(FieldError::one_of("categoria", Category::choices())),
            }
        }

        if let Some(raw) = genere {
            match raw.parse_with(Gender::parse) {
                Some(value) => patch.genere = Some(value),
                None => errors.push(FieldError::one_of("genere", Gender::choices())),
            }
        }

        if let Some(raw) = &self.taglia {
            match optional_text(raw) {
                Ok(text) => patch.taglia = Some(text),
                Err(()) => errors.push(FieldError::new("taglia", "must be a string")),
            }
        }

        if let Some(raw) = condizione {
            match raw.parse_with(Condition::parse) {
                Some(value) => patch.condizione = Some(value),
                None => errors.push(FieldError::one_of("condizione", Condition::choices())),
            }
        }

        if let Some(raw) = &self.epoca {
            match optional_text(raw) {
                Ok(None) => patch.epoca = Some(None),
                Ok(Some(text)) => match Era::parse(&text) {
                    Some(value) => patch.epoca = Some(Some(value)),
                    None => errors.push(FieldError::one_of("epoca", Era::choices())),
                },
                Err(()) => errors.push(FieldError::one_of("epoca", Era::choices())),
            }
        }

        patch.disponibile = self.disponibile.as_ref().map(truthy);

        if errors.is_empty() {
            Ok(patch)
        } else {
            Err(ValidationErrors(errors))
        }
    }
}

impl ProductDraft {
    /// Create-mode check that also applies the insert defaults
    /// (`condizione = buona`, `disponibile = true`).
    pub fn check_new(&self) -> Result<NewProduct, ValidationErrors> {
        self.check(ValidationMode::Create).and_then(NewProduct::try_from)
    }
}

/// Returns every problem with `draft`; an empty list means it is valid.
pub fn validate(draft: &ProductDraft, mode: ValidationMode) -> Vec<FieldError> {
    match draft.check(mode) {
        Ok(_) => Vec::new(),
        Err(errors) => errors.into_inner(),
    }
}

/// Shape of a JSON value supplied for a text field.
#[derive(Debug, Clone, Copy)]
enum Text<'a> {
    Str(&'a str),
    Null,
    Other,
}

impl<'a> Text<'a> {
    fn from_value(value: &'a Value) -> Self {
        match value {
            Value::String(text) => Text::Str(text.trim()),
            Value::Null => Text::Null,
            _ => Text::Other,
        }
    }

    /// Enum fields: falsy values count as not supplied.
    fn optional(value: &'a Option<Value>) -> Option<Self> {
        match value.as_ref().filter(|value| truthy(value))? {
            Value::String(text) => Some(Text::Str(text)),
            _ => Some(Text::Other),
        }
    }

    fn parse_with<T>(self, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        match self {
            Text::Str(text) => parse(text),
            Text::Null | Text::Other => None,
        }
    }
}

/// `null` and blank strings clear the field; anything but a string is an error.
fn optional_text(value: &Value) -> Result<Option<String>, ()> {
    match Text::from_value(value) {
        Text::Str("") | Text::Null => Ok(None),
        Text::Str(text) => Ok(Some(text.to_string())),
        Text::Other => Err(()),
    }
}

/// JavaScript-style truthiness, which is how clients of the catalog send flags.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn draft(value: Value) -> ProductDraft {
        serde_json::from_value(value).expect("draft")
    }

    fn blazer() -> Value {
        json!({
            "nome": "  Blazer Vintage ",
            "prezzo": 85,
            "categoria": "GIACCHE",
            "genere": "Donna"
        })
    }

    #[test]
    fn create_normalizes_fields() {
        let patch = draft(blazer()).check(ValidationMode::Create).unwrap();
        assert_eq!(patch.nome.as_deref(), Some("Blazer Vintage"));
        assert_eq!(patch.prezzo, Some(85.0));
        assert_eq!(patch.categoria, Some(Category::Giacche));
        assert_eq!(patch.genere, Some(Gender::Donna));
        assert_eq!(patch.condizione, None);
        assert_eq!(patch.disponibile, None);
    }

    #[test]
    fn create_reports_every_missing_field_in_order() {
        let errors = validate(
            &draft(json!({ "descrizione": "Missing required fields" })),
            ValidationMode::Create,
        );
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["nome", "prezzo", "categoria", "genere"]);
        assert!(errors.iter().all(|e| e.to_string().contains("required")));
    }

    #[test]
    fn new_product_applies_defaults() {
        let product = draft(blazer()).check_new().unwrap();
        assert_eq!(product.condizione, Condition::Buona);
        assert!(product.disponibile);
        assert_eq!(product.descrizione, None);

        let mut value = blazer();
        value["disponibile"] = json!(false);
        value["condizione"] = json!("Eccellente");
        let product = draft(value).check_new().unwrap();
        assert!(!product.disponibile);
        assert_eq!(product.condizione, Condition::Eccellente);
    }

    #[test]
    fn partial_patch_cannot_become_a_new_product() {
        let patch = draft(json!({ "prezzo": 10 }))
            .check(ValidationMode::Update)
            .unwrap();
        let errors = NewProduct::try_from(patch).unwrap_err();
        assert_eq!(
            errors.to_string(),
            "nome is required, categoria is required, genere is required"
        );
    }

    #[test]
    fn blank_name_counts_as_missing_on_create() {
        let mut value = blazer();
        value["nome"] = json!("   ");
        let errors = draft(value).check(ValidationMode::Create).unwrap_err();
        assert_eq!(errors.to_string(), "nome is required");
    }

    #[test]
    fn price_must_be_a_positive_number() {
        for bad in [json!(0), json!(-10), json!(-0.01), json!("85"), json!(true)] {
            let mut value = blazer();
            value["prezzo"] = bad.clone();
            let errors = draft(value).check(ValidationMode::Create).unwrap_err();
            assert_eq!(
                errors.to_string(),
                "prezzo must be a positive number",
                "price {bad} should be rejected"
            );
        }

        let mut value = blazer();
        value["prezzo"] = json!(0.01);
        assert!(draft(value).check(ValidationMode::Create).is_ok());
    }

    #[test]
    fn enums_are_checked_against_their_sets() {
        let mut value = blazer();
        value["categoria"] = json!("scarpe");
        value["genere"] = json!("bambino");
        value["condizione"] = json!("rovinata");
        value["epoca"] = json!("50");
        let errors = draft(value).check(ValidationMode::Create).unwrap_err();
        let message = errors.to_string();
        assert!(message.contains(
            "categoria must be one of: giacche, vestiti, camicie, gonne, maglieria, accessori"
        ));
        assert!(message.contains("genere must be one of: donna, uomo, unisex"));
        assert!(message.contains("condizione must be one of: eccellente, buona"));
        assert!(message.contains("epoca must be one of: 60, 70, 80, 90"));
        assert_eq!(errors.fields().len(), 4);
    }

    #[test]
    fn non_string_name_is_reported_as_missing() {
        let mut value = blazer();
        value["nome"] = json!(123);
        let errors = draft(value).check(ValidationMode::Create).unwrap_err();
        assert_eq!(errors.to_string(), "nome is required");

        let errors = draft(json!({ "nome": 123 }))
            .check(ValidationMode::Update)
            .unwrap_err();
        assert_eq!(errors.to_string(), "nome must be a string");

        let patch = draft(json!({ "nome": null, "prezzo": 20 }))
            .check(ValidationMode::Update)
            .unwrap();
        assert_eq!(patch.nome, None);
    }

    #[test]
    fn wrongly_typed_fields_become_field_errors() {
        let mut value = blazer();
        value["categoria"] = json!(7);
        value["taglia"] = json!(["M"]);
        value["epoca"] = json!(80);
        let errors = draft(value).check(ValidationMode::Create).unwrap_err();
        let fields: Vec<_> = errors.fields().iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["categoria", "taglia", "epoca"]);
        assert!(errors.to_string().contains("taglia must be a string"));
    }

    #[test]
    fn availability_follows_truthiness() {
        let cases = [
            (json!(true), true),
            (json!(1), true),
            (json!("no"), true),
            (json!(false), false),
            (json!(0), false),
            (json!(""), false),
            (Value::Null, false),
        ];
        for (raw, expected) in cases {
            let mut value = blazer();
            value["disponibile"] = raw.clone();
            let product = draft(value).check_new().unwrap();
            assert_eq!(product.disponibile, expected, "disponibile {raw}");
        }
    }

    #[test]
    fn falsy_enum_values_count_as_absent() {
        let patch = draft(json!({ "categoria": "", "genere": false, "condizione": null }))
            .check(ValidationMode::Update)
            .unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn update_skips_required_checks() {
        let patch = draft(json!({ "prezzo": 120 }))
            .check(ValidationMode::Update)
            .unwrap();
        assert_eq!(patch.prezzo, Some(120.0));
        assert!(patch.nome.is_none());

        let errors = validate(&draft(json!({ "prezzo": -5 })), ValidationMode::Update);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "prezzo");
    }

    #[test]
    fn update_rejects_blank_name() {
        let errors = draft(json!({ "nome": "  " }))
            .check(ValidationMode::Update)
            .unwrap_err();
        assert_eq!(errors.to_string(), "nome must not be blank");
    }

    #[test]
    fn null_clears_optional_text() {
        let patch = draft(json!({ "descrizione": null, "epoca": null, "taglia": "M" }))
            .check(ValidationMode::Update)
            .unwrap();
        assert_eq!(patch.descrizione, Some(None));
        assert_eq!(patch.epoca, Some(None));
        assert_eq!(patch.taglia, Some(Some("M".to_string())));
        assert!(!patch.is_empty());
    }

    #[test]
    fn empty_draft_is_an_empty_patch() {
        let patch = ProductDraft::default()
            .check(ValidationMode::Update)
            .unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn vocabulary_parse_is_case_insensitive() {
        assert_eq!(Category::parse("Maglieria"), Some(Category::Maglieria));
        assert_eq!(Condition::parse("ECCELLENTE"), Some(Condition::Eccellente));
        assert_eq!(Era::parse("80"), Some(Era::Eighties));
        assert_eq!(Gender::parse("other"), None);
        assert_eq!(Condition::default(), Condition::Buona);
    }
}
