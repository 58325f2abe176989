//! Placeholder responses built when neither cache nor network can answer.

use crate::http::{Response, ResponseSource};

const PLACEHOLDER_IMAGE: &str = r##"<svg width="400" height="300" xmlns="http://www.w3.org/2000/svg"><rect width="100%" height="100%" fill="#0f0f0f"/><text x="50%" y="50%" text-anchor="middle" dy=".3em" fill="#b0b0b0">Image non disponible</text></svg>"##;

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html><html lang="fr"><head><meta charset="utf-8"><title>Hors ligne</title></head><body><h1>Hors ligne</h1><p>Veuillez vérifier votre connexion internet.</p></body></html>"#;

/// Vector "image unavailable" graphic.
pub fn image_placeholder() -> Response {
  synthetic("image/svg+xml", PLACEHOLDER_IMAGE)
}

/// Inline page shown when a document cannot be loaded at all.
pub fn offline_page() -> Response {
  synthetic("text/html; charset=utf-8", OFFLINE_PAGE)
}

fn synthetic(content_type: &str, body: &'static str) -> Response {
  Response::new(
    200,
    vec![("content-type".to_string(), content_type.to_string())],
    body,
  )
  .with_source(ResponseSource::Synthetic)
}
