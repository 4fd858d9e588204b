use indexmap::IndexMap;
use serde::Serialize;

use crate::core::error::AdaptorError;
use crate::core::types::RelayMode;
use crate::providers::zhipu::{ApiGeneration, ZHIPU_CHANNEL_NAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Chat,
    Vision,
    Embedding,
    Image,
}

impl ModelKind {
    pub fn relay_mode(self) -> RelayMode {
        match self {
            Self::Chat | Self::Vision => RelayMode::ChatCompletions,
            Self::Embedding => RelayMode::Embeddings,
            Self::Image => RelayMode::ImagesGenerations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogModel {
    pub model_id: String,
    pub kind: ModelKind,
    pub generation: ApiGeneration,
}

impl CatalogModel {
    fn new(model_id: &str, kind: ModelKind) -> Self {
        Self {
            model_id: model_id.to_string(),
            kind,
            generation: ApiGeneration::resolve(model_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct CatalogExport<'a> {
    channel: &'static str,
    models: IndexMap<ModelKind, Vec<&'a CatalogModel>>,
}

pub fn builtin_models() -> Vec<CatalogModel> {
    vec![
        CatalogModel::new("chatglm_turbo", ModelKind::Chat),
        CatalogModel::new("chatglm_pro", ModelKind::Chat),
        CatalogModel::new("chatglm_std", ModelKind::Chat),
        CatalogModel::new("chatglm_lite", ModelKind::Chat),
        CatalogModel::new("glm-4", ModelKind::Chat),
        CatalogModel::new("glm-4v", ModelKind::Vision),
        CatalogModel::new("glm-3-turbo", ModelKind::Chat),
        CatalogModel::new("embedding-2", ModelKind::Embedding),
        CatalogModel::new("cogview-3", ModelKind::Image),
    ]
}

pub fn model_ids() -> Vec<String> {
    builtin_models()
        .into_iter()
        .map(|model| model.model_id)
        .collect()
}

pub fn find_model(model_id: &str) -> Option<CatalogModel> {
    builtin_models()
        .into_iter()
        .find(|model| model.model_id == model_id)
}

/// Pretty JSON of `models` grouped by kind, groups in first-seen order.
pub fn export_catalog_json(models: &[CatalogModel]) -> Result<String, AdaptorError> {
    let mut grouped: IndexMap<ModelKind, Vec<&CatalogModel>> = IndexMap::new();
    for model in models {
        grouped.entry(model.kind).or_default().push(model);
    }

    let export = CatalogExport {
        channel: ZHIPU_CHANNEL_NAME,
        models: grouped,
    };
    serde_json::to_string_pretty(&export)
        .map_err(|error| AdaptorError::decode("serialize_catalog", error))
}
