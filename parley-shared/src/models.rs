use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub id: &'static str,
    pub name: &'static str,
    /// Context window: prompt, history and reply together.
    pub token_limit: usize,
}

pub const MODELS: &[ModelSpec] = &[
    ModelSpec {
        id: "gpt-3.5-turbo",
        name: "GPT-3.5",
        token_limit: 4000,
    },
    ModelSpec {
        id: "gpt-35-turbo",
        name: "GPT-3.5 (Azure)",
        token_limit: 4000,
    },
    ModelSpec {
        id: "gpt-3.5-turbo-16k",
        name: "GPT-3.5 16K",
        token_limit: 16000,
    },
    ModelSpec {
        id: "gpt-4",
        name: "GPT-4",
        token_limit: 8000,
    },
    ModelSpec {
        id: "gpt-4-32k",
        name: "GPT-4 32K",
        token_limit: 32000,
    },
    ModelSpec {
        id: "gpt-4-turbo",
        name: "GPT-4 Turbo",
        token_limit: 128000,
    },
    ModelSpec {
        id: "gpt-4o",
        name: "GPT-4o",
        token_limit: 128000,
    },
    ModelSpec {
        id: "gpt-4o-mini",
        name: "GPT-4o mini",
        token_limit: 128000,
    },
];

pub fn find_model(model_id: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|m| m.id == model_id)
}

/// Context window for `model_id`, or 0 when the model is not supported.
pub fn token_limit(model_id: &str) -> usize {
    find_model(model_id).map_or(0, |m| m.token_limit)
}
