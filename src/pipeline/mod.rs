//! The daily autopost pipeline.

pub mod filter;
pub mod orchestrator;
pub mod pricing;
pub mod rotation;

pub use filter::ProductFilter;
pub use orchestrator::{DailyPipeline, PipelineResult, PipelineServices, StageResult};

use serde::{Deserialize, Serialize};

/// The ten ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    FetchProducts,
    ConvertPrices,
    FilterProducts,
    GenerateContent,
    DownloadImages,
    CreateCards,
    PublishBroadcast,
    PublishMirror,
    SaveToDb,
    NotifyOperators,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::FetchProducts => "fetch_products",
            PipelineStage::ConvertPrices => "convert_prices",
            PipelineStage::FilterProducts => "filter_products",
            PipelineStage::GenerateContent => "generate_content",
            PipelineStage::DownloadImages => "download_images",
            PipelineStage::CreateCards => "create_cards",
            PipelineStage::PublishBroadcast => "publish_broadcast",
            PipelineStage::PublishMirror => "publish_mirror",
            PipelineStage::SaveToDb => "save_to_db",
            PipelineStage::NotifyOperators => "notify_operators",
        }
    }
}

/// Fallback strategies a run can degrade through. Recorded per run and
/// reported to operators as a partial failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackUsed {
    /// Marketplace branch down, cached products served instead.
    CachedProducts,
    /// Currency API down, last stored rate used.
    CurrencyDb,
    /// Caption generation down, template text used.
    TemplateText,
    /// Mirror publish failed or was skipped; broadcast only.
    MirrorSkipped,
}

impl FallbackUsed {
    /// Operator-facing description.
    pub fn describe(&self) -> &'static str {
        match self {
            FallbackUsed::CachedProducts => {
                "API маркетплейса недоступен → использованы кэшированные товары"
            }
            FallbackUsed::CurrencyDb => {
                "API курса валют недоступен → использован последний известный курс"
            }
            FallbackUsed::TemplateText => {
                "Генерация текста недоступна → использованы шаблоны описаний"
            }
            FallbackUsed::MirrorSkipped => {
                "Зеркальная публикация не удалась → пост только в основном канале"
            }
        }
    }
}
