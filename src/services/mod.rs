//! Stage components of the pipeline and their external-service clients.

pub mod cards;
pub mod currency;
pub mod formatter;
pub mod hashtags;
pub mod images;
pub mod instagram;
pub mod notifier;
pub mod telegram;
pub mod textgen;

pub use cards::{CardCompositor, CardRenderer};
pub use currency::{CurrencyFeed, RateFeed, RateOrigin, RateQuote};
pub use hashtags::HashtagGenerator;
pub use images::{ImageDownloader, ImageFetcher};
pub use instagram::{CarouselPublisher, InstagramPublisher};
pub use notifier::Notifier;
pub use telegram::{ChannelPublisher, TelegramPublisher};
pub use textgen::{CaptionWriter, TextGenerator};
