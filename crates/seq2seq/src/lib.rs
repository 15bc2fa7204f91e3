pub mod config;
pub mod generate;
pub mod layers;
pub mod model;

pub use config::Seq2SeqConfig;
pub use generate::DecodeStrategy;
pub use model::TranslationModel;
