pub mod model;
pub mod provider;
pub mod source;

pub use model::{DatasetSpec, PriceSeries};
pub use provider::DatasetProvider;
pub use source::{BinanceSource, CsvSource, PriceSource};
