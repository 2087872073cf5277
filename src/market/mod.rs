// Market data: ticker sampling into the price history and a short-lived
// series cache in front of it
pub mod price_cache;
pub mod price_feed;

pub use price_cache::PriceCache;
pub use price_feed::MarketSampler;
