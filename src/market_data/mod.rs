pub mod trade_feed;

pub use trade_feed::TradeFeedProducer;
