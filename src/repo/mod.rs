pub mod market_repo;
pub mod order_repo;
pub mod trade_repo;
pub mod wallet_repo;

pub use market_repo::MarketRepo;
pub use order_repo::{OrderBook, OrderRepo, PriceLevel};
pub use trade_repo::{TradeRepo, TradeTick};
pub use wallet_repo::WalletRepo;
