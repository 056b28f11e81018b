pub mod candle;
pub mod market;
pub mod order;
pub mod trade;
pub mod wallet;

pub use candle::Candle;
pub use market::Market;
pub use order::{Order, OrderSide, OrderStatus, OrderType, OrderWithSymbol, TimeInForce};
pub use trade::Trade;
pub use wallet::Wallet;
