//! Matching engine
//!
//! Order placement, cancellation and amendment, each inside a single
//! serializable transaction. Matching walks the opposite side of the book in
//! price-time priority with `FOR UPDATE SKIP LOCKED`, emits trades at the
//! maker's price and settles both wallets in the same transaction; on any
//! failure the whole operation rolls back.

use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::db::begin_serializable;
use crate::error::{EngineError, Result};
use crate::models::{
    Market, Order, OrderSide, OrderStatus, OrderType, OrderWithSymbol, TimeInForce, Trade,
};
use crate::repo::{MarketRepo, OrderRepo, TradeRepo, WalletRepo};

use super::types::{eps_base, eps_quote, AmendRequest, PlaceOrderRequest, MATCH_BATCH};

pub struct MatchingEngine {
    pool: PgPool,
    /// Taker fee rate on traded quote; makers pay half.
    fee_rate: Decimal,
}

impl MatchingEngine {
    pub fn new(pool: PgPool, fee_rate: Decimal) -> Self {
        Self { pool, fee_rate }
    }

    // ------------------------------------------------------------------
    // Place
    // ------------------------------------------------------------------

    pub async fn place_order(
        &self,
        user_id: Uuid,
        req: PlaceOrderRequest,
    ) -> Result<(Order, Vec<Trade>)> {
        validate_request(&req)?;

        let mut tx = begin_serializable(&self.pool).await?;

        let market = MarketRepo::get_by_id(&mut tx, req.market_id).await?;
        validate_against_market(&market, &req)?;

        // POST_ONLY: peek the best opposite price without locking and bail
        // out before touching any state.
        if req.order_type == OrderType::Limit && req.tif == TimeInForce::PostOnly {
            if let Some(best) = OrderRepo::best_opposite_price(&mut tx, market.id, req.side).await? {
                let price = req.price.expect("validated: limit order carries a price");
                let crosses = match req.side {
                    OrderSide::Buy => price >= best,
                    OrderSide::Sell => price <= best,
                };
                if crosses {
                    return Err(EngineError::PostOnlyWouldTake);
                }
            }
        }

        // FOK is all-or-nothing: if the matchable side of the book cannot
        // cover the full order, record the rejection and stop before any
        // funds are reserved.
        if req.tif == TimeInForce::Fok && !self.fok_can_fill(&mut tx, &req).await? {
            let mut order = build_taker(user_id, &req, OrderStatus::Rejected);
            OrderRepo::insert(&mut tx, &mut order).await?;
            tx.commit().await?;
            return Ok((order, Vec::new()));
        }

        self.lock_funds(&mut tx, &market, user_id, &req).await?;

        let mut taker = build_taker(user_id, &req, OrderStatus::Open);
        OrderRepo::insert(&mut tx, &mut taker).await?;

        let trades = self.run_match_loop(&mut tx, &market, &mut taker).await?;
        self.apply_tif(&mut tx, &market, &mut taker).await?;

        tx.commit().await?;
        tracing::info!(
            order_id = %taker.id,
            market = %market.symbol,
            side = %taker.side,
            status = %taker.status,
            trades = trades.len(),
            "order placed"
        );
        Ok((taker, trades))
    }

    async fn fok_can_fill(&self, conn: &mut PgConnection, req: &PlaceOrderRequest) -> Result<bool> {
        let (base, notional) = OrderRepo::available_liquidity(
            conn,
            req.market_id,
            req.side,
            req.order_type,
            req.price,
        )
        .await?;
        if req.is_market_buy() {
            let budget = req.quote_amount_max.expect("validated: market buy carries a budget");
            Ok(notional + eps_quote() >= budget)
        } else {
            let amount = req.amount.expect("validated: non-market-buy carries an amount");
            Ok(base + eps_base() >= amount)
        }
    }

    /// Reserve the initiating user's funds: quote for a buy (limit notional
    /// or the market-buy budget), base for a sell.
    async fn lock_funds(
        &self,
        conn: &mut PgConnection,
        market: &Market,
        user_id: Uuid,
        req: &PlaceOrderRequest,
    ) -> Result<()> {
        match req.side {
            OrderSide::Buy => {
                let cost = if req.order_type == OrderType::Market {
                    req.quote_amount_max.expect("validated: market buy carries a budget")
                } else {
                    req.price.expect("validated: limit order carries a price")
                        * req.amount.expect("validated: limit order carries an amount")
                };
                let wallet = WalletRepo::get_for_update(conn, user_id, market.quote_asset_id).await?;
                if wallet.balance < cost {
                    return Err(EngineError::InsufficientFunds("quote"));
                }
                WalletRepo::update_balances(conn, user_id, market.quote_asset_id, -cost, cost).await
            }
            OrderSide::Sell => {
                let amount = req.amount.expect("validated: sell carries an amount");
                let wallet = WalletRepo::get_for_update(conn, user_id, market.base_asset_id).await?;
                if wallet.balance < amount {
                    return Err(EngineError::InsufficientFunds("base"));
                }
                WalletRepo::update_balances(conn, user_id, market.base_asset_id, -amount, amount).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Match loop
    // ------------------------------------------------------------------

    async fn run_match_loop(
        &self,
        conn: &mut PgConnection,
        market: &Market,
        taker: &mut Order,
    ) -> Result<Vec<Trade>> {
        let mut trades: Vec<Trade> = Vec::new();
        let is_market_buy = taker.order_type == OrderType::Market && taker.side == OrderSide::Buy;
        let mut quote_spent = Decimal::ZERO;
        let mut base_bought = Decimal::ZERO;

        'matching: loop {
            if !taker_has_remaining(taker, is_market_buy, quote_spent) {
                break;
            }

            let makers = OrderRepo::select_makers_for_update(
                conn,
                taker.market_id,
                taker.side,
                taker.order_type,
                taker.price,
                MATCH_BATCH,
            )
            .await?;
            if makers.is_empty() {
                break;
            }

            for mut maker in makers {
                if !taker_has_remaining(taker, is_market_buy, quote_spent) {
                    break 'matching;
                }

                let (Some(maker_amount), Some(trade_price)) = (maker.amount, maker.price) else {
                    continue;
                };
                let maker_remaining = maker_amount - maker.filled_amount;

                let trade_amount = if is_market_buy {
                    let budget = taker.quote_amount_max.expect("market buy carries a budget");
                    // Round toward zero so cost never exceeds the budget left.
                    let by_budget = ((budget - quote_spent) / trade_price)
                        .round_dp_with_strategy(12, RoundingStrategy::ToZero);
                    by_budget.min(maker_remaining)
                } else {
                    let taker_remaining =
                        taker.amount.expect("non-market-buy carries an amount") - taker.filled_amount;
                    taker_remaining.min(maker_remaining)
                };
                if trade_amount <= eps_base() {
                    break 'matching;
                }

                let quote_amount = trade_price * trade_amount;
                let fee_taker = quote_amount * self.fee_rate;
                let fee_maker = quote_amount * self.fee_rate * Decimal::new(5, 1);

                let mut trade = Trade {
                    id: Uuid::nil(),
                    market_id: taker.market_id,
                    maker_order_id: maker.id,
                    taker_order_id: taker.id,
                    taker_side: taker.side,
                    price: trade_price,
                    amount: trade_amount,
                    quote_amount,
                    fee_maker,
                    fee_taker,
                    trade_time: chrono::Utc::now(),
                };
                TradeRepo::insert(conn, &mut trade).await?;

                maker.filled_amount += trade_amount;
                taker.filled_amount += trade_amount;
                if is_market_buy {
                    base_bought += trade_amount;
                    quote_spent += quote_amount;
                }

                let maker_status = if maker.filled_amount >= maker_amount - eps_base() {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                let taker_status = if is_market_buy {
                    let budget = taker.quote_amount_max.expect("market buy carries a budget");
                    if quote_spent >= budget - eps_quote() {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::PartiallyFilled
                    }
                } else {
                    let amount = taker.amount.expect("non-market-buy carries an amount");
                    if taker.filled_amount >= amount - eps_base() {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::PartiallyFilled
                    }
                };

                OrderRepo::update_fill(conn, maker.id, maker.filled_amount, maker_status).await?;
                OrderRepo::update_fill(conn, taker.id, taker.filled_amount, taker_status).await?;
                maker.status = maker_status;
                taker.status = taker_status;
                maker.fee += fee_maker;
                taker.fee += fee_taker;
                OrderRepo::add_fee(conn, maker.id, fee_maker).await?;
                OrderRepo::add_fee(conn, taker.id, fee_taker).await?;

                self.settle(conn, market, &maker, taker, trade_price, trade_amount, fee_maker, fee_taker)
                    .await?;

                trades.push(trade);
            }
        }

        // A market buy learns its base amount only here.
        if is_market_buy && base_bought > Decimal::ZERO {
            taker.amount = Some(base_bought);
            OrderRepo::set_amount(conn, taker.id, base_bought).await?;
        }

        Ok(trades)
    }

    /// Post the wallet deltas for one trade. Fees are charged in quote;
    /// the buy side's over-reservation is refunded as part of settlement.
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        conn: &mut PgConnection,
        market: &Market,
        maker: &Order,
        taker: &Order,
        price: Decimal,
        amount: Decimal,
        fee_maker: Decimal,
        fee_taker: Decimal,
    ) -> Result<()> {
        let base = market.base_asset_id;
        let quote = market.quote_asset_id;
        let cost = price * amount;

        if taker.side == OrderSide::Buy {
            let (locked_cost, refund) = if taker.order_type == OrderType::Market {
                // Budget was locked whole up front; leftovers are released in
                // TIF finalization or cancellation.
                (cost, Decimal::ZERO)
            } else {
                let locked = taker.price.expect("limit buy carries a price") * amount;
                (locked, locked - cost)
            };

            WalletRepo::update_balances(conn, taker.user_id, quote, refund, -locked_cost).await?;
            WalletRepo::update_balances(conn, taker.user_id, base, amount, Decimal::ZERO).await?;

            WalletRepo::update_balances(conn, maker.user_id, base, Decimal::ZERO, -amount).await?;
            WalletRepo::update_balances(conn, maker.user_id, quote, cost - fee_maker, Decimal::ZERO)
                .await?;
        } else {
            WalletRepo::update_balances(conn, taker.user_id, base, Decimal::ZERO, -amount).await?;
            WalletRepo::update_balances(conn, taker.user_id, quote, cost - fee_taker, Decimal::ZERO)
                .await?;

            let locked_cost = maker.price.expect("limit buy maker carries a price") * amount;
            let refund = locked_cost - cost;
            WalletRepo::update_balances(conn, maker.user_id, quote, refund, -locked_cost).await?;
            WalletRepo::update_balances(conn, maker.user_id, base, amount, Decimal::ZERO).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // TIF finalization
    // ------------------------------------------------------------------

    async fn apply_tif(
        &self,
        conn: &mut PgConnection,
        market: &Market,
        taker: &mut Order,
    ) -> Result<()> {
        let is_market_buy = taker.order_type == OrderType::Market && taker.side == OrderSide::Buy;

        if is_market_buy {
            let Some(budget) = taker.quote_amount_max else {
                return Ok(());
            };
            let spent = TradeRepo::quote_spent_by_taker(conn, taker.id).await?;
            if budget - spent <= eps_quote() {
                return Ok(());
            }
        } else {
            let Some(amount) = taker.amount else {
                return Ok(());
            };
            if amount - taker.filled_amount <= eps_base() {
                return Ok(());
            }
        }

        let final_status = match taker.tif {
            TimeInForce::Gtc => {
                // Market + GTC is rejected at validation; the guard stays for
                // rows that predate it.
                if taker.order_type == OrderType::Market {
                    OrderStatus::Canceled
                } else {
                    return Ok(());
                }
            }
            TimeInForce::Ioc => OrderStatus::Canceled,
            TimeInForce::Fok => OrderStatus::Rejected,
            // Precheck already guaranteed no crossing; any remainder here is
            // released the same way as IOC.
            TimeInForce::PostOnly => OrderStatus::Canceled,
        };

        self.refund_remaining(conn, market, taker, final_status).await
    }

    /// Reverse the reservation of the unfilled portion and move the order to
    /// `final_status` with `filled_amount` unchanged.
    async fn refund_remaining(
        &self,
        conn: &mut PgConnection,
        market: &Market,
        order: &mut Order,
        final_status: OrderStatus,
    ) -> Result<()> {
        match order.side {
            OrderSide::Buy => {
                let refund = if order.order_type == OrderType::Market {
                    match order.quote_amount_max {
                        Some(budget) => budget - TradeRepo::quote_spent_by_taker(conn, order.id).await?,
                        None => Decimal::ZERO,
                    }
                } else {
                    let remaining = order.amount.unwrap_or_default() - order.filled_amount;
                    order.price.unwrap_or_default() * remaining
                };
                WalletRepo::update_balances(conn, order.user_id, market.quote_asset_id, refund, -refund)
                    .await?;
            }
            OrderSide::Sell => {
                let remaining = order.amount.unwrap_or_default() - order.filled_amount;
                WalletRepo::update_balances(
                    conn,
                    order.user_id,
                    market.base_asset_id,
                    remaining,
                    -remaining,
                )
                .await?;
            }
        }

        OrderRepo::update_fill(conn, order.id, order.filled_amount, final_status).await?;
        order.status = final_status;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cancel
    // ------------------------------------------------------------------

    pub async fn cancel_order(&self, user_id: Uuid, order_id: Uuid) -> Result<()> {
        let mut tx = begin_serializable(&self.pool).await?;

        let mut order = OrderRepo::get_by_id_for_update(&mut tx, order_id).await?;
        if order.user_id != user_id {
            return Err(EngineError::Forbidden);
        }
        if !order.status.is_active() {
            return Err(EngineError::InvalidState("cancel"));
        }

        let market = MarketRepo::get_by_id(&mut tx, order.market_id).await?;

        match order.remaining() {
            Some(remaining) if remaining > eps_base() => {
                self.refund_remaining(&mut tx, &market, &mut order, OrderStatus::Canceled)
                    .await?;
            }
            // A market buy that never finalized: release whatever part of the
            // budget its trades did not spend.
            None => {
                self.refund_remaining(&mut tx, &market, &mut order, OrderStatus::Canceled)
                    .await?;
            }
            _ => {}
        }

        OrderRepo::cancel(&mut tx, order.id).await?;
        tx.commit().await?;
        tracing::info!(order_id = %order_id, "order canceled");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Amend
    // ------------------------------------------------------------------

    /// Change price and/or amount of a resting limit order.
    ///
    /// The reservation is adjusted by the remainder delta priced at the new
    /// price; the order does not re-enter the match loop even if the new
    /// price now crosses the book.
    pub async fn amend_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        req: AmendRequest,
    ) -> Result<Order> {
        if req.amount <= Decimal::ZERO {
            return Err(EngineError::bad_request("amount must be > 0"));
        }

        let mut tx = begin_serializable(&self.pool).await?;

        let mut order = OrderRepo::get_by_id_for_update(&mut tx, order_id).await?;
        if order.user_id != user_id {
            return Err(EngineError::Forbidden);
        }
        if order.order_type != OrderType::Limit {
            return Err(EngineError::bad_request("only limit orders can be amended"));
        }
        if !order.status.is_active() {
            return Err(EngineError::InvalidState("amend"));
        }
        let Some(old_amount) = order.amount else {
            return Err(EngineError::bad_request("order has no amount"));
        };
        if req.amount < order.filled_amount {
            return Err(EngineError::bad_request("new amount is less than filled amount"));
        }

        let market = MarketRepo::get_by_id(&mut tx, order.market_id).await?;

        let new_price = req.price.or(order.price);
        if let Some(price) = req.price {
            validate_price_against_market(&market, price)?;
        }

        let delta_remaining = req.amount - old_amount;

        if delta_remaining.abs() > eps_base() {
            match order.side {
                OrderSide::Buy => {
                    let delta_quote =
                        new_price.expect("limit order carries a price") * delta_remaining;
                    let wallet =
                        WalletRepo::get_for_update(&mut tx, user_id, market.quote_asset_id).await?;
                    if delta_quote > Decimal::ZERO && wallet.balance < delta_quote {
                        return Err(EngineError::InsufficientFunds("quote"));
                    }
                    WalletRepo::update_balances(
                        &mut tx,
                        user_id,
                        market.quote_asset_id,
                        -delta_quote,
                        delta_quote,
                    )
                    .await?;
                }
                OrderSide::Sell => {
                    let delta_base = delta_remaining;
                    let wallet =
                        WalletRepo::get_for_update(&mut tx, user_id, market.base_asset_id).await?;
                    if delta_base > Decimal::ZERO && wallet.balance < delta_base {
                        return Err(EngineError::InsufficientFunds("base"));
                    }
                    WalletRepo::update_balances(
                        &mut tx,
                        user_id,
                        market.base_asset_id,
                        -delta_base,
                        delta_base,
                    )
                    .await?;
                }
            }
        }

        OrderRepo::set_price_amount(&mut tx, order.id, new_price, req.amount).await?;
        order.price = new_price;
        order.amount = Some(req.amount);

        tx.commit().await?;
        tracing::info!(order_id = %order_id, "order amended");
        Ok(order)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn list_orders(
        &self,
        user_id: Uuid,
        status: Option<OrderStatus>,
    ) -> Result<Vec<OrderWithSymbol>> {
        OrderRepo::list_for_user(&self.pool, user_id, status).await
    }
}

fn taker_has_remaining(taker: &Order, is_market_buy: bool, quote_spent: Decimal) -> bool {
    if is_market_buy {
        match taker.quote_amount_max {
            Some(budget) => budget - quote_spent > eps_quote(),
            None => false,
        }
    } else {
        match taker.amount {
            Some(amount) => amount - taker.filled_amount > eps_base(),
            None => false,
        }
    }
}

fn build_taker(user_id: Uuid, req: &PlaceOrderRequest, status: OrderStatus) -> Order {
    Order {
        id: Uuid::nil(),
        user_id,
        market_id: req.market_id,
        side: req.side,
        order_type: req.order_type,
        price: req.price,
        // A market buy's base amount is unknown until it trades.
        amount: if req.is_market_buy() { None } else { req.amount },
        filled_amount: Decimal::ZERO,
        quote_amount_max: req.quote_amount_max,
        status,
        fee: Decimal::ZERO,
        tif: req.tif,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        canceled_at: None,
    }
}

/// Request-shape validation. Fails before any state is touched.
fn validate_request(req: &PlaceOrderRequest) -> Result<()> {
    if req.is_market_buy() {
        match req.quote_amount_max {
            Some(budget) if budget > Decimal::ZERO => {}
            _ => return Err(EngineError::bad_request("market buy requires quoteAmountMax > 0")),
        }
    } else {
        match req.amount {
            Some(amount) if amount > Decimal::ZERO => {}
            _ => return Err(EngineError::bad_request("amount must be > 0")),
        }
    }

    match req.order_type {
        OrderType::Limit => {
            if req.price.is_none() {
                return Err(EngineError::bad_request("limit order requires price"));
            }
        }
        OrderType::Market => {
            if req.price.is_some() {
                return Err(EngineError::bad_request("market order must not have price"));
            }
            if req.tif == TimeInForce::Gtc {
                return Err(EngineError::bad_request(
                    "market orders cannot use GTC (use IOC or FOK)",
                ));
            }
            if req.tif == TimeInForce::PostOnly {
                return Err(EngineError::bad_request("POST_ONLY requires a limit order"));
            }
        }
    }
    Ok(())
}

/// Market-level constraints: active flag, price band, tick alignment,
/// minimum notional.
fn validate_against_market(market: &Market, req: &PlaceOrderRequest) -> Result<()> {
    if !market.is_active {
        return Err(EngineError::bad_request("market is not active"));
    }

    if let Some(price) = req.price {
        validate_price_against_market(market, price)?;
    }

    if market.min_notional > Decimal::ZERO {
        // Market sells have no known notional up front and are not checked.
        let notional = if req.is_market_buy() {
            req.quote_amount_max
        } else if let (Some(price), Some(amount)) = (req.price, req.amount) {
            Some(price * amount)
        } else {
            None
        };
        if let Some(notional) = notional {
            if notional < market.min_notional {
                return Err(EngineError::bad_request("order notional below market minimum"));
            }
        }
    }

    Ok(())
}

fn validate_price_against_market(market: &Market, price: Decimal) -> Result<()> {
    if price <= Decimal::ZERO {
        return Err(EngineError::bad_request("price must be > 0"));
    }
    if market.min_price > Decimal::ZERO && price < market.min_price {
        return Err(EngineError::bad_request("price below market minimum"));
    }
    if market.max_price > Decimal::ZERO && price > market.max_price {
        return Err(EngineError::bad_request("price above market maximum"));
    }
    if market.tick_size > Decimal::ZERO && price % market.tick_size != Decimal::ZERO {
        return Err(EngineError::bad_request("price not aligned to tick size"));
    }
    Ok(())
}
