//! Wallet ledger access.
//!
//! The engine never creates wallet rows; provisioning (registration,
//! deposits) happens outside. Mutation is a pair of signed deltas applied in
//! one statement while the caller holds the row lock.

use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::Wallet;

pub struct WalletRepo;

impl WalletRepo {
    /// Lock the wallet row for the rest of the transaction.
    pub async fn get_for_update(
        conn: &mut PgConnection,
        user_id: Uuid,
        asset_id: Uuid,
    ) -> Result<Wallet> {
        sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, user_id, asset_id, balance, in_orders, updated_at
            FROM wallets
            WHERE user_id = $1 AND asset_id = $2
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(asset_id)
        .fetch_optional(conn)
        .await?
        .ok_or(EngineError::NotFound("wallet"))
    }

    /// Apply `balance += balance_delta, in_orders += in_orders_delta`.
    ///
    /// Negativity is not checked here; the caller holds the lock and has
    /// verified sufficiency.
    pub async fn update_balances(
        conn: &mut PgConnection,
        user_id: Uuid,
        asset_id: Uuid,
        balance_delta: Decimal,
        in_orders_delta: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE wallets
            SET balance = balance + $3,
                in_orders = in_orders + $4,
                updated_at = NOW()
            WHERE user_id = $1 AND asset_id = $2
            "#,
        )
        .bind(user_id)
        .bind(asset_id)
        .bind(balance_delta)
        .bind(in_orders_delta)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Balances of every asset the user holds, joined with the asset symbol.
    pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<(String, Decimal, Decimal)>> {
        let rows: Vec<(String, Decimal, Decimal)> = sqlx::query_as(
            r#"
            SELECT a.symbol, w.balance, w.in_orders
            FROM wallets w
            JOIN assets a ON a.id = w.asset_id
            WHERE w.user_id = $1
            ORDER BY a.symbol
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
