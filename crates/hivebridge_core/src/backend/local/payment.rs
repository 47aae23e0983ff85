//! Local payment: a fixed price list and an order book per vault.

use super::{now_epoch_ms, VaultContext};
use crate::backend::VaultPayment;
use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

const PAYMENT_VERSION: &str = "1.0";
const CURRENCY: &str = "ELA";

struct PricingPlan {
    name: &'static str,
    max_storage_mb: u64,
    service_days: u64,
    amount: f64,
}

const PRICING_PLANS: &[PricingPlan] = &[
    PricingPlan {
        name: "Free",
        max_storage_mb: 500,
        service_days: 0,
        amount: 0.0,
    },
    PricingPlan {
        name: "Rookie",
        max_storage_mb: 2000,
        service_days: 30,
        amount: 2.5,
    },
    PricingPlan {
        name: "Advanced",
        max_storage_mb: 50_000,
        service_days: 30,
        amount: 10.0,
    },
];

impl PricingPlan {
    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "maxStorage": self.max_storage_mb,
            "serviceDays": self.service_days,
            "amount": self.amount,
            "currency": CURRENCY,
        })
    }
}

fn find_plan(name: &str) -> BackendResult<&'static PricingPlan> {
    PRICING_PLANS
        .iter()
        .find(|plan| plan.name.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| BackendError::other(format!("pricing plan not found: {name}")))
}

pub(super) struct LocalPayment {
    context: VaultContext,
}

impl LocalPayment {
    pub(super) fn new(context: VaultContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl VaultPayment for LocalPayment {
    async fn pricing_info(&self) -> BackendResult<Value> {
        self.context.session.ensure().await?;
        Ok(json!({
            "version": PAYMENT_VERSION,
            "pricingPlans": PRICING_PLANS.iter().map(PricingPlan::to_json).collect::<Vec<_>>(),
            "paymentSettings": { "receivingAddress": "local", "currency": CURRENCY },
        }))
    }

    async fn pricing_plan(&self, name: &str) -> BackendResult<Value> {
        self.context.session.ensure().await?;
        Ok(find_plan(name)?.to_json())
    }

    async fn place_order(&self, plan_name: &str) -> BackendResult<String> {
        let plan = find_plan(plan_name)?;
        self.context
            .run(move |conn, owner| {
                let order_id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO orders (order_id, owner_did, plan_name, status, created_at)
                     VALUES (?1, ?2, ?3, 'pending', ?4)",
                    params![order_id, owner, plan.name, now_epoch_ms()],
                )?;
                Ok(order_id)
            })
            .await
    }

    async fn pay_order(&self, order_id: &str, transaction_ids: Vec<String>) -> BackendResult<bool> {
        if transaction_ids.is_empty() {
            return Err(BackendError::other("pay order needs at least one transaction id"));
        }
        let order_id = order_id.trim().to_string();
        self.context
            .run(move |conn, owner| {
                let order = load_order(conn, owner, &order_id)?;
                if order["status"] == "paid" {
                    return Err(BackendError::other(format!(
                        "order already paid: {order_id}"
                    )));
                }
                conn.execute(
                    "UPDATE orders SET status = 'paid', transaction_ids = ?1 WHERE order_id = ?2",
                    params![serde_json::to_string(&transaction_ids)?, order_id],
                )?;
                conn.execute(
                    "UPDATE vaults SET pricing_plan = ?1 WHERE owner_did = ?2",
                    params![order["planName"].as_str(), owner],
                )?;
                Ok(true)
            })
            .await
    }

    async fn get_order(&self, order_id: &str) -> BackendResult<Value> {
        let order_id = order_id.trim().to_string();
        self.context
            .run(move |conn, owner| load_order(conn, owner, &order_id))
            .await
    }

    async fn all_orders(&self) -> BackendResult<Vec<Value>> {
        self.context
            .run(|conn, owner| {
                let mut stmt = conn.prepare(
                    "SELECT order_id, plan_name, status, transaction_ids, created_at
                     FROM orders WHERE owner_did = ?1 ORDER BY created_at, rowid",
                )?;
                let orders = stmt
                    .query_map([owner], order_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(orders)
            })
            .await
    }

    async fn active_pricing_plan(&self) -> BackendResult<Value> {
        let plan_name = self
            .context
            .run(|conn, owner| {
                let name = conn
                    .query_row(
                        "SELECT pricing_plan FROM vaults WHERE owner_did = ?1",
                        [owner],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(name)
            })
            .await?;
        let plan_name = plan_name.unwrap_or_else(|| PRICING_PLANS[0].name.to_string());
        Ok(find_plan(&plan_name)?.to_json())
    }

    async fn payment_version(&self) -> BackendResult<String> {
        self.context.session.ensure().await?;
        Ok(PAYMENT_VERSION.to_string())
    }
}

fn load_order(conn: &Connection, owner: &str, order_id: &str) -> BackendResult<Value> {
    conn.query_row(
        "SELECT order_id, plan_name, status, transaction_ids, created_at
         FROM orders WHERE owner_did = ?1 AND order_id = ?2",
        params![owner, order_id],
        order_from_row,
    )
    .optional()?
    .ok_or_else(|| BackendError::other(format!("order not found: {order_id}")))
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Value> {
    let plan_name: String = row.get(1)?;
    let transaction_ids: String = row.get(3)?;
    let amount = PRICING_PLANS
        .iter()
        .find(|plan| plan.name == plan_name)
        .map_or(0.0, |plan| plan.amount);
    Ok(json!({
        "orderId": row.get::<_, String>(0)?,
        "planName": plan_name,
        "status": row.get::<_, String>(2)?,
        "transactionIds": serde_json::from_str::<Value>(&transaction_ids).unwrap_or_else(|_| json!([])),
        "amount": amount,
        "currency": CURRENCY,
        "createdAt": row.get::<_, i64>(4)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::find_plan;

    #[test]
    fn plans_are_matched_case_insensitively() {
        assert_eq!(find_plan("rookie").expect("rookie").name, "Rookie");
        assert_eq!(find_plan(" Free ").expect("free").amount, 0.0);
        assert!(find_plan("Platinum").is_err());
    }
}
