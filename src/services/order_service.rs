use std::collections::BTreeMap;
use std::future::Future;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DbErr, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{CheckoutItem, CheckoutRequest, OrderList, OrderWithItems},
    entity::{
        cart_items::{Column as CartCol, Entity as CartItems},
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel},
        products::{Column as ProdCol, Entity as Products},
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Order, OrderItem, OrderStatus},
    notify,
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    state::AppState,
};

/// Lock-conflict retry budget for one checkout request. Business failures
/// (missing product, insufficient stock) are never retried.
const MAX_TXN_ATTEMPTS: u32 = 3;

/// Place an order from a client-submitted cart: verify stock for every line
/// item, create the order in `pending` status, and decrement stock, all
/// inside one transaction. Either every effect commits or none does.
///
/// `user_id` is `None` for guest checkout. Monetary totals are carried
/// through as supplied by the client; a mismatch against the recomputed sum
/// is logged but not rejected (see DESIGN.md).
pub async fn place_order(
    state: &AppState,
    user_id: Option<Uuid>,
    payload: &CheckoutRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    if payload.items.is_empty() {
        return Err(AppError::EmptyCart);
    }
    for item in &payload.items {
        if item.quantity <= 0 {
            return Err(AppError::BadRequest(format!(
                "Invalid quantity {} for product {}",
                item.quantity, item.product_id
            )));
        }
    }

    let recomputed = recompute_total(&payload.items, payload.shipping_cost, payload.tax);
    if recomputed != payload.total {
        tracing::warn!(
            claimed = %payload.total,
            recomputed = %recomputed,
            "client-supplied total does not match recomputed sum"
        );
    }

    let (order, items) = with_txn_retry(MAX_TXN_ATTEMPTS, || {
        attempt_checkout(state, user_id, payload)
    })
    .await?;

    if let Err(err) = log_audit(
        &state.pool,
        user_id,
        "checkout",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "total": order.total })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    notify::send_order_confirmation(&order.email, order.id, order.total);

    Ok(ApiResponse::success(
        "Order placed",
        OrderWithItems {
            order: order_from_entity(order),
            items: items.into_iter().map(order_item_from_entity).collect(),
        },
        Some(Meta::empty()),
    ))
}

/// One transactional attempt. The transaction rolls back on any early
/// return, so a failed attempt leaves no order row and no stock change.
async fn attempt_checkout(
    state: &AppState,
    user_id: Option<Uuid>,
    payload: &CheckoutRequest,
) -> AppResult<(OrderModel, Vec<OrderItemModel>)> {
    let txn = state.orm.begin().await?;

    // A product may appear on several cart lines, so stock is checked and
    // later decremented against the summed quantity per product. The BTreeMap
    // also fixes an ascending lock order, so two concurrent checkouts
    // touching the same products cannot deadlock on each other.
    let mut wanted: BTreeMap<Uuid, i32> = BTreeMap::new();
    for item in &payload.items {
        *wanted.entry(item.product_id).or_insert(0) += item.quantity;
    }

    let mut locked: BTreeMap<Uuid, _> = BTreeMap::new();
    for (&product_id, &quantity) in &wanted {
        let product = Products::find_by_id(product_id)
            .lock(LockType::Update)
            .one(&txn)
            .await?;
        let product = match product {
            Some(p) => p,
            None => return Err(AppError::ProductNotFound(product_id)),
        };
        if product.stock < quantity {
            return Err(AppError::InsufficientStock {
                product_id,
                available: product.stock,
                requested: quantity,
            });
        }
        locked.insert(product_id, product);
    }

    let order = OrderActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        email: Set(payload.shipping.email.clone()),
        ship_name: Set(payload.shipping.name.clone()),
        ship_street: Set(payload.shipping.street.clone()),
        ship_city: Set(payload.shipping.city.clone()),
        ship_state: Set(payload.shipping.state.clone()),
        ship_postal_code: Set(payload.shipping.postal_code.clone()),
        ship_country: Set(payload.shipping.country.clone()),
        subtotal: Set(payload.subtotal),
        shipping_cost: Set(payload.shipping_cost),
        tax: Set(payload.tax),
        total: Set(payload.total),
        status: Set(OrderStatus::Pending.as_str().into()),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let mut items = Vec::with_capacity(payload.items.len());
    for item in &payload.items {
        if let Some(product) = locked.get(&item.product_id) {
            if product.price != item.unit_price {
                tracing::warn!(
                    product_id = %item.product_id,
                    catalog = %product.price,
                    claimed = %item.unit_price,
                    "cart unit price differs from catalog price"
                );
            }
        }

        let row = OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(item.product_id),
            name: Set(item.name.clone()),
            quantity: Set(item.quantity),
            unit_price: Set(item.unit_price),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
        items.push(row);
    }

    for (&product_id, &quantity) in &wanted {
        Products::update_many()
            .col_expr(ProdCol::Stock, Expr::col(ProdCol::Stock).sub(quantity))
            .filter(ProdCol::Id.eq(product_id))
            .exec(&txn)
            .await?;
    }

    // An authenticated checkout consumes the persisted cart as well.
    if let Some(uid) = user_id {
        CartItems::delete_many()
            .filter(CartCol::UserId.eq(uid))
            .exec(&txn)
            .await?;
    }

    txn.commit().await?;

    Ok((order, items))
}

/// Bounded retry around a transactional block. Only store-level conflicts
/// (serialization failures, deadlocks) are retried; everything else is
/// returned as-is. Exhausting the budget surfaces `TransientConflict`.
async fn with_txn_retry<T, F, Fut>(max_attempts: u32, mut attempt: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Err(AppError::OrmError(err)) if is_txn_conflict(&err) => {
                if tries >= max_attempts {
                    return Err(AppError::TransientConflict);
                }
                tracing::debug!(attempt = tries, error = %err, "transaction conflict, retrying");
            }
            other => return other,
        }
    }
}

fn is_txn_conflict(err: &DbErr) -> bool {
    // SQLSTATE 40001 (serialization_failure) / 40P01 (deadlock_detected).
    let msg = err.to_string();
    msg.contains("40001")
        || msg.contains("40P01")
        || msg.contains("could not serialize")
        || msg.contains("deadlock detected")
}

fn recompute_total(items: &[CheckoutItem], shipping_cost: Decimal, tax: Decimal) -> Decimal {
    let subtotal: Decimal = items
        .iter()
        .map(|item| item.unit_price * Decimal::from(item.quantity))
        .sum();
    subtotal + shipping_cost + tax
}

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all().add(OrderCol::UserId.eq(user.user_id));
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(OrderCol::Status.eq(status.clone()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);

    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_from_entity)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Ok",
        OrderList { items: orders },
        Some(meta),
    ))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::Id.eq(id)),
        )
        .one(&state.orm)
        .await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    Ok(ApiResponse::success(
        "OK",
        OrderWithItems {
            order: order_from_entity(order),
            items,
        },
        Some(Meta::empty()),
    ))
}

pub(crate) fn order_from_entity(model: OrderModel) -> Order {
    Order {
        id: model.id,
        user_id: model.user_id,
        email: model.email,
        ship_name: model.ship_name,
        ship_street: model.ship_street,
        ship_city: model.ship_city,
        ship_state: model.ship_state,
        ship_postal_code: model.ship_postal_code,
        ship_country: model.ship_country,
        subtotal: model.subtotal,
        shipping_cost: model.shipping_cost,
        tax: model.tax,
        total: model.total,
        status: model.status,
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    }
}

pub(crate) fn order_item_from_entity(model: OrderItemModel) -> OrderItem {
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        name: model.name,
        quantity: model.quantity,
        unit_price: model.unit_price,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(quantity: i32, unit_price: Decimal) -> CheckoutItem {
        CheckoutItem {
            product_id: Uuid::new_v4(),
            quantity,
            name: "Sleep Sack".into(),
            unit_price,
        }
    }

    #[test]
    fn recompute_sums_line_items_shipping_and_tax() {
        let items = vec![item(2, dec!(10.00)), item(1, dec!(5.50))];
        assert_eq!(
            recompute_total(&items, dec!(5.00), dec!(2.00)),
            dec!(32.50)
        );
    }

    #[test]
    fn recompute_of_empty_cart_is_fees_only() {
        assert_eq!(recompute_total(&[], dec!(4.99), dec!(0.00)), dec!(4.99));
    }

    #[test]
    fn conflict_classification_matches_postgres_sqlstates() {
        let ser = DbErr::Custom("ERROR: could not serialize access due to concurrent update (SQLSTATE 40001)".into());
        let deadlock = DbErr::Custom("ERROR: deadlock detected (SQLSTATE 40P01)".into());
        let other = DbErr::Custom("ERROR: null value in column \"email\" (SQLSTATE 23502)".into());
        assert!(is_txn_conflict(&ser));
        assert!(is_txn_conflict(&deadlock));
        assert!(!is_txn_conflict(&other));
    }

    #[tokio::test]
    async fn retry_stops_after_budget_and_reports_transient_conflict() {
        let mut calls = 0u32;
        let result: AppResult<()> = with_txn_retry(3, || {
            calls += 1;
            async { Err(AppError::OrmError(DbErr::Custom("SQLSTATE 40001".into()))) }
        })
        .await;
        assert_eq!(calls, 3);
        assert!(matches!(result, Err(AppError::TransientConflict)));
    }

    #[tokio::test]
    async fn retry_does_not_touch_business_failures() {
        let mut calls = 0u32;
        let pid = Uuid::new_v4();
        let result: AppResult<()> = with_txn_retry(3, || {
            calls += 1;
            async move {
                Err(AppError::InsufficientStock {
                    product_id: pid,
                    available: 0,
                    requested: 1,
                })
            }
        })
        .await;
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(AppError::InsufficientStock { .. })));
    }
}
