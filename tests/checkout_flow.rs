use babyshop_api::{
    db::{create_orm_conn, create_pool},
    dto::cart::AddToCartRequest,
    dto::orders::{CheckoutItem, CheckoutRequest, ShippingInfo},
    entity::{
        cart_items::{Column as CartCol, Entity as CartItems},
        orders::{Column as OrderCol, Entity as Orders},
        products::{ActiveModel as ProductActive, Entity as Products, Model as ProductModel},
        users::ActiveModel as UserActive,
    },
    error::AppError,
    middleware::auth::AuthUser,
    routes::admin::{InventoryAdjustRequest, LowStockQuery, UpdateOrderStatusRequest},
    routes::params::Pagination,
    services::{admin_service, cart_service, order_service},
    state::AppState,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, Set};
use uuid::Uuid;

// Integration tests need a database; they skip themselves when neither
// TEST_DATABASE_URL nor DATABASE_URL is set. Each test seeds its own rows
// with unique names/emails so the file stays safe to run in parallel.

async fn setup_state() -> anyhow::Result<Option<AppState>> {
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration tests."
                );
                return Ok(None);
            }
        };

    let pool = create_pool(&database_url).await?;
    let orm = create_orm_conn(&database_url).await?;
    // The sqlx migrator takes an advisory lock, so concurrent test setup is safe.
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(Some(AppState { pool, orm }))
}

async fn seed_product(state: &AppState, price: Decimal, stock: i32) -> anyhow::Result<ProductModel> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(format!("Muslin Swaddle {}", Uuid::new_v4())),
        description: Set(Some("Breathable cotton swaddle blanket".into())),
        price: Set(price),
        category: Set("nursery".into()),
        image_urls: Set(serde_json::json!([])),
        attributes: Set(None),
        stock: Set(stock),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(product)
}

async fn create_user(state: &AppState, role: &str) -> anyhow::Result<Uuid> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(format!("{}@example.com", Uuid::new_v4())),
        password_hash: Set("dummy".into()),
        role: Set(role.into()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(user.id)
}

fn shipping(email: &str) -> ShippingInfo {
    ShippingInfo {
        name: "Jordan Doe".into(),
        street: "1 Crib Lane".into(),
        city: "Springfield".into(),
        state: "OR".into(),
        postal_code: "97401".into(),
        country: "US".into(),
        email: email.into(),
    }
}

fn payload_for(product: &ProductModel, quantity: i32, email: &str) -> CheckoutRequest {
    let subtotal = product.price * Decimal::from(quantity);
    let shipping_cost = dec!(5.00);
    let tax = dec!(2.00);
    CheckoutRequest {
        shipping: shipping(email),
        items: vec![CheckoutItem {
            product_id: product.id,
            quantity,
            name: product.name.clone(),
            unit_price: product.price,
        }],
        subtotal,
        shipping_cost,
        tax,
        total: subtotal + shipping_cost + tax,
    }
}

async fn stock_of(state: &AppState, id: Uuid) -> anyhow::Result<i32> {
    let product = Products::find_by_id(id)
        .one(&state.orm)
        .await?
        .expect("product row should exist");
    Ok(product.stock)
}

async fn orders_for_email(state: &AppState, email: &str) -> anyhow::Result<u64> {
    Ok(Orders::find()
        .filter(OrderCol::Email.eq(email))
        .count(&state.orm)
        .await?)
}

#[tokio::test]
async fn successful_checkout_decrements_stock_and_creates_pending_order() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let user_id = create_user(&state, "user").await?;
    let product = seed_product(&state, dec!(10.00), 3).await?;
    let email = format!("{}@example.com", Uuid::new_v4());

    let resp = order_service::place_order(&state, Some(user_id), &payload_for(&product, 2, &email))
        .await?;
    let data = resp.data.unwrap();

    assert_eq!(data.order.status, "pending");
    assert_eq!(data.order.user_id, Some(user_id));
    assert_eq!(data.order.total, dec!(27.00));
    assert_eq!(data.items.len(), 1);
    assert_eq!(data.items[0].quantity, 2);
    assert_eq!(data.items[0].unit_price, dec!(10.00));
    assert_eq!(stock_of(&state, product.id).await?, 1);
    Ok(())
}

#[tokio::test]
async fn insufficient_stock_leaves_no_order_and_stock_untouched() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product = seed_product(&state, dec!(8.00), 1).await?;
    let email = format!("{}@example.com", Uuid::new_v4());

    let result = order_service::place_order(&state, None, &payload_for(&product, 2, &email)).await;

    match result {
        Err(AppError::InsufficientStock {
            product_id,
            available,
            requested,
        }) => {
            assert_eq!(product_id, product.id);
            assert_eq!(available, 1);
            assert_eq!(requested, 2);
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }
    assert_eq!(stock_of(&state, product.id).await?, 1);
    assert_eq!(orders_for_email(&state, &email).await?, 0);
    Ok(())
}

#[tokio::test]
async fn multi_item_cart_fails_atomically_when_one_line_is_short() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let plenty = seed_product(&state, dec!(4.00), 10).await?;
    let scarce = seed_product(&state, dec!(6.00), 1).await?;
    let email = format!("{}@example.com", Uuid::new_v4());

    let subtotal = dec!(4.00) * Decimal::from(2) + dec!(6.00) * Decimal::from(3);
    let payload = CheckoutRequest {
        shipping: shipping(&email),
        items: vec![
            CheckoutItem {
                product_id: plenty.id,
                quantity: 2,
                name: plenty.name.clone(),
                unit_price: plenty.price,
            },
            CheckoutItem {
                product_id: scarce.id,
                quantity: 3,
                name: scarce.name.clone(),
                unit_price: scarce.price,
            },
        ],
        subtotal,
        shipping_cost: dec!(0.00),
        tax: dec!(0.00),
        total: subtotal,
    };

    let result = order_service::place_order(&state, None, &payload).await;
    assert!(matches!(result, Err(AppError::InsufficientStock { .. })));

    // Neither product moved, even though the first line alone was satisfiable.
    assert_eq!(stock_of(&state, plenty.id).await?, 10);
    assert_eq!(stock_of(&state, scarce.id).await?, 1);
    assert_eq!(orders_for_email(&state, &email).await?, 0);
    Ok(())
}

#[tokio::test]
async fn duplicate_cart_lines_count_against_combined_quantity() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product = seed_product(&state, dec!(7.00), 3).await?;
    let email = format!("{}@example.com", Uuid::new_v4());

    let line = |qty: i32| CheckoutItem {
        product_id: product.id,
        quantity: qty,
        name: product.name.clone(),
        unit_price: product.price,
    };
    let subtotal = product.price * Decimal::from(4);
    let payload = CheckoutRequest {
        shipping: shipping(&email),
        items: vec![line(2), line(2)],
        subtotal,
        shipping_cost: dec!(0.00),
        tax: dec!(0.00),
        total: subtotal,
    };

    // Each line fits the stock on its own; together they ask for 4 of 3.
    let result = order_service::place_order(&state, None, &payload).await;
    match result {
        Err(AppError::InsufficientStock {
            product_id,
            available,
            requested,
        }) => {
            assert_eq!(product_id, product.id);
            assert_eq!(available, 3);
            assert_eq!(requested, 4);
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }
    assert_eq!(stock_of(&state, product.id).await?, 3);
    assert_eq!(orders_for_email(&state, &email).await?, 0);

    // With enough stock the repeated lines go through and the sum is taken
    // from stock exactly once.
    let restocked = seed_product(&state, dec!(7.00), 4).await?;
    let line = |qty: i32| CheckoutItem {
        product_id: restocked.id,
        quantity: qty,
        name: restocked.name.clone(),
        unit_price: restocked.price,
    };
    let payload = CheckoutRequest {
        shipping: shipping(&email),
        items: vec![line(2), line(2)],
        subtotal,
        shipping_cost: dec!(0.00),
        tax: dec!(0.00),
        total: subtotal,
    };
    let resp = order_service::place_order(&state, None, &payload).await?;
    assert_eq!(resp.data.unwrap().items.len(), 2);
    assert_eq!(stock_of(&state, restocked.id).await?, 0);
    Ok(())
}

#[tokio::test]
async fn unknown_product_is_a_typed_failure_with_no_order() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let email = format!("{}@example.com", Uuid::new_v4());
    let ghost = Uuid::new_v4();

    let payload = CheckoutRequest {
        shipping: shipping(&email),
        items: vec![CheckoutItem {
            product_id: ghost,
            quantity: 1,
            name: "Gone".into(),
            unit_price: dec!(9.99),
        }],
        subtotal: dec!(9.99),
        shipping_cost: dec!(0.00),
        tax: dec!(0.00),
        total: dec!(9.99),
    };

    let result = order_service::place_order(&state, None, &payload).await;
    match result {
        Err(AppError::ProductNotFound(id)) => assert_eq!(id, ghost),
        other => panic!("expected ProductNotFound, got {other:?}"),
    }
    assert_eq!(orders_for_email(&state, &email).await?, 0);
    Ok(())
}

#[tokio::test]
async fn empty_cart_is_rejected_before_any_store_access() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let payload = CheckoutRequest {
        shipping: shipping("guest@example.com"),
        items: vec![],
        subtotal: dec!(0.00),
        shipping_cost: dec!(0.00),
        tax: dec!(0.00),
        total: dec!(0.00),
    };

    let result = order_service::place_order(&state, None, &payload).await;
    assert!(matches!(result, Err(AppError::EmptyCart)));
    Ok(())
}

#[tokio::test]
async fn guest_checkout_records_no_user_reference() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product = seed_product(&state, dec!(12.50), 5).await?;
    let email = format!("{}@example.com", Uuid::new_v4());

    let resp = order_service::place_order(&state, None, &payload_for(&product, 1, &email)).await?;
    let order = resp.data.unwrap().order;

    assert_eq!(order.user_id, None);
    assert_eq!(order.email, email);
    assert_eq!(stock_of(&state, product.id).await?, 4);
    Ok(())
}

#[tokio::test]
async fn repeated_checkouts_get_distinct_orders_and_fresh_stock_checks() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product = seed_product(&state, dec!(10.00), 5).await?;
    let email = format!("{}@example.com", Uuid::new_v4());

    let first = order_service::place_order(&state, None, &payload_for(&product, 2, &email)).await?;
    let second =
        order_service::place_order(&state, None, &payload_for(&product, 2, &email)).await?;
    let first_id = first.data.unwrap().order.id;
    let second_id = second.data.unwrap().order.id;

    assert_ne!(first_id, second_id);
    assert_eq!(stock_of(&state, product.id).await?, 1);

    // The third call re-checks current stock instead of riding on past success.
    let third = order_service::place_order(&state, None, &payload_for(&product, 2, &email)).await;
    assert!(matches!(third, Err(AppError::InsufficientStock { .. })));
    assert_eq!(stock_of(&state, product.id).await?, 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_checkouts_for_last_unit_admit_exactly_one() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product = seed_product(&state, dec!(20.00), 1).await?;
    let email_a = format!("{}@example.com", Uuid::new_v4());
    let email_b = format!("{}@example.com", Uuid::new_v4());

    let payload_a = payload_for(&product, 1, &email_a);
    let payload_b = payload_for(&product, 1, &email_b);

    let (a, b) = tokio::join!(
        order_service::place_order(&state, None, &payload_a),
        order_service::place_order(&state, None, &payload_b),
    );

    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1, "exactly one of the two checkouts must win");

    for result in [a, b] {
        if let Err(err) = result {
            assert!(
                matches!(
                    err,
                    AppError::InsufficientStock { .. } | AppError::TransientConflict
                ),
                "loser must fail with a stock or conflict error, got {err:?}"
            );
        }
    }
    assert_eq!(stock_of(&state, product.id).await?, 0);
    Ok(())
}

#[tokio::test]
async fn authenticated_checkout_clears_the_persisted_cart() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let user_id = create_user(&state, "user").await?;
    let auth = AuthUser {
        user_id,
        role: "user".into(),
    };
    let product = seed_product(&state, dec!(15.00), 4).await?;

    cart_service::add_to_cart(
        &state.pool,
        &auth,
        AddToCartRequest {
            product_id: product.id,
            quantity: 2,
        },
    )
    .await?;

    let email = format!("{}@example.com", Uuid::new_v4());
    order_service::place_order(&state, Some(user_id), &payload_for(&product, 2, &email)).await?;

    let remaining = CartItems::find()
        .filter(CartCol::UserId.eq(user_id))
        .count(&state.orm)
        .await?;
    assert_eq!(remaining, 0);
    Ok(())
}

#[tokio::test]
async fn order_status_moves_through_guarded_transitions_only() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let admin = AuthUser {
        user_id: create_user(&state, "admin").await?,
        role: "admin".into(),
    };
    let product = seed_product(&state, dec!(30.00), 2).await?;
    let email = format!("{}@example.com", Uuid::new_v4());

    let resp = order_service::place_order(&state, None, &payload_for(&product, 1, &email)).await?;
    let order_id = resp.data.unwrap().order.id;

    // pending -> delivered skips two states and must be rejected.
    let skip = admin_service::update_order_status(
        &state,
        &admin,
        order_id,
        UpdateOrderStatusRequest {
            status: "delivered".into(),
        },
    )
    .await;
    assert!(matches!(skip, Err(AppError::BadRequest(_))));

    for next in ["processing", "shipped", "delivered"] {
        let updated = admin_service::update_order_status(
            &state,
            &admin,
            order_id,
            UpdateOrderStatusRequest {
                status: next.into(),
            },
        )
        .await?;
        assert_eq!(updated.data.unwrap().status, next);
    }

    // Delivered is terminal; cancellation after the fact must be rejected.
    let cancel = admin_service::update_order_status(
        &state,
        &admin,
        order_id,
        UpdateOrderStatusRequest {
            status: "cancelled".into(),
        },
    )
    .await;
    assert!(matches!(cancel, Err(AppError::BadRequest(_))));
    Ok(())
}

#[tokio::test]
async fn low_stock_report_lists_depleted_products() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let admin = AuthUser {
        user_id: create_user(&state, "admin").await?,
        role: "admin".into(),
    };
    let depleted = seed_product(&state, dec!(9.00), 0).await?;
    let stocked = seed_product(&state, dec!(9.00), 50).await?;

    let resp = admin_service::list_low_stock(
        &state,
        &admin,
        LowStockQuery {
            pagination: Pagination {
                page: Some(1),
                per_page: Some(100),
            },
            threshold: Some(0),
        },
    )
    .await?;
    let items = resp.data.unwrap().items;

    assert!(items.iter().all(|p| p.stock <= 0));
    assert!(items.iter().any(|p| p.id == depleted.id));
    assert!(items.iter().all(|p| p.id != stocked.id));
    Ok(())
}

#[tokio::test]
async fn inventory_adjustment_is_bounded_at_zero() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let admin = AuthUser {
        user_id: create_user(&state, "admin").await?,
        role: "admin".into(),
    };
    let product = seed_product(&state, dec!(9.00), 3).await?;

    let over_withdraw = admin_service::adjust_inventory(
        &state,
        &admin,
        product.id,
        InventoryAdjustRequest { delta: -4 },
    )
    .await;
    assert!(matches!(over_withdraw, Err(AppError::BadRequest(_))));
    assert_eq!(stock_of(&state, product.id).await?, 3);

    let overflow = admin_service::adjust_inventory(
        &state,
        &admin,
        product.id,
        InventoryAdjustRequest { delta: i32::MAX },
    )
    .await;
    assert!(matches!(overflow, Err(AppError::BadRequest(_))));
    assert_eq!(stock_of(&state, product.id).await?, 3);

    let restocked = admin_service::adjust_inventory(
        &state,
        &admin,
        product.id,
        InventoryAdjustRequest { delta: 7 },
    )
    .await?;
    assert_eq!(restocked.data.unwrap().stock, 10);
    Ok(())
}

#[tokio::test]
async fn non_admin_cannot_touch_admin_surface() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let shopper = AuthUser {
        user_id: create_user(&state, "user").await?,
        role: "user".into(),
    };
    let product = seed_product(&state, dec!(9.00), 3).await?;

    let result = admin_service::adjust_inventory(
        &state,
        &shopper,
        product.id,
        InventoryAdjustRequest { delta: 1 },
    )
    .await;
    assert!(matches!(result, Err(AppError::Forbidden)));
    assert_eq!(stock_of(&state, product.id).await?, 3);
    Ok(())
}
