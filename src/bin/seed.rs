use argon2::{
    Argon2, PasswordHasher,
    password_hash::{SaltString, rand_core::OsRng},
};
use babyshop_api::{config::AppConfig, db::create_pool};
use rust_decimal::Decimal;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url).await?;
    // Ensure migrations are applied.
    sqlx::migrate!("./migrations").run(&pool).await?;

    let admin_id = ensure_user_with_role(&pool, "admin@example.com", "admin123", "admin").await?;
    let user_id = ensure_user_with_role(&pool, "user@example.com", "user123", "user").await?;
    seed_products(&pool).await?;

    println!("Seed completed. Admin ID: {admin_id}, User ID: {user_id}");
    Ok(())
}

async fn ensure_user_with_role(
    pool: &sqlx::PgPool,
    email: &str,
    password: &str,
    role: &str,
) -> anyhow::Result<Uuid> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .to_string();

    let row: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO users (id, email, password_hash, role)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO UPDATE SET role = EXCLUDED.role
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(email)
    .bind(password_hash)
    .bind(role)
    .fetch_one(pool)
    .await?;

    println!("Ensured user {email} (role={role})");
    Ok(row.0)
}

async fn seed_products(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let products = [
        (
            "Organic Cotton Onesie",
            "Soft newborn onesie, 0-3 months",
            Decimal::new(1499, 2),
            "clothing",
            serde_json::json!({ "sizes": ["0-3m", "3-6m"], "colors": ["cream", "sage"] }),
            60,
        ),
        (
            "Convertible Stroller",
            "Reversible seat, one-hand fold",
            Decimal::new(29900, 2),
            "gear",
            serde_json::json!({ "weight_limit_kg": 22 }),
            12,
        ),
        (
            "Silicone Feeding Set",
            "Plate, bowl and spoon, dishwasher safe",
            Decimal::new(2450, 2),
            "feeding",
            serde_json::json!({ "colors": ["dusty rose", "ocean"] }),
            80,
        ),
        (
            "Wooden Stacking Rings",
            "Classic stacker in non-toxic paint",
            Decimal::new(1899, 2),
            "toys",
            serde_json::json!({ "age": "12m+" }),
            45,
        ),
    ];

    for (name, desc, price, category, attributes, stock) in products {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, description, price, category, image_urls, attributes, stock)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(desc)
        .bind(price)
        .bind(category)
        .bind(serde_json::json!([]))
        .bind(attributes)
        .bind(stock)
        .execute(pool)
        .await?;
    }

    println!("Seeded products");
    Ok(())
}
