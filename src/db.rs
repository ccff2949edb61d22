use crate::config::AppConfig;
use crate::errors::ServiceError;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema};
use std::time::Duration;
use tracing::{debug, info};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

/// Establishes a connection pool to the database
pub async fn establish_connection(database_url: &str) -> Result<DbPool, ServiceError> {
    let config = DbConfig {
        url: database_url.to_string(),
        ..Default::default()
    };

    establish_connection_with_config(&config).await
}

/// Establishes a connection pool with custom configuration
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection with: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());

    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(true);

    info!(
        "Connecting to database with max_connections={}",
        config.max_connections
    );

    let db_pool = Database::connect(opt).await?;

    info!("Database connection pool established successfully");

    Ok(db_pool)
}

/// Establish DB pool using AppConfig tuning
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let db_cfg: DbConfig = cfg.into();
    establish_connection_with_config(&db_cfg).await
}

/// Checks if the database connection is active
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    debug!("Checking database connection");
    pool.ping().await?;
    Ok(())
}

/// Creates any missing tables and indexes from the entity definitions.
///
/// Statements are generated with IF NOT EXISTS, so calling this against an
/// already-provisioned database is a no-op. Schema evolution beyond that is
/// handled operationally, not by this service.
pub async fn ensure_schema(db: &DbPool) -> Result<(), ServiceError> {
    use crate::entities::{
        audit_log, coupon, order, order_item, payment_transaction, refund, tax_rate,
    };
    use sea_orm::sea_query::Index;

    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut tables = vec![
        schema.create_table_from_entity(order::Entity),
        schema.create_table_from_entity(order_item::Entity),
        schema.create_table_from_entity(payment_transaction::Entity),
        schema.create_table_from_entity(refund::Entity),
        schema.create_table_from_entity(coupon::Entity),
        schema.create_table_from_entity(tax_rate::Entity),
        schema.create_table_from_entity(audit_log::Entity),
    ];

    for stmt in &mut tables {
        stmt.if_not_exists();
        db.execute(backend.build(&*stmt)).await?;
    }

    // Webhooks locate orders by the provider's identifier; two orders must
    // never share one.
    let mut intent_idx = Index::create();
    intent_idx
        .name("idx_orders_provider_intent_id")
        .table(order::Entity)
        .col(order::Column::ProviderIntentId)
        .unique()
        .if_not_exists();
    db.execute(backend.build(&intent_idx)).await?;

    let mut txn_order_idx = Index::create();
    txn_order_idx
        .name("idx_payment_transactions_order_id")
        .table(payment_transaction::Entity)
        .col(payment_transaction::Column::OrderId)
        .if_not_exists();
    db.execute(backend.build(&txn_order_idx)).await?;

    let mut tax_lookup_idx = Index::create();
    tax_lookup_idx
        .name("idx_tax_rates_country_effective")
        .table(tax_rate::Entity)
        .col(tax_rate::Column::Country)
        .col(tax_rate::Column::EffectiveFrom)
        .if_not_exists();
    db.execute(backend.build(&tax_lookup_idx)).await?;

    info!("Database schema ensured");
    Ok(())
}
