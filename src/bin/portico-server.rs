// ABOUTME: Server binary: config, logging, database, seed, key manager, background sweeper, HTTP
// ABOUTME: Boots the authorization core and serves it with warp
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use portico_server::cache::SettingsCache;
use portico_server::config::ServerConfig;
use portico_server::database::seed::{seed_database, SeedOptions};
use portico_server::database::{Database, DatabaseProvider};
use portico_server::errors::{AppError, AppResult};
use portico_server::jwks::KeyManager;
use portico_server::logging::{init_logging, LoggingConfig};
use portico_server::oauth2::routes::{oauth2_routes, RouteState};

/// How often the sweeper purges expired codes and auth contexts, and the
/// key manager refreshes from the store
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> AppResult<()> {
    let config = ServerConfig::from_env()?;
    init_logging(&LoggingConfig {
        level: config.log_level.clone(),
        json: config.log_json,
    })?;

    info!(
        port = config.http_port,
        database = %config.database_url,
        issuer = %config.issuer,
        "starting portico"
    );

    let db = Database::new(&config.database_url)
        .await
        .map_err(AppError::from)?;
    db.migrate().await.map_err(AppError::from)?;

    let mut seed_options = SeedOptions::new(&config.issuer, &config.base_url);
    seed_options.admin_email = config.admin_email.clone();
    seed_options.admin_password = config.admin_password.clone();
    seed_options.access_token_seconds = config.access_token_seconds;
    seed_options.refresh_token_seconds = config.refresh_token_seconds;
    seed_options.auth_code_seconds = config.auth_code_seconds;
    seed_options.session_idle_seconds = config.session_idle_seconds;
    seed_options.session_max_seconds = config.session_max_seconds;
    seed_database(&db, &seed_options)
        .await
        .map_err(AppError::from)?;

    let keys = Arc::new(KeyManager::load(&db).await?);
    let settings = Arc::new(SettingsCache::new(db.clone()));

    spawn_maintenance(db.clone(), keys.clone());

    let state = RouteState::new(db, keys, settings);
    let routes = oauth2_routes(state);

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| AppError::config(format!("HOST is not an IP address: {}", config.host)))?;
    let addr = SocketAddr::new(host, config.http_port);

    info!(%addr, "listening");
    warp::serve(routes).run(addr).await;
    Ok(())
}

/// Periodic maintenance: purge expired codes and stale auth contexts, and
/// pick up key rotations performed by other processes.
fn spawn_maintenance(db: Database, keys: Arc<KeyManager>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let now = Utc::now();

            match db.purge_expired_auth_codes(now).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged expired authorization codes"),
                Err(e) => error!("code purge failed: {e:#}"),
            }
            match db.purge_expired_auth_contexts(now).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged expired auth contexts"),
                Err(e) => error!("auth context purge failed: {e:#}"),
            }
            if let Err(e) = keys.refresh(&db).await {
                warn!("key ring refresh failed: {e}");
            }
        }
    });
}
