#[macro_use]
extern crate rocket;

pub mod config;
pub mod db;
pub mod error;
pub mod import;
pub mod request_logger;
pub mod routes;
pub mod session;

use crate::config::ImportConfig;
use crate::db::ImportDb;
use crate::request_logger::RequestLogger;
use crate::session::{SessionRegistry, SessionSweeper};
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::Once;

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    log::info!("Starting Import API Server");

    let import_config = ImportConfig::from_env();

    // Ensure the upload directory exists
    std::fs::create_dir_all(&import_config.upload_dir)
        .expect("Failed to create upload directory");
    log::info!(
        "Upload directory initialized at: {}",
        import_config.upload_dir.display()
    );

    // Configure CORS
    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![
                Method::Get,
                Method::Post,
                Method::Put,
                Method::Delete,
                Method::Patch,
            ]
            .into_iter()
            .map(From::from)
            .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    rocket::build()
        .attach(RequestLogger)
        .attach(ImportDb::init())
        .attach(cors)
        .manage(import_config)
        .manage(SessionRegistry::new())
        // Fairing to clone and manage the database pool for background jobs
        .attach(AdHoc::try_on_ignite("Manage DB Pool", |rocket| async move {
            match ImportDb::fetch(&rocket) {
                Some(db) => {
                    let pool = (**db).clone();
                    Ok(rocket.manage(pool))
                }
                None => {
                    log::error!("database pool not available");
                    Err(rocket)
                }
            }
        }))
        // Expire idle sessions in the background
        .attach(AdHoc::on_liftoff("Spawn Session Sweeper", |rocket| {
            Box::pin(async move {
                if let Some(registry) = rocket.state::<SessionRegistry>() {
                    let sweeper = SessionSweeper::new(registry.clone());
                    tokio::spawn(async move { sweeper.run().await });
                } else {
                    log::error!("failed to spawn session sweeper: session registry not found");
                }
            })
        }))
        .mount(
            "/api/v1",
            openapi_get_routes![
                // Health routes
                routes::health::health_check,
                // Import routes
                routes::imports::upload_spreadsheet,
                routes::imports::start_import,
                routes::imports::poll_progress,
                routes::imports::cancel_import,
                routes::imports::list_procedures,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Import API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::config::ImportConfig;
    use crate::session::SessionRegistry;
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use rocket_db_pools::sqlx::PgPool;
    use tempfile::TempDir;

    pub use database::{TestDatabase, TestDatabaseError};

    /// An [`ImportConfig`] pointed at a throwaway upload directory.
    ///
    /// The directory lives as long as the returned guard; keep it in
    /// scope for the duration of the test.
    pub fn temp_import_config() -> (ImportConfig, TempDir) {
        let dir = TempDir::new().expect("create temp upload dir");
        let config = ImportConfig {
            upload_dir: dir.path().to_path_buf(),
            ..ImportConfig::from_env()
        };
        (config, dir)
    }

    pub mod database {
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers::{ContainerAsync, ImageExt, core::error::TestcontainersError};
        use testcontainers_modules::postgres::Postgres;
        use testcontainers_modules::testcontainers::runners::AsyncRunner;
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database factory for integration tests.
        ///
        /// Launches a disposable Postgres container and creates a
        /// uniquely named database inside it. No schema is applied;
        /// imports provision their own staging tables.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<Postgres>>,
        }

        impl TestDatabase {
            /// Provision a fresh database in a disposable container.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                // 16-alpine so DROP DATABASE WITH (FORCE) can evict
                // backends a cancelled job left behind.
                let container = Postgres::default().with_tag("16-alpine").start().await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let base_options: PgConnectOptions =
                    admin_url.parse().map_err(TestDatabaseError::Sqlx)?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let database_name = format!("import_test_{}", Uuid::new_v4().simple());
                let create_sql =
                    format!("CREATE DATABASE \"{}\" TEMPLATE template0", database_name);
                sqlx::query(&create_sql)
                    .execute(&admin_pool)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(base_options.clone().database(&database_name))
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name,
                    container: Some(container),
                })
            }

            /// Cloneable connection pool for use in tests and Rocket state.
            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            /// Convenience method returning a clone of the pooled connection handle.
            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database_with_fallback(self.admin_options.clone(), &self.database_name)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database_with_fallback(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
            match sqlx::query(&drop_force).execute(&admin_pool).await {
                Ok(_) => Ok(()),
                Err(err) if force_drop_unsupported(&err) => {
                    let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
                    sqlx::query(&drop_sql).execute(&admin_pool).await?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        fn force_drop_unsupported(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err)
                    if db_err
                        .code()
                        .map(|code| code == "42601" || code == "0A000")
                        .unwrap_or(false)
            )
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ =
                                drop_database_with_fallback(admin_options.clone(), &db_name).await;
                        });
                    } else {
                        std::thread::spawn(move || {
                            if let Ok(rt) = tokio::runtime::Runtime::new() {
                                rt.block_on(async move {
                                    pool.close().await;
                                    let _ = drop_database_with_fallback(
                                        admin_options.clone(),
                                        &db_name,
                                    )
                                    .await;
                                });
                            }
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        pg_pool: Option<PgPool>,
        import_config: Option<ImportConfig>,
        session_registry: Option<SessionRegistry>,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                pg_pool: None,
                import_config: None,
                session_registry: None,
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        /// Manage a `PgPool` instance for tests that exercise database-backed routes.
        pub fn manage_pg_pool(mut self, pool: PgPool) -> Self {
            self.pg_pool = Some(pool);
            self
        }

        /// Manage an [`ImportConfig`] for tests that exercise import routes.
        pub fn manage_import_config(mut self, config: ImportConfig) -> Self {
            self.import_config = Some(config);
            self
        }

        /// Manage a [`SessionRegistry`], possibly pre-seeded by the test.
        pub fn manage_session_registry(mut self, registry: SessionRegistry) -> Self {
            self.session_registry = Some(registry);
            self
        }

        /// Finish building the Rocket instance.
        ///
        /// Import routes always need a session registry, so one is
        /// supplied even when the test did not provide its own.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            if let Some(pool) = self.pg_pool {
                rocket = rocket.manage(pool);
            }
            if let Some(config) = self.import_config {
                rocket = rocket.manage(config);
            }
            rocket = rocket.manage(self.session_registry.unwrap_or_default());

            rocket
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
