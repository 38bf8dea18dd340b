//! Application wiring: collaborators, shared state, router and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::{
    routing::{get, post},
    Router,
};
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    signature::{signature_validation_middleware, SignatureConfig, SignatureStore},
    tracing::request_id_middleware,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::adapters::{BankTransferAdapter, PayosWebhookAdapter, VnpayReturnAdapter};
use crate::config::{Config, DatabaseBackend, NotificationsConfig, RefundsConfig};
use crate::handlers;
use crate::services::{
    AppointmentService, ExpirySweeper, HttpNotifier, HttpRefundGateway, IdempotencyLedger,
    InvoiceStateMachine, LogNotifier, ManualRefundGateway, MemoryStore, MongoStore, Notifier,
    PaymentLinkService, PaymentPipeline, RefundGateway, Store, Synchronizer,
};

/// Routes that never carry a BFF signature: probes and gateway callbacks,
/// which are authenticated by the gateway's own signature instead.
pub const UNSIGNED_PATHS: [&str; 5] = [
    "/health",
    "/ready",
    "/metrics",
    "/webhooks/payos",
    "/payments/vnpay/return",
];

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub redis: redis::Client,
    pub signature_config: SignatureConfig,
    pub store: Arc<dyn Store>,
    pub invoices: InvoiceStateMachine,
    pub synchronizer: Synchronizer,
    pub appointments: AppointmentService,
    pub pipeline: PaymentPipeline,
    pub sweeper: ExpirySweeper,
    pub refunds: Arc<dyn RefundGateway>,
    pub links: PaymentLinkService,
    pub vnpay: VnpayReturnAdapter,
    pub payos: PayosWebhookAdapter,
    pub bank_transfer: BankTransferAdapter,
}

impl AppState {
    pub fn new(
        config: Config,
        redis: redis::Client,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        refunds: Arc<dyn RefundGateway>,
    ) -> Self {
        let invoices = InvoiceStateMachine::new(store.clone(), config.payments.amount_tolerance);
        let synchronizer = Synchronizer::new(
            store.clone(),
            invoices.clone(),
            notifier,
            refunds.clone(),
            Duration::from_secs(config.payments.sync_retry_secs),
        );
        let ledger = IdempotencyLedger::new(store.clone(), config.ledger.claim_ttl_secs);
        let appointments = AppointmentService::new(
            store.clone(),
            invoices.clone(),
            synchronizer.clone(),
            config.booking.clone(),
            config.payments.clone(),
        );
        let pipeline = PaymentPipeline::new(
            store.clone(),
            ledger.clone(),
            invoices.clone(),
            synchronizer.clone(),
        );
        let sweeper = ExpirySweeper::new(
            store.clone(),
            invoices.clone(),
            synchronizer.clone(),
            ledger,
            config.sweeper.batch_size,
            config.sweeper.resync_grace_secs,
        );

        let signature_config = SignatureConfig {
            require_signatures: config.signature.enabled,
            excluded_paths: UNSIGNED_PATHS.iter().map(|p| p.to_string()).collect(),
            max_skew_secs: config.signature.max_skew_secs,
        };

        Self {
            links: PaymentLinkService::new(config.vnpay.clone(), config.bank_transfer.clone()),
            vnpay: VnpayReturnAdapter::new(config.vnpay.hash_secret.clone()),
            payos: PayosWebhookAdapter::new(config.payos.checksum_key.clone()),
            bank_transfer: BankTransferAdapter::new(store.clone()),
            config,
            redis,
            signature_config,
            store,
            invoices,
            synchronizer,
            appointments,
            pipeline,
            sweeper,
            refunds,
        }
    }
}

impl AsRef<SignatureConfig> for AppState {
    fn as_ref(&self) -> &SignatureConfig {
        &self.signature_config
    }
}

#[async_trait::async_trait]
impl SignatureStore for AppState {
    async fn validate_nonce(&self, nonce: &str) -> Result<bool, AppError> {
        let mut con = self
            .redis
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to get redis connection");
                AppError::ServiceUnavailable(anyhow::anyhow!("Nonce store unavailable"))
            })?;

        let key = format!("booking:nonce:{}", nonce);
        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut con)
            .await
            .unwrap_or(false);
        if exists {
            return Ok(false);
        }

        let _: () = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("EX")
            .arg(self.config.signature.expiry_seconds)
            .query_async(&mut con)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to set nonce");
                AppError::ServiceUnavailable(anyhow::anyhow!("Nonce store unavailable"))
            })?;

        Ok(true)
    }

    async fn get_signing_secret(&self, _client_id: &str) -> Result<Option<String>, AppError> {
        // Single BFF client; per-client secrets live in auth-service.
        Ok(Some(self.config.signature.secret.expose_secret().clone()))
    }
}

pub fn notifier_from_config(config: &NotificationsConfig) -> Arc<dyn Notifier> {
    match config.endpoint.as_deref().filter(|e| !e.is_empty()) {
        Some(endpoint) => Arc::new(HttpNotifier::new(endpoint)),
        None => {
            tracing::warn!("No notification endpoint configured; domain events are only logged");
            Arc::new(LogNotifier)
        }
    }
}

pub fn refunds_from_config(config: &RefundsConfig) -> Arc<dyn RefundGateway> {
    match config.endpoint.as_deref().filter(|e| !e.is_empty()) {
        Some(endpoint) => Arc::new(HttpRefundGateway::new(endpoint)),
        None => {
            tracing::warn!("No refund endpoint configured; refunds are recorded as manual");
            Arc::new(ManualRefundGateway)
        }
    }
}

/// Open the configured store. MongoDB indexes are created on connect.
pub async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match config.database.backend {
        DatabaseBackend::Memory => {
            tracing::warn!("Using in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        DatabaseBackend::Mongo => {
            let mut client_options =
                ClientOptions::parse(config.database.url.expose_secret()).await?;
            client_options.app_name = Some("booking-service".to_string());

            let client = Client::with_options(client_options)?;
            let db = client.database(&config.database.db_name);

            let store = MongoStore::new(&db);
            store.init_indexes().await?;
            tracing::info!(db_name = %config.database.db_name, "Connected to MongoDB");
            Ok(Arc::new(store))
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        // Gateway callbacks
        .route(
            "/payments/vnpay/return",
            post(handlers::payments::vnpay_return).get(handlers::payments::vnpay_return_redirect),
        )
        .route("/webhooks/payos", post(handlers::payments::payos_webhook))
        // Patient payment helpers
        .route("/payments/vnpay/url", post(handlers::payments::vnpay_url))
        .route(
            "/payments/bank-transfer/confirm",
            post(handlers::payments::bank_transfer_confirm),
        )
        .route(
            "/payments/bank-transfer/:invoice_id/instructions",
            get(handlers::payments::bank_transfer_instructions),
        )
        .route(
            "/payments/by-ref/:gateway_ref",
            get(handlers::payments::payment_by_ref),
        )
        // Invoices
        .route("/invoices/:id", get(handlers::invoices::get_invoice))
        .route("/invoices/:id/refund", post(handlers::invoices::refund_invoice))
        // Slots
        .route("/slots", post(handlers::slots::create_slot))
        .route("/slots/:id", get(handlers::slots::get_slot))
        // Appointments
        .route(
            "/appointments",
            post(handlers::appointments::create_appointment),
        )
        .route(
            "/appointments/:id",
            get(handlers::appointments::get_appointment),
        )
        .route(
            "/appointments/:id/invoices",
            get(handlers::invoices::list_for_appointment),
        )
        .route(
            "/appointments/:id/approve",
            post(handlers::appointments::approve),
        )
        .route(
            "/appointments/:id/reject",
            post(handlers::appointments::reject),
        )
        .route(
            "/appointments/:id/complete",
            post(handlers::appointments::complete),
        )
        .route(
            "/appointments/:id/cancel",
            post(handlers::appointments::cancel),
        )
        .route(
            "/appointments/:id/reschedule",
            post(handlers::appointments::request_reschedule),
        )
        .route(
            "/appointments/:id/reschedule/accept",
            post(handlers::appointments::accept_reschedule),
        )
        .route(
            "/appointments/:id/reschedule/reject",
            post(handlers::appointments::reject_reschedule),
        )
        .route(
            "/appointments/:id/reschedule/self-accept",
            post(handlers::appointments::self_accept_reschedule),
        )
        .layer(from_fn_with_state(
            state.clone(),
            signature_validation_middleware::<AppState>,
        ))
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let store = connect_store(&config).await?;
        let redis = redis::Client::open(config.redis.url.expose_secret().as_str())?;
        let notifier = notifier_from_config(&config.notifications);
        let refunds = refunds_from_config(&config.refunds);

        if config.vnpay.hash_secret.is_none() || config.payos.checksum_key.is_none() {
            tracing::warn!(
                vnpay = config.vnpay.hash_secret.is_some(),
                payos = config.payos.checksum_key.is_some(),
                "Gateway secrets missing; deliveries on those channels will be rejected"
            );
        }

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        let state = AppState::new(config, redis, store, notifier, refunds);
        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();

        let sweeper_task = if self.state.config.sweeper.enabled {
            let interval = Duration::from_secs(self.state.config.sweeper.interval_secs.max(1));
            Some(
                self.state
                    .sweeper
                    .clone()
                    .spawn_periodic(interval, shutdown.clone()),
            )
        } else {
            tracing::info!("In-process expiry sweeper disabled");
            None
        };

        tracing::info!(address = %self.listener.local_addr()?, "Listening");
        let app = router(self.state);

        let server_shutdown = shutdown.clone();
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

        shutdown.cancel();
        if let Some(task) = sweeper_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Sweeper task ended abnormally");
            }
        }

        tracing::info!("Service shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
