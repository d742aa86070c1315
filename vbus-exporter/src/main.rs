//! Consolidate VBus headers and export them over HTTP and Kafka.
use std::future::Future;
use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use health::{ComponentStatus, HealthRegistry};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use vbus_common::clock::SystemTime;
use vbus_common::consolidator::{ConsolidatorOptions, HeaderSetConsolidator};
use vbus_common::metrics::setup_metrics_recorder;
use vbus_common::specification::{Specification, TableSpecification};
use vbus_exporter::config::Config;
use vbus_exporter::context::AppContext;
use vbus_exporter::handlers;
use vbus_exporter::ingest::Ingestor;
use vbus_exporter::publisher::{start_publishing, Publisher};
use vbus_exporter::sink::{KafkaSink, PrintSink, PublishSink};
use vbus_exporter::source::TcpFeedSource;

async fn listen<F>(app: Router, bind: String, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(err) => error!("failed to listen for shutdown signal: {}", err),
    }
}

fn load_specification(config: &Config) -> Result<Arc<dyn Specification>> {
    let specification = match &config.specification_path {
        Some(path) => TableSpecification::from_path(path)
            .wrap_err_with(|| format!("failed to load specification from {}", path))?,
        None => TableSpecification::default_specification()
            .wrap_err("failed to load built-in specification")?,
    };
    info!(
        "loaded decoding rules for {} packets",
        specification.packet_count()
    );
    Ok(Arc::new(specification))
}

/// Connects to the record feed and consumes it in the background. A failed
/// connection is logged, the HTTP surface stays up.
async fn connect_to_stream(config: &Config, context: &AppContext) {
    let source = TcpFeedSource::new(&config.stream_address, Arc::new(SystemTime {}));
    let liveness = context
        .liveness
        .register("ingest", time::Duration::seconds(60));

    info!("connecting to record stream at {}...", config.stream_address);
    match source.connect().await {
        Ok(events) => {
            info!("connected to record stream");
            tokio::spawn(Ingestor::new(context.clone(), liveness).run(events));
        }
        Err(err) => {
            error!("{}", err);
            liveness.report_status(ComponentStatus::Unhealthy);
        }
    }
}

/// Starts publishing when enabled. A broker that cannot be reached only
/// disables publishing.
async fn start_publisher(config: &Config, context: &AppContext) -> Option<HeaderSetConsolidator> {
    let interval = config.publish_interval.enabled()?;

    let sink: Arc<dyn PublishSink> = if config.print_sink {
        Arc::new(PrintSink {})
    } else {
        match KafkaSink::connect(config.kafka.clone()).await {
            Ok(sink) => Arc::new(sink),
            Err(err) => {
                error!("publishing disabled: {}", err);
                return None;
            }
        }
    };

    let liveness = context.liveness.register(
        "publisher",
        time::Duration::try_from(interval * 3).unwrap_or(time::Duration::MAX),
    );
    let publisher = Publisher::new(context.clone(), config.field_map.clone(), sink, liveness);

    info!("publishing every {:?}", interval);
    Some(start_publishing(
        publisher,
        interval,
        config.publish_fire_immediately,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let recorder_handle = match setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            error!("failed to install metrics recorder: {}", err);
            None
        }
    };

    let specification = load_specification(&config)?;
    let consolidator = HeaderSetConsolidator::new(ConsolidatorOptions {
        name: "primary".to_owned(),
        interval: config.logging_interval.enabled(),
        time_to_live: config.logging_time_to_live.enabled(),
        fire_immediately: false,
    });
    let context = AppContext::new(specification, consolidator, HealthRegistry::new("liveness"));

    connect_to_stream(&config, &context).await;

    context
        .consolidator
        .start_timer(|headers| {
            debug!("primary consolidator holds {} headers", headers.len());
            Ok(())
        });

    let publisher = start_publisher(&config, &context).await;

    let app = handlers::app(context.clone(), recorder_handle);

    info!("listening on {}", config.bind());
    let result = listen(app, config.bind(), shutdown_signal())
        .await
        .wrap_err("vbus-exporter http server failed");

    if let Some(publisher) = publisher {
        publisher.stop_timer();
    }
    context.consolidator.stop_timer();

    result
}
