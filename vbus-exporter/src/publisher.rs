use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use tracing::{debug, error};
use vbus_common::consolidator::{ConsolidatorOptions, HeaderSetConsolidator};
use vbus_common::mapping::{formatted_values, OutputMapping, OutputParameters};

use crate::context::AppContext;
use crate::error::ExportError;
use crate::sink::PublishSink;

/// Builds the output parameter map from the primary consolidator and hands
/// it to the sink.
pub struct Publisher {
    context: AppContext,
    mapping: OutputMapping,
    sink: Arc<dyn PublishSink>,
    liveness: HealthHandle,
}

impl Publisher {
    pub fn new(
        context: AppContext,
        mapping: OutputMapping,
        sink: Arc<dyn PublishSink>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            context,
            mapping,
            sink,
            liveness,
        }
    }

    /// Current values of the primary consolidator, renamed and formatted.
    pub fn output_parameters(&self) -> Result<OutputParameters, ExportError> {
        let headers = self.context.consolidator.sorted_headers();
        let fields = self.context.specification.packet_fields(&headers)?;
        Ok(self.mapping.resolve(&formatted_values(&fields)))
    }

    /// The JSON message for this tick, `None` when no output key resolved.
    pub fn build_message(&self) -> Result<Option<String>, ExportError> {
        let params = self.output_parameters()?;
        if params.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_string(&params)?))
    }

    /// Publishes one message. Delivery runs in its own task and is not
    /// awaited, so a slow broker never delays the next tick.
    pub fn on_tick(&self) -> eyre::Result<()> {
        self.liveness.report_healthy();

        let Some(payload) = self.build_message()? else {
            debug!("no output parameters resolved, nothing to publish");
            return Ok(());
        };

        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.publish(payload).await {
                error!("failed to publish output parameters: {}", err);
            }
        });
        Ok(())
    }
}

/// Starts a dedicated consolidator whose only job is to tick every
/// `interval`. Each tick publishes the primary consolidator's values.
pub fn start_publishing(
    publisher: Publisher,
    interval: Duration,
    fire_immediately: bool,
) -> HeaderSetConsolidator {
    let ticker = HeaderSetConsolidator::new(ConsolidatorOptions {
        name: "publisher".to_owned(),
        interval: Some(interval),
        time_to_live: None,
        fire_immediately,
    });

    ticker.start_timer(move |_| publisher.on_tick());
    ticker
}
