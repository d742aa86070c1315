use health::{ComponentStatus, HealthHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vbus_common::header_set::HeaderSet;
use vbus_common::metrics::report_record_received;
use vbus_common::settlement::SettlementDetector;

use crate::context::AppContext;
use crate::source::SourceEvent;

/// Single consumer of the record stream: feeds the settlement detector
/// until it settles and the primary consolidator for the whole lifetime.
pub struct Ingestor {
    context: AppContext,
    detector: SettlementDetector,
    liveness: HealthHandle,
}

impl Ingestor {
    pub fn new(context: AppContext, liveness: HealthHandle) -> Self {
        Self {
            context,
            detector: SettlementDetector::new(),
            liveness,
        }
    }

    pub fn has_settled(&self) -> bool {
        self.detector.has_settled()
    }

    pub fn handle(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::ConnectionState(state) => {
                debug!("connection state changed to {}", state);
            }
            SourceEvent::Packet(header) => {
                report_record_received(&header.id());

                if let Some(header_set) = self.detector.observe(&header) {
                    self.header_set_has_settled(&header_set);
                }
                self.context.consolidator.add_header(header);
                self.liveness.report_healthy();
            }
        }
    }

    /// Consumes events in delivery order until the source closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<SourceEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }

        warn!("record stream closed");
        self.liveness.report_status(ComponentStatus::Unhealthy);
    }

    fn header_set_has_settled(&self, header_set: &HeaderSet) {
        metrics::counter!("vbus_header_set_settled_total").increment(1);

        let headers: Vec<_> = header_set.sorted_headers().into_iter().cloned().collect();
        match self.context.specification.packet_fields(&headers) {
            Ok(fields) => {
                info!(
                    "header set settled with {} packets and {} fields",
                    headers.len(),
                    fields.len()
                );
                for field in &fields {
                    debug!("{}: {}", field.id, field.name);
                }
            }
            Err(err) => warn!(
                "header set settled with {} packets, but they could not be decoded: {}",
                headers.len(),
                err
            ),
        }
    }
}
