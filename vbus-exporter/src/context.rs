use std::sync::Arc;

use health::HealthRegistry;
use vbus_common::consolidator::HeaderSetConsolidator;
use vbus_common::specification::Specification;

/// Process-wide state, built once in `main` and shared by every component.
#[derive(Clone)]
pub struct AppContext {
    pub specification: Arc<dyn Specification>,
    /// Long-window consolidator read by `GET /` and by every publish tick.
    pub consolidator: Arc<HeaderSetConsolidator>,
    pub liveness: HealthRegistry,
}

impl AppContext {
    pub fn new(
        specification: Arc<dyn Specification>,
        consolidator: HeaderSetConsolidator,
        liveness: HealthRegistry,
    ) -> Self {
        Self {
            specification,
            consolidator: Arc::new(consolidator),
            liveness,
        }
    }
}
