pub use crate::config::{LoadTestConfiguration, ThinkTime};
pub use crate::executor::{ActionResult, Outcome};
pub use crate::metrics::{ActionMetricAggregate, LoadTestMetrics, MetricsAggregator};
pub use crate::session::{AuthFlow, Credential, Identity};
pub use crate::task::{Task, TaskContext, TaskMethod, TaskRequest};
pub use crate::{
    CancelHandle, HatchlingError, LoadTest, LoadTestDefault, LoadTestDefaultType, LoadTestReport,
    RunOutcome,
};
