//! # loadstage
//!
//! Virtual-user load generator. A test plan describes scenarios (ramping or
//! constant concurrency), the requests each virtual user sends, named checks
//! on the responses, and thresholds that decide whether the run passed.
//!
//! ## Components
//!
//! - **scheduler**: target concurrency as a function of scenario time
//! - **pool** / **vu**: virtual users as tokio tasks, scaled to the target
//! - **http**: request client that records latency and failure samples
//! - **check**: named response assertions
//! - **metrics**: thread-safe series registry and immutable snapshots
//! - **thresholds**: pass/fail expressions over metric snapshots
//! - **engine**: runs a plan and produces a [`summary::RunReport`]
//!
//! ```no_run
//! use loadstage::prelude::*;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let plan = PlanFile::from_toml_str(r#"
//!     [options]
//!     vus = 2
//!     duration = "10s"
//!     [options.thresholds]
//!     http_req_failed = ["rate<0.01"]
//! "#)?;
//! let engine = plan
//!     .into_engine(None)?
//!     .with_default(|ctx: VuContext| async move {
//!         let res = ctx.get("http://localhost:8080/healthz").await;
//!         ctx.check(&res, &[Check::status(200)]);
//!         ctx.sleep(std::time::Duration::from_secs(1)).await;
//!         Ok::<_, anyhow::Error>(())
//!     });
//! let report = engine.run().await?;
//! std::process::exit(report.exit_code().into());
//! # }
//! ```

pub mod check;
pub mod config;
pub mod duration;
pub mod engine;
pub mod error;
pub mod http;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod scheduler;
pub mod script;
pub mod summary;
pub mod telemetry;
pub mod thresholds;
pub mod vu;

pub mod prelude {
    pub use crate::check::Check;
    pub use crate::config::PlanFile;
    pub use crate::engine::{Engine, EngineSettings};
    pub use crate::error::{ConfigError, EngineError};
    pub use crate::http::{RequestOptions, Response};
    pub use crate::metrics::{MetricKind, TagSet, ValueType};
    pub use crate::summary::RunReport;
    pub use crate::vu::{ScenarioFn, VuContext};
}
