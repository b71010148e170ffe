//! Probing engine of the alive monitor.
//!
//! Every target address maps to a [`Prober`] that writes one or more
//! [`Record`]s to a [`Reporter`] each time it is invoked. Alerts reuse the
//! same machinery through [`alert::new_alerter`].

pub mod address;
pub mod alert;
pub mod context;
pub mod error;
pub mod probe;
pub mod record;
pub mod reporter;
pub mod resource;
pub mod settings;
pub mod tracker;
pub mod util;

pub use address::{Scheme, Separator, alert_target, parse_target};
pub use alert::{Alerter, new_alerter, new_direct_alerter};
pub use context::{Interruption, ProbeContext};
pub use error::ProbeError;
pub use probe::{Prober, new_direct_prober, new_prober, new_prober_from_url};
pub use record::{Record, RecordParseError, Status};
pub use reporter::{AlertReporter, MemoryReporter, ReportComposer, Reporter};
pub use resource::{Lifecycle, ResourceError, ResourceGuard, ResourceManager};
pub use settings::Settings;
pub use tracker::{TargetTracker, TrackingReporter};
