// ── Domain model ──
//
// Value types shared by every service of the fabric.

mod attributes;
mod event;
mod query;
mod state;
mod variant;

pub use attributes::{AttributeMode, Attributes};
pub use event::{Event, MonitorStatus, MonitorStatusInformation};
pub use query::{QueryBucket, QueryParameters, QueryState, ValueInformation};
pub use state::SubscriptionState;
pub use variant::{Variant, VariantType};
