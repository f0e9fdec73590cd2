//! The two cooperating benchmark roles.
//!
//! The relay echoes requests back on the matching reply channel; the driver
//! publishes requests and measures how long the replies take. Both roles are
//! built from the same [`ChannelTopology`](crate::topology::ChannelTopology),
//! so they always agree on channel names.

pub mod driver;
pub mod relay;

pub use driver::MeasurementRole;
pub use relay::RelayRole;
