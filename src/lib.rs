pub mod clock;
pub mod config;
pub mod logging;
pub mod punishment;
pub mod warden;

// Log targets, filterable through RUST_LOG
pub const CRATE_NAME: &str = "punishment_warden";
pub const LIFECYCLE_TARGET: &str = "punishment_warden::lifecycle";
pub const SCHEDULER_TARGET: &str = "punishment_warden::scheduler";
pub const SYNC_TARGET: &str = "punishment_warden::sync";
pub const ERROR_TARGET: &str = "punishment_warden::error";
pub const CONSOLE_TARGET: &str = "punishment_warden";

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use punishment::{
    Actor, Expiry, PlayerId, Punishment, PunishmentDuration, PunishmentError, PunishmentKind,
    PunishmentManager, PunishmentResult, PunishmentState,
};
pub use warden::Warden;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
