pub mod authres;
pub mod config;
pub mod decision;
pub mod decode;
pub mod message;
pub mod milter;
pub mod policy;
pub mod session;

pub use config::Config;
pub use decision::{AuditRecord, Decision, DmarcVerdict};
pub use milter::Milter;
pub use policy::{Policy, RejectDomains, RejectTemplate};
pub use session::{CaptureState, Response, Session};
