pub mod audit_log;
pub mod client;
pub mod client_assignment;
pub mod document;
pub mod document_version;
pub mod engagement;
pub mod engagement_assignment;
pub mod firm;
pub mod rate_limit_counter;
pub mod session;
pub mod user;

pub use audit_log::Entity as AuditLog;
pub use client::Entity as Client;
pub use client_assignment::Entity as ClientAssignment;
pub use document::Entity as Document;
pub use document_version::Entity as DocumentVersion;
pub use engagement::Entity as Engagement;
pub use engagement_assignment::Entity as EngagementAssignment;
pub use firm::Entity as Firm;
pub use rate_limit_counter::Entity as RateLimitCounter;
pub use session::Entity as Session;
pub use user::Entity as User;
