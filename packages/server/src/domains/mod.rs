pub mod analysis;
pub mod billing;
pub mod connections;
pub mod costs;
pub mod notifications;
pub mod remediation;
pub mod tenancy;
pub mod zombies;
