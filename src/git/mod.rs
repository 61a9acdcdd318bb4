mod repository;

pub use repository::{GitCredentials, RepositoryService};
