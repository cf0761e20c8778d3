pub mod repo;
pub mod repo_sqlx;

pub use repo::ExecutionRepo;
pub use repo_sqlx::SqlxExecutionRepo;
