pub mod job_repo;
pub mod memory_repo;

pub use job_repo::PgJobRepo;
pub use memory_repo::InMemoryJobRepo;
